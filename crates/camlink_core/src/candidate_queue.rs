/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::metrics::SessionMetrics;
use crate::transport::PeerTransport;
use camlink_protocol::CandidatePayload;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Queued,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Remote candidates that arrived before the remote description was set.
///
/// Empty at all times except between the first early candidate and the
/// one flush that follows `set_remote_description`.
pub struct CandidateQueue {
    session_id: String,
    pending: Vec<CandidatePayload>,
    remote_set: bool,
    metrics: Arc<SessionMetrics>,
}

impl CandidateQueue {
    pub fn new(session_id: &str, metrics: Arc<SessionMetrics>) -> Self {
        Self {
            session_id: session_id.to_string(),
            pending: Vec::new(),
            remote_set: false,
            metrics,
        }
    }

    pub fn remote_set(&self) -> bool {
        self.remote_set
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub async fn enqueue_or_apply(&mut self, transport: &dyn PeerTransport, candidate: CandidatePayload) -> CandidateOutcome {
        if !self.remote_set {
            self.pending.push(candidate);
            self.metrics.candidate_queued();
            debug!(session = %self.session_id, queued = self.pending.len(), "candidate queued");
            return CandidateOutcome::Queued;
        }
        self.apply_one(transport, &candidate).await
    }

    /// Marks the remote description as set and applies everything buffered,
    /// in arrival order. Only the first call does any work.
    pub async fn flush(&mut self, transport: &dyn PeerTransport) -> FlushReport {
        let mut report = FlushReport::default();
        if self.remote_set {
            return report;
        }
        self.remote_set = true;
        let pending = std::mem::take(&mut self.pending);
        for candidate in pending {
            match self.apply_one(transport, &candidate).await {
                CandidateOutcome::Applied => report.applied += 1,
                _ => report.skipped += 1,
            }
        }
        if report.applied + report.skipped > 0 {
            debug!(
                session = %self.session_id,
                applied = report.applied,
                skipped = report.skipped,
                "candidate queue flushed"
            );
        }
        report
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    async fn apply_one(&self, transport: &dyn PeerTransport, candidate: &CandidatePayload) -> CandidateOutcome {
        match transport.add_candidate(candidate).await {
            Ok(()) => CandidateOutcome::Applied,
            Err(e) => {
                self.metrics.candidate_skipped();
                warn!(session = %self.session_id, "candidate skipped: {e:#}");
                CandidateOutcome::Skipped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use camlink_protocol::SessionDescriptionPayload;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerTransport for Recorder {
        async fn attach_capture(&self, _tracks: &[Arc<dyn MediaTrack>]) -> Result<()> {
            Ok(())
        }
        async fn expect_media(&self, _audio: bool) -> Result<()> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescriptionPayload> {
            Err(anyhow!("unused"))
        }
        async fn create_answer(&self) -> Result<SessionDescriptionPayload> {
            Err(anyhow!("unused"))
        }
        async fn set_local_description(&self, _desc: &SessionDescriptionPayload) -> Result<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _desc: &SessionDescriptionPayload) -> Result<()> {
            Ok(())
        }
        async fn add_candidate(&self, c: &CandidatePayload) -> Result<()> {
            if c.candidate.starts_with("bad") {
                return Err(anyhow!("malformed candidate"));
            }
            self.applied.lock().unwrap().push(c.candidate.clone());
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn cand(s: &str) -> CandidatePayload {
        CandidatePayload {
            candidate: s.to_string(),
            media_line_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn early_candidates_flush_in_order_and_skip_bad_ones() {
        let t = Recorder::default();
        let metrics = Arc::new(SessionMetrics::new());
        let mut q = CandidateQueue::new("s", metrics.clone());

        for c in ["a", "bad-1", "b", "c"] {
            assert_eq!(q.enqueue_or_apply(&t, cand(c)).await, CandidateOutcome::Queued);
        }
        assert!(t.applied.lock().unwrap().is_empty());

        let report = q.flush(&t).await;
        assert_eq!(report, FlushReport { applied: 3, skipped: 1 });
        assert_eq!(q.pending_len(), 0);
        assert_eq!(*t.applied.lock().unwrap(), vec!["a", "b", "c"]);

        assert_eq!(q.enqueue_or_apply(&t, cand("d")).await, CandidateOutcome::Applied);
        assert_eq!(q.enqueue_or_apply(&t, cand("bad-2")).await, CandidateOutcome::Skipped);
        assert_eq!(q.flush(&t).await, FlushReport::default());

        let snap = metrics.snapshot();
        assert_eq!(snap.candidates_queued, 4);
        assert_eq!(snap.candidates_skipped, 2);
    }

    #[tokio::test]
    async fn clear_discards_buffered_entries() {
        let t = Recorder::default();
        let mut q = CandidateQueue::new("s", Arc::new(SessionMetrics::new()));
        q.enqueue_or_apply(&t, cand("a")).await;
        q.clear();
        assert_eq!(q.flush(&t).await, FlushReport::default());
        assert!(t.applied.lock().unwrap().is_empty());
    }
}
