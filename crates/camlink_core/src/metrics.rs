/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct SessionMetrics {
    pub sessions_started: AtomicU64,
    pub sessions_reused: AtomicU64,
    pub sessions_ended: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub live_sessions: AtomicU64,

    pub signals_applied: AtomicU64,
    pub signals_duplicate: AtomicU64,
    pub signals_dropped: AtomicU64,
    pub append_failures: AtomicU64,

    pub candidates_queued: AtomicU64,
    pub candidates_skipped: AtomicU64,

    pub acquire_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_reused: u64,
    pub sessions_ended: u64,
    pub sessions_failed: u64,
    pub live_sessions: u64,
    pub signals_applied: u64,
    pub signals_duplicate: u64,
    pub signals_dropped: u64,
    pub append_failures: u64,
    pub candidates_queued: u64,
    pub candidates_skipped: u64,
    pub acquire_failures: u64,
}

fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        bump(&self.sessions_started);
        bump(&self.live_sessions);
    }

    pub fn session_reused(&self) {
        bump(&self.sessions_reused);
    }

    pub fn session_settled(&self, failed: bool) {
        if failed {
            bump(&self.sessions_failed);
        } else {
            bump(&self.sessions_ended);
        }
        let _ = self
            .live_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn signal_applied(&self) {
        bump(&self.signals_applied);
    }

    pub fn signal_duplicate(&self) {
        bump(&self.signals_duplicate);
    }

    pub fn signal_dropped(&self) {
        bump(&self.signals_dropped);
    }

    pub fn append_failed(&self) {
        bump(&self.append_failures);
    }

    pub fn candidate_queued(&self) {
        bump(&self.candidates_queued);
    }

    pub fn candidate_skipped(&self) {
        bump(&self.candidates_skipped);
    }

    pub fn acquire_failed(&self) {
        bump(&self.acquire_failures);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            sessions_started: get(&self.sessions_started),
            sessions_reused: get(&self.sessions_reused),
            sessions_ended: get(&self.sessions_ended),
            sessions_failed: get(&self.sessions_failed),
            live_sessions: get(&self.live_sessions),
            signals_applied: get(&self.signals_applied),
            signals_duplicate: get(&self.signals_duplicate),
            signals_dropped: get(&self.signals_dropped),
            append_failures: get(&self.append_failures),
            candidates_queued: get(&self.candidates_queued),
            candidates_skipped: get(&self.candidates_skipped),
            acquire_failures: get(&self.acquire_failures),
        }
    }
}
