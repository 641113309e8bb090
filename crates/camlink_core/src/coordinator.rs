/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Session lifecycle: identity reconciliation, single-flight starts, and
//! the gap enforced between one session's teardown and the next start.

use crate::config::SessionSettings;
use crate::media::{CaptureHandle, HardwareReport, MediaController};
use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::peer_session::{PeerSession, PeerSessionConfig, PeerSessionHandle, PeerState, SessionOutcome};
use crate::relays::RelayProvider;
use crate::signal_store::{now_ms, NewSession, SignalStore};
use crate::signaling::SignalChannel;
use crate::transport::TransportFactory;
use anyhow::anyhow;
use camlink_protocol::{
    channel_name, FailureReason, Role, SessionRecord, SessionStatus, StartSessionRequest, StartSessionResponse,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type SessionTicket = StartSessionResponse;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StartError {
    #[error("invalid start request: {0}")]
    Invalid(String),
    #[error("session {session_id} is already active for this endpoint")]
    AlreadyActive { session_id: String },
    #[error("capture hardware unavailable: {0:#}")]
    Hardware(Arc<anyhow::Error>),
    #[error("signal store: {0:#}")]
    Store(Arc<anyhow::Error>),
    #[error("start cancelled")]
    Cancelled,
}

impl StartError {
    fn store(e: anyhow::Error) -> Self {
        StartError::Store(Arc::new(e))
    }

    fn hardware(e: anyhow::Error) -> Self {
        StartError::Hardware(Arc::new(e))
    }
}

type StartOutcome = Option<Result<SessionTicket, StartError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopResult {
    /// A live session was torn down here.
    Stopped(SessionOutcome),
    /// An open session owned elsewhere was marked ended in the store.
    Marked(SessionRecord),
    /// Already terminal; nothing ran.
    AlreadySettled(SessionStatus),
    Unknown,
}

struct LiveSession {
    handle: PeerSessionHandle,
    ticket: SessionTicket,
    started: Instant,
}

#[derive(Default)]
struct EndpointState {
    live: Option<Arc<LiveSession>>,
    last_stop: Option<Instant>,
    pending_cancel: Option<CancellationToken>,
    /// Result slot of the start currently in flight; later callers wait on it.
    attempt: Option<watch::Receiver<StartOutcome>>,
}

#[derive(Default)]
struct Endpoint {
    state: Mutex<EndpointState>,
}

/// Frees the endpoint's attempt slot even when the leading start is dropped.
struct AttemptSlot<'a> {
    ep: &'a Endpoint,
}

impl Drop for AttemptSlot<'_> {
    fn drop(&mut self) {
        let mut st = self.ep.state();
        st.attempt = None;
        st.pending_cancel = None;
    }
}

impl Endpoint {
    fn state(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live(&self) -> Option<Arc<LiveSession>> {
        self.state().live.clone()
    }

    /// Clears the live slot once `session_id` has finished teardown. Only the
    /// first caller stamps the stop time.
    fn settle(&self, session_id: &str) {
        let mut st = self.state();
        if st.live.as_ref().is_some_and(|l| l.ticket.session_id == session_id) {
            st.live = None;
            st.last_stop = Some(Instant::now());
        }
    }
}

struct Inner {
    settings: SessionSettings,
    store: Arc<dyn SignalStore>,
    transports: Arc<dyn TransportFactory>,
    media: Option<MediaController>,
    relays: RelayProvider,
    metrics: Arc<SessionMetrics>,
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
    sessions: Mutex<HashMap<String, PeerSessionHandle>>,
}

/// Caller-owned context for all sessions of one process. Cheap to clone.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

fn random_id() -> String {
    let mut b = [0u8; 16];
    use rand::RngCore as _;
    rand::rngs::OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

impl SessionCoordinator {
    /// `media` is required for the capture role only.
    pub fn new(
        settings: SessionSettings,
        store: Arc<dyn SignalStore>,
        transports: Arc<dyn TransportFactory>,
        media: Option<MediaController>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        let relays = RelayProvider::new(settings.relays.clone());
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                transports,
                media,
                relays,
                metrics,
                endpoints: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn SignalStore> {
        &self.inner.store
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Runtime state of a session live in this process.
    pub fn state(&self, session_id: &str) -> Option<PeerState> {
        self.session(session_id).map(|h| h.state())
    }

    pub fn session(&self, session_id: &str) -> Option<PeerSessionHandle> {
        self.sessions().get(session_id).cloned()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerSessionHandle>> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoint(&self, endpoint_id: &str) -> Arc<Endpoint> {
        let mut guard = self.inner.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        guard.entry(endpoint_id.to_string()).or_default().clone()
    }

    /// Presence check for the capture hardware; never starts capture.
    pub async fn hardware_check(&self) -> HardwareReport {
        match &self.inner.media {
            Some(media) => media.hardware_check().await,
            None => HardwareReport {
                detail: Some("no capture device configured".to_string()),
                ..Default::default()
            },
        }
    }

    /// Starts (or joins) the session for `req.endpoint_id`.
    ///
    /// Concurrent starts for one endpoint collapse into the attempt already
    /// in flight and get its result, failure included.
    pub async fn start(&self, role: Role, req: StartSessionRequest) -> Result<SessionTicket, StartError> {
        let endpoint_id = req.endpoint_id.trim().to_string();
        let viewer_id = req.viewer_id.trim().to_string();
        if endpoint_id.is_empty() || viewer_id.is_empty() {
            return Err(StartError::Invalid("endpoint_id and viewer_id are required".into()));
        }
        let requested_id = req
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let ep = self.endpoint(&endpoint_id);
        let cancel = CancellationToken::new();
        let leader = {
            let mut st = ep.state();
            match st.attempt.clone() {
                Some(rx) => Err(rx),
                None => {
                    let (tx, rx) = watch::channel(None);
                    st.attempt = Some(rx);
                    st.pending_cancel = Some(cancel.clone());
                    Ok(tx)
                }
            }
        };
        let tx = match leader {
            Ok(tx) => tx,
            Err(rx) => return self.join_attempt(rx).await,
        };
        let _slot = AttemptSlot { ep: ep.as_ref() };

        let out = match ep.live() {
            Some(live) if !live.handle.state().is_terminal() => self.join_live(&live),
            live => {
                if let Some(live) = live {
                    // Settled but the watcher has not cleared the slot yet.
                    live.handle.wait().await;
                    ep.settle(&live.ticket.session_id);
                }
                self.start_locked(role, &ep, &endpoint_id, &viewer_id, requested_id, req.ttl_secs, &cancel)
                    .await
            }
        };
        tx.send_replace(Some(out.clone()));
        out
    }

    async fn join_attempt(&self, mut rx: watch::Receiver<StartOutcome>) -> Result<SessionTicket, StartError> {
        let shared = match rx.wait_for(|o| o.is_some()).await {
            Ok(o) => o.clone(),
            Err(_) => None,
        };
        match shared {
            Some(Ok(mut ticket)) => {
                self.inner.metrics.session_reused();
                debug!(session = %ticket.session_id, "start joined in-flight attempt");
                ticket.reused = true;
                Ok(ticket)
            }
            Some(Err(e)) => Err(e),
            // Leading start was dropped before it finished.
            None => Err(StartError::Cancelled),
        }
    }

    fn join_live(&self, live: &LiveSession) -> Result<SessionTicket, StartError> {
        let in_window = live.started.elapsed() <= self.inner.settings.recency_window;
        if live.handle.state() == PeerState::Connecting || in_window {
            self.inner.metrics.session_reused();
            debug!(session = %live.ticket.session_id, "start joined live session");
            let mut ticket = live.ticket.clone();
            ticket.reused = true;
            return Ok(ticket);
        }
        Err(StartError::AlreadyActive {
            session_id: live.ticket.session_id.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_locked(
        &self,
        role: Role,
        ep: &Arc<Endpoint>,
        endpoint_id: &str,
        viewer_id: &str,
        requested_id: Option<String>,
        ttl_secs: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<SessionTicket, StartError> {
        self.wait_for_gap(ep, cancel).await?;

        let (record, reused) = self
            .reconcile(endpoint_id, viewer_id, requested_id, ttl_secs)
            .await?;
        let session_id = record.id.clone();

        if cancel.is_cancelled() {
            self.abandon(&session_id, SessionStatus::Ended, FailureReason::Cancelled).await;
            return Err(StartError::Cancelled);
        }

        let capture = match role {
            Role::Capture => Some(self.acquire_hardware(&session_id, cancel).await?),
            Role::Viewer => None,
        };

        let relays = self.inner.relays.descriptors(endpoint_id, now_ms());
        let ticket = SessionTicket {
            session_id: session_id.clone(),
            channel: channel_name(&session_id),
            relays: relays.clone(),
            expires_at_ms: record.expires_at_ms,
            reused,
        };

        let settings = &self.inner.settings;
        let channel = SignalChannel::new(
            self.inner.store.clone(),
            &session_id,
            role,
            settings.append_retry,
            settings.poll_interval,
            self.inner.metrics.clone(),
        );
        let handle = PeerSession::spawn(
            PeerSessionConfig {
                session_id: session_id.clone(),
                role,
                relays,
                expires_at_ms: record.expires_at_ms,
                connect_timeout: settings.connect_timeout,
                disconnect_grace: settings.disconnect_grace,
            },
            channel,
            self.inner.transports.clone(),
            capture,
            self.inner.metrics.clone(),
        );

        let cancelled = {
            let mut st = ep.state();
            st.pending_cancel = None;
            if cancel.is_cancelled() {
                true
            } else {
                st.live = Some(Arc::new(LiveSession {
                    handle: handle.clone(),
                    ticket: ticket.clone(),
                    started: Instant::now(),
                }));
                false
            }
        };
        if cancelled {
            handle.stop(Some(FailureReason::Cancelled)).await;
            ep.state().last_stop = Some(Instant::now());
            return Err(StartError::Cancelled);
        }

        self.inner.metrics.session_started();
        if reused {
            self.inner.metrics.session_reused();
        }
        self.sessions().insert(session_id.clone(), handle.clone());

        let this = self.clone();
        let ep = ep.clone();
        tokio::spawn(async move {
            let outcome = handle.wait().await;
            this.sessions().remove(&outcome.session_id);
            ep.settle(&outcome.session_id);
            debug!(session = %outcome.session_id, status = %outcome.status, "start slot released");
        });

        info!(session = %session_id, %role, endpoint = %endpoint_id, reused, "session started");
        Ok(ticket)
    }

    /// Sleeps out whatever remains of the inter-session gap and the hardware
    /// release grace since the last stop on this endpoint.
    async fn wait_for_gap(&self, ep: &Endpoint, cancel: &CancellationToken) -> Result<(), StartError> {
        let Some(last_stop) = ep.state().last_stop else {
            return Ok(());
        };
        let gap = self
            .inner
            .settings
            .min_session_gap
            .max(self.inner.settings.hardware_release_grace);
        let ready_at = last_stop + gap;
        if ready_at <= Instant::now() {
            return Ok(());
        }
        debug!(wait = ?(ready_at - Instant::now()), "waiting out inter-session gap");
        tokio::select! {
            _ = tokio::time::sleep_until(ready_at) => Ok(()),
            _ = cancel.cancelled() => Err(StartError::Cancelled),
        }
    }

    /// Finds the session this start should attach to, or creates one.
    async fn reconcile(
        &self,
        endpoint_id: &str,
        viewer_id: &str,
        requested_id: Option<String>,
        ttl_secs: Option<u64>,
    ) -> Result<(SessionRecord, bool), StartError> {
        let store = &self.inner.store;
        let window_ms = self.inner.settings.recency_window.as_millis() as i64;

        if let Some(rec) = store
            .find_open_session(endpoint_id)
            .await
            .map_err(StartError::store)?
        {
            let fresh = now_ms().saturating_sub(rec.created_at_ms) <= window_ms;
            if requested_id.as_deref() == Some(rec.id.as_str()) || fresh {
                return Ok((rec, true));
            }
            if rec.status == SessionStatus::Active {
                return Err(StartError::AlreadyActive { session_id: rec.id });
            }
            info!(session = %rec.id, endpoint = %endpoint_id, "replacing stale pending session");
            store
                .set_status(&rec.id, SessionStatus::Failed, Some(FailureReason::Expired))
                .await
                .map_err(StartError::store)?;
            if let Err(e) = store.publish_stop(&rec.id, Some(FailureReason::Expired)).await {
                debug!(session = %rec.id, "stop notice failed: {e:#}");
            }
        }

        let mut id = requested_id;
        if let Some(existing) = id.as_deref() {
            if store.get_session(existing).await.map_err(StartError::store)?.is_some() {
                // Settled ids are never reopened.
                id = None;
            }
        }

        let ttl = ttl_secs
            .map(Duration::from_secs)
            .map(|d| d.min(self.inner.settings.session_ttl))
            .unwrap_or(self.inner.settings.session_ttl)
            .max(Duration::from_secs(1));
        let new = NewSession {
            id: id.unwrap_or_else(random_id),
            endpoint_id: endpoint_id.to_string(),
            viewer_id: viewer_id.to_string(),
            expires_at_ms: now_ms() + ttl.as_millis() as i64,
        };
        let (rec, created) = store.create_or_get_open(new).await.map_err(StartError::store)?;
        if !created {
            debug!(session = %rec.id, "another process opened this endpoint first");
        }
        Ok((rec, !created))
    }

    /// Acquisition is not preemptible; a cancel that lands meanwhile only
    /// discards the result.
    async fn acquire_hardware(&self, session_id: &str, cancel: &CancellationToken) -> Result<CaptureHandle, StartError> {
        let Some(media) = &self.inner.media else {
            self.abandon(session_id, SessionStatus::Failed, FailureReason::HardwareUnavailable)
                .await;
            return Err(StartError::hardware(anyhow!("no capture device configured")));
        };
        let settings = &self.inner.settings;
        match media
            .acquire(settings.acquire_timeout, settings.acquire_retry.max_attempts)
            .await
        {
            Ok(handle) if cancel.is_cancelled() => {
                handle.stop();
                self.abandon(session_id, SessionStatus::Ended, FailureReason::Cancelled).await;
                Err(StartError::Cancelled)
            }
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.abandon(session_id, SessionStatus::Failed, FailureReason::HardwareUnavailable)
                    .await;
                Err(StartError::hardware(e))
            }
        }
    }

    /// Settles a session that never got a peer session.
    async fn abandon(&self, session_id: &str, status: SessionStatus, reason: FailureReason) {
        let store = &self.inner.store;
        if let Err(e) = store.set_status(session_id, status, Some(reason)).await {
            warn!(session = %session_id, "abandon status write failed: {e:#}");
        }
        if let Err(e) = store.publish_stop(session_id, Some(reason)).await {
            debug!(session = %session_id, "stop notice failed: {e:#}");
        }
    }

    /// Idempotent stop. Live sessions run full teardown; open sessions owned
    /// elsewhere are marked ended and a stop notice is published.
    pub async fn stop(&self, session_id: &str) -> anyhow::Result<StopResult> {
        if let Some(handle) = self.session(session_id) {
            return Ok(StopResult::Stopped(handle.stop(None).await));
        }
        let store = &self.inner.store;
        let Some(rec) = store.get_session(session_id).await? else {
            return Ok(StopResult::Unknown);
        };
        if rec.status.is_terminal() {
            return Ok(StopResult::AlreadySettled(rec.status));
        }
        let rec = store.set_status(session_id, SessionStatus::Ended, None).await?;
        if let Err(e) = store.publish_stop(session_id, None).await {
            debug!(session = %session_id, "stop notice failed: {e:#}");
        }
        info!(session = %session_id, "session marked ended");
        Ok(StopResult::Marked(rec))
    }

    /// Cancels a start that has not reached `connected`. Returns false when
    /// there was nothing cancellable.
    pub async fn cancel(&self, endpoint_id: &str) -> bool {
        let ep = self.endpoint(endpoint_id);
        let (pending, live) = {
            let st = ep.state();
            (st.pending_cancel.clone(), st.live.clone())
        };
        if let Some(token) = pending {
            token.cancel();
            return true;
        }
        match live {
            Some(live) if live.handle.state() == PeerState::Connecting => {
                live.handle.stop(Some(FailureReason::Cancelled)).await;
                true
            }
            _ => false,
        }
    }

    /// Capture side: picks up pending sessions addressed to `endpoint_id` and
    /// answers them with an offer, until `cancel` fires.
    pub async fn run_capture_agent(&self, endpoint_id: &str, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.inner.settings.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(endpoint = %endpoint_id, "capture agent running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let rec = match self.inner.store.find_open_session(endpoint_id).await {
                Ok(Some(rec)) => rec,
                Ok(None) => continue,
                Err(e) => {
                    warn!(endpoint = %endpoint_id, "capture agent poll failed: {e:#}");
                    continue;
                }
            };
            if rec.status != SessionStatus::Pending || self.session(&rec.id).is_some() || rec.expires_at_ms <= now_ms() {
                continue;
            }
            let req = StartSessionRequest {
                endpoint_id: endpoint_id.to_string(),
                viewer_id: rec.viewer_id.clone(),
                session_id: Some(rec.id.clone()),
                ttl_secs: None,
            };
            match self.start(Role::Capture, req).await {
                Ok(ticket) => debug!(session = %ticket.session_id, "capture agent started session"),
                Err(StartError::AlreadyActive { session_id }) => {
                    debug!(session = %session_id, "capture agent: endpoint busy")
                }
                Err(e) => warn!(session = %rec.id, "capture agent start failed: {e}"),
            }
        }

        let live: Vec<PeerSessionHandle> = self.sessions().values().cloned().collect();
        for handle in live {
            handle.stop(None).await;
        }
        info!(endpoint = %endpoint_id, "capture agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_hex() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn already_active_names_the_session() {
        let e = StartError::AlreadyActive {
            session_id: "abc".into(),
        };
        assert!(e.to_string().contains("abc"));
    }
}
