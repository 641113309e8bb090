/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use camlink_core::config::SessionSettings;
use camlink_core::coordinator::SessionCoordinator;
use camlink_core::media::{MediaController, MediaTrack, SampleFeedDevice};
use camlink_core::metrics::SessionMetrics;
use camlink_core::peer_session::{PeerSessionHandle, PeerState};
use camlink_core::retry::{Backoff, RetryPolicy};
use camlink_core::signal_store::{NewSession, SignalStore, SqliteSignalStore, Subscription};
use camlink_core::transport::{LinkState, PeerTransport, TransportEvent, TransportFactory};
use camlink_protocol::{
    CandidatePayload, FailureReason, RelayDescriptor, Role, SessionDescriptionPayload, SessionRecord, SessionStatus,
    Signal, SignalKind, StartSessionRequest,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AttachCapture(usize),
    ExpectMedia,
    CreateOffer,
    CreateAnswer,
    SetLocal(String),
    SetRemote(String),
    RejectedRemote(String),
    AddCandidate(String),
    RejectedCandidate(String),
    Close,
}

/// Records every call; connects on its own once both descriptions are set
/// when `auto_connect` is on.
pub struct FakeTransport {
    pub label: String,
    calls: Mutex<Vec<Call>>,
    events: mpsc::Sender<TransportEvent>,
    auto_connect: bool,
    local_candidates: u32,
    answer_delay: Duration,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    closed: AtomicBool,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddCandidate(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit(&self, ev: TransportEvent) {
        let _ = self.events.try_send(ev);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn maybe_connect(&self) {
        if self.auto_connect && self.local_set.load(Ordering::SeqCst) && self.remote_set.load(Ordering::SeqCst) {
            self.emit(TransportEvent::State(LinkState::Connecting));
            self.emit(TransportEvent::State(LinkState::Connected));
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn attach_capture(&self, tracks: &[Arc<dyn MediaTrack>]) -> Result<()> {
        self.record(Call::AttachCapture(tracks.len()));
        Ok(())
    }

    async fn expect_media(&self, _audio: bool) -> Result<()> {
        self.record(Call::ExpectMedia);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescriptionPayload> {
        self.record(Call::CreateOffer);
        Ok(SessionDescriptionPayload {
            kind: "offer".into(),
            body: format!("offer-from-{}", self.label),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescriptionPayload> {
        if !self.answer_delay.is_zero() {
            tokio::time::sleep(self.answer_delay).await;
        }
        self.record(Call::CreateAnswer);
        Ok(SessionDescriptionPayload {
            kind: "answer".into(),
            body: format!("answer-from-{}", self.label),
        })
    }

    async fn set_local_description(&self, desc: &SessionDescriptionPayload) -> Result<()> {
        self.record(Call::SetLocal(desc.body.clone()));
        self.local_set.store(true, Ordering::SeqCst);
        for i in 0..self.local_candidates {
            self.emit(TransportEvent::LocalCandidate(CandidatePayload {
                candidate: format!("{}-cand-{i}", self.label),
                media_line_index: Some(0),
                username_fragment: None,
            }));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescriptionPayload) -> Result<()> {
        if !matches!(desc.kind.as_str(), "offer" | "answer") || desc.body.is_empty() {
            self.record(Call::RejectedRemote(desc.body.clone()));
            return Err(anyhow!("unparseable session description"));
        }
        self.record(Call::SetRemote(desc.body.clone()));
        self.remote_set.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_candidate(&self, candidate: &CandidatePayload) -> Result<()> {
        if !self.remote_set.load(Ordering::SeqCst) {
            self.record(Call::RejectedCandidate(candidate.candidate.clone()));
            return Err(anyhow!("no remote description"));
        }
        if self.is_closed() {
            return Err(anyhow!("connection closed"));
        }
        self.record(Call::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(Call::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeTransportFactory {
    pub label: String,
    pub auto_connect: bool,
    pub local_candidates: u32,
    pub answer_delay: Duration,
    created: Mutex<Vec<Arc<FakeTransport>>>,
    seq: AtomicU32,
}

impl FakeTransportFactory {
    pub fn new(label: &str, auto_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            auto_connect,
            local_candidates: 2,
            answer_delay: Duration::ZERO,
            created: Mutex::new(Vec::new()),
            seq: AtomicU32::new(0),
        })
    }

    pub fn with_answer_delay(label: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            auto_connect: true,
            local_candidates: 0,
            answer_delay: delay,
            created: Mutex::new(Vec::new()),
            seq: AtomicU32::new(0),
        })
    }

    pub fn created(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<FakeTransport> {
        self.created().last().cloned().expect("no transport created yet")
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn connect(&self, _relays: &[RelayDescriptor]) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<TransportEvent>)> {
        let (tx, rx) = mpsc::channel(64);
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let t = Arc::new(FakeTransport {
            label: format!("{}{n}", self.label),
            calls: Mutex::new(Vec::new()),
            events: tx,
            auto_connect: self.auto_connect,
            local_candidates: self.local_candidates,
            answer_delay: self.answer_delay,
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(t.clone());
        Ok((t, rx))
    }
}

/// Delegates to SQLite but can refuse every append of one signal kind or
/// stall session creation; remembers each status written.
pub struct RefusingStore {
    pub inner: Arc<SqliteSignalStore>,
    refuse: Option<SignalKind>,
    create_delay: Duration,
    refused: AtomicU32,
    statuses: Mutex<Vec<SessionStatus>>,
}

impl RefusingStore {
    pub fn new(inner: Arc<SqliteSignalStore>, refuse: SignalKind) -> Arc<Self> {
        Arc::new(Self {
            inner,
            refuse: Some(refuse),
            create_delay: Duration::ZERO,
            refused: AtomicU32::new(0),
            statuses: Mutex::new(Vec::new()),
        })
    }

    pub fn slow_create(inner: Arc<SqliteSignalStore>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            refuse: None,
            create_delay: delay,
            refused: AtomicU32::new(0),
            statuses: Mutex::new(Vec::new()),
        })
    }

    pub fn refused(&self) -> u32 {
        self.refused.load(Ordering::SeqCst)
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalStore for RefusingStore {
    async fn create_or_get_open(&self, new: NewSession) -> Result<(SessionRecord, bool)> {
        tokio::time::sleep(self.create_delay).await;
        self.inner.create_or_get_open(new).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.inner.get_session(session_id).await
    }

    async fn find_open_session(&self, endpoint_id: &str) -> Result<Option<SessionRecord>> {
        self.inner.find_open_session(endpoint_id).await
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: Option<FailureReason>,
    ) -> Result<SessionRecord> {
        self.statuses.lock().unwrap().push(status);
        self.inner.set_status(session_id, status, reason).await
    }

    async fn append(&self, session_id: &str, origin: Role, kind: SignalKind, payload: serde_json::Value) -> Result<i64> {
        if Some(kind) == self.refuse {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(anyhow!("store unavailable"));
        }
        self.inner.append(session_id, origin, kind, payload).await
    }

    async fn poll(&self, session_id: &str, since_id: i64, limit: u32) -> Result<Vec<Signal>> {
        self.inner.poll(session_id, since_id, limit).await
    }

    async fn subscribe(&self, session_id: &str) -> Result<Subscription> {
        self.inner.subscribe(session_id).await
    }

    async fn publish_stop(&self, session_id: &str, reason: Option<FailureReason>) -> Result<()> {
        self.inner.publish_stop(session_id, reason).await
    }
}

pub fn fast_settings() -> SessionSettings {
    let mut s = SessionSettings::default();
    s.poll_interval = Duration::from_millis(30);
    s.connect_timeout = Duration::from_secs(3);
    s.disconnect_grace = Duration::from_millis(200);
    s.recency_window = Duration::from_secs(30);
    s.min_session_gap = Duration::from_millis(50);
    s.hardware_release_grace = Duration::from_millis(50);
    s.append_retry = RetryPolicy {
        max_attempts: 3,
        backoff: Backoff::Exponential {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
        },
        jitter: Duration::ZERO,
    };
    s.acquire_timeout = Duration::from_millis(500);
    s.acquire_retry = RetryPolicy {
        max_attempts: 2,
        backoff: Backoff::Linear {
            step: Duration::from_millis(10),
        },
        jitter: Duration::ZERO,
    };
    s
}

pub fn temp_store() -> (tempfile::TempDir, Arc<SqliteSignalStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteSignalStore::open(dir.path().join("camlink.sqlite"), 500).unwrap());
    (dir, store)
}

pub fn viewer(settings: SessionSettings, store: Arc<dyn SignalStore>, factory: Arc<FakeTransportFactory>) -> SessionCoordinator {
    SessionCoordinator::new(settings, store, factory, None, Arc::new(SessionMetrics::new()))
}

pub fn capture(
    settings: SessionSettings,
    store: Arc<SqliteSignalStore>,
    factory: Arc<FakeTransportFactory>,
    device: Arc<SampleFeedDevice>,
) -> SessionCoordinator {
    capture_on(settings, store, factory, device)
}

pub fn capture_on(
    settings: SessionSettings,
    store: Arc<dyn SignalStore>,
    factory: Arc<FakeTransportFactory>,
    device: Arc<SampleFeedDevice>,
) -> SessionCoordinator {
    let metrics = Arc::new(SessionMetrics::new());
    let media = MediaController::new(
        device,
        settings.preferred_video,
        settings.minimal_video,
        Duration::from_millis(10),
        metrics.clone(),
    );
    SessionCoordinator::new(settings, store, factory, Some(media), metrics)
}

pub fn request(endpoint: &str, viewer: &str) -> StartSessionRequest {
    StartSessionRequest {
        endpoint_id: endpoint.to_string(),
        viewer_id: viewer.to_string(),
        session_id: None,
        ttl_secs: None,
    }
}

pub async fn wait_for_state(handle: &PeerSessionHandle, want: PeerState) {
    let mut rx = handle.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}, at {:?}", handle.state()))
        .unwrap();
}

/// Polls `f` until it returns true or five seconds pass.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut f: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn live_session(coordinator: &SessionCoordinator, session_id: &str) -> PeerSessionHandle {
    eventually("live session", || coordinator.session(session_id).is_some()).await;
    coordinator.session(session_id).unwrap()
}
