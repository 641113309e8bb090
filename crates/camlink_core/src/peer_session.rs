/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! One peer connection's lifecycle, driven by a single task.
//!
//! The task owns the transport, the candidate queue, the applied-id set and
//! the capture handle; nothing else touches them. Callers talk to it through
//! [`PeerSessionHandle`].

use crate::candidate_queue::CandidateQueue;
use crate::media::CaptureHandle;
use crate::metrics::SessionMetrics;
use crate::signal_store::now_ms;
use crate::signaling::{AppliedSignals, Inbound, SignalChannel, SignalFeed};
use crate::transport::{LinkState, PeerTransport, TransportEvent, TransportFactory};
use camlink_protocol::{
    CandidatePayload, FailureReason, RelayDescriptor, Role, SessionDescriptionPayload, SessionStatus, Signal,
    SignalKind,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    Ended,
    Failed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Ended | PeerState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

#[derive(Debug, Clone)]
pub struct PeerSessionConfig {
    pub session_id: String,
    pub role: Role,
    pub relays: Vec<RelayDescriptor>,
    pub expires_at_ms: i64,
    pub connect_timeout: Duration,
    pub disconnect_grace: Duration,
}

#[derive(Debug)]
enum Command {
    Stop { reason: Option<FailureReason> },
}

/// How the session settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    /// `notify` is false when the counterpart already announced the stop.
    Ended { reason: Option<FailureReason>, notify: bool },
    Failed(FailureReason),
}

#[derive(Clone)]
pub struct PeerSessionHandle {
    session_id: String,
    role: Role,
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<PeerState>,
    done_rx: watch::Receiver<Option<SessionOutcome>>,
}

impl PeerSessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> PeerState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PeerState> {
        self.state_rx.clone()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.done_rx.borrow().clone()
    }

    /// Ends the session (no-op once it has settled) and waits for teardown.
    pub async fn stop(&self, reason: Option<FailureReason>) -> SessionOutcome {
        if self.cmd_tx.send(Command::Stop { reason }).await.is_err() {
            debug!(session = %self.session_id, "stop sent to a finished session");
        }
        self.wait().await
    }

    /// Waits until teardown has finished.
    pub async fn wait(&self) -> SessionOutcome {
        let mut rx = self.done_rx.clone();
        if rx.wait_for(|o| o.is_some()).await.is_err() {
            debug!(session = %self.session_id, "session task gone before settling");
        }
        let outcome = rx.borrow().clone();
        outcome.unwrap_or_else(|| SessionOutcome {
            session_id: self.session_id.clone(),
            status: SessionStatus::Failed,
            reason: Some(FailureReason::Cancelled),
        })
    }
}

pub struct PeerSession {
    session_id: String,
    role: Role,
    relays: Vec<RelayDescriptor>,
    connect_timeout: Duration,
    disconnect_grace: Duration,
    expires_at: Instant,

    channel: SignalChannel,
    transports: Arc<dyn TransportFactory>,
    metrics: Arc<SessionMetrics>,

    transport: Option<Arc<dyn PeerTransport>>,
    capture: Option<CaptureHandle>,
    queue: CandidateQueue,
    applied: AppliedSignals,
    feed_cancel: CancellationToken,
    outbound: Option<mpsc::Sender<CandidatePayload>>,
    outbound_task: Option<JoinHandle<()>>,

    state_tx: watch::Sender<PeerState>,
    offer_in_flight: bool,
    offer_applied: bool,
    answer_applied: bool,
    disconnect_deadline: Option<Instant>,
}

impl PeerSession {
    /// Starts the session task in `connecting`. Capture sessions must be given
    /// the acquired hardware; it is released during teardown.
    pub fn spawn(
        cfg: PeerSessionConfig,
        channel: SignalChannel,
        transports: Arc<dyn TransportFactory>,
        capture: Option<CaptureHandle>,
        metrics: Arc<SessionMetrics>,
    ) -> PeerSessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(PeerState::Idle);
        let (done_tx, done_rx) = watch::channel(None);

        let ttl_ms = cfg.expires_at_ms.saturating_sub(now_ms()).max(0) as u64;
        let session = PeerSession {
            session_id: cfg.session_id.clone(),
            role: cfg.role,
            relays: cfg.relays,
            connect_timeout: cfg.connect_timeout,
            disconnect_grace: cfg.disconnect_grace,
            expires_at: Instant::now() + Duration::from_millis(ttl_ms),
            queue: CandidateQueue::new(&cfg.session_id, metrics.clone()),
            channel,
            transports,
            metrics,
            transport: None,
            capture,
            applied: AppliedSignals::default(),
            feed_cancel: CancellationToken::new(),
            outbound: None,
            outbound_task: None,
            state_tx,
            offer_in_flight: false,
            offer_applied: false,
            answer_applied: false,
            disconnect_deadline: None,
        };

        tokio::spawn(async move {
            let outcome = session.run(cmd_rx).await;
            done_tx.send_replace(Some(outcome));
        });

        PeerSessionHandle {
            session_id: cfg.session_id,
            role: cfg.role,
            cmd_tx,
            state_rx,
            done_rx,
        }
    }

    fn set_state(&self, next: PeerState) {
        let prev = *self.state_tx.borrow();
        if prev != next {
            debug!(session = %self.session_id, from = ?prev, to = ?next, "peer state");
            self.state_tx.send_replace(next);
        }
    }

    fn state(&self) -> PeerState {
        *self.state_tx.borrow()
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) -> SessionOutcome {
        self.set_state(PeerState::Connecting);
        info!(session = %self.session_id, role = %self.role, "peer session connecting");
        let connect_deadline = Instant::now() + self.connect_timeout;

        let (settle, feed) = match self.begin().await {
            Ok((mut feed, mut events)) => {
                let settle = self
                    .event_loop(&mut feed, &mut events, &mut cmd_rx, connect_deadline)
                    .await;
                (settle, Some(feed))
            }
            Err(settle) => (settle, None),
        };
        self.teardown(settle, feed).await
    }

    async fn begin(&mut self) -> Result<(SignalFeed, mpsc::Receiver<TransportEvent>), Settle> {
        let (transport, events) = self.transports.connect(&self.relays).await.map_err(|e| {
            warn!(session = %self.session_id, "transport setup failed: {e:#}");
            Settle::Failed(FailureReason::NegotiationFailed)
        })?;
        self.transport = Some(transport.clone());

        match self.role {
            Role::Capture => begin_capture(self, transport.as_ref()).await?,
            Role::Viewer => begin_viewer(self, transport.as_ref()).await?,
        }

        self.start_outbound();
        let feed = self.channel.open(self.feed_cancel.clone()).await;

        if self.role == Role::Capture {
            self.send_offer(transport.as_ref()).await?;
        }
        Ok((feed, events))
    }

    async fn event_loop(
        &mut self,
        feed: &mut SignalFeed,
        events: &mut mpsc::Receiver<TransportEvent>,
        cmd_rx: &mut mpsc::Receiver<Command>,
        connect_deadline: Instant,
    ) -> Settle {
        let mut cmds_open = true;
        let mut events_open = true;
        loop {
            let connecting = self.state() == PeerState::Connecting;
            let grace_deadline = self.disconnect_deadline.unwrap_or(self.expires_at);
            tokio::select! {
                cmd = cmd_rx.recv(), if cmds_open => match cmd {
                    Some(Command::Stop { reason }) => {
                        info!(session = %self.session_id, "stop requested");
                        return Settle::Ended { reason, notify: true };
                    }
                    None => cmds_open = false,
                },
                inbound = feed.recv() => match inbound {
                    Some(Inbound::Signal(sig)) => {
                        if !self.applied.first_seen(sig.id) {
                            self.metrics.signal_duplicate();
                            continue;
                        }
                        self.metrics.signal_applied();
                        if let Err(settle) = self.apply_signal(sig).await {
                            return settle;
                        }
                    }
                    Some(Inbound::Stop(reason)) => {
                        info!(session = %self.session_id, ?reason, "counterpart ended session");
                        return Settle::Ended { reason, notify: false };
                    }
                    None => {
                        warn!(session = %self.session_id, "signal feed closed");
                        return Settle::Failed(FailureReason::SignalingFailed);
                    }
                },
                ev = events.recv(), if events_open => match ev {
                    Some(ev) => {
                        if let Err(settle) = self.on_transport_event(ev) {
                            return settle;
                        }
                    }
                    None => events_open = false,
                },
                _ = tokio::time::sleep_until(connect_deadline), if connecting => {
                    warn!(session = %self.session_id, timeout = ?self.connect_timeout, "connect timeout");
                    return Settle::Failed(FailureReason::Timeout);
                }
                _ = tokio::time::sleep_until(grace_deadline), if self.disconnect_deadline.is_some() => {
                    warn!(session = %self.session_id, "disconnected past grace window");
                    return Settle::Failed(FailureReason::Disconnected);
                }
                _ = tokio::time::sleep_until(self.expires_at) => {
                    info!(session = %self.session_id, "session ttl reached");
                    return Settle::Ended { reason: Some(FailureReason::Expired), notify: true };
                }
            }
        }
    }

    fn on_transport_event(&mut self, ev: TransportEvent) -> Result<(), Settle> {
        match ev {
            TransportEvent::LocalCandidate(c) => self.trickle(c),
            TransportEvent::State(LinkState::Connected) => {
                self.disconnect_deadline = None;
                if self.state() == PeerState::Connecting {
                    info!(session = %self.session_id, "peer connected");
                    self.set_state(PeerState::Connected);
                }
            }
            TransportEvent::State(LinkState::Disconnected) => {
                if self.disconnect_deadline.is_none() {
                    debug!(session = %self.session_id, grace = ?self.disconnect_grace, "link disconnected");
                    self.disconnect_deadline = Some(Instant::now() + self.disconnect_grace);
                }
            }
            TransportEvent::State(LinkState::Failed) => return Err(Settle::Failed(FailureReason::TransportFailed)),
            TransportEvent::State(LinkState::Closed) => return Err(Settle::Failed(FailureReason::TransportClosed)),
            TransportEvent::State(_) => {}
            TransportEvent::RemoteTrack { kind, id } => {
                info!(session = %self.session_id, ?kind, track = %id, "remote track");
            }
        }
        Ok(())
    }

    async fn apply_signal(&mut self, sig: Signal) -> Result<(), Settle> {
        let Some(transport) = self.transport.clone() else {
            return Ok(());
        };
        match sig.kind {
            SignalKind::Offer => on_offer(self, transport.as_ref(), sig).await,
            SignalKind::Answer => on_answer(self, transport.as_ref(), sig).await,
            SignalKind::Candidate => {
                match serde_json::from_value::<CandidatePayload>(sig.payload) {
                    Ok(c) => {
                        self.queue.enqueue_or_apply(transport.as_ref(), c).await;
                    }
                    Err(e) => self.drop_signal(sig.id, &format!("bad candidate payload: {e}")),
                }
                Ok(())
            }
        }
    }

    fn drop_signal(&self, id: i64, why: &str) {
        self.metrics.signal_dropped();
        warn!(session = %self.session_id, signal = id, "signal dropped: {why}");
    }

    async fn send_offer(&mut self, transport: &dyn PeerTransport) -> Result<(), Settle> {
        let offer = transport.create_offer().await.map_err(|e| self.negotiation_failed(e))?;
        transport
            .set_local_description(&offer)
            .await
            .map_err(|e| self.negotiation_failed(e))?;
        self.append_description(SignalKind::Offer, &offer).await?;

        // Active only once the offer is durable.
        match self.channel.store().set_status(&self.session_id, SessionStatus::Active, None).await {
            Ok(rec) if rec.status.is_terminal() => Err(Settle::Ended {
                reason: rec.failure_reason,
                notify: false,
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(session = %self.session_id, "promote to active failed: {e:#}");
                Err(Settle::Failed(FailureReason::SignalingFailed))
            }
        }
    }

    async fn append_description(&self, kind: SignalKind, desc: &SessionDescriptionPayload) -> Result<i64, Settle> {
        let payload = serde_json::to_value(desc).map_err(|e| {
            warn!(session = %self.session_id, "encode {kind} failed: {e}");
            Settle::Failed(FailureReason::SignalingFailed)
        })?;
        self.channel.append(kind, payload).await.map_err(|e| {
            warn!(session = %self.session_id, "{kind} not delivered: {e:#}");
            Settle::Failed(FailureReason::SignalingFailed)
        })
    }

    fn negotiation_failed(&self, e: anyhow::Error) -> Settle {
        warn!(session = %self.session_id, "negotiation failed: {e:#}");
        Settle::Failed(FailureReason::NegotiationFailed)
    }

    fn start_outbound(&mut self) {
        let (tx, mut rx) = mpsc::channel::<CandidatePayload>(64);
        let channel = self.channel.clone();
        let sid = self.session_id.clone();
        self.outbound_task = Some(tokio::spawn(async move {
            while let Some(c) = rx.recv().await {
                let payload = match serde_json::to_value(&c) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(session = %sid, "encode local candidate failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = channel.append(SignalKind::Candidate, payload).await {
                    warn!(session = %sid, "local candidate not delivered: {e:#}");
                }
            }
        }));
        self.outbound = Some(tx);
    }

    fn trickle(&self, c: CandidatePayload) {
        let Some(tx) = &self.outbound else { return };
        if tx.try_send(c).is_err() {
            warn!(session = %self.session_id, "outbound candidate backlog full, dropping one");
        }
    }

    /// Stop tracks, close the connection, unsubscribe, then persist.
    async fn teardown(&mut self, settle: Settle, feed: Option<SignalFeed>) -> SessionOutcome {
        let (status, reason, notify) = match settle {
            Settle::Ended { reason, notify } => (SessionStatus::Ended, reason, notify),
            Settle::Failed(reason) => (SessionStatus::Failed, Some(reason), true),
        };

        if let Some(capture) = self.capture.take() {
            if capture.stop() {
                debug!(session = %self.session_id, "local tracks stopped");
            }
        }
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!(session = %self.session_id, "transport close failed: {e:#}");
            }
        }
        self.feed_cancel.cancel();
        if let Some(feed) = feed {
            feed.close().await;
        }
        self.outbound = None;
        if let Some(task) = self.outbound_task.take() {
            task.abort();
        }

        let (status, reason) = match self.channel.persist_status(status, reason).await {
            Ok(rec) => (rec.status, rec.failure_reason),
            Err(e) => {
                warn!(session = %self.session_id, "final status not persisted: {e:#}");
                (status, reason)
            }
        };
        if notify {
            if let Err(e) = self.channel.store().publish_stop(&self.session_id, reason).await {
                debug!(session = %self.session_id, "stop notice failed: {e:#}");
            }
        }

        self.queue.clear();
        self.applied.clear();
        let failed = status == SessionStatus::Failed;
        self.set_state(if failed { PeerState::Failed } else { PeerState::Ended });
        self.metrics.session_settled(failed);
        info!(session = %self.session_id, %status, reason = ?reason, "peer session settled");

        SessionOutcome {
            session_id: self.session_id.clone(),
            status,
            reason,
        }
    }
}

async fn begin_capture(s: &mut PeerSession, transport: &dyn PeerTransport) -> Result<(), Settle> {
    let Some(capture) = s.capture.as_ref() else {
        warn!(session = %s.session_id, "capture session started without hardware");
        return Err(Settle::Failed(FailureReason::HardwareUnavailable));
    };
    let tracks = capture.tracks().to_vec();
    transport
        .attach_capture(&tracks)
        .await
        .map_err(|e| s.negotiation_failed(e))
}

async fn begin_viewer(s: &mut PeerSession, transport: &dyn PeerTransport) -> Result<(), Settle> {
    transport.expect_media(true).await.map_err(|e| s.negotiation_failed(e))
}

async fn on_offer(s: &mut PeerSession, transport: &dyn PeerTransport, sig: Signal) -> Result<(), Settle> {
    if s.role != Role::Viewer {
        s.drop_signal(sig.id, "offer received by capture side");
        return Ok(());
    }
    if s.offer_in_flight || s.offer_applied {
        s.drop_signal(sig.id, "offer already in flight");
        return Ok(());
    }
    let offer: SessionDescriptionPayload = match serde_json::from_value(sig.payload) {
        Ok(v) => v,
        Err(e) => {
            s.drop_signal(sig.id, &format!("bad offer payload: {e}"));
            return Ok(());
        }
    };

    s.offer_in_flight = true;
    if let Err(e) = transport.set_remote_description(&offer).await {
        // Queue stays unflushed until an offer is accepted.
        s.offer_in_flight = false;
        s.drop_signal(sig.id, &format!("offer rejected: {e:#}"));
        return Ok(());
    }
    s.queue.flush(transport).await;
    let answer = transport.create_answer().await.map_err(|e| s.negotiation_failed(e))?;
    transport
        .set_local_description(&answer)
        .await
        .map_err(|e| s.negotiation_failed(e))?;
    s.append_description(SignalKind::Answer, &answer).await?;
    s.offer_in_flight = false;
    s.offer_applied = true;
    debug!(session = %s.session_id, offer = sig.id, "answer sent");
    Ok(())
}

async fn on_answer(s: &mut PeerSession, transport: &dyn PeerTransport, sig: Signal) -> Result<(), Settle> {
    if s.role != Role::Capture {
        s.drop_signal(sig.id, "answer received by viewer side");
        return Ok(());
    }
    if s.answer_applied {
        s.drop_signal(sig.id, "duplicate answer");
        return Ok(());
    }
    let answer: SessionDescriptionPayload = match serde_json::from_value(sig.payload) {
        Ok(v) => v,
        Err(e) => {
            s.drop_signal(sig.id, &format!("bad answer payload: {e}"));
            return Ok(());
        }
    };
    if let Err(e) = transport.set_remote_description(&answer).await {
        s.drop_signal(sig.id, &format!("answer rejected: {e:#}"));
        return Ok(());
    }
    s.answer_applied = true;
    s.queue.flush(transport).await;
    debug!(session = %s.session_id, answer = sig.id, "answer applied");
    Ok(())
}
