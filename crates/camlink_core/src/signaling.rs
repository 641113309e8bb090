/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Consumer side of the signaling channel: retrying appends, and a merged
//! push + poll feed of the remote side's signals.
//!
//! The two read paths are not merged in id order. Each path delivers in
//! increasing id order; consumers drop repeats with [`AppliedSignals`].

use crate::metrics::SessionMetrics;
use crate::retry::{retry, RetryPolicy};
use crate::signal_store::{SignalStore, POLL_LIMIT_MAX};
use anyhow::Result;
use camlink_protocol::{ChannelEvent, FailureReason, Role, SessionRecord, SessionStatus, Signal, SignalKind};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Signal(Signal),
    /// The counterpart (or the store) ended the session.
    Stop(Option<FailureReason>),
}

/// Ids already applied by one peer session. Lives exactly as long as the session.
#[derive(Debug, Default)]
pub struct AppliedSignals {
    seen: HashSet<i64>,
}

impl AppliedSignals {
    /// True the first time `id` is offered, false for every repeat.
    pub fn first_seen(&mut self, id: i64) -> bool {
        self.seen.insert(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

#[derive(Clone)]
pub struct SignalChannel {
    store: Arc<dyn SignalStore>,
    session_id: String,
    local: Role,
    append_policy: RetryPolicy,
    poll_interval: Duration,
    metrics: Arc<SessionMetrics>,
}

impl SignalChannel {
    pub fn new(
        store: Arc<dyn SignalStore>,
        session_id: &str,
        local: Role,
        append_policy: RetryPolicy,
        poll_interval: Duration,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            store,
            session_id: session_id.to_string(),
            local,
            append_policy,
            poll_interval,
            metrics,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &Arc<dyn SignalStore> {
        &self.store
    }

    /// Appends with bounded exponential backoff. An error here means the
    /// message was not durably written.
    pub async fn append(&self, kind: SignalKind, payload: serde_json::Value) -> Result<i64> {
        let out = retry(&self.append_policy, "signal append", |_| {
            let store = self.store.clone();
            let payload = payload.clone();
            async move { store.append(&self.session_id, self.local, kind, payload).await }
        })
        .await;
        if out.is_err() {
            self.metrics.append_failed();
        }
        out
    }

    /// Writes a status with the same retry policy as appends.
    pub async fn persist_status(&self, status: SessionStatus, reason: Option<FailureReason>) -> Result<SessionRecord> {
        retry(&self.append_policy, "status write", |_| {
            let store = self.store.clone();
            async move { store.set_status(&self.session_id, status, reason).await }
        })
        .await
    }

    /// Starts the push subscription and the poll timer. Both stop when
    /// `cancel` fires or the returned feed is dropped.
    pub async fn open(&self, cancel: CancellationToken) -> SignalFeed {
        let (tx, rx) = mpsc::channel(128);
        let mut tasks = Vec::with_capacity(2);

        match self.store.subscribe(&self.session_id).await {
            Ok(mut sub) => {
                let tx = tx.clone();
                let cancel = cancel.clone();
                let remote = self.local.opposite();
                let sid = self.session_id.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        let ev = tokio::select! {
                            _ = cancel.cancelled() => break,
                            ev = sub.recv() => ev,
                        };
                        let Some(ev) = ev else {
                            debug!(session = %sid, "push path closed");
                            break;
                        };
                        let inbound = match ev {
                            ChannelEvent::Signal(sig) if sig.origin == remote && sig.session_id == sid => {
                                Inbound::Signal(sig)
                            }
                            ChannelEvent::Signal(_) => continue,
                            ChannelEvent::Stop { reason, .. } => Inbound::Stop(reason),
                        };
                        if tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(e) => {
                // Poll alone still guarantees delivery.
                warn!(session = %self.session_id, "push subscribe failed, polling only: {e:#}");
            }
        }

        {
            let store = self.store.clone();
            let sid = self.session_id.clone();
            let remote = self.local.opposite();
            let interval = self.poll_interval;
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                poll_loop(store, sid, remote, interval, cancel, tx).await;
            }));
        }

        SignalFeed { rx, cancel, tasks }
    }
}

async fn poll_loop(
    store: Arc<dyn SignalStore>,
    session_id: String,
    remote: Role,
    interval: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<Inbound>,
) {
    let mut since_id = 0i64;
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }

        loop {
            let batch = match store.poll(&session_id, since_id, POLL_LIMIT_MAX).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(session = %session_id, "signal poll failed: {e:#}");
                    break;
                }
            };
            let full = batch.len() as u32 >= POLL_LIMIT_MAX;
            for sig in batch {
                since_id = since_id.max(sig.id);
                if sig.origin != remote {
                    continue;
                }
                if tx.send(Inbound::Signal(sig)).await.is_err() {
                    return;
                }
            }
            if !full {
                break;
            }
        }

        // A stop notice on the push path can be lost; the stored status cannot.
        match store.get_session(&session_id).await {
            Ok(Some(rec)) if rec.status.is_terminal() => {
                if tx.send(Inbound::Stop(rec.failure_reason)).await.is_err() {
                    debug!(session = %session_id, "stored stop not forwarded, feed closed");
                }
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(session = %session_id, "session status poll failed: {e:#}"),
        }
    }
}

/// Merged remote-origin feed for one session.
pub struct SignalFeed {
    rx: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalFeed {
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    /// Unsubscribes both paths and waits for their tasks to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("signal feed task ended abnormally: {e}");
                }
            }
        }
    }
}

impl Drop for SignalFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
