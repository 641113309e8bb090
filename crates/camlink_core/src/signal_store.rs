/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Durable, queryable store for sessions and their signaling log.
//!
//! Every mutation of a session or signal record goes through [`SignalStore`].
//! Reads come in two flavours: `poll` (authoritative, ordered by id) and
//! `subscribe` (push, best effort, may miss messages).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use camlink_protocol::{ChannelEvent, FailureReason, Role, SessionRecord, SessionStatus, Signal, SignalKind};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const POLL_LIMIT_MAX: u32 = 200;
const PUSH_BUFFER: usize = 64;

/// Store refusals callers may act on; other failures stay plain `anyhow`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("illegal status transition {from} -> {to} for {session_id}")]
    IllegalTransition {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("signal queue full for session {0}")]
    QueueFull(String),
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub endpoint_id: String,
    pub viewer_id: String,
    pub expires_at_ms: i64,
}

/// Push-path handle. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<ChannelEvent>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<ChannelEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Inserts `new` unless the endpoint already has a pending/active session,
    /// in which case that one is returned with `created = false`.
    async fn create_or_get_open(&self, new: NewSession) -> Result<(SessionRecord, bool)>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    async fn find_open_session(&self, endpoint_id: &str) -> Result<Option<SessionRecord>>;

    /// Applies a legal status transition. Writing to an already terminal
    /// session is a no-op that returns the stored record.
    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: Option<FailureReason>,
    ) -> Result<SessionRecord>;

    async fn append(&self, session_id: &str, origin: Role, kind: SignalKind, payload: serde_json::Value) -> Result<i64>;

    /// Signals with `id > since_id`, ascending.
    async fn poll(&self, session_id: &str, since_id: i64, limit: u32) -> Result<Vec<Signal>>;

    async fn subscribe(&self, session_id: &str) -> Result<Subscription>;

    async fn publish_stop(&self, session_id: &str, reason: Option<FailureReason>) -> Result<()>;
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<ChannelEvent>>>>;

#[derive(Clone)]
pub struct SqliteSignalStore {
    db_path: PathBuf,
    max_signals_per_session: u32,
    channels: Channels,
}

impl SqliteSignalStore {
    pub fn open(db_path: impl AsRef<Path>, max_signals_per_session: u32) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            max_signals_per_session: max_signals_per_session.max(8),
            channels: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn publish(&self, session_id: &str, ev: ChannelEvent) {
        let mut guard = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.get(session_id) else { return };
        if tx.send(ev).is_err() {
            // Nobody listening anymore.
            guard.remove(session_id);
        }
    }

    /// Deletes the signal log of sessions that settled more than `ttl` ago.
    pub async fn purge_signals(&self, ttl: Duration) -> Result<u64> {
        let db_path = self.db_path.clone();
        let cutoff = now_ms().saturating_sub(ttl.as_millis() as i64);
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let conn = open_conn(&db_path)?;
            let n = conn.execute(
                r#"
                DELETE FROM signals WHERE session_id IN (
                  SELECT id FROM sessions
                  WHERE status IN ('ended', 'failed') AND ended_at_ms IS NOT NULL AND ended_at_ms < ?1
                )
                "#,
                params![cutoff],
            )?;
            Ok(n as u64)
        })
        .await?
    }

    /// Ends every open session whose `expires_at_ms` has passed; returns their ids.
    pub async fn expire_sessions(&self) -> Result<Vec<String>> {
        let db_path = self.db_path.clone();
        let now = now_ms();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut conn = open_conn(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM sessions WHERE status IN ('pending', 'active') AND expires_at_ms <= ?1",
                )?;
                let rows = stmt
                    .query_map(params![now], |r| r.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            for id in &ids {
                tx.execute(
                    "UPDATE sessions SET status = 'ended', ended_at_ms = ?2, failure_reason = ?3 WHERE id = ?1",
                    params![id, now, FailureReason::Expired.as_str()],
                )?;
            }
            tx.commit()?;
            Ok(ids)
        })
        .await?
    }
}

#[async_trait]
impl SignalStore for SqliteSignalStore {
    async fn create_or_get_open(&self, new: NewSession) -> Result<(SessionRecord, bool)> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(SessionRecord, bool)> {
            let mut conn = open_conn(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(existing) = select_session(
                &tx,
                "WHERE endpoint_id = ?1 AND status IN ('pending', 'active')",
                &new.endpoint_id,
            )? {
                return Ok((existing, false));
            }
            let now = now_ms();
            tx.execute(
                r#"
                INSERT INTO sessions (id, endpoint_id, viewer_id, status, created_at_ms, ended_at_ms, failure_reason, expires_at_ms)
                VALUES (?1, ?2, ?3, 'pending', ?4, NULL, NULL, ?5)
                "#,
                params![new.id, new.endpoint_id, new.viewer_id, now, new.expires_at_ms],
            )
            .with_context(|| format!("insert session {}", new.id))?;
            tx.commit()?;
            Ok((
                SessionRecord {
                    id: new.id,
                    endpoint_id: new.endpoint_id,
                    viewer_id: new.viewer_id,
                    status: SessionStatus::Pending,
                    created_at_ms: now,
                    ended_at_ms: None,
                    failure_reason: None,
                    expires_at_ms: new.expires_at_ms,
                },
                true,
            ))
        })
        .await?
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<SessionRecord>> {
            let conn = open_conn(&db_path)?;
            select_session(&conn, "WHERE id = ?1", &session_id)
        })
        .await?
    }

    async fn find_open_session(&self, endpoint_id: &str) -> Result<Option<SessionRecord>> {
        let db_path = self.db_path.clone();
        let endpoint_id = endpoint_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<SessionRecord>> {
            let conn = open_conn(&db_path)?;
            select_session(
                &conn,
                "WHERE endpoint_id = ?1 AND status IN ('pending', 'active')",
                &endpoint_id,
            )
        })
        .await?
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: Option<FailureReason>,
    ) -> Result<SessionRecord> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<SessionRecord> {
            let mut conn = open_conn(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut rec) = select_session(&tx, "WHERE id = ?1", &session_id)? else {
                return Err(StoreError::UnknownSession(session_id).into());
            };
            if rec.status.is_terminal() {
                return Ok(rec);
            }
            if !rec.status.can_transition_to(status) {
                return Err(StoreError::IllegalTransition {
                    session_id,
                    from: rec.status,
                    to: status,
                }
                .into());
            }
            let ended_at_ms = status.is_terminal().then(now_ms);
            tx.execute(
                "UPDATE sessions SET status = ?2, ended_at_ms = ?3, failure_reason = ?4 WHERE id = ?1",
                params![session_id, status.as_str(), ended_at_ms, reason.map(|r| r.as_str())],
            )?;
            tx.commit()?;
            rec.status = status;
            rec.ended_at_ms = ended_at_ms;
            rec.failure_reason = reason;
            Ok(rec)
        })
        .await?
    }

    async fn append(&self, session_id: &str, origin: Role, kind: SignalKind, payload: serde_json::Value) -> Result<i64> {
        let db_path = self.db_path.clone();
        let sid = session_id.to_string();
        let payload_json = serde_json::to_string(&payload).context("serialize payload")?;
        let max_signals = self.max_signals_per_session;
        let (id, created_at_ms) = tokio::task::spawn_blocking(move || -> Result<(i64, i64)> {
            let mut conn = open_conn(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let known: Option<String> = tx
                .query_row("SELECT status FROM sessions WHERE id = ?1", params![sid], |r| r.get(0))
                .optional()?;
            if known.is_none() {
                return Err(StoreError::UnknownSession(sid).into());
            }
            let count: u64 = tx.query_row(
                "SELECT COUNT(*) FROM signals WHERE session_id = ?1",
                params![sid],
                |r| r.get(0),
            )?;
            if count >= max_signals as u64 {
                return Err(StoreError::QueueFull(sid).into());
            }
            let now = now_ms();
            tx.execute(
                "INSERT INTO signals (session_id, origin, kind, payload_json, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![sid, origin.as_str(), kind.as_str(), payload_json, now],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok((id, now))
        })
        .await??;

        self.publish(
            session_id,
            ChannelEvent::Signal(Signal {
                id,
                session_id: session_id.to_string(),
                origin,
                kind,
                payload,
                created_at_ms,
            }),
        );
        Ok(id)
    }

    async fn poll(&self, session_id: &str, since_id: i64, limit: u32) -> Result<Vec<Signal>> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        let limit = limit.max(1).min(POLL_LIMIT_MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<Signal>> {
            let conn = open_conn(&db_path)?;
            let mut stmt = conn.prepare(
                r#"
                SELECT id, origin, kind, payload_json, created_at_ms
                FROM signals
                WHERE session_id = ?1 AND id > ?2
                ORDER BY id ASC
                LIMIT ?3
                "#,
            )?;
            let mut rows = stmt.query(params![session_id, since_id, limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let origin: String = row.get(1)?;
                let kind: String = row.get(2)?;
                let payload_json: String = row.get(3)?;
                let created_at_ms: i64 = row.get(4)?;
                out.push(Signal {
                    id,
                    session_id: session_id.clone(),
                    origin: origin.parse().map_err(|e| anyhow!("signal {id}: {e}"))?,
                    kind: kind.parse().map_err(|e| anyhow!("signal {id}: {e}"))?,
                    payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
                    created_at_ms,
                });
            }
            Ok(out)
        })
        .await?
    }

    async fn subscribe(&self, session_id: &str) -> Result<Subscription> {
        let mut bus = {
            let mut guard = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .entry(session_id.to_string())
                .or_insert_with(|| broadcast::channel(PUSH_BUFFER).0)
                .subscribe()
        };
        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        let sid = session_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(ev) => {
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The poll path will pick these up.
                        debug!(session = %sid, skipped = n, "push subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx, Some(task)))
    }

    async fn publish_stop(&self, session_id: &str, reason: Option<FailureReason>) -> Result<()> {
        self.publish(
            session_id,
            ChannelEvent::Stop {
                session_id: session_id.to_string(),
                reason,
            },
        );
        Ok(())
    }
}

fn open_conn(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn select_session(conn: &Connection, filter: &str, key: &str) -> Result<Option<SessionRecord>> {
    let sql = format!(
        "SELECT id, endpoint_id, viewer_id, status, created_at_ms, ended_at_ms, failure_reason, expires_at_ms FROM sessions {filter} LIMIT 1"
    );
    let row = conn
        .query_row(&sql, params![key], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, Option<i64>>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, i64>(7)?,
            ))
        })
        .optional()?;
    let Some((id, endpoint_id, viewer_id, status, created_at_ms, ended_at_ms, reason, expires_at_ms)) = row else {
        return Ok(None);
    };
    let status = status.parse().map_err(|e| anyhow!("session {id}: {e}"))?;
    let failure_reason = match reason {
        Some(r) => match r.parse() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(session = %id, "ignoring stored failure reason: {e}");
                None
            }
        },
        None => None,
    };
    Ok(Some(SessionRecord {
        id,
        endpoint_id,
        viewer_id,
        status,
        created_at_ms,
        ended_at_ms,
        failure_reason,
        expires_at_ms,
    }))
}

fn init_db(path: &Path) -> Result<()> {
    let conn = open_conn(path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS sessions (
          id TEXT PRIMARY KEY,
          endpoint_id TEXT NOT NULL,
          viewer_id TEXT NOT NULL,
          status TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          ended_at_ms INTEGER,
          failure_reason TEXT,
          expires_at_ms INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_endpoint
          ON sessions(endpoint_id) WHERE status IN ('pending', 'active');
        CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON sessions(status, expires_at_ms);
        CREATE TABLE IF NOT EXISTS signals (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          session_id TEXT NOT NULL,
          origin TEXT NOT NULL,
          kind TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_signals_session ON signals(session_id, id);
        "#,
    )?;
    Ok(())
}
