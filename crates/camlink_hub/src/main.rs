/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use camlink_core::signal_store::{now_ms, NewSession, SignalStore, SqliteSignalStore, StoreError, POLL_LIMIT_MAX};
use camlink_protocol::{
    AppendSignalBody, AppendSignalResponse, FailureReason, NewSessionBody, OpenSessionResponse, PollResponse,
    SessionLookupResponse, StatusUpdateBody, StopNoticeBody,
};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn};

#[derive(Debug, Clone)]
struct HubConfig {
    bind: SocketAddr,
    db_path: PathBuf,
    /// Shared secret; when unset every request is accepted.
    token: Option<String>,
    max_body_bytes: usize,
    max_signals_per_session: u32,
    /// How long the signal log of a settled session is kept.
    signal_ttl: Duration,
    sweep_interval: Duration,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn load_config() -> Result<HubConfig> {
    let bind = std::env::var("CAMLINK_HUB_BIND").unwrap_or_else(|_| "0.0.0.0:8790".to_string());
    let bind: SocketAddr = bind
        .parse()
        .with_context(|| format!("CAMLINK_HUB_BIND invalid: {bind}"))?;
    let db_path = std::env::var("CAMLINK_HUB_DB").unwrap_or_else(|_| "camlink_hub.db".to_string());
    let token = std::env::var("CAMLINK_HUB_TOKEN")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    Ok(HubConfig {
        bind,
        db_path: PathBuf::from(db_path),
        token,
        max_body_bytes: env_u64("CAMLINK_HUB_MAX_BODY_BYTES", 64 * 1024).clamp(1024, 1024 * 1024) as usize,
        max_signals_per_session: env_u64("CAMLINK_HUB_MAX_SIGNALS", 2_000).clamp(8, 100_000) as u32,
        signal_ttl: Duration::from_secs(env_u64("CAMLINK_HUB_SIGNAL_TTL_SECS", 3_600).max(60)),
        sweep_interval: Duration::from_secs(env_u64("CAMLINK_HUB_SWEEP_SECS", 15).clamp(1, 3_600)),
    })
}

#[derive(Default)]
struct HubMetrics {
    sessions_opened: AtomicU64,
    signals_appended: AtomicU64,
    stops_published: AtomicU64,
    sessions_expired: AtomicU64,
    signals_purged: AtomicU64,
    ws_clients: AtomicU64,
}

#[derive(Debug, serde::Serialize)]
struct HubMetricsSnapshot {
    sessions_opened: u64,
    signals_appended: u64,
    stops_published: u64,
    sessions_expired: u64,
    signals_purged: u64,
    ws_clients: u64,
}

impl HubMetrics {
    fn snapshot(&self) -> HubMetricsSnapshot {
        HubMetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            signals_appended: self.signals_appended.load(Ordering::Relaxed),
            stops_published: self.stops_published.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            signals_purged: self.signals_purged.load(Ordering::Relaxed),
            ws_clients: self.ws_clients.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct HubState {
    cfg: Arc<HubConfig>,
    store: Arc<SqliteSignalStore>,
    metrics: Arc<HubMetrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = load_config()?;
    let store = SqliteSignalStore::open(&cfg.db_path, cfg.max_signals_per_session)
        .with_context(|| format!("open hub db {}", cfg.db_path.display()))?;
    if cfg.token.is_none() {
        warn!("CAMLINK_HUB_TOKEN unset: accepting unauthenticated requests");
    }
    let addr = cfg.bind;
    let state = HubState {
        cfg: Arc::new(cfg),
        store: Arc::new(store),
        metrics: Arc::new(HubMetrics::default()),
    };

    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_state.cfg.sweep_interval);
        loop {
            interval.tick().await;
            if let Err(e) = sweep_once(&sweep_state).await {
                error!("session sweep failed: {e:#}");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(version = camlink_core::version(), "camlink_hub listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {e}");
            }
            info!("shutdown requested");
        })
        .await
        .context("serve")?;
    Ok(())
}

fn router(state: HubState) -> Router {
    let max_body = state.cfg.max_body_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/metrics", get(metrics_json))
        .route("/v1/sessions", post(open_session))
        .route("/v1/sessions/:id", get(get_session))
        .route("/v1/sessions/:id/status", post(update_status))
        .route("/v1/sessions/:id/signals", get(poll_signals).post(append_signal))
        .route("/v1/sessions/:id/stop", post(stop_session))
        .route("/v1/sessions/:id/ws", get(session_ws))
        .route("/v1/endpoints/:id/open", get(open_for_endpoint))
        .layer(axum::extract::DefaultBodyLimit::max(max_body))
        .layer(
            // Path only: the ws query string carries the token.
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                info_span!("http", method = %req.method(), path = %req.uri().path())
            }),
        )
        .with_state(state)
}

/// Ends sessions past their expiry, tells their peers, and drops old signal logs.
async fn sweep_once(state: &HubState) -> Result<()> {
    let expired = state.store.expire_sessions().await?;
    for id in &expired {
        if let Err(e) = state.store.publish_stop(id, Some(FailureReason::Expired)).await {
            debug!(session = %id, "expiry notice failed: {e:#}");
        }
    }
    let purged = state.store.purge_signals(state.cfg.signal_ttl).await?;
    state
        .metrics
        .sessions_expired
        .fetch_add(expired.len() as u64, Ordering::Relaxed);
    state.metrics.signals_purged.fetch_add(purged, Ordering::Relaxed);
    if !expired.is_empty() || purged > 0 {
        info!(expired = expired.len(), purged, "session sweep");
    }
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let v = headers.get("Authorization")?.to_str().ok()?.trim().to_string();
    let v = v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer "))?;
    let v = v.trim();
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

fn authorize(state: &HubState, headers: &HeaderMap, query_token: Option<&str>) -> Result<(), Response> {
    let Some(want) = state.cfg.token.as_deref() else {
        return Ok(());
    };
    let got = bearer_token(headers).or_else(|| query_token.map(|t| t.trim().to_string()));
    match got {
        Some(t) if t == want => Ok(()),
        Some(_) => Err((StatusCode::FORBIDDEN, "invalid token").into_response()),
        None => Err((StatusCode::UNAUTHORIZED, "missing bearer token").into_response()),
    }
}

fn valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'))
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|_| (StatusCode::BAD_REQUEST, "invalid json").into_response())
}

fn store_error(e: anyhow::Error) -> Response {
    let msg = format!("{e:#}");
    let status = match e.downcast_ref::<StoreError>() {
        Some(StoreError::UnknownSession(_)) => StatusCode::NOT_FOUND,
        Some(StoreError::IllegalTransition { .. }) => StatusCode::CONFLICT,
        Some(StoreError::QueueFull(_)) => StatusCode::TOO_MANY_REQUESTS,
        None => {
            warn!("store error: {msg}");
            StatusCode::BAD_GATEWAY
        }
    };
    (status, msg).into_response()
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_json(State(state): State<HubState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers, None) {
        return resp;
    }
    Json(state.metrics.snapshot()).into_response()
}

async fn open_session(State(state): State<HubState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(resp) = authorize(&state, &headers, None) {
        return resp;
    }
    let req: NewSessionBody = match parse_json(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if !valid_id(&req.id) || !valid_id(&req.endpoint_id) || !valid_id(&req.viewer_id) {
        return (StatusCode::BAD_REQUEST, "invalid id").into_response();
    }
    if req.expires_at_ms <= now_ms() {
        return (StatusCode::BAD_REQUEST, "session already expired").into_response();
    }
    let new = NewSession {
        id: req.id,
        endpoint_id: req.endpoint_id,
        viewer_id: req.viewer_id,
        expires_at_ms: req.expires_at_ms,
    };
    match state.store.create_or_get_open(new).await {
        Ok((session, created)) => {
            if created {
                state.metrics.sessions_opened.fetch_add(1, Ordering::Relaxed);
                info!(session = %session.id, endpoint = %session.endpoint_id, "session opened");
            }
            Json(OpenSessionResponse {
                ok: true,
                session,
                created,
            })
            .into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn get_session(State(state): State<HubState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(resp) = authorize(&state, &headers, None) {
        return resp;
    }
    match state.store.get_session(&id).await {
        Ok(session) => Json(SessionLookupResponse { ok: true, session }).into_response(),
        Err(e) => store_error(e),
    }
}

async fn open_for_endpoint(State(state): State<HubState>, headers: HeaderMap, Path(endpoint): Path<String>) -> Response {
    if let Err(resp) = authorize(&state, &headers, None) {
        return resp;
    }
    match state.store.find_open_session(&endpoint).await {
        Ok(session) => Json(SessionLookupResponse { ok: true, session }).into_response(),
        Err(e) => store_error(e),
    }
}

async fn update_status(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, None) {
        return resp;
    }
    let req: StatusUpdateBody = match parse_json(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.store.set_status(&id, req.status, req.reason).await {
        Ok(rec) => {
            debug!(session = %id, status = %rec.status, "status written");
            Json(SessionLookupResponse {
                ok: true,
                session: Some(rec),
            })
            .into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn append_signal(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, None) {
        return resp;
    }
    let req: AppendSignalBody = match parse_json(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.store.append(&id, req.origin, req.kind, req.payload).await {
        Ok(signal_id) => {
            state.metrics.signals_appended.fetch_add(1, Ordering::Relaxed);
            Json(AppendSignalResponse { ok: true, id: signal_id }).into_response()
        }
        Err(e) => store_error(e),
    }
}

#[derive(Debug, serde::Deserialize)]
struct PollQuery {
    since: Option<i64>,
    limit: Option<u32>,
}

async fn poll_signals(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<PollQuery>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, None) {
        return resp;
    }
    let since = q.since.unwrap_or(0).max(0);
    let limit = q.limit.unwrap_or(100).clamp(1, POLL_LIMIT_MAX);
    match state.store.poll(&id, since, limit).await {
        Ok(messages) => Json(PollResponse { ok: true, messages }).into_response(),
        Err(e) => store_error(e),
    }
}

async fn stop_session(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, None) {
        return resp;
    }
    let req: StopNoticeBody = if body.is_empty() {
        StopNoticeBody::default()
    } else {
        match parse_json(&body) {
            Ok(v) => v,
            Err(resp) => return resp,
        }
    };
    match state.store.publish_stop(&id, req.reason).await {
        Ok(()) => {
            state.metrics.stops_published.fetch_add(1, Ordering::Relaxed);
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        Err(e) => store_error(e),
    }
}

#[derive(Debug, serde::Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn session_ws(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, q.token.as_deref()) {
        return resp;
    }
    ws.on_upgrade(move |socket| pump_channel(state, id, socket))
}

/// Forwards the session's push events to one websocket client until either
/// side goes away.
async fn pump_channel(state: HubState, session_id: String, socket: WebSocket) {
    let mut sub = match state.store.subscribe(&session_id).await {
        Ok(s) => s,
        Err(e) => {
            warn!(session = %session_id, "subscribe failed: {e:#}");
            return;
        }
    };
    state.metrics.ws_clients.fetch_add(1, Ordering::Relaxed);
    debug!(session = %session_id, "push client attached");

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            ev = sub.recv() => {
                let Some(ev) = ev else { break };
                let text = match serde_json::to_string(&ev) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(session = %session_id, "encode push event failed: {e}");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.metrics.ws_clients.fetch_sub(1, Ordering::Relaxed);
    debug!(session = %session_id, "push client detached");
}
