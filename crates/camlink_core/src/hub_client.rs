/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::retry::send_with_retry;
use crate::signal_store::{NewSession, SignalStore, Subscription};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use camlink_protocol::{
    AppendSignalBody, AppendSignalResponse, ChannelEvent, FailureReason, NewSessionBody, OpenSessionResponse,
    PollResponse, Role, SessionLookupResponse, SessionRecord, SessionStatus, Signal, SignalKind, StatusUpdateBody,
    StopNoticeBody,
};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// [`SignalStore`] backed by a remote `camlink_hub`.
#[derive(Clone)]
pub struct HubSignalStore {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HubSignalStore {
    pub fn new(http: reqwest::Client, base: &str, token: Option<String>) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            token: token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn ws_url(&self, path: &str) -> Result<String> {
        let base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("hub url must be http(s): {}", self.base));
        };
        Ok(format!("{base}{path}"))
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = send_with_retry(|| self.auth(self.http.get(url)), 3).await?;
        decode(resp, url).await
    }

    /// Writes are not retried here; the signaling layer owns that policy.
    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(&self, url: &str, body: &B) -> Result<T> {
        let resp = self
            .auth(self.http.post(url).json(body))
            .send()
            .await
            .with_context(|| format!("post {url}"))?;
        decode(resp, url).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response, url: &str) -> Result<T> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!("hub request failed: {url}: {status} {text}"));
    }
    serde_json::from_str(&text).with_context(|| format!("parse hub response from {url}"))
}

fn enc(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

#[async_trait]
impl SignalStore for HubSignalStore {
    async fn create_or_get_open(&self, new: NewSession) -> Result<(SessionRecord, bool)> {
        let body = NewSessionBody {
            id: new.id,
            endpoint_id: new.endpoint_id,
            viewer_id: new.viewer_id,
            expires_at_ms: new.expires_at_ms,
        };
        let resp: OpenSessionResponse = self.post_json(&self.url("/v1/sessions"), &body).await?;
        Ok((resp.session, resp.created))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let resp: SessionLookupResponse = self
            .get_json(&self.url(&format!("/v1/sessions/{}", enc(session_id))))
            .await?;
        Ok(resp.session)
    }

    async fn find_open_session(&self, endpoint_id: &str) -> Result<Option<SessionRecord>> {
        let resp: SessionLookupResponse = self
            .get_json(&self.url(&format!("/v1/endpoints/{}/open", enc(endpoint_id))))
            .await?;
        Ok(resp.session)
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: Option<FailureReason>,
    ) -> Result<SessionRecord> {
        let url = self.url(&format!("/v1/sessions/{}/status", enc(session_id)));
        let resp: SessionLookupResponse = self.post_json(&url, &StatusUpdateBody { status, reason }).await?;
        resp.session.ok_or_else(|| anyhow!("hub returned no session for {session_id}"))
    }

    async fn append(&self, session_id: &str, origin: Role, kind: SignalKind, payload: serde_json::Value) -> Result<i64> {
        let url = self.url(&format!("/v1/sessions/{}/signals", enc(session_id)));
        let resp: AppendSignalResponse = self
            .post_json(&url, &AppendSignalBody { origin, kind, payload })
            .await?;
        if !resp.ok {
            return Err(anyhow!("hub refused signal for {session_id}"));
        }
        Ok(resp.id)
    }

    async fn poll(&self, session_id: &str, since_id: i64, limit: u32) -> Result<Vec<Signal>> {
        let url = self.url(&format!(
            "/v1/sessions/{}/signals?since={since_id}&limit={limit}",
            enc(session_id)
        ));
        let resp: PollResponse = self.get_json(&url).await?;
        Ok(resp.messages)
    }

    async fn subscribe(&self, session_id: &str) -> Result<Subscription> {
        let url = self.ws_url(&format!("/v1/sessions/{}/ws", enc(session_id)))?;
        let token = self.token.clone();
        let (tx, rx) = mpsc::channel(64);
        let sid = session_id.to_string();
        let task = tokio::spawn(async move {
            let mut backoff = Duration::from_millis(250);
            loop {
                match ws_pump(&url, token.as_deref(), &tx).await {
                    Ok(()) => backoff = Duration::from_millis(250),
                    Err(e) => debug!(session = %sid, "push channel dropped: {e:#}"),
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2).min(Duration::from_secs(10));
            }
        });
        Ok(Subscription::new(rx, Some(task)))
    }

    async fn publish_stop(&self, session_id: &str, reason: Option<FailureReason>) -> Result<()> {
        let url = self.url(&format!("/v1/sessions/{}/stop", enc(session_id)));
        let _: serde_json::Value = self.post_json(&url, &StopNoticeBody { reason }).await?;
        Ok(())
    }
}

async fn ws_pump(url: &str, token: Option<&str>, tx: &mpsc::Sender<ChannelEvent>) -> Result<()> {
    let url = match token {
        Some(t) => format!("{url}?token={}", enc(t)),
        None => url.to_string(),
    };
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .context("ws connect")?;
    while let Some(msg) = ws.next().await {
        let msg = msg.context("ws read")?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ChannelEvent>(&text) {
            Ok(ev) => {
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("push channel bad json: {e:#}"),
        }
    }
    Ok(())
}
