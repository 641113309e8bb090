/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::RelaySettings;
use anyhow::{anyhow, Result};
use base64::Engine as _;
use camlink_protocol::RelayDescriptor;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::warn;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

type HmacSha1 = Hmac<Sha1>;

/// Builds the relay list handed out with every started session.
#[derive(Debug, Clone)]
pub struct RelayProvider {
    settings: RelaySettings,
}

impl RelayProvider {
    pub fn new(settings: RelaySettings) -> Self {
        Self { settings }
    }

    /// At least one reflection server, plus TURN with time-limited
    /// credentials when a shared secret is configured.
    pub fn descriptors(&self, endpoint_id: &str, now_ms: i64) -> Vec<RelayDescriptor> {
        let stun = if self.settings.stun_urls.is_empty() {
            vec![DEFAULT_STUN_URL.to_string()]
        } else {
            self.settings.stun_urls.clone()
        };
        let mut out = vec![RelayDescriptor {
            urls: stun,
            username: None,
            credential: None,
        }];

        if self.settings.turn_urls.is_empty() {
            return out;
        }
        let Some(secret) = self.settings.turn_secret.as_deref() else {
            warn!("turn urls configured without a shared secret, skipping");
            return out;
        };
        let expiry = now_ms / 1000 + self.settings.turn_credential_ttl.as_secs() as i64;
        let username = format!("{expiry}:{endpoint_id}");
        match turn_credential(secret, &username) {
            Ok(credential) => out.push(RelayDescriptor {
                urls: self.settings.turn_urls.clone(),
                username: Some(username),
                credential: Some(credential),
            }),
            Err(e) => warn!("turn credential failed: {e:#}"),
        }
        out
    }
}

/// `base64(HMAC-SHA1(secret, username))`, the TURN REST credential scheme.
pub fn turn_credential(secret: &str, username: &str) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).map_err(|e| anyhow!("hmac key: {e}"))?;
    mac.update(username.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}
