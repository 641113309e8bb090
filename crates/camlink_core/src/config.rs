/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::media::VideoConstraints;
use crate::retry::{Backoff, RetryPolicy};
use std::time::Duration;

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SessionConfig {
    /// Poll interval (milliseconds) for the pull path of the signaling channel.
    pub poll_ms: Option<u64>,
    /// Budget for `connecting -> connected`.
    pub connect_timeout_secs: Option<u64>,
    /// How long a `disconnected` transport may take to heal before the session fails.
    pub disconnect_grace_secs: Option<u64>,
    /// An open session younger than this is reused by a new start for the same endpoint.
    pub recency_window_secs: Option<u64>,
    /// Minimum gap between a stop completing and the next start on the same endpoint.
    pub min_session_gap_ms: Option<u64>,
    /// Extra delay after track release before the camera may be reopened.
    pub hardware_release_grace_ms: Option<u64>,
    /// Default session time-to-live when the start request carries none.
    pub session_ttl_secs: Option<u64>,

    pub append_attempts: Option<u32>,
    pub append_base_backoff_ms: Option<u64>,
    pub append_max_backoff_ms: Option<u64>,

    pub acquire_timeout_ms: Option<u64>,
    pub acquire_attempts: Option<u32>,
    pub acquire_backoff_step_ms: Option<u64>,

    pub video_width: Option<u32>,
    pub video_height: Option<u32>,
    pub video_frame_rate: Option<u32>,
    pub video_min_width: Option<u32>,
    pub video_min_height: Option<u32>,
    pub video_min_frame_rate: Option<u32>,

    /// STUN urls (e.g. `stun:stun.l.google.com:19302`).
    pub stun_urls: Option<Vec<String>>,
    /// TURN urls (e.g. `turn:turn.example:3478?transport=udp`).
    pub turn_urls: Option<Vec<String>>,
    /// Shared secret for time-limited TURN credentials.
    pub turn_secret: Option<String>,
    pub turn_credential_ttl_secs: Option<u64>,
}

/// Resolved, clamped settings used at runtime.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub disconnect_grace: Duration,
    pub recency_window: Duration,
    pub min_session_gap: Duration,
    pub hardware_release_grace: Duration,
    pub session_ttl: Duration,
    pub append_retry: RetryPolicy,
    pub acquire_timeout: Duration,
    pub acquire_retry: RetryPolicy,
    pub preferred_video: VideoConstraints,
    pub minimal_video: VideoConstraints,
    pub relays: RelaySettings,
}

#[derive(Debug, Clone, Default)]
pub struct RelaySettings {
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_secret: Option<String>,
    pub turn_credential_ttl: Duration,
}

fn clean_list(v: Option<Vec<String>>) -> Vec<String> {
    v.unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl SessionConfig {
    pub fn resolve(&self) -> SessionSettings {
        let append_base = self.append_base_backoff_ms.unwrap_or(200).max(10).min(5_000);
        let append_max = self
            .append_max_backoff_ms
            .unwrap_or(3_000)
            .max(append_base)
            .min(30_000);
        let preferred_video = VideoConstraints {
            width: self.video_width.unwrap_or(1280).max(160).min(3840),
            height: self.video_height.unwrap_or(720).max(120).min(2160),
            frame_rate: self.video_frame_rate.unwrap_or(30).max(1).min(60),
        };
        let minimal_video = VideoConstraints {
            width: self.video_min_width.unwrap_or(640).max(160).min(preferred_video.width),
            height: self.video_min_height.unwrap_or(480).max(120).min(preferred_video.height),
            frame_rate: self.video_min_frame_rate.unwrap_or(15).max(1).min(preferred_video.frame_rate),
        };
        SessionSettings {
            poll_interval: Duration::from_millis(self.poll_ms.unwrap_or(1_000).max(100).min(30_000)),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.unwrap_or(20).max(5).min(120)),
            disconnect_grace: Duration::from_secs(self.disconnect_grace_secs.unwrap_or(5).max(1).min(60)),
            recency_window: Duration::from_secs(self.recency_window_secs.unwrap_or(30).max(1).min(600)),
            min_session_gap: Duration::from_millis(self.min_session_gap_ms.unwrap_or(1_500).min(60_000)),
            hardware_release_grace: Duration::from_millis(
                self.hardware_release_grace_ms.unwrap_or(500).min(10_000),
            ),
            session_ttl: Duration::from_secs(self.session_ttl_secs.unwrap_or(3_600).max(60).min(24 * 3_600)),
            append_retry: RetryPolicy {
                max_attempts: self.append_attempts.unwrap_or(4).max(1).min(10),
                backoff: Backoff::Exponential {
                    base: Duration::from_millis(append_base),
                    max: Duration::from_millis(append_max),
                },
                jitter: Duration::from_millis(100),
            },
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms.unwrap_or(8_000).max(500).min(60_000)),
            acquire_retry: RetryPolicy {
                max_attempts: self.acquire_attempts.unwrap_or(3).max(1).min(10),
                backoff: Backoff::Linear {
                    step: Duration::from_millis(self.acquire_backoff_step_ms.unwrap_or(1_000).min(10_000)),
                },
                jitter: Duration::ZERO,
            },
            preferred_video,
            minimal_video,
            relays: RelaySettings {
                stun_urls: clean_list(self.stun_urls.clone()),
                turn_urls: clean_list(self.turn_urls.clone()),
                turn_secret: self
                    .turn_secret
                    .clone()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
                turn_credential_ttl: Duration::from_secs(
                    self.turn_credential_ttl_secs.unwrap_or(3_600).max(60).min(7 * 24 * 3_600),
                ),
            },
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionConfig::default().resolve()
    }
}
