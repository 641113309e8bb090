/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Result};
use rand::{thread_rng, Rng};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^n`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// `step * (n + 1)`.
    Linear { step: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Delay slept after failed attempt number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
            Backoff::Linear { step } => step.saturating_mul(attempt.saturating_add(1)),
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

async fn sleep_with_jitter(base: Duration, jitter: Duration) {
    let jitter_ms = jitter.as_millis() as u64;
    let extra = if jitter_ms == 0 {
        0
    } else {
        thread_rng().gen_range(0..=jitter_ms)
    };
    tokio::time::sleep(base + Duration::from_millis(extra)).await;
}

/// Runs `op` until it succeeds or `policy.max_attempts` is exhausted.
///
/// `op` receives the 0-based attempt number. The last error is returned with
/// the attempt count attached; callers decide whether that is terminal.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.attempts();
    let mut last_err = None;
    for attempt in 0..max_attempts {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt + 1 < max_attempts {
                    let delay = policy.delay_for(attempt);
                    warn!(op = label, attempt = attempt + 1, max_attempts, "retrying in {delay:?}: {e:#}");
                    sleep_with_jitter(delay, policy.jitter).await;
                }
                last_err = Some(e);
            }
        }
    }
    let e = last_err.unwrap_or_else(|| anyhow!("no attempt made"));
    Err(e.context(format!("{label} failed after {max_attempts} attempts")))
}

/// Idempotent HTTP requests against the hub: retries transport errors,
/// 429 and 5xx with exponential backoff.
pub async fn send_with_retry<F>(mut build: F, attempts: u32) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = Duration::from_millis(200);
    let jitter = Duration::from_millis(200);
    for attempt in 0..max_attempts {
        match build().send().await {
            Ok(resp) => {
                if should_retry_status(resp.status()) && attempt + 1 < max_attempts {
                    sleep_with_jitter(backoff, jitter).await;
                    backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
                    continue;
                }
                return Ok(resp);
            }
            Err(e) => {
                if attempt + 1 >= max_attempts {
                    return Err(e.into());
                }
                sleep_with_jitter(backoff, jitter).await;
                backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
            }
        }
    }
    Err(anyhow!("retry loop exhausted"))
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
