/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Capture-side hardware acquisition.

use crate::metrics::SessionMetrics;
use crate::retry::{retry, Backoff, RetryPolicy};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// One rung of the acquisition ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constraints {
    pub video: VideoConstraints,
    pub audio: bool,
}

/// Strictest first; the last rung drops audio so a broken microphone never
/// blocks video.
pub fn constraint_ladder(preferred: VideoConstraints, minimal: VideoConstraints) -> [Constraints; 3] {
    [
        Constraints {
            video: preferred,
            audio: true,
        },
        Constraints {
            video: minimal,
            audio: true,
        },
        Constraints {
            video: minimal,
            audio: false,
        },
    ]
}

pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// Releases the underlying device. Returns false if already stopped.
    fn stop(&self) -> bool;
    fn is_live(&self) -> bool;
    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HardwareReport {
    pub video_present: bool,
    pub audio_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn open_video(&self, constraints: &VideoConstraints) -> Result<Arc<dyn MediaTrack>>;
    async fn open_audio(&self) -> Result<Arc<dyn MediaTrack>>;
    /// Presence check only; must not start capture.
    async fn probe(&self) -> HardwareReport;
}

/// Tracks owned by one session. Stopping is idempotent and also happens on drop.
pub struct CaptureHandle {
    tracks: Vec<Arc<dyn MediaTrack>>,
    constraints: Constraints,
    audio_enabled: bool,
    stopped: AtomicBool,
}

impl CaptureHandle {
    fn new(tracks: Vec<Arc<dyn MediaTrack>>, constraints: Constraints) -> Self {
        let audio_enabled = tracks.iter().any(|t| t.kind() == MediaKind::Audio);
        Self {
            tracks,
            constraints,
            audio_enabled,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn constraints(&self) -> Constraints {
        self.constraints
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Returns true only for the call that actually released the tracks.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        for t in &self.tracks {
            t.stop();
        }
        true
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("tracks", &self.tracks.len())
            .field("constraints", &self.constraints)
            .field("audio_enabled", &self.audio_enabled)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

type Partial = Arc<Mutex<Vec<Arc<dyn MediaTrack>>>>;

fn stop_partial(partial: &Partial) -> usize {
    let tracks = match partial.lock() {
        Ok(mut g) => std::mem::take(&mut *g),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    tracks.iter().filter(|t| t.stop()).count()
}

fn remember(partial: &Partial, track: &Arc<dyn MediaTrack>) {
    if let Ok(mut g) = partial.lock() {
        g.push(track.clone());
    }
}

pub struct MediaController {
    device: Arc<dyn CaptureDevice>,
    ladder: [Constraints; 3],
    backoff_step: Duration,
    metrics: Arc<SessionMetrics>,
}

impl MediaController {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        preferred: VideoConstraints,
        minimal: VideoConstraints,
        backoff_step: Duration,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            device,
            ladder: constraint_ladder(preferred, minimal),
            backoff_step,
            metrics,
        }
    }

    pub async fn hardware_check(&self) -> HardwareReport {
        self.device.probe().await
    }

    /// Acquires camera (and, if possible, microphone) with up to
    /// `max_attempts` time-boxed attempts and a linear backoff in between.
    pub async fn acquire(&self, timeout: Duration, max_attempts: u32) -> Result<CaptureHandle> {
        let policy = RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Linear {
                step: self.backoff_step,
            },
            jitter: Duration::ZERO,
        };
        let out = retry(&policy, "media acquire", |attempt| async move {
            let partial: Partial = Arc::new(Mutex::new(Vec::new()));
            match tokio::time::timeout(timeout, self.attempt(&partial)).await {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(e)) => {
                    let stopped = stop_partial(&partial);
                    debug!(attempt, stopped, "acquire attempt failed");
                    Err(e)
                }
                Err(_) => {
                    let stopped = stop_partial(&partial);
                    debug!(attempt, stopped, "acquire attempt timed out");
                    Err(anyhow!("acquire attempt timed out after {timeout:?}"))
                }
            }
        })
        .await;
        match out {
            Ok(handle) => {
                info!(
                    audio = handle.audio_enabled(),
                    width = handle.constraints().video.width,
                    height = handle.constraints().video.height,
                    "capture hardware acquired"
                );
                Ok(handle)
            }
            Err(e) => {
                self.metrics.acquire_failed();
                Err(e)
            }
        }
    }

    async fn attempt(&self, partial: &Partial) -> Result<CaptureHandle> {
        let mut last_err = None;
        for rung in self.ladder {
            let video = match self.device.open_video(&rung.video).await {
                Ok(t) => t,
                Err(e) => {
                    debug!(?rung, "video open failed: {e:#}");
                    last_err = Some(e);
                    continue;
                }
            };
            remember(partial, &video);
            if !rung.audio {
                forget_partial(partial);
                warn!("microphone unavailable, continuing video-only");
                return Ok(CaptureHandle::new(vec![video], rung));
            }
            match self.device.open_audio().await {
                Ok(audio) => {
                    remember(partial, &audio);
                    forget_partial(partial);
                    return Ok(CaptureHandle::new(vec![video, audio], rung));
                }
                Err(e) => {
                    debug!(?rung, "audio open failed: {e:#}");
                    stop_partial(partial);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow!("no capture constraints configured"))
            .context("no constraint level could be satisfied"))
    }
}

/// Ownership moves to the returned handle; nothing is stopped.
fn forget_partial(partial: &Partial) {
    if let Ok(mut g) = partial.lock() {
        g.clear();
    }
}

/// Track fed by an external encoder through [`TrackLocalStaticSample`].
pub struct SampleTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    live: AtomicBool,
}

impl SampleTrack {
    fn new(kind: MediaKind) -> Self {
        let (mime, clock_rate, channels, id) = match kind {
            MediaKind::Video => (MIME_TYPE_H264, 90_000, 0, "video"),
            MediaKind::Audio => (MIME_TYPE_OPUS, 48_000, 2, "audio"),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                clock_rate,
                channels,
                ..Default::default()
            },
            id.to_owned(),
            "camlink".to_owned(),
        ));
        Self {
            id: id.to_owned(),
            kind,
            track,
            live: AtomicBool::new(true),
        }
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }
}

impl MediaTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) -> bool {
        self.live.swap(false, Ordering::SeqCst)
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(self.track.clone())
    }
}

/// Capture device whose samples come from an external encoder process.
///
/// A second `open_video` while the previous video track is live fails as
/// "busy", the way a real camera does.
pub struct SampleFeedDevice {
    video_available: AtomicBool,
    audio_available: AtomicBool,
    video: Mutex<Option<Arc<SampleTrack>>>,
    audio: Mutex<Option<Arc<SampleTrack>>>,
}

impl SampleFeedDevice {
    pub fn new(video_available: bool, audio_available: bool) -> Self {
        Self {
            video_available: AtomicBool::new(video_available),
            audio_available: AtomicBool::new(audio_available),
            video: Mutex::new(None),
            audio: Mutex::new(None),
        }
    }

    pub fn set_available(&self, video: bool, audio: bool) {
        self.video_available.store(video, Ordering::SeqCst);
        self.audio_available.store(audio, Ordering::SeqCst);
    }

    /// Live video track for the encoder to write into, if capture is running.
    pub fn current_video(&self) -> Option<Arc<TrackLocalStaticSample>> {
        current(&self.video)
    }

    pub fn current_audio(&self) -> Option<Arc<TrackLocalStaticSample>> {
        current(&self.audio)
    }

    fn open(&self, slot: &Mutex<Option<Arc<SampleTrack>>>, kind: MediaKind) -> Result<Arc<dyn MediaTrack>> {
        let mut g = slot.lock().map_err(|_| anyhow!("device state poisoned"))?;
        if g.as_ref().is_some_and(|t| t.is_live()) {
            return Err(anyhow!("{kind:?} device busy"));
        }
        let track = Arc::new(SampleTrack::new(kind));
        *g = Some(track.clone());
        Ok(track)
    }
}

fn current(slot: &Mutex<Option<Arc<SampleTrack>>>) -> Option<Arc<TrackLocalStaticSample>> {
    let g = slot.lock().ok()?;
    g.as_ref().filter(|t| t.is_live()).map(|t| t.sample_track())
}

#[async_trait]
impl CaptureDevice for SampleFeedDevice {
    async fn open_video(&self, constraints: &VideoConstraints) -> Result<Arc<dyn MediaTrack>> {
        if !self.video_available.load(Ordering::SeqCst) {
            return Err(anyhow!("no video source"));
        }
        self.open(&self.video, MediaKind::Video)
            .with_context(|| format!("open video {}x{}@{}", constraints.width, constraints.height, constraints.frame_rate))
    }

    async fn open_audio(&self) -> Result<Arc<dyn MediaTrack>> {
        if !self.audio_available.load(Ordering::SeqCst) {
            return Err(anyhow!("no audio source"));
        }
        self.open(&self.audio, MediaKind::Audio).context("open audio")
    }

    async fn probe(&self) -> HardwareReport {
        HardwareReport {
            video_present: self.video_available.load(Ordering::SeqCst),
            audio_present: self.audio_available.load(Ordering::SeqCst),
            detail: Some("sample feed".to_string()),
        }
    }
}
