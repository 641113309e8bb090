/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Native connection seam. The peer session only talks to [`PeerTransport`];
//! [`WebrtcTransportFactory`] backs it with webrtc-rs.

use crate::media::{MediaKind, MediaTrack};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use camlink_protocol::{CandidatePayload, RelayDescriptor, SessionDescriptionPayload};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(CandidatePayload),
    State(LinkState),
    RemoteTrack { kind: MediaKind, id: String },
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Registers local tracks for sending.
    async fn attach_capture(&self, tracks: &[Arc<dyn MediaTrack>]) -> Result<()>;
    /// Declares receive-only intent.
    async fn expect_media(&self, audio: bool) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescriptionPayload>;
    async fn create_answer(&self) -> Result<SessionDescriptionPayload>;
    async fn set_local_description(&self, desc: &SessionDescriptionPayload) -> Result<()>;
    async fn set_remote_description(&self, desc: &SessionDescriptionPayload) -> Result<()>;
    /// Must fail while no remote description is set.
    async fn add_candidate(&self, candidate: &CandidatePayload) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, relays: &[RelayDescriptor]) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<TransportEvent>)>;
}

pub struct WebrtcTransportFactory {
    api: Arc<API>,
}

impl WebrtcTransportFactory {
    pub fn new() -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().context("register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media).context("register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api: Arc::new(api) })
    }
}

fn build_ice_servers(relays: &[RelayDescriptor]) -> Vec<RTCIceServer> {
    relays
        .iter()
        .filter(|r| !r.urls.is_empty())
        .map(|r| RTCIceServer {
            urls: r.urls.clone(),
            username: r.username.clone().unwrap_or_default(),
            credential: r.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn link_state(st: RTCPeerConnectionState) -> LinkState {
    match st {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn to_rtc(desc: &SessionDescriptionPayload) -> Result<RTCSessionDescription> {
    let sdp = desc.body.clone();
    let out = match desc.kind.as_str() {
        "offer" => RTCSessionDescription::offer(sdp),
        "answer" => RTCSessionDescription::answer(sdp),
        "pranswer" => RTCSessionDescription::pranswer(sdp),
        other => return Err(anyhow!("unsupported description type: {other}")),
    };
    out.context("invalid sdp")
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescriptionPayload {
    SessionDescriptionPayload {
        kind: desc.sdp_type.to_string(),
        body: desc.sdp,
    }
}

#[async_trait]
impl TransportFactory for WebrtcTransportFactory {
    async fn connect(&self, relays: &[RelayDescriptor]) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<TransportEvent>)> {
        let pc = self
            .api
            .new_peer_connection(RTCConfiguration {
                ice_servers: build_ice_servers(relays),
                ..Default::default()
            })
            .await
            .context("new peer connection")?;
        let pc = Arc::new(pc);
        let (tx, rx) = mpsc::channel(64);

        {
            let tx = tx.clone();
            pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(cand) = cand else { return };
                    match cand.to_json() {
                        Ok(init) => {
                            let payload = CandidatePayload {
                                candidate: init.candidate,
                                media_line_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            };
                            if tx.send(TransportEvent::LocalCandidate(payload)).await.is_err() {
                                debug!("local candidate after session closed");
                            }
                        }
                        Err(e) => warn!("local candidate encode failed: {e}"),
                    }
                })
            }));
        }

        {
            let tx = tx.clone();
            pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    debug!(state = %st, "peer connection state");
                    if tx.send(TransportEvent::State(link_state(st))).await.is_err() {
                        debug!(state = %st, "state change after session closed");
                    }
                })
            }));
        }

        {
            let tx = tx.clone();
            pc.on_track(Box::new(
                move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _tr: Arc<RTCRtpTransceiver>| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let kind = match track.kind() {
                            RTPCodecType::Audio => MediaKind::Audio,
                            _ => MediaKind::Video,
                        };
                        let event = TransportEvent::RemoteTrack {
                            kind,
                            id: track.id().to_string(),
                        };
                        if tx.send(event).await.is_err() {
                            debug!("remote track after session closed");
                        }
                    })
                },
            ));
        }

        let transport: Arc<dyn PeerTransport> = Arc::new(WebrtcTransport { pc });
        Ok((transport, rx))
    }
}

pub struct WebrtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for WebrtcTransport {
    async fn attach_capture(&self, tracks: &[Arc<dyn MediaTrack>]) -> Result<()> {
        for t in tracks {
            let Some(rtc) = t.rtc_track() else {
                continue;
            };
            let sender = self.pc.add_track(rtc).await.context("add track")?;
            // RTCP must be drained for interceptors (NACK, reports) to work.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn expect_media(&self, audio: bool) -> Result<()> {
        let mut kinds = vec![RTPCodecType::Video];
        if audio {
            kinds.push(RTPCodecType::Audio);
        }
        for kind in kinds {
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .context("add recvonly transceiver")?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescriptionPayload> {
        let offer = self.pc.create_offer(None).await.context("create offer")?;
        Ok(from_rtc(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescriptionPayload> {
        let answer = self.pc.create_answer(None).await.context("create answer")?;
        Ok(from_rtc(answer))
    }

    async fn set_local_description(&self, desc: &SessionDescriptionPayload) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .context("set local description")
    }

    async fn set_remote_description(&self, desc: &SessionDescriptionPayload) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .context("set remote description")
    }

    async fn add_candidate(&self, candidate: &CandidatePayload) -> Result<()> {
        if self.pc.remote_description().await.is_none() {
            return Err(anyhow!("no remote description"));
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: None,
                sdp_mline_index: candidate.media_line_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await
            .context("add ice candidate")
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.context("close peer connection")
    }
}
