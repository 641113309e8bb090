/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side of the media exchange a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Hosts the camera/microphone and makes the offer.
    Capture,
    /// Consumes the stream and answers.
    Viewer,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Capture => Role::Viewer,
            Role::Viewer => Role::Capture,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Capture => "capture",
            Role::Viewer => "viewer",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "capture" => Ok(Role::Capture),
            "viewer" => Ok(Role::Viewer),
            _ => Err(UnknownValue::new("role", s)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

impl FromStr for SignalKind {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offer" => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            "candidate" => Ok(SignalKind::Candidate),
            _ => Err(UnknownValue::new("signal kind", s)),
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Active)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }

    /// Status only moves forward: pending -> active -> {ended, failed}.
    /// Re-writing the current open status is allowed (idempotent promote).
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Pending, SessionStatus::Pending) => true,
            (SessionStatus::Pending, SessionStatus::Active) => true,
            (SessionStatus::Active, SessionStatus::Active) => true,
            (SessionStatus::Pending | SessionStatus::Active, SessionStatus::Ended | SessionStatus::Failed) => true,
            _ => false,
        }
    }
}

impl FromStr for SessionStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(UnknownValue::new("session status", s)),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason persisted with a failed (or expired) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    TransportFailed,
    TransportClosed,
    Disconnected,
    HardwareUnavailable,
    SignalingFailed,
    NegotiationFailed,
    Expired,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::TransportFailed => "transport_failed",
            FailureReason::TransportClosed => "transport_closed",
            FailureReason::Disconnected => "disconnected",
            FailureReason::HardwareUnavailable => "hardware_unavailable",
            FailureReason::SignalingFailed => "signaling_failed",
            FailureReason::NegotiationFailed => "negotiation_failed",
            FailureReason::Expired => "expired",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl FromStr for FailureReason {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = match s.trim().to_ascii_lowercase().as_str() {
            "timeout" => FailureReason::Timeout,
            "transport_failed" => FailureReason::TransportFailed,
            "transport_closed" => FailureReason::TransportClosed,
            "disconnected" => FailureReason::Disconnected,
            "hardware_unavailable" => FailureReason::HardwareUnavailable,
            "signaling_failed" => FailureReason::SignalingFailed,
            "negotiation_failed" => FailureReason::NegotiationFailed,
            "expired" => FailureReason::Expired,
            "cancelled" => FailureReason::Cancelled,
            _ => return Err(UnknownValue::new("failure reason", s)),
        };
        Ok(v)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownValue {
    what: &'static str,
    value: String,
}

impl UnknownValue {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.what, self.value)
    }
}

impl std::error::Error for UnknownValue {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub endpoint_id: String,
    pub viewer_id: String,
    pub status: SessionStatus,
    pub created_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub session_id: String,
    pub origin: Role,
    pub kind: SignalKind,
    pub payload: serde_json::Value,
    pub created_at_ms: i64,
}

/// Offer/answer body as exchanged on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "mediaLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub media_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// One STUN/TURN entry handed to both peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub endpoint_id: String,
    pub viewer_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub channel: String,
    pub relays: Vec<RelayDescriptor>,
    pub expires_at_ms: i64,
    #[serde(default)]
    pub reused: bool,
}

/// Message delivered on the push path of a session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ChannelEvent {
    Signal(Signal),
    Stop {
        session_id: String,
        #[serde(default)]
        reason: Option<FailureReason>,
    },
}

pub fn channel_name(session_id: &str) -> String {
    format!("camlink/session/{session_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSessionBody {
    pub id: String,
    pub endpoint_id: String,
    pub viewer_id: String,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub ok: bool,
    pub session: SessionRecord,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLookupResponse {
    pub ok: bool,
    #[serde(default)]
    pub session: Option<SessionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateBody {
    pub status: SessionStatus,
    #[serde(default)]
    pub reason: Option<FailureReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendSignalBody {
    pub origin: Role,
    pub kind: SignalKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendSignalResponse {
    pub ok: bool,
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub ok: bool,
    pub messages: Vec<Signal>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopNoticeBody {
    #[serde(default)]
    pub reason: Option<FailureReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        assert!(SessionStatus::Pending.can_transition_to(SessionStatus::Active));
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Failed));
        assert!(!SessionStatus::Active.can_transition_to(SessionStatus::Pending));
        assert!(!SessionStatus::Ended.can_transition_to(SessionStatus::Active));
        assert!(!SessionStatus::Failed.can_transition_to(SessionStatus::Ended));
    }

    #[test]
    fn payload_shapes_use_transport_field_names() {
        let c = CandidatePayload {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            media_line_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["mediaLineIndex"], 0);
        assert_eq!(v["usernameFragment"], "abcd");

        let d: SessionDescriptionPayload =
            serde_json::from_value(serde_json::json!({"type": "offer", "body": "v=0"})).unwrap();
        assert_eq!(d.kind, "offer");
    }

    #[test]
    fn channel_event_is_tagged() {
        let ev = ChannelEvent::Stop {
            session_id: "s1".to_string(),
            reason: Some(FailureReason::Timeout),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["t"], "stop");
        assert_eq!(v["reason"], "timeout");
    }

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!(" OFFER ".parse::<SignalKind>().unwrap(), SignalKind::Offer);
        assert!("bye".parse::<SignalKind>().is_err());
        assert_eq!("transport_closed".parse::<FailureReason>().unwrap(), FailureReason::TransportClosed);
    }
}
