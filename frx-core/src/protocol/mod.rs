//! JSON message protocol spoken over the WebSocket.
//!
//! # Wire Protocol
//!
//! ## Handshake
//! ```text
//! Client ──[source_face {data, protocol_version?}]──► Server
//! Server ──[source_face_confirmation {status, message}]──► Client
//! ```
//!
//! ## Frames (continuous)
//! ```text
//! Client ──[frame {data, timestamp}]─────────► Server   (repeated)
//! Server ──[processed_frame {data, timestamp}]► Client  (newest wins)
//! ```
//!
//! ## Side channel
//! ```text
//! Client ──[stats_request]──► Server ──[stats {data}]──► Client
//! Client ──[ping]───────────► Server ──[pong {timestamp}]► Client
//! ```
//!
//! Unknown `type` values deserialize to `Unknown` and are ignored by both
//! ends.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, FrxError};
use crate::stats::StatsSnapshot;

/// Handshake protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Client → Server ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One webcam frame.
    Frame {
        data: String,
        #[serde(default)]
        timestamp: f64,
    },
    /// Configuration handshake carrying the source identity image.
    SourceFace {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<u32>,
    },
    StatsRequest,
    Ping,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse one text message.
    ///
    /// A message that fails to parse is a [`DecodeError`], except a
    /// malformed `source_face`, which is a protocol violation.
    pub fn parse(text: &str) -> Result<Self, FrxError> {
        match serde_json::from_str(text) {
            Ok(msg) => Ok(msg),
            Err(e) => {
                let declared = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned));
                if declared.as_deref() == Some("source_face") {
                    Err(FrxError::Protocol(format!("malformed source_face: {e}")))
                } else {
                    Err(DecodeError::Malformed(e.to_string()).into())
                }
            }
        }
    }

    pub fn to_json(&self) -> Result<String, FrxError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ── Server → Client ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A transformed frame. `timestamp` echoes the client's value.
    ProcessedFrame { data: String, timestamp: f64 },
    Stats { data: StatsSnapshot },
    SourceFaceConfirmation {
        status: ConfirmationStatus,
        message: String,
    },
    Pong { timestamp: f64 },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn confirmation_ok(message: impl Into<String>) -> Self {
        Self::SourceFaceConfirmation {
            status: ConfirmationStatus::Success,
            message: message.into(),
        }
    }

    pub fn confirmation_err(message: impl Into<String>) -> Self {
        Self::SourceFaceConfirmation {
            status: ConfirmationStatus::Error,
            message: message.into(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: wall_clock_secs(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, FrxError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, FrxError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Seconds since the Unix epoch as a float, the timestamp unit clients use.
pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frame() {
        let msg = ClientMessage::parse(r#"{"type":"frame","data":"AAAA","timestamp":1.5}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Frame {
                data: "AAAA".into(),
                timestamp: 1.5
            }
        );
    }

    #[test]
    fn parses_stats_request_and_ping() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"stats_request"}"#).unwrap(),
            ClientMessage::StatsRequest
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let msg = ClientMessage::parse(r#"{"type":"telemetry","x":1}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown);
    }

    #[test]
    fn malformed_frame_is_decode_error() {
        let err = ClientMessage::parse(r#"{"type":"frame"}"#).unwrap_err();
        assert!(matches!(err, FrxError::Decode(_)));
        let err = ClientMessage::parse("{not json").unwrap_err();
        assert!(matches!(err, FrxError::Decode(_)));
    }

    #[test]
    fn malformed_source_face_is_protocol_error() {
        let err = ClientMessage::parse(r#"{"type":"source_face","data":42}"#).unwrap_err();
        assert!(matches!(err, FrxError::Protocol(_)));
    }

    #[test]
    fn processed_frame_wire_shape() {
        let json = ServerMessage::ProcessedFrame {
            data: "QUJD".into(),
            timestamp: 42.25,
        }
        .to_json()
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "processed_frame");
        assert_eq!(v["data"], "QUJD");
        assert_eq!(v["timestamp"], 42.25);
    }

    #[test]
    fn stats_wire_shape() {
        let snap = StatsSnapshot {
            connected_sessions: 3,
            frames_processed: 10,
            average_latency: 0.25,
            ..Default::default()
        };
        let json = ServerMessage::Stats { data: snap }.to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "stats");
        assert_eq!(v["data"]["connected_clients"], 3);
        assert_eq!(v["data"]["frames_processed"], 10);
        assert_eq!(v["data"]["processing_time_avg"], 0.25);
    }

    #[test]
    fn confirmation_status_lowercase() {
        let json = ServerMessage::confirmation_err("no face").to_json().unwrap();
        assert!(json.contains(r#""status":"error""#));
        assert!(json.contains(r#""type":"source_face_confirmation""#));
    }
}
