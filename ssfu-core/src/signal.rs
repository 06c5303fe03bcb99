//! Signalling wire protocol.
//!
//! Self-contained JSON objects over WebSocket text frames, discriminated by
//! a `type` field. Session descriptions and ICE candidates reuse the engine
//! serde representations so the server speaks the same dialect browsers
//! produce from `RTCSessionDescription` / `RTCIceCandidateInit`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::types::{MemberRole, PeerId, RoomId, TrackId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Sent once by the server right after the WebSocket upgrade.
    #[serde(rename = "signalling_ready")]
    SignallingReady { data: String },

    /// Client request to join a room mid-session; augments any membership
    /// established through the connection query parameters.
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        member_id: PeerId,
        member_type: MemberRole,
    },

    #[serde(rename = "offer")]
    Offer { description: RTCSessionDescription },

    #[serde(rename = "answer")]
    Answer { description: RTCSessionDescription },

    /// `candidate: null` conveys end-of-candidates.
    #[serde(rename = "candidate")]
    Candidate {
        candidate: Option<RTCIceCandidateInit>,
    },

    /// Advisory notification that a new track is being forwarded to the
    /// receiving client.
    #[serde(rename = "track")]
    Track { id: TrackId },

    /// Ask the remote side to re-initiate negotiation.
    #[serde(rename = "retry")]
    Retry,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown signalling message type {0:?}")]
    UnknownType(String),

    #[error("signalling message without a type field")]
    MissingType,

    #[error("malformed signalling message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl SignalMessage {
    const KNOWN_TYPES: [&'static str; 7] = [
        "signalling_ready",
        "join-room",
        "offer",
        "answer",
        "candidate",
        "track",
        "retry",
    ];

    /// Decode one wire frame, distinguishing unknown message types (which
    /// callers log and ignore) from malformed payloads.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
            return Err(DecodeError::MissingType);
        };
        if !Self::KNOWN_TYPES.contains(&kind) {
            return Err(DecodeError::UnknownType(kind.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}
