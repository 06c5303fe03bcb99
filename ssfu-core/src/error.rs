use std::time::Duration;
use thiserror::Error;

use crate::types::{PeerId, TrackId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("signalling transport closed")]
    TransportClosed,

    #[error("signalling send queue overflow, client too slow")]
    SlowConsumer,

    #[error("failed to encode signalling message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sdp negotiation failed: {0}")]
    Sdp(String),

    #[error("sdp negotiation timed out after {0:?}")]
    SdpTimeout(Duration),

    #[error("answer received in signalling state {0}")]
    UnexpectedAnswer(String),

    #[error("track {0} is published by this peer")]
    ConflictOwnTrack(TrackId),

    #[error("track {0} is already attached to this peer")]
    AlreadyAttached(TrackId),

    #[error("track {0} is not attached to this peer")]
    NotAttached(TrackId),

    #[error("failed to add remote ice candidate: {0}")]
    IceAdd(String),

    #[error("peer {0} is closed")]
    PeerClosed(PeerId),

    #[error("webrtc engine error: {0}")]
    Engine(#[from] webrtc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
