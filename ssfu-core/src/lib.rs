//! `ssfu` core — a selective forwarding unit for real-time audio/video.
//!
//! The server terminates WebRTC peer connections from many clients and
//! forwards each publisher's RTP packets, unmodified, to every subscriber in
//! the same room. A WebSocket signalling channel per client carries session
//! descriptions and ICE candidates so connections can be established and
//! renegotiated as room membership changes.
//!
//! ## Architecture
//!
//! - **[`SignalTransport`]**: framed JSON message channel to one client
//! - **[`Negotiator`]**: per-peer perfect-negotiation state machine
//! - **[`MediaPeer`]**: one WebRTC connection plus track bookkeeping
//! - **[`PeerRegistry`]**: process-wide index of live peers
//! - **[`Room`] / [`RoomManager`]**: named member groupings with track fan-out
//! - **[`Session`]**: per-connection glue and lifecycle

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod negotiator;
pub mod peer;
pub mod registry;
pub mod room;
pub mod session;
pub mod signal;
pub mod transport;
pub mod types;

pub use config::Config;
pub use engine::EngineFactory;
pub use error::{Error, Result};
pub use events::{EventHub, Subscription};
pub use negotiator::{Negotiator, SdpEndpoint};
pub use peer::{MediaPeer, PeerEvent};
pub use registry::PeerRegistry;
pub use room::{Room, RoomManager};
pub use session::{Session, SessionParams, SfuState};
pub use signal::SignalMessage;
pub use transport::{OutboundFrame, SignalTransport};
pub use types::{MemberRole, PeerId, RoomId, TrackId};
