//! Per-connection orchestration: builds the peer and its negotiator, joins
//! the declared rooms, bridges media-layer events into negotiation and room
//! fan-out, and runs the eviction protocol when the connection ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::config::Config;
use crate::engine::EngineFactory;
use crate::error::{Error, Result};
use crate::negotiator::Negotiator;
use crate::peer::{MediaPeer, PeerEvent};
use crate::registry::PeerRegistry;
use crate::room::RoomManager;
use crate::signal::{DecodeError, SignalMessage};
use crate::transport::{SignalTransport, CLOSE_NORMAL};
use crate::types::{MemberRole, PeerId, RoomId};

/// Shared state of the whole forwarding unit.
pub struct SfuState {
    config: Config,
    registry: Arc<PeerRegistry>,
    rooms: Arc<RoomManager>,
    engine: Arc<EngineFactory>,
}

impl SfuState {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let registry = Arc::new(PeerRegistry::new());
        let rooms = Arc::new(RoomManager::new(registry.clone()));
        let engine = Arc::new(EngineFactory::new(&config.webrtc)?);
        Ok(Arc::new(Self {
            config,
            registry,
            rooms,
            engine,
        }))
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<EngineFactory> {
        &self.engine
    }

    /// Graceful shutdown: ask every client to close, wait for the drain
    /// deadline, then force-evict whatever is left.
    pub async fn shutdown(self: &Arc<Self>) {
        let grace = self.config.shutdown_grace();
        info!(peers = self.registry.len(), "shutting down, draining clients");
        for peer in self.registry.snapshot() {
            peer.transport().close(CLOSE_NORMAL, "server shutting down");
        }

        let deadline = Instant::now() + grace;
        while !self.registry.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for peer in self.registry.snapshot() {
            evict(self, peer).await;
        }
    }
}

/// Connection parameters taken from the WebSocket query string.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub peer_id: PeerId,
    pub read_rooms: Vec<RoomId>,
    pub write_rooms: Vec<RoomId>,
}

impl SessionParams {
    /// Parse `id`, `readRooms` and `writeRooms` query values; a missing id
    /// gets a server-generated UUID.
    #[must_use]
    pub fn from_query(
        id: Option<String>,
        read_rooms: Option<String>,
        write_rooms: Option<String>,
    ) -> Self {
        Self {
            peer_id: match id {
                Some(id) if !id.is_empty() => PeerId::from(id),
                _ => PeerId::random(),
            },
            read_rooms: split_rooms(read_rooms),
            write_rooms: split_rooms(write_rooms),
        }
    }

    /// Role per room: readRooms only = viewer, writeRooms only = source,
    /// both = both.
    #[must_use]
    pub fn roles(&self) -> HashMap<RoomId, MemberRole> {
        let mut roles: HashMap<RoomId, MemberRole> = HashMap::new();
        for room in &self.read_rooms {
            roles.insert(room.clone(), MemberRole::Viewer);
        }
        for room in &self.write_rooms {
            roles
                .entry(room.clone())
                .and_modify(|role| *role = role.merge(MemberRole::Source))
                .or_insert(MemberRole::Source);
        }
        roles
    }
}

fn split_rooms(raw: Option<String>) -> Vec<RoomId> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(RoomId::from)
            .collect()
    })
    .unwrap_or_default()
}

/// One live signalling session.
pub struct Session {
    state: Arc<SfuState>,
    peer: Arc<MediaPeer>,
    negotiator: Arc<Negotiator>,
    event_pump: JoinHandle<()>,
}

impl Session {
    /// Build the peer and negotiator for a fresh connection, install them,
    /// and join the declared rooms.
    pub async fn start(
        state: Arc<SfuState>,
        params: SessionParams,
        transport: SignalTransport,
    ) -> Result<Self> {
        let pc = state.engine.new_peer_connection().await?;
        let peer = MediaPeer::new(
            params.peer_id.clone(),
            pc,
            transport.clone(),
            state.config.keyframe_interval(),
        );
        // The server is the polite side: on glare it rolls back its own
        // offer and answers the client's.
        let negotiator = Arc::new(Negotiator::new(
            params.peer_id.clone(),
            peer.clone(),
            transport.clone(),
            true,
            state.config.sdp_timeout(),
        ));

        // Subscribe before wiring the engine so no early event is dropped.
        let (subscription, events) = peer.events().subscribe();
        let event_pump = tokio::spawn(run_event_pump(
            state.clone(),
            peer.clone(),
            negotiator.clone(),
            subscription,
            events,
        ));
        peer.bind_engine_callbacks();

        transport.send(&SignalMessage::SignallingReady {
            data: "connected to signalling server, awaiting negotiation".to_string(),
        })?;

        if let Some(displaced) = state.registry.insert(peer.clone()) {
            info!(peer = %params.peer_id, "reconnect with live id, evicting stale peer");
            evict(&state, displaced).await;
        }

        for (room_id, role) in params.roles() {
            state.rooms.get_or_create(room_id).join(&peer, role).await;
        }

        info!(peer = %params.peer_id, "session started");
        Ok(Self {
            state,
            peer,
            negotiator,
            event_pump,
        })
    }

    #[must_use]
    pub fn peer(&self) -> &Arc<MediaPeer> {
        &self.peer
    }

    /// Decode and dispatch one inbound text frame.
    pub async fn handle_frame(&self, text: &str) {
        match SignalMessage::decode(text) {
            Ok(message) => self.dispatch(message).await,
            Err(DecodeError::UnknownType(kind)) => {
                debug!(peer = %self.peer.id(), kind, "ignoring unknown signalling message");
            }
            Err(err) => {
                warn!(peer = %self.peer.id(), error = %err, "dropping malformed signalling message");
            }
        }
    }

    async fn dispatch(&self, message: SignalMessage) {
        match message {
            SignalMessage::Offer { description } | SignalMessage::Answer { description } => {
                match self.negotiator.handle_remote_description(description).await {
                    Ok(()) => {}
                    Err(Error::UnexpectedAnswer(state)) => {
                        warn!(peer = %self.peer.id(), state, "discarding unexpected answer");
                    }
                    Err(err) => {
                        warn!(peer = %self.peer.id(), error = %err, "remote description failed");
                    }
                }
            }
            SignalMessage::Candidate { candidate } => {
                if let Err(err) = self.negotiator.handle_remote_candidate(candidate).await {
                    warn!(peer = %self.peer.id(), error = %err, "remote candidate failed");
                }
            }
            SignalMessage::Retry => {
                if let Err(err) = self.negotiator.handle_retry().await {
                    warn!(peer = %self.peer.id(), error = %err, "retry-initiated negotiation failed");
                }
            }
            SignalMessage::JoinRoom {
                room_id,
                member_id,
                member_type,
            } => {
                if member_id != *self.peer.id() {
                    warn!(
                        peer = %self.peer.id(),
                        claimed = %member_id,
                        "join-room for a different member id, using connection identity"
                    );
                }
                self.state
                    .rooms
                    .get_or_create(room_id)
                    .join(&self.peer, member_type)
                    .await;
            }
            SignalMessage::SignallingReady { .. } | SignalMessage::Track { .. } => {
                debug!(peer = %self.peer.id(), "ignoring server-directed message from client");
            }
        }
    }

    /// Tear the session down; safe to call after the peer was already
    /// evicted through a connection-state change.
    pub async fn shutdown(self) {
        self.negotiator.close().await;
        evict(&self.state, self.peer).await;
        self.event_pump.abort();
    }
}

/// Bridge media-layer events into negotiation, room fan-out and eviction.
async fn run_event_pump(
    state: Arc<SfuState>,
    peer: Arc<MediaPeer>,
    negotiator: Arc<Negotiator>,
    _subscription: crate::events::Subscription<PeerEvent>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::NegotiationNeeded => {
                if let Err(err) = negotiator.negotiation_needed().await {
                    warn!(peer = %peer.id(), error = %err, "negotiation failed");
                }
            }
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(err) = negotiator.handle_local_candidate(candidate) {
                    debug!(peer = %peer.id(), error = %err, "local candidate not sent");
                }
            }
            PeerEvent::TrackPublished(track) => {
                state.rooms.publish_track(peer.id(), track).await;
            }
            PeerEvent::TrackEnded(track_id) => {
                state.rooms.retract_track(peer.id(), &track_id).await;
            }
            PeerEvent::ConnectionState(
                connection_state @ (RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Closed
                | RTCPeerConnectionState::Disconnected),
            ) => {
                info!(peer = %peer.id(), state = %connection_state, "terminal connection state");
                negotiator.close().await;
                evict(&state, peer.clone()).await;
                break;
            }
            PeerEvent::ConnectionState(_) => {}
        }
    }
}

/// Eviction protocol. Runs under the Registry → Room → Peer lock order and
/// is idempotent so the disconnect path and the connection-state path can
/// both trigger it.
pub async fn evict(state: &Arc<SfuState>, peer: Arc<MediaPeer>) {
    let owned = peer.owned_track_ids();

    // Remove this peer's tracks from every other live peer, then drop its
    // room memberships (which detaches again; NotAttached is expected).
    for other in state.registry.snapshot() {
        if Arc::ptr_eq(&other, &peer) {
            continue;
        }
        for track_id in &owned {
            match other.detach_sender(track_id).await {
                Ok(()) | Err(Error::NotAttached(_)) => {}
                Err(err) => {
                    debug!(peer = %other.id(), track = %track_id, error = %err, "detach during eviction");
                }
            }
        }
    }

    state.rooms.leave_all(peer.id()).await;
    peer.close().await;
    state.registry.remove_entry(peer.id(), &peer);
    info!(peer = %peer.id(), "peer evicted");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_derive_from_room_sets() {
        let params = SessionParams::from_query(
            Some("a".to_string()),
            Some("r1,r2".to_string()),
            Some("r2,r3".to_string()),
        );
        let roles = params.roles();
        assert_eq!(roles[&RoomId::from("r1")], MemberRole::Viewer);
        assert_eq!(roles[&RoomId::from("r2")], MemberRole::Both);
        assert_eq!(roles[&RoomId::from("r3")], MemberRole::Source);
    }

    #[test]
    fn test_missing_id_generates_one() {
        let params = SessionParams::from_query(None, None, None);
        assert!(!params.peer_id.as_str().is_empty());
        assert!(params.roles().is_empty());
    }

    #[test]
    fn test_room_lists_are_trimmed() {
        let params =
            SessionParams::from_query(Some(String::new()), Some(" r1 , ,r2".to_string()), None);
        assert_eq!(
            params.read_rooms,
            vec![RoomId::from("r1"), RoomId::from("r2")]
        );
    }
}
