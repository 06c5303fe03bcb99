//! Rooms: named member groupings with track fan-out.
//!
//! A room holds member roles and an index of the local tracks currently
//! published into it. Members are addressed by `PeerId` and resolved through
//! the registry, so a room never keeps a peer alive past its eviction.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::error::Error;
use crate::peer::MediaPeer;
use crate::registry::PeerRegistry;
use crate::signal::SignalMessage;
use crate::types::{MemberRole, PeerId, RoomId, TrackId};

struct PublishedTrack {
    publisher: PeerId,
    track: Arc<TrackLocalStaticRTP>,
}

#[derive(Default)]
struct RoomInner {
    members: HashMap<PeerId, MemberRole>,
    tracks: HashMap<TrackId, PublishedTrack>,
}

pub struct Room {
    id: RoomId,
    registry: Arc<PeerRegistry>,
    inner: tokio::sync::Mutex<RoomInner>,
}

impl Room {
    fn new(id: RoomId, registry: Arc<PeerRegistry>) -> Self {
        Self {
            id,
            registry,
            inner: tokio::sync::Mutex::new(RoomInner::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Add a member, merging roles on a repeated join. A joining viewer is
    /// attached to every track already published by other members; the
    /// attaches complete before the engine's single resulting negotiation
    /// fires.
    pub async fn join(&self, peer: &Arc<MediaPeer>, role: MemberRole) {
        let mut inner = self.inner.lock().await;
        let role = match inner.members.get(peer.id()) {
            Some(existing) => existing.merge(role),
            None => role,
        };
        inner.members.insert(peer.id().clone(), role);
        info!(room = %self.id, peer = %peer.id(), %role, "member joined");

        if role.can_view() {
            for published in inner.tracks.values() {
                if published.publisher == *peer.id() {
                    continue;
                }
                attach_and_notify(peer, published).await;
            }
        }
    }

    /// Remove a member. Tracks the departing peer published here are
    /// detached from every remaining viewer, each detach raising its own
    /// renegotiation. Returns true when the room became empty.
    pub async fn leave(&self, peer_id: &PeerId) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.members.remove(peer_id).is_none() {
            return inner.members.is_empty();
        }
        info!(room = %self.id, peer = %peer_id, "member left");

        let gone: Vec<TrackId> = inner
            .tracks
            .iter()
            .filter(|(_, published)| published.publisher == *peer_id)
            .map(|(track_id, _)| track_id.clone())
            .collect();
        for track_id in &gone {
            inner.tracks.remove(track_id);
        }

        if !gone.is_empty() {
            self.detach_from_viewers(&inner, peer_id, &gone).await;
        }
        inner.members.is_empty()
    }

    /// A source member published a new local track: index it and attach it
    /// to every other viewer.
    pub async fn publish_track(&self, source: &PeerId, track: Arc<TrackLocalStaticRTP>) {
        let mut inner = self.inner.lock().await;
        match inner.members.get(source) {
            Some(role) if role.can_publish() => {}
            Some(_) => {
                warn!(room = %self.id, peer = %source, "member without source role published a track");
                return;
            }
            None => return,
        }

        let track_id = TrackId::from(track.id());
        debug!(room = %self.id, peer = %source, track = %track_id, "track published");
        inner.tracks.insert(
            track_id,
            PublishedTrack {
                publisher: source.clone(),
                track: track.clone(),
            },
        );

        let published = PublishedTrack {
            publisher: source.clone(),
            track,
        };
        for (member_id, role) in &inner.members {
            if member_id == source || !role.can_view() {
                continue;
            }
            let Some(viewer) = self.registry.get(member_id) else {
                continue;
            };
            attach_and_notify(&viewer, &published).await;
        }
    }

    /// A published track went away (forwarding ended or the publisher shut
    /// it down): drop it from the index and detach it from every viewer.
    pub async fn retract_track(&self, source: &PeerId, track_id: &TrackId) {
        let mut inner = self.inner.lock().await;
        match inner.tracks.get(track_id) {
            Some(published) if published.publisher == *source => {
                inner.tracks.remove(track_id);
            }
            _ => return,
        }
        debug!(room = %self.id, peer = %source, track = %track_id, "track retracted");

        self.detach_from_viewers(&inner, source, std::slice::from_ref(track_id))
            .await;
    }

    async fn detach_from_viewers(&self, inner: &RoomInner, source: &PeerId, gone: &[TrackId]) {
        for (member_id, role) in &inner.members {
            if member_id == source || !role.can_view() {
                continue;
            }
            let Some(viewer) = self.registry.get(member_id) else {
                continue;
            };
            for track_id in gone {
                match viewer.detach_sender(track_id).await {
                    Ok(()) | Err(Error::NotAttached(_)) => {}
                    Err(err) => {
                        debug!(room = %self.id, peer = %member_id, track = %track_id, error = %err, "detach failed");
                    }
                }
            }
        }
    }

    pub async fn member_role(&self, peer_id: &PeerId) -> Option<MemberRole> {
        self.inner.lock().await.members.get(peer_id).copied()
    }

    pub async fn is_member(&self, peer_id: &PeerId) -> bool {
        self.inner.lock().await.members.contains_key(peer_id)
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.members.is_empty()
    }

    pub async fn track_count(&self) -> usize {
        self.inner.lock().await.tracks.len()
    }
}

async fn attach_and_notify(viewer: &Arc<MediaPeer>, published: &PublishedTrack) {
    let track_id = TrackId::from(published.track.id());
    match viewer.attach_sender(published.track.clone()).await {
        Ok(()) => {
            // Advisory only; the real state change rides in the offer.
            if let Err(err) = viewer.transport().send(&SignalMessage::Track {
                id: track_id.clone(),
            }) {
                debug!(peer = %viewer.id(), track = %track_id, error = %err, "track advisory not sent");
            }
        }
        Err(Error::AlreadyAttached(_) | Error::ConflictOwnTrack(_)) => {
            debug!(peer = %viewer.id(), track = %track_id, "track already routed");
        }
        Err(err) => {
            warn!(peer = %viewer.id(), track = %track_id, error = %err, "attach failed");
        }
    }
}

/// Map of rooms with get-or-create semantics; empty rooms are pruned when
/// their last member leaves.
pub struct RoomManager {
    registry: Arc<PeerRegistry>,
    rooms: DashMap<RoomId, Arc<Room>>,
}

impl RoomManager {
    #[must_use]
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self {
            registry,
            rooms: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, id: RoomId) -> Arc<Room> {
        self.rooms
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Room::new(id, self.registry.clone())))
            .clone()
    }

    #[must_use]
    pub fn get(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Remove a peer from every room it joined, pruning rooms left empty.
    pub async fn leave_all(&self, peer_id: &PeerId) {
        for room in self.snapshot() {
            if room.leave(peer_id).await {
                self.rooms
                    .remove_if(room.id(), |_, candidate| Arc::ptr_eq(candidate, &room));
            }
        }
    }

    /// Fan a newly published local track out to every room where the peer
    /// is a source member.
    pub async fn publish_track(&self, source: &PeerId, track: Arc<TrackLocalStaticRTP>) {
        for room in self.snapshot() {
            room.publish_track(source, track.clone()).await;
        }
    }

    /// Withdraw a track from every room that carries it.
    pub async fn retract_track(&self, source: &PeerId, track_id: &TrackId) {
        for room in self.snapshot() {
            room.retract_track(source, track_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRtcConfig;
    use crate::engine::EngineFactory;
    use crate::transport::SignalTransport;
    use std::time::Duration;
    use webrtc::api::media_engine::MIME_TYPE_VP8;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    async fn new_peer(registry: &Arc<PeerRegistry>, id: &str) -> Arc<MediaPeer> {
        let factory = EngineFactory::new(&WebRtcConfig::default()).unwrap();
        let pc = factory.new_peer_connection().await.unwrap();
        let (transport, _rx) = SignalTransport::pair(16);
        let peer = MediaPeer::new(PeerId::from(id), pc, transport, Duration::from_secs(3));
        registry.insert(peer.clone());
        peer
    }

    fn video_track(id: &str, stream: &str) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            id.to_string(),
            stream.to_string(),
        ))
    }

    #[tokio::test]
    async fn test_join_merges_roles() {
        let registry = Arc::new(PeerRegistry::new());
        let manager = RoomManager::new(registry.clone());
        let room = manager.get_or_create(RoomId::from("r1"));
        let peer = new_peer(&registry, "a").await;

        room.join(&peer, MemberRole::Viewer).await;
        room.join(&peer, MemberRole::Source).await;
        assert_eq!(
            room.member_role(&PeerId::from("a")).await,
            Some(MemberRole::Both)
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_existing_viewers() {
        let registry = Arc::new(PeerRegistry::new());
        let manager = RoomManager::new(registry.clone());
        let room = manager.get_or_create(RoomId::from("r1"));

        let source = new_peer(&registry, "a").await;
        let viewer = new_peer(&registry, "b").await;
        room.join(&source, MemberRole::Source).await;
        room.join(&viewer, MemberRole::Viewer).await;

        room.publish_track(source.id(), video_track("v1", "a")).await;

        assert!(viewer.is_attached(&TrackId::from("v1")).await);
        assert!(!source.is_attached(&TrackId::from("v1")).await);
        assert_eq!(room.track_count().await, 1);
    }

    #[tokio::test]
    async fn test_late_viewer_receives_published_tracks() {
        let registry = Arc::new(PeerRegistry::new());
        let manager = RoomManager::new(registry.clone());
        let room = manager.get_or_create(RoomId::from("r1"));

        let source = new_peer(&registry, "a").await;
        room.join(&source, MemberRole::Source).await;
        room.publish_track(source.id(), video_track("v1", "a")).await;
        room.publish_track(source.id(), video_track("a1", "a")).await;

        let late = new_peer(&registry, "c").await;
        room.join(&late, MemberRole::Viewer).await;

        let mut attached = late.attached_track_ids().await;
        attached.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(attached, vec![TrackId::from("a1"), TrackId::from("v1")]);
    }

    #[tokio::test]
    async fn test_leave_detaches_publisher_tracks() {
        let registry = Arc::new(PeerRegistry::new());
        let manager = RoomManager::new(registry.clone());
        let room = manager.get_or_create(RoomId::from("r1"));

        let source = new_peer(&registry, "a").await;
        let viewer = new_peer(&registry, "b").await;
        room.join(&source, MemberRole::Source).await;
        room.join(&viewer, MemberRole::Viewer).await;
        room.publish_track(source.id(), video_track("v1", "a")).await;
        assert!(viewer.is_attached(&TrackId::from("v1")).await);

        room.leave(source.id()).await;
        assert!(!viewer.is_attached(&TrackId::from("v1")).await);
        assert_eq!(room.track_count().await, 0);
    }

    #[tokio::test]
    async fn test_both_roles_exchange_tracks_without_reflection() {
        let registry = Arc::new(PeerRegistry::new());
        let manager = RoomManager::new(registry.clone());
        let room = manager.get_or_create(RoomId::from("r1"));

        let a = new_peer(&registry, "a").await;
        let b = new_peer(&registry, "b").await;
        room.join(&a, MemberRole::Both).await;
        room.join(&b, MemberRole::Both).await;

        room.publish_track(a.id(), video_track("v1", "a")).await;
        room.publish_track(b.id(), video_track("v2", "b")).await;

        assert_eq!(a.attached_track_ids().await, vec![TrackId::from("v2")]);
        assert_eq!(b.attached_track_ids().await, vec![TrackId::from("v1")]);
    }

    #[tokio::test]
    async fn test_retract_removes_senders() {
        let registry = Arc::new(PeerRegistry::new());
        let manager = RoomManager::new(registry.clone());
        let room = manager.get_or_create(RoomId::from("r1"));

        let source = new_peer(&registry, "a").await;
        let viewer = new_peer(&registry, "b").await;
        room.join(&source, MemberRole::Source).await;
        room.join(&viewer, MemberRole::Viewer).await;
        room.publish_track(source.id(), video_track("v1", "a")).await;

        room.retract_track(source.id(), &TrackId::from("v1")).await;
        assert!(!viewer.is_attached(&TrackId::from("v1")).await);
        assert_eq!(room.track_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_rooms_are_pruned() {
        let registry = Arc::new(PeerRegistry::new());
        let manager = RoomManager::new(registry.clone());
        let room = manager.get_or_create(RoomId::from("r1"));
        let peer = new_peer(&registry, "a").await;

        room.join(&peer, MemberRole::Viewer).await;
        assert_eq!(manager.room_count(), 1);

        manager.leave_all(peer.id()).await;
        assert_eq!(manager.room_count(), 0);
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_rooms() {
        let registry = Arc::new(PeerRegistry::new());
        let manager = RoomManager::new(registry);

        let first = manager.get_or_create(RoomId::from("r1"));
        let second = manager.get_or_create(RoomId::from("r1"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.room_count(), 1);
    }
}
