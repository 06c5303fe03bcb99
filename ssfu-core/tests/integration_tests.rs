//! End-to-end tests over the public API: registry eviction, room fan-out,
//! the session orchestrator and negotiation against a real engine peer
//! connection. Nothing here performs network I/O; ICE never runs.

use std::sync::Arc;
use std::time::Duration;

use ssfu_core::session::evict;
use ssfu_core::transport::OutboundFrame;
use ssfu_core::{
    Config, MediaPeer, MemberRole, Negotiator, PeerId, RoomId, SdpEndpoint, Session,
    SessionParams, SfuState, SignalMessage, SignalTransport, TrackId,
};
use tokio::sync::mpsc;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

fn new_state() -> Arc<SfuState> {
    SfuState::new(Config::default()).unwrap()
}

async fn new_peer(
    state: &Arc<SfuState>,
    id: &str,
) -> (Arc<MediaPeer>, mpsc::Receiver<OutboundFrame>) {
    let pc = state.engine().new_peer_connection().await.unwrap();
    let (transport, rx) = SignalTransport::pair(32);
    let peer = MediaPeer::new(PeerId::from(id), pc, transport, Duration::from_secs(3));
    state.registry().insert(peer.clone());
    (peer, rx)
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

fn drain_types(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<String> {
    let mut kinds = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        match frame {
            OutboundFrame::Message(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                kinds.push(value["type"].as_str().unwrap().to_string());
            }
            OutboundFrame::Close { .. } => kinds.push("close".to_string()),
        }
    }
    kinds
}

#[tokio::test]
async fn test_single_publisher_single_viewer() {
    let state = new_state();
    let room = state.rooms().get_or_create(RoomId::from("r1"));

    let (publisher, _publisher_rx) = new_peer(&state, "a").await;
    let (viewer, mut viewer_rx) = new_peer(&state, "b").await;
    room.join(&publisher, MemberRole::Source).await;
    room.join(&viewer, MemberRole::Viewer).await;

    room.publish_track(publisher.id(), video_track("v1", "a"))
        .await;

    assert_eq!(viewer.attached_track_ids().await, vec![TrackId::from("v1")]);
    assert!(publisher.attached_track_ids().await.is_empty());
    assert!(drain_types(&mut viewer_rx).contains(&"track".to_string()));
}

#[tokio::test]
async fn test_late_viewer_catches_up() {
    let state = new_state();
    let room = state.rooms().get_or_create(RoomId::from("r1"));

    let (publisher, _rx) = new_peer(&state, "a").await;
    room.join(&publisher, MemberRole::Source).await;
    room.publish_track(publisher.id(), video_track("v1", "a"))
        .await;
    room.publish_track(publisher.id(), video_track("a1", "a"))
        .await;

    let (late, _late_rx) = new_peer(&state, "c").await;
    room.join(&late, MemberRole::Viewer).await;

    let mut attached = late.attached_track_ids().await;
    attached.sort_by(|left, right| left.as_str().cmp(right.as_str()));
    assert_eq!(attached, vec![TrackId::from("a1"), TrackId::from("v1")]);
}

#[tokio::test]
async fn test_publisher_eviction_clears_viewers() {
    let state = new_state();
    let room = state.rooms().get_or_create(RoomId::from("r1"));

    let (publisher, _rx) = new_peer(&state, "a").await;
    let (viewer, _viewer_rx) = new_peer(&state, "b").await;
    room.join(&publisher, MemberRole::Source).await;
    room.join(&viewer, MemberRole::Viewer).await;
    room.publish_track(publisher.id(), video_track("v1", "a"))
        .await;
    assert!(viewer.is_attached(&TrackId::from("v1")).await);

    evict(&state, publisher.clone()).await;

    assert!(viewer.attached_track_ids().await.is_empty());
    assert!(publisher.is_closed());
    assert!(state.registry().get(&PeerId::from("a")).is_none());
    assert!(state.registry().get(&PeerId::from("b")).is_some());
}

#[tokio::test]
async fn test_reconnect_with_same_id_replaces_peer() {
    let state = new_state();
    let room = state.rooms().get_or_create(RoomId::from("r1"));

    let (old, _old_rx) = new_peer(&state, "a").await;
    let (viewer, _viewer_rx) = new_peer(&state, "b").await;
    room.join(&old, MemberRole::Source).await;
    room.join(&viewer, MemberRole::Viewer).await;
    room.publish_track(old.id(), video_track("v1", "a")).await;

    // A new connection arrives with the same id; the registry hands back
    // the stale peer for eviction.
    let pc = state.engine().new_peer_connection().await.unwrap();
    let (transport, _new_rx) = SignalTransport::pair(32);
    let new = MediaPeer::new(PeerId::from("a"), pc, transport, Duration::from_secs(3));
    let displaced = state.registry().insert(new.clone()).unwrap();
    assert!(Arc::ptr_eq(&displaced, &old));

    evict(&state, displaced).await;

    assert!(old.is_closed());
    assert!(!new.is_closed());
    assert!(Arc::ptr_eq(
        &state.registry().get(&PeerId::from("a")).unwrap(),
        &new
    ));
    // The stale publisher's tracks are gone from every other peer.
    assert!(viewer.attached_track_ids().await.is_empty());
}

#[tokio::test]
async fn test_both_roles_never_receive_own_tracks() {
    let state = new_state();
    let room = state.rooms().get_or_create(RoomId::from("r1"));

    let (a, _a_rx) = new_peer(&state, "a").await;
    let (b, _b_rx) = new_peer(&state, "b").await;
    room.join(&a, MemberRole::Both).await;
    room.join(&b, MemberRole::Both).await;

    room.publish_track(a.id(), video_track("v1", "a")).await;
    room.publish_track(b.id(), video_track("v2", "b")).await;

    assert_eq!(a.attached_track_ids().await, vec![TrackId::from("v2")]);
    assert_eq!(b.attached_track_ids().await, vec![TrackId::from("v1")]);
}

#[tokio::test]
async fn test_negotiator_offers_against_real_engine() {
    let state = new_state();
    let (peer, _peer_rx) = new_peer(&state, "a").await;
    peer.attach_sender(video_track("v1", "b")).await.unwrap();

    let (transport, mut rx) = SignalTransport::pair(32);
    let negotiator = Negotiator::new(
        PeerId::from("a"),
        peer.clone(),
        transport,
        true,
        Duration::from_secs(10),
    );

    negotiator.negotiation_needed().await.unwrap();

    let kinds = drain_types(&mut rx);
    assert_eq!(kinds, vec!["offer".to_string()]);
    assert_eq!(peer.signaling_state(), RTCSignalingState::HaveLocalOffer);

    // Another trigger while the offer is outstanding stays silent.
    negotiator.negotiation_needed().await.unwrap();
    assert!(drain_types(&mut rx).is_empty());
}

#[tokio::test]
async fn test_session_lifecycle_over_frames() {
    let state = new_state();
    let (transport, mut rx) = SignalTransport::pair(32);
    let params = SessionParams::from_query(
        Some("a".to_string()),
        Some("r1".to_string()),
        None,
    );

    let session = Session::start(state.clone(), params, transport)
        .await
        .unwrap();

    assert!(state.registry().get(&PeerId::from("a")).is_some());
    assert_eq!(
        state
            .rooms()
            .get(&RoomId::from("r1"))
            .unwrap()
            .member_role(&PeerId::from("a"))
            .await,
        Some(MemberRole::Viewer)
    );
    assert_eq!(drain_types(&mut rx), vec!["signalling_ready".to_string()]);

    // A mid-session join-room augments membership.
    session
        .handle_frame(r#"{"type":"join-room","roomId":"r2","memberId":"a","memberType":"source"}"#)
        .await;
    assert_eq!(
        state
            .rooms()
            .get(&RoomId::from("r2"))
            .unwrap()
            .member_role(&PeerId::from("a"))
            .await,
        Some(MemberRole::Source)
    );

    // Unknown and malformed frames are ignored.
    session.handle_frame(r#"{"type":"ping"}"#).await;
    session.handle_frame("not json").await;

    session.shutdown().await;
    assert!(state.registry().is_empty());
    assert_eq!(state.rooms().room_count(), 0);
}

#[tokio::test]
async fn test_wire_messages_round_trip() {
    let track = SignalMessage::Track {
        id: TrackId::from("v1"),
    };
    let encoded = serde_json::to_string(&track).unwrap();
    assert_eq!(encoded, r#"{"type":"track","id":"v1"}"#);
    assert!(matches!(
        SignalMessage::decode(&encoded).unwrap(),
        SignalMessage::Track { id } if id.as_str() == "v1"
    ));
}
