//! One WebRTC peer connection and its media bookkeeping.
//!
//! Inbound remote tracks are converted to server-owned local tracks that fan
//! out to subscribers; outbound senders are tracked per TrackId so a track
//! is never attached twice and a peer never re-receives what it published.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::events::EventHub;
use crate::negotiator::SdpEndpoint;
use crate::transport::{SignalTransport, CLOSE_NORMAL};
use crate::types::{PeerId, TrackId};

/// RTP packets never exceed the ethernet MTU; one buffer per forwarding task.
const RTP_BUFFER_SIZE: usize = 1500;

/// Events surfaced by the media layer, consumed by the session's event pump.
#[derive(Clone)]
pub enum PeerEvent {
    NegotiationNeeded,
    LocalCandidate(Option<RTCIceCandidateInit>),
    ConnectionState(RTCPeerConnectionState),
    /// A remote track was converted into a forwardable local track.
    TrackPublished(Arc<TrackLocalStaticRTP>),
    /// A forwarding task ended; the local track no longer carries media.
    TrackEnded(TrackId),
}

pub struct MediaPeer {
    id: PeerId,
    pc: Arc<RTCPeerConnection>,
    transport: SignalTransport,
    /// Tracks this peer publishes, keyed by the original TrackId.
    local_tracks: parking_lot::Mutex<HashMap<TrackId, Arc<TrackLocalStaticRTP>>>,
    /// Tracks being forwarded to this peer. Guarded by an async mutex so the
    /// check-and-add against the engine is one critical section.
    senders: tokio::sync::Mutex<HashMap<TrackId, Arc<RTCRtpSender>>>,
    events: EventHub<PeerEvent>,
    keyframe_interval: Duration,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl MediaPeer {
    pub fn new(
        id: PeerId,
        pc: Arc<RTCPeerConnection>,
        transport: SignalTransport,
        keyframe_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            pc,
            transport,
            local_tracks: parking_lot::Mutex::new(HashMap::new()),
            senders: tokio::sync::Mutex::new(HashMap::new()),
            events: EventHub::new(),
            keyframe_interval,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub fn transport(&self) -> &SignalTransport {
        &self.transport
    }

    #[must_use]
    pub fn events(&self) -> &EventHub<PeerEvent> {
        &self.events
    }

    /// Route the engine callbacks into the event hub. Subscribe before
    /// calling this so no event is lost.
    pub fn bind_engine_callbacks(self: &Arc<Self>) {
        let events = self.events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            events.emit(PeerEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let peer_id = self.id.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => events.emit(PeerEvent::LocalCandidate(Some(init))),
                    Err(err) => {
                        warn!(peer = %peer_id, error = %err, "failed to serialise local candidate");
                    }
                },
                None => events.emit(PeerEvent::LocalCandidate(None)),
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let peer_id = self.id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                debug!(peer = %peer_id, %state, "connection state changed");
                events.emit(PeerEvent::ConnectionState(state));
                Box::pin(async {})
            }));

        let weak = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(peer) = weak.upgrade() else { return };
                if let Err(err) = peer.publish_remote_track(track).await {
                    warn!(peer = %peer.id, error = %err, "failed to publish remote track");
                }
            })
        }));
    }

    /// Convert an inbound remote track into the fan-out local track.
    ///
    /// The local track keeps the original TrackId and advertises this peer's
    /// id as its stream group so subscribers can correlate tracks by
    /// publisher. If the id is already known the existing track is reused
    /// (the remote track was renegotiated).
    pub async fn publish_remote_track(
        &self,
        remote: Arc<TrackRemote>,
    ) -> Result<Arc<TrackLocalStaticRTP>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PeerClosed(self.id.clone()));
        }

        let track_id = TrackId::from(remote.id());
        if let Some(existing) = self.local_tracks.lock().get(&track_id) {
            debug!(peer = %self.id, track = %track_id, "remote track renegotiated, reusing local track");
            return Ok(existing.clone());
        }

        // Scrub RTCP feedback so the forwarded capability cannot conflict
        // with subscriber negotiations.
        let mut capability = remote.codec().capability;
        capability.rtcp_feedback = Vec::new();

        let local = Arc::new(TrackLocalStaticRTP::new(
            capability,
            track_id.to_string(),
            self.id.to_string(),
        ));
        self.local_tracks
            .lock()
            .insert(track_id.clone(), local.clone());

        info!(
            peer = %self.id,
            track = %track_id,
            kind = %remote.kind(),
            ssrc = remote.ssrc(),
            "publishing remote track"
        );

        let task_cancel = self.cancel.child_token();
        self.spawn_keyframe_task(remote.ssrc(), task_cancel.clone());
        self.spawn_forward_task(remote, local.clone(), track_id, task_cancel);

        self.events.emit(PeerEvent::TrackPublished(local.clone()));
        Ok(local)
    }

    /// Copy RTP from the remote track into the local track until the first
    /// read or write error; the task is not restarted.
    fn spawn_forward_task(
        &self,
        remote: Arc<TrackRemote>,
        local: Arc<TrackLocalStaticRTP>,
        track_id: TrackId,
        cancel: CancellationToken,
    ) {
        let events = self.events.clone();
        let peer_id = self.id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTP_BUFFER_SIZE];
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    read = remote.read(&mut buf) => {
                        let packet = match read {
                            Ok((packet, _attributes)) => packet,
                            Err(err) => {
                                debug!(peer = %peer_id, track = %track_id, error = %err, "remote track read ended");
                                break;
                            }
                        };
                        if let Err(err) = local.write_rtp(&packet).await {
                            debug!(peer = %peer_id, track = %track_id, error = %err, "local track write ended");
                            break;
                        }
                    }
                }
            }
            // Stops the paired keyframe task and tells subscribers the
            // stream is over.
            cancel.cancel();
            events.emit(PeerEvent::TrackEnded(track_id));
        });
    }

    /// Request a keyframe every interval so late subscribers do not wait on
    /// the publisher's own keyframe cadence. Runs until the forwarding task
    /// for the same track ends.
    fn spawn_keyframe_task(&self, ssrc: u32, cancel: CancellationToken) {
        let pc = self.pc.clone();
        let peer_id = self.id.clone();
        let interval = self.keyframe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let pli = PictureLossIndication {
                            sender_ssrc: 0,
                            media_ssrc: ssrc,
                        };
                        if let Err(err) = pc.write_rtcp(&[Box::new(pli)]).await {
                            debug!(peer = %peer_id, ssrc, error = %err, "keyframe request failed, stopping");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Start forwarding a local track to this peer.
    ///
    /// The engine raises negotiation-needed as a consequence, picked up by
    /// the negotiator through the event pump.
    pub async fn attach_sender(&self, track: Arc<TrackLocalStaticRTP>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PeerClosed(self.id.clone()));
        }

        let track_id = TrackId::from(track.id());
        if self.is_my_track(&track_id) {
            return Err(Error::ConflictOwnTrack(track_id));
        }

        let mut senders = self.senders.lock().await;
        if senders.contains_key(&track_id) {
            return Err(Error::AlreadyAttached(track_id));
        }

        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        senders.insert(track_id, sender);
        Ok(())
    }

    /// Stop forwarding a track to this peer.
    pub async fn detach_sender(&self, track_id: &TrackId) -> Result<()> {
        let mut senders = self.senders.lock().await;
        let Some(sender) = senders.remove(track_id) else {
            return Err(Error::NotAttached(track_id.clone()));
        };
        drop(senders);

        if self.closed.load(Ordering::Acquire) {
            // Engine teardown already removed the sender.
            return Ok(());
        }
        self.pc.remove_track(&sender).await?;
        Ok(())
    }

    #[must_use]
    pub fn is_my_track(&self, track_id: &TrackId) -> bool {
        self.local_tracks.lock().contains_key(track_id)
    }

    pub async fn is_attached(&self, track_id: &TrackId) -> bool {
        self.senders.lock().await.contains_key(track_id)
    }

    #[must_use]
    pub fn owned_track_ids(&self) -> Vec<TrackId> {
        self.local_tracks.lock().keys().cloned().collect()
    }

    pub async fn attached_track_ids(&self) -> Vec<TrackId> {
        self.senders.lock().await.keys().cloned().collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the peer: stop every forwarding and keyframe task, close the
    /// engine connection and the signalling transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(peer = %self.id, "closing peer");
        self.cancel.cancel();
        if let Err(err) = self.pc.close().await {
            debug!(peer = %self.id, error = %err, "engine close");
        }
        self.transport.close(CLOSE_NORMAL, "peer closed");
    }
}

#[async_trait]
impl SdpEndpoint for MediaPeer {
    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_local_description(desc).await?)
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_remote_description(desc).await?)
    }

    async fn rollback(&self) -> Result<()> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        Ok(self.pc.set_local_description(rollback).await?)
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        Ok(self.pc.add_ice_candidate(candidate).await?)
    }
}
