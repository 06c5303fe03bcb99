//! Perfect-negotiation state machine, one instance per peer.
//!
//! The symmetric WebRTC pattern: either side may start an offer at any time;
//! when offers collide the polite side rolls back its own offer and answers
//! the remote one, the impolite side ignores the remote offer and lets its
//! own stand. The server is the polite side by default.
//!
//! All SDP work for one negotiation round runs under a single async mutex,
//! so `making_offer` brackets the whole create/set/send span and a remote
//! description arriving mid-round waits its turn instead of corrupting the
//! signalling state.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::error::{Error, Result};
use crate::signal::SignalMessage;
use crate::transport::SignalTransport;
use crate::types::PeerId;

/// SDP operations the negotiator drives on the surrounding peer connection.
#[async_trait]
pub trait SdpEndpoint: Send + Sync {
    async fn create_offer(&self) -> Result<RTCSessionDescription>;
    async fn create_answer(&self) -> Result<RTCSessionDescription>;
    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()>;
    /// Discard the in-flight local offer and return to stable.
    async fn rollback(&self) -> Result<()>;
    fn signaling_state(&self) -> RTCSignalingState;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;
}

#[derive(Default)]
struct NegotiationState {
    making_offer: bool,
    have_remote_description: bool,
    /// Remote candidates that arrived before the remote description, in
    /// arrival order.
    pending_candidates: Vec<RTCIceCandidateInit>,
    closed: bool,
}

pub struct Negotiator {
    peer_id: PeerId,
    endpoint: Arc<dyn SdpEndpoint>,
    transport: SignalTransport,
    polite: bool,
    sdp_timeout: Duration,
    state: tokio::sync::Mutex<NegotiationState>,
}

impl Negotiator {
    pub fn new(
        peer_id: PeerId,
        endpoint: Arc<dyn SdpEndpoint>,
        transport: SignalTransport,
        polite: bool,
        sdp_timeout: Duration,
    ) -> Self {
        Self {
            peer_id,
            endpoint,
            transport,
            polite,
            sdp_timeout,
            state: tokio::sync::Mutex::new(NegotiationState::default()),
        }
    }

    /// React to a negotiation-needed signal from the media layer.
    ///
    /// A no-op while an offer is already in flight or the signalling state is
    /// not stable; the pending change rides along in that offer or a later
    /// trigger.
    pub async fn negotiation_needed(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        if state.making_offer || self.endpoint.signaling_state() != RTCSignalingState::Stable {
            debug!(peer = %self.peer_id, "negotiation already in flight, skipping");
            return Ok(());
        }

        state.making_offer = true;
        let result = self.deadline(self.offer_round()).await;
        state.making_offer = false;

        if let Err(err) = result {
            self.abort_round(&err).await;
            return Err(err);
        }
        Ok(())
    }

    async fn offer_round(&self) -> Result<()> {
        let offer = self.endpoint.create_offer().await?;
        self.endpoint.set_local_description(offer.clone()).await?;
        self.transport
            .send(&SignalMessage::Offer { description: offer })
    }

    /// Handle an offer or answer received from the remote side.
    pub async fn handle_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        match desc.sdp_type {
            RTCSdpType::Offer => self.handle_remote_offer(desc).await,
            RTCSdpType::Answer => self.handle_remote_answer(desc).await,
            other => Err(Error::Sdp(format!(
                "unsupported remote description type {other}"
            ))),
        }
    }

    async fn handle_remote_offer(&self, offer: RTCSessionDescription) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }

        let collision =
            state.making_offer || self.endpoint.signaling_state() != RTCSignalingState::Stable;
        if collision && !self.polite {
            debug!(peer = %self.peer_id, "offer collision, impolite side keeps its own offer");
            return Ok(());
        }

        let result = self
            .deadline(async {
                if collision {
                    debug!(peer = %self.peer_id, "offer collision, rolling back local offer");
                    self.endpoint.rollback().await?;
                }
                self.endpoint.set_remote_description(offer).await?;
                let answer = self.endpoint.create_answer().await?;
                self.endpoint.set_local_description(answer.clone()).await?;
                self.transport.send(&SignalMessage::Answer {
                    description: answer,
                })
            })
            .await;
        if collision {
            state.making_offer = false;
        }
        if let Err(err) = result {
            self.abort_round(&err).await;
            return Err(err);
        }

        state.have_remote_description = true;
        self.flush_candidates(&mut state).await;
        Ok(())
    }

    async fn handle_remote_answer(&self, answer: RTCSessionDescription) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }

        let signaling = self.endpoint.signaling_state();
        if signaling != RTCSignalingState::HaveLocalOffer {
            return Err(Error::UnexpectedAnswer(signaling.to_string()));
        }

        if let Err(err) = self
            .deadline(self.endpoint.set_remote_description(answer))
            .await
        {
            self.abort_round(&err).await;
            return Err(err);
        }

        state.have_remote_description = true;
        self.flush_candidates(&mut state).await;
        Ok(())
    }

    /// Handle an ICE candidate received from the remote side.
    ///
    /// Buffered until a remote description is set; per-candidate failures
    /// are logged and the connection continues.
    pub async fn handle_remote_candidate(
        &self,
        candidate: Option<RTCIceCandidateInit>,
    ) -> Result<()> {
        let Some(candidate) = candidate else {
            debug!(peer = %self.peer_id, "remote end-of-candidates");
            return Ok(());
        };
        if candidate.candidate.is_empty() {
            debug!(peer = %self.peer_id, "empty remote candidate, skipping");
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        if !state.have_remote_description {
            state.pending_candidates.push(candidate);
            return Ok(());
        }
        if let Err(err) = self.endpoint.add_ice_candidate(candidate).await {
            warn!(peer = %self.peer_id, error = %err, "failed to add remote candidate");
        }
        Ok(())
    }

    /// Forward a local candidate from the media layer to the remote side.
    /// `None` conveys end-of-candidates as-is.
    pub fn handle_local_candidate(&self, candidate: Option<RTCIceCandidateInit>) -> Result<()> {
        self.transport.send(&SignalMessage::Candidate { candidate })
    }

    /// The remote side asked us to re-initiate negotiation.
    pub async fn handle_retry(&self) -> Result<()> {
        self.negotiation_needed().await
    }

    /// Abandon any in-flight negotiation; no further outbound signalling.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.making_offer = false;
        state.pending_candidates.clear();
    }

    async fn flush_candidates(&self, state: &mut NegotiationState) {
        for candidate in std::mem::take(&mut state.pending_candidates) {
            if let Err(err) = self.endpoint.add_ice_candidate(candidate).await {
                warn!(peer = %self.peer_id, error = %err, "failed to add buffered candidate");
            }
        }
    }

    /// Leave the signalling state stable after a failed round and ask the
    /// remote side to start over.
    async fn abort_round(&self, err: &Error) {
        warn!(peer = %self.peer_id, error = %err, "negotiation round failed");
        if self.endpoint.signaling_state() == RTCSignalingState::HaveLocalOffer {
            if let Err(rollback_err) = self.endpoint.rollback().await {
                warn!(peer = %self.peer_id, error = %rollback_err, "rollback after failed round");
            }
        }
        let _ = self.transport.send(&SignalMessage::Retry);
    }

    async fn deadline<F>(&self, fut: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        timeout(self.sdp_timeout, fut)
            .await
            .map_err(|_| Error::SdpTimeout(self.sdp_timeout))?
    }
}
