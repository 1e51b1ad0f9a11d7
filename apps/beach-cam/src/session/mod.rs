//! Per-attempt negotiation state and the machinery that drives it.

pub mod negotiator;
pub mod pipeline;
pub mod supervisor;

use std::collections::VecDeque;
use std::fmt;

use crate::agent::{IceConnectionState, IceGatheringState};
use crate::protocol::IceCandidate;

pub use negotiator::Negotiator;
pub use pipeline::{CandidatePipeline, Disposition};
pub use supervisor::{SessionEvent, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Registered,
    /// Remote description applied.
    OfferReceived,
    /// Answer being created and applied locally.
    AnsweringInProgress,
    /// Local description applied, waiting for gathering to finish.
    GatheringIce,
    AnswerSent,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Registered => "registered",
            NegotiationState::OfferReceived => "offer_received",
            NegotiationState::AnsweringInProgress => "answering",
            NegotiationState::GatheringIce => "gathering_ice",
            NegotiationState::AnswerSent => "answer_sent",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One negotiation attempt. Recreated from scratch on every restart; only
/// `session_id` carries over.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub session_id: String,
    pub peer_id: Option<String>,
    pub state: NegotiationState,
    pub local_description: Option<String>,
    pub remote_description: Option<String>,
    pub ice_gathering_state: IceGatheringState,
    pub ice_connection_state: IceConnectionState,
    /// Candidates that arrived before the remote description, in arrival order.
    pub pending_remote_candidates: VecDeque<IceCandidate>,
}

impl PeerSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            peer_id: None,
            state: NegotiationState::Idle,
            local_description: None,
            remote_description: None,
            ice_gathering_state: IceGatheringState::New,
            ice_connection_state: IceConnectionState::New,
            pending_remote_candidates: VecDeque::new(),
        }
    }

    /// Moves to `next` and returns the previous state. Terminal states are
    /// sticky: once failed or closed the session only changes by being
    /// replaced.
    pub fn transition(&mut self, next: NegotiationState) -> Option<NegotiationState> {
        if self.state == next || self.state.is_terminal() {
            return None;
        }
        let previous = self.state;
        self.state = next;
        tracing::debug!(
            target: "beach_cam::session",
            session_id = %self.session_id,
            from = %previous,
            to = %next,
            "negotiation state changed"
        );
        Some(previous)
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }
}
