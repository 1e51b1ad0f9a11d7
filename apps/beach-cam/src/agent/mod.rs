//! Contract for the local ICE/media agent that backs one peer session.
//!
//! The negotiator only talks to [`PeerAgent`]; agent callbacks are funnelled
//! into a single [`AgentEvent`] queue that the control loop consumes.

pub mod mock;
pub mod rtc;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::IceCandidate;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent setup failed: {0}")]
    Setup(String),
    #[error("description rejected: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("agent is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    pub fn is_established(self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }

    /// States after which the session cannot recover on its own.
    pub fn is_lost(self) -> bool {
        matches!(self, IceConnectionState::Failed | IceConnectionState::Disconnected)
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A locally gathered candidate attribute, with or without the
    /// `candidate:` prefix.
    LocalCandidate(String),
    GatheringState(IceGatheringState),
    ConnectionState(IceConnectionState),
}

#[async_trait]
pub trait PeerAgent: Send + Sync {
    async fn set_remote_description(&self, offer_sdp: &str) -> Result<(), AgentError>;

    async fn create_answer(&self) -> Result<String, AgentError>;

    /// Applies the answer locally. Starts ICE gathering.
    async fn set_local_description(&self, answer_sdp: &str) -> Result<(), AgentError>;

    /// Current local description, including any candidates gathered so far.
    async fn local_description(&self) -> Option<String>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), AgentError>;

    /// Releases every peer and media resource. Repeated calls are no-ops.
    async fn close(&self);
}

pub type AgentEvents = mpsc::UnboundedReceiver<AgentEvent>;

/// A freshly built agent plus the receiving end of its event queue.
pub struct AgentHandle {
    pub agent: Box<dyn PeerAgent>,
    pub events: AgentEvents,
}

/// Builds one agent per negotiation attempt. Agents are never reused.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self) -> Result<AgentHandle, AgentError>;
}
