use std::time::Duration;

use thiserror::Error;

use crate::agent::{AgentError, IceConnectionState};
use crate::protocol::CandidateError;
use crate::transport::TransportError;

/// Session-level failures. Only fatal variants ever reach the supervisor;
/// candidate problems are logged where they happen.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("malformed candidate: {0}")]
    MalformedCandidate(#[from] CandidateError),
    #[error("candidate rejected by ice agent: {0}")]
    CandidateApplyFailure(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("relay requested disconnect")]
    RelayDisconnect,
    #[error("ice connection {0}")]
    ConnectionLost(IceConnectionState),
    #[error("negotiation did not complete within {0:?}")]
    NegotiationTimeout(Duration),
}

impl SignalingError {
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SignalingError::MalformedCandidate(_) | SignalingError::CandidateApplyFailure(_)
        )
    }

    pub(crate) fn negotiation(err: AgentError) -> Self {
        SignalingError::Negotiation(err.to_string())
    }
}
