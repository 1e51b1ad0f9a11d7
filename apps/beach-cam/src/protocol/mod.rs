//! Wire envelope exchanged with the signaling relay.
//!
//! Every frame is a JSON object discriminated by its `type` field. Frames are
//! validated against the known schema before dispatch; anything else surfaces
//! as a [`ProtocolError`] which callers log and skip.

pub mod candidate;
pub mod sdp;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use candidate::{CandidateError, CandidateType, IceCandidate, TransportProtocol};

const KNOWN_TYPES: &[&str] = &[
    "register",
    "registerraspberrypi",
    "offer",
    "answer",
    "ice-candidate",
    "disconnect",
    "start_video",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "register", alias = "registerraspberrypi")]
    Register {
        #[serde(rename = "uniqueId")]
        unique_id: String,
    },
    #[serde(rename = "offer")]
    Offer {
        sdp: String,
        /// Identifier of the controller that produced the offer, when the relay
        /// forwards it.
        #[serde(rename = "uniqueId", default, skip_serializing_if = "Option::is_none")]
        unique_id: Option<String>,
    },
    #[serde(rename = "answer")]
    Answer {
        #[serde(rename = "uniqueId")]
        unique_id: String,
        sdp: String,
        to: String,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(rename = "uniqueId", default, skip_serializing_if = "Option::is_none")]
        unique_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        candidate: CandidatePayload,
    },
    #[serde(rename = "disconnect")]
    Disconnect {},
    #[serde(rename = "start_video")]
    StartVideo {},
}

/// The `candidate` object of an `ice-candidate` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl CandidatePayload {
    pub fn new(candidate: impl Into<String>, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some(sdp_mid.into()),
            sdp_mline_index: Some(sdp_mline_index),
        }
    }

    /// An empty candidate string marks the end of the remote candidate list.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }

    /// Validates the payload and parses it with the candidate codec.
    pub fn parse(&self) -> Result<IceCandidate, CandidateError> {
        let sdp_mid = self
            .sdp_mid
            .as_deref()
            .ok_or(CandidateError::MissingField("sdpMid"))?;
        let sdp_mline_index = self
            .sdp_mline_index
            .ok_or(CandidateError::MissingField("sdpMLineIndex"))?;
        IceCandidate::parse(&self.candidate, sdp_mid, sdp_mline_index)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no 'type' field")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("invalid '{kind}' message: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Register { .. } => "register",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::Disconnect {} => "disconnect",
            SignalingMessage::StartVideo {} => "start_video",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;
        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        };
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|err| ProtocolError::InvalidPayload {
            kind,
            reason: err.to_string(),
        })
    }
}
