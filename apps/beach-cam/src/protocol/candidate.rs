use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of tokens every candidate attribute must carry before the optional
/// key/value tail: foundation, component, protocol, priority, ip, port, `typ`,
/// type.
pub const MANDATORY_TOKENS: usize = 8;

const CANDIDATE_PREFIX: &str = "candidate:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandidateError {
    #[error("expected at least {MANDATORY_TOKENS} tokens, found {found}")]
    TooFewTokens { found: usize },
    #[error("invalid {field} value '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("component must be 1 or 2, got {0}")]
    InvalidComponent(u8),
    #[error("unsupported transport protocol '{0}'")]
    UnsupportedProtocol(String),
    #[error("expected 'typ' keyword at position 6, got '{0}'")]
    MissingTypKeyword(String),
    #[error("unknown candidate type '{0}'")]
    UnknownCandidateType(String),
    #[error("'{0}' is missing its value")]
    MissingValue(String),
    #[error("raddr and rport must appear together")]
    UnpairedRelatedAddress,
    #[error("candidate is missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp",
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = CandidateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportProtocol::Udp),
            "tcp" => Ok(TransportProtocol::Tcp),
            _ => Err(CandidateError::UnsupportedProtocol(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateType {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::Srflx => "srflx",
            CandidateType::Prflx => "prflx",
            CandidateType::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = CandidateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::Srflx),
            "prflx" => Ok(CandidateType::Prflx),
            "relay" => Ok(CandidateType::Relay),
            other => Err(CandidateError::UnknownCandidateType(other.to_string())),
        }
    }
}

/// Structured form of one `a=candidate` attribute plus the media section it
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub transport_protocol: TransportProtocol,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    /// Trailing key/value pairs other than `raddr`/`rport`, in wire order.
    pub extensions: Vec<(String, String)>,
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
}

impl IceCandidate {
    /// Parses a candidate attribute. The `candidate:` prefix is optional.
    pub fn parse(
        attribute: &str,
        sdp_mid: impl Into<String>,
        sdp_mline_index: u16,
    ) -> Result<Self, CandidateError> {
        let body = attribute
            .trim()
            .strip_prefix(CANDIDATE_PREFIX)
            .unwrap_or(attribute.trim());
        let parts: Vec<&str> = body.split_whitespace().collect();
        if parts.len() < MANDATORY_TOKENS {
            return Err(CandidateError::TooFewTokens { found: parts.len() });
        }

        let foundation = parts[0].to_string();
        let component: u8 = parse_number("component", parts[1])?;
        if !(1..=2).contains(&component) {
            return Err(CandidateError::InvalidComponent(component));
        }
        let transport_protocol = parts[2].parse()?;
        let priority: u32 = parse_number("priority", parts[3])?;
        let ip = parts[4].to_string();
        let port: u16 = parse_number("port", parts[5])?;
        if parts[6] != "typ" {
            return Err(CandidateError::MissingTypKeyword(parts[6].to_string()));
        }
        let candidate_type = parts[7].parse()?;

        let mut related_address = None;
        let mut related_port = None;
        let mut extensions = Vec::new();
        let mut tail = parts[MANDATORY_TOKENS..].iter();
        while let Some(&key) = tail.next() {
            let value = *tail
                .next()
                .ok_or_else(|| CandidateError::MissingValue(key.to_string()))?;
            match key {
                "raddr" => related_address = Some(value.to_string()),
                "rport" => related_port = Some(parse_number("rport", value)?),
                _ => extensions.push((key.to_string(), value.to_string())),
            }
        }
        if related_address.is_some() != related_port.is_some() {
            return Err(CandidateError::UnpairedRelatedAddress);
        }

        Ok(Self {
            foundation,
            component,
            transport_protocol,
            priority,
            ip,
            port,
            candidate_type,
            related_address,
            related_port,
            extensions,
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
        })
    }

    /// The eight mandatory tokens in wire order.
    pub fn mandatory_tokens(&self) -> [String; MANDATORY_TOKENS] {
        [
            self.foundation.clone(),
            self.component.to_string(),
            self.transport_protocol.as_str().to_string(),
            self.priority.to_string(),
            self.ip.clone(),
            self.port.to_string(),
            "typ".to_string(),
            self.candidate_type.as_str().to_string(),
        ]
    }

    /// Attribute form with the `candidate:` prefix, as ICE agents expect it.
    pub fn to_sdp_attribute(&self) -> String {
        format!("{CANDIDATE_PREFIX}{self}")
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mandatory_tokens().join(" "))?;
        if let (Some(addr), Some(port)) = (&self.related_address, self.related_port) {
            write!(f, " raddr {addr} rport {port}")?;
        }
        for (key, value) in &self.extensions {
            write!(f, " {key} {value}")?;
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> Result<T, CandidateError> {
    value.parse().map_err(|_| CandidateError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}
