use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::protocol::{ProtocolError, SignalingMessage};

pub mod mock;
pub mod websocket;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error("failed to receive frame: {0}")]
    Receive(String),
    #[error("relay silent for {0:?} despite heartbeats")]
    HeartbeatTimeout(Duration),
}

/// One decoded inbound frame. Frames that fail schema validation are handed
/// up as `Rejected` so the caller can log them without tearing anything down.
#[derive(Debug)]
pub enum Inbound {
    Message(SignalingMessage),
    Rejected(ProtocolError),
}

/// Bidirectional message stream to the signaling relay.
///
/// `recv` returning `Err` is terminal: the stream ended or errored and the
/// channel will not yield anything else.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError>;

    async fn recv(&mut self) -> Result<Inbound, TransportError>;

    /// Releases the channel. Calling it again is a no-op.
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalingChannel>, TransportError>;
}

/// Accepts ws(s) URLs as-is and rewrites http(s) to the matching ws scheme.
pub fn websocket_url(raw: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(raw)
        .map_err(|err| TransportError::Setup(format!("invalid relay url '{raw}': {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported relay url scheme '{other}'"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Setup(format!("cannot rewrite scheme of '{raw}'")))?;
    Ok(url)
}
