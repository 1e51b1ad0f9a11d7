//! In-memory relay used by tests: every `connect` hands the test a
//! [`RelayPeer`] that plays the relay side of the new channel.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connector, Inbound, SignalingChannel, TransportError};
use crate::protocol::SignalingMessage;

#[derive(Clone)]
pub struct MockConnector {
    peers: mpsc::UnboundedSender<RelayPeer>,
    failures: Arc<Mutex<usize>>,
    attempts: Arc<AtomicUsize>,
}

/// Test-side handle yielding one [`RelayPeer`] per successful connect.
pub struct MockRelay {
    peers: mpsc::UnboundedReceiver<RelayPeer>,
}

impl MockConnector {
    pub fn new() -> (Self, MockRelay) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: peers_tx,
                failures: Arc::new(Mutex::new(0)),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            MockRelay { peers: peers_rx },
        )
    }

    /// Makes the next `count` connects fail with a setup error.
    pub fn fail_next(&self, count: usize) {
        *self.failures.lock().unwrap() = count;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalingChannel>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Setup(format!("relay {url} unreachable")));
            }
        }
        let (to_relay_tx, to_relay_rx) = mpsc::unbounded_channel();
        let (to_device_tx, to_device_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let peer = RelayPeer {
            from_device: to_relay_rx,
            to_device: Some(to_device_tx),
            closes: Arc::clone(&closes),
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Setup("mock relay dropped".into()))?;
        Ok(Box::new(MockChannel {
            to_relay: Some(to_relay_tx),
            from_relay: to_device_rx,
            closes,
        }))
    }
}

impl MockRelay {
    pub async fn next_peer(&mut self) -> Option<RelayPeer> {
        self.peers.recv().await
    }
}

/// Relay end of one device connection.
pub struct RelayPeer {
    from_device: mpsc::UnboundedReceiver<SignalingMessage>,
    to_device: Option<mpsc::UnboundedSender<String>>,
    closes: Arc<AtomicUsize>,
}

impl RelayPeer {
    pub fn send(&self, message: &SignalingMessage) {
        let text = message.encode().expect("encode mock frame");
        self.send_raw(text);
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        if let Some(tx) = &self.to_device {
            let _ = tx.send(text.into());
        }
    }

    /// Next message the device sent, or `None` once the device closed.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.from_device.recv().await
    }

    pub async fn recv_within(&mut self, limit: Duration) -> Option<SignalingMessage> {
        tokio::time::timeout(limit, self.from_device.recv())
            .await
            .ok()
            .flatten()
    }

    /// Drops the relay side so the device observes a closed stream.
    pub fn hang_up(&mut self) {
        self.to_device.take();
    }

    /// How many times the device called `close` on this channel.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct MockChannel {
    to_relay: Option<mpsc::UnboundedSender<SignalingMessage>>,
    from_relay: mpsc::UnboundedReceiver<String>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl SignalingChannel for MockChannel {
    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        let tx = self.to_relay.as_ref().ok_or(TransportError::ChannelClosed)?;
        tx.send(message).map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        let text = self
            .from_relay
            .recv()
            .await
            .ok_or(TransportError::ChannelClosed)?;
        Ok(match SignalingMessage::decode(&text) {
            Ok(message) => Inbound::Message(message),
            Err(err) => Inbound::Rejected(err),
        })
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.to_relay.take();
        self.from_relay.close();
    }
}
