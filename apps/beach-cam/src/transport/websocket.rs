use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError as WsProtocolError},
};

use super::{Connector, Inbound, SignalingChannel, TransportError, websocket_url};
use crate::protocol::SignalingMessage;

const CLOSE_GRACE: Duration = Duration::from_secs(1);
/// Heartbeat intervals the relay may stay silent for before the channel fails.
const MISSED_HEARTBEATS: u32 = 2;

/// Opens [`WebSocketChannel`]s to the relay.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    heartbeat: Option<Duration>,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self { heartbeat: None }
    }

    /// Sends a WebSocket ping frame every `interval`. When nothing, pongs
    /// included, arrives from the relay for two intervals, `recv` fails with
    /// [`TransportError::HeartbeatTimeout`].
    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat = interval.filter(|interval| !interval.is_zero());
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalingChannel>, TransportError> {
        let channel = WebSocketChannel::connect(url, self.heartbeat).await?;
        Ok(Box::new(channel))
    }
}

pub struct WebSocketChannel {
    send_tx: Option<mpsc::UnboundedSender<Message>>,
    inbound_rx: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl WebSocketChannel {
    pub async fn connect(url: &str, heartbeat: Option<Duration>) -> Result<Self, TransportError> {
        let websocket_url = websocket_url(url)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target: "beach_cam::transport",
            url = %websocket_url,
            "relay websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (seen_tx, seen_rx) = watch::channel(Instant::now());
        let failure_tx = inbound_tx.clone();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = ws_write.send(message).await {
                    tracing::debug!(target: "beach_cam::transport", error = %err, "websocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                let Some(frame) = ws_read.next().await else {
                    break TransportError::ChannelClosed;
                };
                if frame.is_ok() {
                    seen_tx.send_replace(Instant::now());
                }
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(target: "beach_cam::transport", "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(target: "beach_cam::transport", ?frame, "relay closed websocket");
                        break TransportError::ChannelClosed;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: "beach_cam::transport", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: "beach_cam::transport", "relay websocket error: {err}");
                            }
                        }
                        break TransportError::Receive(err.to_string());
                    }
                };
                tracing::trace!(target: "beach_cam::transport", event = "ws_in", len = text.len());
                let inbound = match SignalingMessage::decode(&text) {
                    Ok(message) => Inbound::Message(message),
                    Err(err) => Inbound::Rejected(err),
                };
                if inbound_tx.send(Ok(inbound)).is_err() {
                    return;
                }
            };
            let _ = inbound_tx.send(Err(reason));
        });

        let heartbeat = heartbeat.map(|interval| {
            tokio::spawn(keep_alive(interval, send_tx.clone(), seen_rx, failure_tx))
        });

        Ok(Self {
            send_tx: Some(send_tx),
            inbound_rx,
            writer: Some(writer),
            reader: Some(reader),
            heartbeat,
        })
    }

    fn abort_tasks(&mut self) {
        for handle in [self.heartbeat.take(), self.reader.take(), self.writer.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl SignalingChannel for WebSocketChannel {
    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        let sender = self.send_tx.as_ref().ok_or(TransportError::ChannelClosed)?;
        let text = message
            .encode()
            .map_err(|err| TransportError::Send(err.to_string()))?;
        tracing::trace!(
            target: "beach_cam::transport",
            event = "ws_out",
            kind = message.kind(),
            len = text.len()
        );
        sender
            .send(Message::Text(text))
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        match self.inbound_rx.recv().await {
            Some(result) => result,
            None => Err(TransportError::ChannelClosed),
        }
    }

    async fn close(&mut self) {
        let Some(sender) = self.send_tx.take() else {
            return;
        };
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        let _ = sender.send(Message::Close(None));
        drop(sender);
        if let Some(mut writer) = self.writer.take() {
            if timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        self.abort_tasks();
        tracing::debug!(target: "beach_cam::transport", "relay websocket closed locally");
    }
}

async fn keep_alive(
    interval: Duration,
    pings: mpsc::UnboundedSender<Message>,
    last_seen: watch::Receiver<Instant>,
    failures: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
) {
    let allowed = interval * MISSED_HEARTBEATS;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if last_seen.has_changed().is_err() {
            // The reader already reported how the channel ended.
            break;
        }
        let silent = last_seen.borrow().elapsed();
        if silent > allowed {
            tracing::warn!(
                target: "beach_cam::transport",
                silent = ?silent,
                "relay stopped answering heartbeats"
            );
            let _ = failures.send(Err(TransportError::HeartbeatTimeout(silent)));
            let _ = pings.send(Message::Close(None));
            break;
        }
        if pings.send(Message::Ping(Vec::new())).is_err() {
            break;
        }
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
