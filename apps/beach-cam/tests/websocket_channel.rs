use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

use beach_cam::protocol::{ProtocolError, SignalingMessage};
use beach_cam::transport::websocket::WebSocketConnector;
use beach_cam::transport::{Connector, Inbound, SignalingChannel, TransportError};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct RelayState {
    outbound: Arc<Mutex<Option<mpsc::UnboundedReceiver<WsMessage>>>>,
    inbound: mpsc::UnboundedSender<WsMessage>,
}

/// Test side of a single-connection relay. Dropping `outbound` makes the
/// relay close the socket.
struct Relay {
    url: String,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    inbound: mpsc::UnboundedReceiver<WsMessage>,
}

impl Relay {
    fn push(&self, message: WsMessage) {
        self.outbound
            .as_ref()
            .expect("relay still open")
            .send(message)
            .expect("relay socket alive");
    }

    fn push_json(&self, value: Value) {
        self.push(WsMessage::Text(value.to_string()));
    }

    async fn next_frame(&mut self) -> WsMessage {
        timeout(WAIT, self.inbound.recv())
            .await
            .expect("relay frame in time")
            .expect("relay socket open")
    }
}

async fn spawn_relay() -> Relay {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let state = RelayState {
        outbound: Arc::new(Mutex::new(Some(outbound_rx))),
        inbound: inbound_tx,
    };
    let router = Router::new()
        .route("/", get(upgrade))
        .route("/silent", get(upgrade_silent))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Relay {
        url: format!("http://{addr}/"),
        outbound: Some(outbound_tx),
        inbound: inbound_rx,
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

/// Accepts the upgrade and then never reads, so pings go unanswered.
async fn upgrade_silent(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move {
        let _socket = socket;
        std::future::pending::<()>().await;
    })
}

async fn serve_socket(mut socket: WebSocket, state: RelayState) {
    let Some(mut outbound) = state.outbound.lock().await.take() else {
        return;
    };
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if socket.send(message).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(message)) => {
                    let closing = matches!(message, WsMessage::Close(_));
                    let _ = state.inbound.send(message);
                    if closing {
                        break;
                    }
                }
                _ => break,
            },
        }
    }
}

async fn connect(relay: &Relay) -> Box<dyn SignalingChannel> {
    WebSocketConnector::new()
        .connect(&relay.url)
        .await
        .expect("connect to relay")
}

async fn next_inbound(channel: &mut Box<dyn SignalingChannel>) -> Result<Inbound, TransportError> {
    timeout(WAIT, channel.recv()).await.expect("inbound frame in time")
}

#[test_timeout::tokio_timeout_test(10)]
async fn frames_cross_the_socket_as_json() {
    let mut relay = spawn_relay().await;
    let mut channel = connect(&relay).await;

    channel
        .send(SignalingMessage::Register {
            unique_id: "dev-1".into(),
        })
        .await
        .unwrap();
    match relay.next_frame().await {
        WsMessage::Text(text) => {
            let value: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value, json!({"type": "register", "uniqueId": "dev-1"}));
        }
        other => panic!("expected text frame, got {other:?}"),
    }

    relay.push_json(json!({"type": "offer", "sdp": "v=0\r\n", "uniqueId": "tablet-7"}));
    match next_inbound(&mut channel).await {
        Ok(Inbound::Message(SignalingMessage::Offer { sdp, unique_id })) => {
            assert_eq!(sdp, "v=0\r\n");
            assert_eq!(unique_id.as_deref(), Some("tablet-7"));
        }
        other => panic!("expected offer, got {other:?}"),
    }

    let candidate = json!({
        "type": "ice-candidate",
        "candidate": {
            "candidate": "1 1 UDP 2122260223 10.0.0.5 54400 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }
    });
    relay.push(WsMessage::Binary(candidate.to_string().into_bytes()));
    match next_inbound(&mut channel).await {
        Ok(Inbound::Message(SignalingMessage::IceCandidate { candidate, .. })) => {
            assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            assert!(candidate.parse().is_ok());
        }
        other => panic!("expected candidate, got {other:?}"),
    }

    channel.close().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn invalid_frames_are_rejected_without_closing() {
    let relay = spawn_relay().await;
    let mut channel = connect(&relay).await;

    relay.push_json(json!({"type": "renegotiate"}));
    relay.push(WsMessage::Text("{not json".into()));
    relay.push(WsMessage::Binary(vec![0xff, 0xfe, 0x00]));
    relay.push_json(json!({"type": "answer", "sdp": "v=0"}));
    relay.push_json(json!({"type": "disconnect"}));

    assert!(matches!(
        next_inbound(&mut channel).await,
        Ok(Inbound::Rejected(ProtocolError::UnknownType(kind))) if kind == "renegotiate"
    ));
    assert!(matches!(
        next_inbound(&mut channel).await,
        Ok(Inbound::Rejected(ProtocolError::InvalidJson(_)))
    ));
    // The non-utf8 binary frame is dropped by the transport.
    assert!(matches!(
        next_inbound(&mut channel).await,
        Ok(Inbound::Rejected(ProtocolError::InvalidPayload { .. }))
    ));
    assert!(matches!(
        next_inbound(&mut channel).await,
        Ok(Inbound::Message(SignalingMessage::Disconnect {}))
    ));

    channel.close().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn relay_close_ends_the_channel() {
    let mut relay = spawn_relay().await;
    let mut channel = connect(&relay).await;

    relay.outbound = None;
    assert!(matches!(
        next_inbound(&mut channel).await,
        Err(TransportError::ChannelClosed)
    ));
    assert!(matches!(
        next_inbound(&mut channel).await,
        Err(TransportError::ChannelClosed)
    ));
    channel.close().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn local_close_is_idempotent() {
    let mut relay = spawn_relay().await;
    let mut channel = connect(&relay).await;

    channel.close().await;
    assert!(matches!(relay.next_frame().await, WsMessage::Close(_)));
    channel.close().await;

    let err = channel
        .send(SignalingMessage::Disconnect {})
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ChannelClosed));
}

#[test_timeout::tokio_timeout_test(10)]
async fn unreachable_relay_fails_setup() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = WebSocketConnector::new()
        .with_heartbeat(Some(Duration::from_secs(1)))
        .connect(&format!("ws://{addr}/"))
        .await
        .err()
        .expect("connect should fail");
    assert!(matches!(err, TransportError::Setup(_)));
}

#[test_timeout::tokio_timeout_test(10)]
async fn heartbeat_pings_reach_the_relay() {
    let mut relay = spawn_relay().await;
    let mut channel = WebSocketConnector::new()
        .with_heartbeat(Some(Duration::from_millis(100)))
        .connect(&relay.url)
        .await
        .expect("connect to relay");

    for _ in 0..2 {
        assert!(matches!(relay.next_frame().await, WsMessage::Ping(_)));
    }
    // The relay answers each ping, so the channel stays up.
    tokio::time::sleep(Duration::from_millis(400)).await;
    relay.push_json(json!({"type": "start_video"}));
    assert!(matches!(
        next_inbound(&mut channel).await,
        Ok(Inbound::Message(SignalingMessage::StartVideo {}))
    ));

    channel.close().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn silent_relay_trips_the_heartbeat_deadline() {
    let relay = spawn_relay().await;
    let mut channel = WebSocketConnector::new()
        .with_heartbeat(Some(Duration::from_millis(100)))
        .connect(&format!("{}silent", relay.url))
        .await
        .expect("connect to relay");

    match next_inbound(&mut channel).await {
        Err(TransportError::HeartbeatTimeout(silent)) => {
            assert!(silent > Duration::from_millis(200));
        }
        other => panic!("expected heartbeat timeout, got {other:?}"),
    }
    channel.close().await;
}
