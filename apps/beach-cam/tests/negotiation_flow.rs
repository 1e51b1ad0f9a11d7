use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use beach_cam::agent::IceConnectionState;
use beach_cam::agent::IceGatheringState;
use beach_cam::agent::mock::{AgentCall, MOCK_ANSWER_SDP, MockAgentControl, MockAgentFactory, MockAgents};
use beach_cam::protocol::{CandidatePayload, SignalingMessage};
use beach_cam::transport::mock::{MockConnector, MockRelay, RelayPeer};
use beach_cam::{DeviceConfig, NegotiationState, SessionEvent, SignalingError, Supervisor, TricklePolicy};

const OFFER_SDP: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
a=mid:0\r\n\
a=recvonly\r\n";

const LOCAL_HOST: &str = "candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host";
const LOCAL_SRFLX: &str =
    "candidate:2 1 udp 1686052607 203.0.113.9 61000 typ srflx raddr 192.168.1.20 rport 50000";
const REMOTE_HOST: &str = "1 1 UDP 2122260223 10.0.0.5 54400 typ host";

struct Device {
    relay: MockRelay,
    agents: MockAgents,
    events: broadcast::Receiver<SessionEvent>,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<(), SignalingError>>,
}

fn config() -> DeviceConfig {
    let mut config = DeviceConfig::new("ws://relay.test:8000", "dev-1", "controller");
    config.ice_servers.clear();
    config.restart_interval = Duration::from_millis(50);
    config.gathering_timeout = Duration::from_secs(5);
    config
}

fn start(config: DeviceConfig) -> Device {
    let (connector, relay) = MockConnector::new();
    let (factory, agents) = MockAgentFactory::new();
    let supervisor = Supervisor::new(config, Arc::new(connector), Arc::new(factory))
        .expect("valid config");
    let events = supervisor.subscribe();
    let (stop, shutdown) = watch::channel(false);
    let task = tokio::spawn(async move { supervisor.run(shutdown).await });
    Device {
        relay,
        agents,
        events,
        stop,
        task,
    }
}

impl Device {
    async fn next_session(&mut self) -> (RelayPeer, MockAgentControl) {
        let mut peer = self.relay.next_peer().await.expect("device connects");
        let agent = self.agents.next_agent().await.expect("agent created");
        match peer.recv().await {
            Some(SignalingMessage::Register { unique_id }) => assert_eq!(unique_id, "dev-1"),
            other => panic!("expected register, got {other:?}"),
        }
        (peer, agent)
    }

    async fn wait_for(&mut self, mut matches: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = self.events.recv().await.expect("event stream open");
            if matches(&event) {
                return event;
            }
        }
    }

    async fn wait_for_state(&mut self, state: NegotiationState) {
        self.wait_for(|event| matches!(event, SessionEvent::StateChanged { to, .. } if *to == state))
            .await;
    }

    async fn stop(self) {
        self.stop.send(true).expect("supervisor alive");
        self.task
            .await
            .expect("supervisor task")
            .expect("clean shutdown");
    }
}

fn offer() -> SignalingMessage {
    SignalingMessage::Offer {
        sdp: OFFER_SDP.into(),
        unique_id: None,
    }
}

fn remote_candidate(candidate: &str) -> SignalingMessage {
    SignalingMessage::IceCandidate {
        unique_id: None,
        to: None,
        candidate: CandidatePayload::new(candidate, "0", 0),
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn answer_follows_a_single_candidate_burst() {
    let mut device = start(config());
    let (mut peer, agent) = device.next_session().await;

    peer.send(&offer());
    device.wait_for_state(NegotiationState::GatheringIce).await;
    agent.gather(LOCAL_HOST);
    agent.gather(LOCAL_SRFLX);
    agent.gathering(IceGatheringState::Complete);

    let mut burst = Vec::new();
    for _ in 0..2 {
        match peer.recv().await {
            Some(SignalingMessage::IceCandidate {
                unique_id,
                to,
                candidate,
            }) => {
                assert_eq!(unique_id.as_deref(), Some("dev-1"));
                assert_eq!(to.as_deref(), Some("controller"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                burst.push(candidate.candidate);
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }
    assert_eq!(burst, vec![LOCAL_HOST, LOCAL_SRFLX]);

    match peer.recv().await {
        Some(SignalingMessage::Answer { unique_id, sdp, to }) => {
            assert_eq!(unique_id, "dev-1");
            assert_eq!(sdp, MOCK_ANSWER_SDP);
            assert_eq!(to, "controller");
        }
        other => panic!("expected answer, got {other:?}"),
    }
    let sent = device
        .wait_for(|event| matches!(event, SessionEvent::AnswerSent { .. }))
        .await;
    assert_eq!(
        sent,
        SessionEvent::AnswerSent {
            attempt: 1,
            candidates: 2
        }
    );

    agent.connection(IceConnectionState::Checking);
    agent.connection(IceConnectionState::Connected);
    device.wait_for_state(NegotiationState::Connected).await;
    assert!(peer.recv_within(Duration::from_millis(100)).await.is_none());

    device.stop().await;
    assert_eq!(agent.close_count(), 1);
    assert_eq!(peer.close_count(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn candidate_before_offer_is_applied_after_remote_description() {
    let mut device = start(config());
    let (mut peer, agent) = device.next_session().await;

    peer.send(&remote_candidate(REMOTE_HOST));
    peer.send(&offer());
    device.wait_for_state(NegotiationState::GatheringIce).await;
    agent.gathering(IceGatheringState::Complete);
    assert!(matches!(peer.recv().await, Some(SignalingMessage::Answer { .. })));

    let calls = agent.calls();
    let remote_at = calls
        .iter()
        .position(|call| matches!(call, AgentCall::SetRemote(_)))
        .expect("remote description applied");
    let candidate_at = calls
        .iter()
        .position(|call| matches!(call, AgentCall::AddCandidate(_)))
        .expect("buffered candidate applied");
    assert!(remote_at < candidate_at);
    let applied = agent.applied_candidates();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].ip, "10.0.0.5");
    assert_eq!(applied[0].port, 54400);

    // The same candidate again is a no-op.
    peer.send(&remote_candidate(REMOTE_HOST));
    agent.connection(IceConnectionState::Connected);
    device.wait_for_state(NegotiationState::Connected).await;
    assert_eq!(agent.applied_candidates().len(), 1);

    device.stop().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn relay_disconnect_tears_down_once_and_reregisters() {
    let mut device = start(config());
    let (mut first_peer, first_agent) = device.next_session().await;

    first_peer.send(&offer());
    device.wait_for_state(NegotiationState::GatheringIce).await;
    first_agent.gathering(IceGatheringState::Complete);
    assert!(matches!(first_peer.recv().await, Some(SignalingMessage::Answer { .. })));
    first_agent.connection(IceConnectionState::Connected);
    device.wait_for_state(NegotiationState::Connected).await;

    first_peer.send(&SignalingMessage::Disconnect {});
    let reset = device
        .wait_for(|event| matches!(event, SessionEvent::Reset { .. }))
        .await;
    assert_eq!(
        reset,
        SessionEvent::Reset {
            attempt: 1,
            reason: "relay requested disconnect".into()
        }
    );

    let (_second_peer, second_agent) = device.next_session().await;
    assert_eq!(first_agent.close_count(), 1);
    assert_eq!(first_peer.close_count(), 1);
    assert!(first_peer.recv().await.is_none());
    assert_eq!(second_agent.close_count(), 0);

    device.stop().await;
    assert_eq!(first_agent.close_count(), 1);
    assert_eq!(second_agent.close_count(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn malformed_candidate_keeps_session_state() {
    let mut device = start(config());
    let (peer, agent) = device.next_session().await;

    peer.send(&remote_candidate("bad candidate string"));
    peer.send_raw(r#"{"type":"renegotiate"}"#);
    peer.send(&SignalingMessage::StartVideo {});
    peer.send(&offer());

    match device
        .wait_for(|event| match event {
            SessionEvent::StateChanged { from, .. } => *from != NegotiationState::Idle,
            SessionEvent::Reset { .. } => true,
            _ => false,
        })
        .await
    {
        SessionEvent::StateChanged { from, to, .. } => {
            assert_eq!(from, NegotiationState::Registered);
            assert_eq!(to, NegotiationState::OfferReceived);
        }
        other => panic!("session did not survive malformed input: {other:?}"),
    }
    assert!(agent.applied_candidates().is_empty());

    device.stop().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn rejected_offer_restarts_negotiation() {
    let mut device = start(config());
    let (mut peer, agent) = device.next_session().await;
    agent.reject_remote_description();

    peer.send(&offer());
    device.wait_for_state(NegotiationState::Failed).await;
    let reset = device
        .wait_for(|event| matches!(event, SessionEvent::Reset { .. }))
        .await;
    assert!(matches!(reset, SessionEvent::Reset { attempt: 1, reason } if reason.starts_with("negotiation failed")));
    assert!(peer.recv().await.is_none());

    let (_peer, _agent) = device.next_session().await;
    device.stop().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn transport_loss_and_ice_failure_both_restart() {
    let mut device = start(config());
    let (mut peer, agent) = device.next_session().await;

    peer.hang_up();
    device
        .wait_for(|event| matches!(event, SessionEvent::Reset { attempt: 1, .. }))
        .await;
    assert_eq!(agent.close_count(), 1);

    let (mut peer, agent) = device.next_session().await;
    peer.send(&offer());
    device.wait_for_state(NegotiationState::GatheringIce).await;
    agent.gathering(IceGatheringState::Complete);
    assert!(matches!(peer.recv().await, Some(SignalingMessage::Answer { .. })));
    agent.connection(IceConnectionState::Disconnected);
    let reset = device
        .wait_for(|event| matches!(event, SessionEvent::Reset { .. }))
        .await;
    assert_eq!(
        reset,
        SessionEvent::Reset {
            attempt: 2,
            reason: "ice connection disconnected".into()
        }
    );

    let (_peer, _agent) = device.next_session().await;
    device.stop().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn negotiation_timeout_triggers_restart() {
    let mut config = config();
    config.negotiation_timeout = Duration::from_millis(300);
    let mut device = start(config);
    let (mut peer, agent) = device.next_session().await;

    peer.send(&offer());
    device.wait_for_state(NegotiationState::GatheringIce).await;
    agent.gathering(IceGatheringState::Complete);
    assert!(matches!(peer.recv().await, Some(SignalingMessage::Answer { .. })));

    let reset = device
        .wait_for(|event| matches!(event, SessionEvent::Reset { .. }))
        .await;
    assert!(matches!(reset, SessionEvent::Reset { reason, .. } if reason.contains("did not complete")));
    let (_peer, _agent) = device.next_session().await;
    device.stop().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn eager_trickle_and_offer_named_controller() {
    let mut config = config();
    config.trickle = TricklePolicy::Eager;
    let mut device = start(config);
    let (mut peer, agent) = device.next_session().await;

    peer.send(&SignalingMessage::Offer {
        sdp: OFFER_SDP.into(),
        unique_id: Some("tablet-7".into()),
    });
    match peer.recv().await {
        Some(SignalingMessage::Answer { to, .. }) => assert_eq!(to, "tablet-7"),
        other => panic!("expected answer, got {other:?}"),
    }
    agent.gather(LOCAL_HOST);
    match peer.recv().await {
        Some(SignalingMessage::IceCandidate { to, candidate, .. }) => {
            assert_eq!(to.as_deref(), Some("tablet-7"));
            assert_eq!(candidate.candidate, LOCAL_HOST);
        }
        other => panic!("expected candidate, got {other:?}"),
    }

    device.stop().await;
}
