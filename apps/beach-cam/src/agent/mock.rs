//! Scripted agent for tests. Every call is recorded and the test drives ICE
//! events through [`MockAgentControl`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    AgentError, AgentEvent, AgentFactory, AgentHandle, IceConnectionState, IceGatheringState,
    PeerAgent,
};
use crate::protocol::IceCandidate;

pub const MOCK_ANSWER_SDP: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
a=mid:0\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    SetRemote(String),
    CreateAnswer,
    SetLocal(String),
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<AgentCall>>,
    closes: AtomicUsize,
    reject_remote: AtomicBool,
    reject_candidates: AtomicBool,
    local: Mutex<Option<String>>,
}

/// Test-side view of one agent.
#[derive(Clone)]
pub struct MockAgentControl {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl MockAgentControl {
    pub fn calls(&self) -> Vec<AgentCall> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::AddCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn reject_remote_description(&self) {
        self.shared.reject_remote.store(true, Ordering::SeqCst);
    }

    pub fn reject_candidates(&self) {
        self.shared.reject_candidates.store(true, Ordering::SeqCst);
    }

    /// Emits a local candidate as the ICE agent would during gathering.
    pub fn gather(&self, candidate: &str) {
        let _ = self
            .events
            .send(AgentEvent::LocalCandidate(candidate.to_string()));
    }

    pub fn gathering(&self, state: IceGatheringState) {
        let _ = self.events.send(AgentEvent::GatheringState(state));
    }

    pub fn connection(&self, state: IceConnectionState) {
        let _ = self.events.send(AgentEvent::ConnectionState(state));
    }
}

pub struct MockAgent {
    shared: Arc<Shared>,
}

impl MockAgent {
    pub fn new() -> (AgentHandle, MockAgentControl) {
        let shared = Arc::new(Shared::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = AgentHandle {
            agent: Box::new(MockAgent {
                shared: Arc::clone(&shared),
            }),
            events: events_rx,
        };
        (
            handle,
            MockAgentControl {
                shared,
                events: events_tx,
            },
        )
    }

    fn record(&self, call: AgentCall) {
        self.shared.calls.lock().unwrap().push(call);
    }

    fn ensure_open(&self) -> Result<(), AgentError> {
        if self.shared.closes.load(Ordering::SeqCst) > 0 {
            return Err(AgentError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerAgent for MockAgent {
    async fn set_remote_description(&self, offer_sdp: &str) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.record(AgentCall::SetRemote(offer_sdp.to_string()));
        if self.shared.reject_remote.load(Ordering::SeqCst) || !offer_sdp.starts_with("v=0") {
            return Err(AgentError::Description("offer is not a session description".into()));
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<String, AgentError> {
        self.ensure_open()?;
        self.record(AgentCall::CreateAnswer);
        Ok(MOCK_ANSWER_SDP.to_string())
    }

    async fn set_local_description(&self, answer_sdp: &str) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.record(AgentCall::SetLocal(answer_sdp.to_string()));
        *self.shared.local.lock().unwrap() = Some(answer_sdp.to_string());
        Ok(())
    }

    async fn local_description(&self) -> Option<String> {
        self.shared.local.lock().unwrap().clone()
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.record(AgentCall::AddCandidate(candidate.clone()));
        if self.shared.reject_candidates.load(Ordering::SeqCst) {
            return Err(AgentError::Candidate(format!("{candidate} refused")));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.shared.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            self.record(AgentCall::Close);
        }
    }
}

/// Builds a fresh [`MockAgent`] per `create` and hands its control to the
/// test through [`MockAgents`].
#[derive(Clone)]
pub struct MockAgentFactory {
    controls: mpsc::UnboundedSender<MockAgentControl>,
}

pub struct MockAgents {
    controls: mpsc::UnboundedReceiver<MockAgentControl>,
}

impl MockAgentFactory {
    pub fn new() -> (Self, MockAgents) {
        let (controls_tx, controls_rx) = mpsc::unbounded_channel();
        (
            Self {
                controls: controls_tx,
            },
            MockAgents {
                controls: controls_rx,
            },
        )
    }
}

impl MockAgents {
    pub async fn next_agent(&mut self) -> Option<MockAgentControl> {
        self.controls.recv().await
    }
}

#[async_trait]
impl AgentFactory for MockAgentFactory {
    async fn create(&self) -> Result<AgentHandle, AgentError> {
        let (handle, control) = MockAgent::new();
        let _ = self.controls.send(control);
        Ok(handle)
    }
}
