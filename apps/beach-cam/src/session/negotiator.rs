//! Drives one [`PeerSession`] from registration to a connected peer.
//!
//! A single loop consumes relay frames, agent events and timers in arrival
//! order. The first fatal error ends the loop; recovery belongs to the
//! supervisor.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, sleep_until};

use super::pipeline::CandidatePipeline;
use super::supervisor::SessionEvent;
use super::{NegotiationState, PeerSession};
use crate::agent::{AgentEvent, AgentEvents, AgentHandle, IceGatheringState, PeerAgent};
use crate::config::{DeviceConfig, TricklePolicy};
use crate::error::SignalingError;
use crate::protocol::sdp;
use crate::protocol::{CandidatePayload, SignalingMessage};
use crate::transport::{Inbound, SignalingChannel, TransportError};

/// Why [`Negotiator::run`] returned.
#[derive(Debug)]
pub enum Exit {
    Shutdown,
    Reset(SignalingError),
}

enum Step {
    Shutdown,
    Inbound(Result<Inbound, TransportError>),
    Agent(Option<AgentEvent>),
    GatheringTimeout,
    NegotiationTimeout,
}

pub struct Negotiator {
    config: Arc<DeviceConfig>,
    attempt: u64,
    session: PeerSession,
    pipeline: CandidatePipeline,
    channel: Box<dyn SignalingChannel>,
    agent: Box<dyn PeerAgent>,
    agent_events: Option<AgentEvents>,
    events: broadcast::Sender<SessionEvent>,
    gathering_deadline: Option<Instant>,
    negotiation_deadline: Option<Instant>,
    torn_down: bool,
}

impl Negotiator {
    pub fn new(
        config: Arc<DeviceConfig>,
        attempt: u64,
        channel: Box<dyn SignalingChannel>,
        agent: AgentHandle,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            session: PeerSession::new(config.unique_id.clone()),
            pipeline: CandidatePipeline::new(config.trickle),
            config,
            attempt,
            channel,
            agent: agent.agent,
            agent_events: Some(agent.events),
            events,
            gathering_deadline: None,
            negotiation_deadline: None,
            torn_down: false,
        }
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    /// Registers with the relay and processes events until shutdown or the
    /// first fatal error.
    pub async fn run(&mut self, shutdown: &mut watch::Receiver<bool>) -> Exit {
        if let Err(err) = self.register().await {
            return self.fail(err);
        }
        loop {
            let step = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => Step::Shutdown,
                inbound = self.channel.recv() => Step::Inbound(inbound),
                event = next_event(&mut self.agent_events) => Step::Agent(event),
                _ = deadline(self.gathering_deadline) => Step::GatheringTimeout,
                _ = deadline(self.negotiation_deadline) => Step::NegotiationTimeout,
            };
            let result = match step {
                Step::Shutdown => return Exit::Shutdown,
                Step::Inbound(Ok(Inbound::Message(message))) => self.on_message(message).await,
                Step::Inbound(Ok(Inbound::Rejected(err))) => {
                    tracing::warn!(
                        target: "beach_cam::session",
                        attempt = self.attempt,
                        error = %err,
                        "ignoring invalid relay frame"
                    );
                    Ok(())
                }
                Step::Inbound(Err(err)) => Err(SignalingError::Transport(err)),
                Step::Agent(Some(event)) => self.on_agent_event(event).await,
                Step::Agent(None) => {
                    tracing::debug!(target: "beach_cam::session", attempt = self.attempt, "agent event stream ended");
                    self.agent_events = None;
                    Ok(())
                }
                Step::GatheringTimeout => {
                    tracing::warn!(
                        target: "beach_cam::session",
                        attempt = self.attempt,
                        timeout = ?self.config.gathering_timeout,
                        "ice gathering timed out; answering with candidates gathered so far"
                    );
                    self.finish_gathering().await
                }
                Step::NegotiationTimeout => Err(SignalingError::NegotiationTimeout(
                    self.config.negotiation_timeout,
                )),
            };
            if let Err(err) = result {
                return self.fail(err);
            }
        }
    }

    /// Releases the agent and the relay channel. Safe to call repeatedly.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.gathering_deadline = None;
        self.negotiation_deadline = None;
        self.agent_events = None;
        self.agent.close().await;
        self.channel.close().await;
        self.set_state(NegotiationState::Closed);
        tracing::debug!(target: "beach_cam::session", attempt = self.attempt, "session resources released");
    }

    async fn register(&mut self) -> Result<(), SignalingError> {
        self.send(SignalingMessage::Register {
            unique_id: self.session.session_id.clone(),
        })
        .await?;
        tracing::info!(
            target: "beach_cam::session",
            attempt = self.attempt,
            unique_id = %self.session.session_id,
            "registered with relay"
        );
        self.set_state(NegotiationState::Registered);
        Ok(())
    }

    async fn on_message(&mut self, message: SignalingMessage) -> Result<(), SignalingError> {
        match message {
            SignalingMessage::Offer { sdp, unique_id } => self.on_offer(sdp, unique_id).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.pipeline
                    .receive(&mut self.session, self.agent.as_ref(), &candidate)
                    .await;
                Ok(())
            }
            SignalingMessage::Disconnect {} => {
                tracing::info!(target: "beach_cam::session", attempt = self.attempt, "relay requested disconnect");
                Err(SignalingError::RelayDisconnect)
            }
            SignalingMessage::StartVideo {} => {
                tracing::info!(target: "beach_cam::session", attempt = self.attempt, "controller requested video");
                Ok(())
            }
            other @ (SignalingMessage::Answer { .. } | SignalingMessage::Register { .. }) => {
                tracing::debug!(
                    target: "beach_cam::session",
                    kind = other.kind(),
                    "ignoring device-bound message type from relay"
                );
                Ok(())
            }
        }
    }

    async fn on_offer(&mut self, sdp: String, unique_id: Option<String>) -> Result<(), SignalingError> {
        if self.session.has_remote_description() {
            tracing::warn!(
                target: "beach_cam::session",
                attempt = self.attempt,
                state = %self.session.state,
                "ignoring offer for a session that already has one"
            );
            return Ok(());
        }
        let peer_id = unique_id.unwrap_or_else(|| self.config.controller_id.clone());
        tracing::info!(target: "beach_cam::session", attempt = self.attempt, peer_id = %peer_id, "offer received");
        self.session.peer_id = Some(peer_id);

        self.agent
            .set_remote_description(&sdp)
            .await
            .map_err(SignalingError::negotiation)?;
        self.pipeline
            .set_media_tag(sdp::media_tag(&sdp).unwrap_or_default());
        self.session.remote_description = Some(sdp);
        self.negotiation_deadline = Some(Instant::now() + self.config.negotiation_timeout);
        self.set_state(NegotiationState::OfferReceived);
        self.pipeline
            .flush_pending(&mut self.session, self.agent.as_ref())
            .await;

        self.set_state(NegotiationState::AnsweringInProgress);
        let answer = self
            .agent
            .create_answer()
            .await
            .map_err(SignalingError::negotiation)?;
        self.agent
            .set_local_description(&answer)
            .await
            .map_err(SignalingError::negotiation)?;
        self.session.local_description = Some(answer.clone());

        match self.pipeline.policy() {
            TricklePolicy::Eager => self.send_answer(answer, 0).await,
            TricklePolicy::Batch => {
                self.set_state(NegotiationState::GatheringIce);
                if self.session.ice_gathering_state == IceGatheringState::Complete {
                    return self.finish_gathering().await;
                }
                self.gathering_deadline = Some(Instant::now() + self.config.gathering_timeout);
                Ok(())
            }
        }
    }

    async fn on_agent_event(&mut self, event: AgentEvent) -> Result<(), SignalingError> {
        match event {
            AgentEvent::LocalCandidate(candidate) => {
                if let Some(payload) = self.pipeline.local_candidate(candidate) {
                    self.send_candidate(payload).await?;
                }
                Ok(())
            }
            AgentEvent::GatheringState(state) => {
                self.session.ice_gathering_state = state;
                tracing::debug!(target: "beach_cam::session", attempt = self.attempt, ?state, "ice gathering state");
                if state == IceGatheringState::Complete
                    && self.session.state == NegotiationState::GatheringIce
                {
                    self.finish_gathering().await?;
                }
                Ok(())
            }
            AgentEvent::ConnectionState(state) => {
                self.session.ice_connection_state = state;
                tracing::debug!(target: "beach_cam::session", attempt = self.attempt, %state, "ice connection state");
                if state.is_lost() {
                    return Err(SignalingError::ConnectionLost(state));
                }
                self.mark_connected_if_established();
                Ok(())
            }
        }
    }

    /// Sends the batched candidates followed by the single answer.
    async fn finish_gathering(&mut self) -> Result<(), SignalingError> {
        if self.session.state != NegotiationState::GatheringIce {
            return Ok(());
        }
        self.gathering_deadline = None;
        if let Some(local) = self.agent.local_description().await {
            self.session.local_description = Some(local);
        }
        let Some(answer) = self.session.local_description.clone() else {
            return Err(SignalingError::Negotiation(
                "local description missing after gathering".into(),
            ));
        };
        let burst = self.pipeline.take_burst(Some(&answer));
        let count = burst.len();
        for payload in burst {
            self.send_candidate(payload).await?;
        }
        self.send_answer(answer, count).await
    }

    async fn send_answer(&mut self, sdp: String, candidates: usize) -> Result<(), SignalingError> {
        let to = self.peer_id();
        self.send(SignalingMessage::Answer {
            unique_id: self.session.session_id.clone(),
            sdp,
            to,
        })
        .await?;
        self.set_state(NegotiationState::AnswerSent);
        tracing::info!(target: "beach_cam::session", attempt = self.attempt, candidates, "answer sent");
        let _ = self.events.send(SessionEvent::AnswerSent {
            attempt: self.attempt,
            candidates,
        });
        // ICE may have connected while the answer was still pending.
        self.mark_connected_if_established();
        Ok(())
    }

    fn mark_connected_if_established(&mut self) {
        if self.session.state != NegotiationState::AnswerSent
            || !self.session.ice_connection_state.is_established()
        {
            return;
        }
        self.negotiation_deadline = None;
        self.set_state(NegotiationState::Connected);
        tracing::info!(target: "beach_cam::session", attempt = self.attempt, "peer connected");
    }

    async fn send_candidate(&self, candidate: CandidatePayload) -> Result<(), SignalingError> {
        self.send(SignalingMessage::IceCandidate {
            unique_id: Some(self.session.session_id.clone()),
            to: Some(self.peer_id()),
            candidate,
        })
        .await
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        tracing::trace!(target: "beach_cam::session", kind = message.kind(), "sending to relay");
        self.channel.send(message).await.map_err(SignalingError::from)
    }

    fn peer_id(&self) -> String {
        self.session
            .peer_id
            .clone()
            .unwrap_or_else(|| self.config.controller_id.clone())
    }

    fn set_state(&mut self, next: NegotiationState) {
        if let Some(from) = self.session.transition(next) {
            let _ = self.events.send(SessionEvent::StateChanged {
                attempt: self.attempt,
                from,
                to: next,
            });
        }
    }

    fn fail(&mut self, err: SignalingError) -> Exit {
        let next = match err {
            SignalingError::RelayDisconnect => NegotiationState::Closed,
            _ => NegotiationState::Failed,
        };
        self.set_state(next);
        Exit::Reset(err)
    }
}

pub(super) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Nobody can signal shutdown anymore.
            std::future::pending::<()>().await;
        }
    }
}

async fn next_event(events: &mut Option<AgentEvents>) -> Option<AgentEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
