//! Keeps the device negotiating: one attempt at a time, each with a fresh
//! channel, agent and [`PeerSession`](super::PeerSession), torn down through
//! a single path before the next begins.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, sleep_until};

use super::NegotiationState;
use super::negotiator::{Exit, Negotiator, wait_for_shutdown};
use crate::agent::AgentFactory;
use crate::config::{ConfigError, DeviceConfig};
use crate::error::SignalingError;
use crate::transport::Connector;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connecting {
        attempt: u64,
    },
    StateChanged {
        attempt: u64,
        from: NegotiationState,
        to: NegotiationState,
    },
    AnswerSent {
        attempt: u64,
        candidates: usize,
    },
    Reset {
        attempt: u64,
        reason: String,
    },
    Stopped,
}

pub struct Supervisor {
    config: Arc<DeviceConfig>,
    connector: Arc<dyn Connector>,
    agents: Arc<dyn AgentFactory>,
    events: broadcast::Sender<SessionEvent>,
}

impl Supervisor {
    pub fn new(
        config: DeviceConfig,
        connector: Arc<dyn Connector>,
        agents: Arc<dyn AgentFactory>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            config: Arc::new(config),
            connector,
            agents,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Runs negotiation attempts back to back until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SignalingError> {
        let mut attempt = 0u64;
        loop {
            if *shutdown.borrow() {
                break;
            }
            attempt += 1;
            let started = Instant::now();
            match self.attempt(attempt, &mut shutdown).await {
                Exit::Shutdown => break,
                Exit::Reset(reason) => {
                    tracing::warn!(
                        target: "beach_cam::supervisor",
                        attempt,
                        error = %reason,
                        "session reset"
                    );
                    self.emit(SessionEvent::Reset {
                        attempt,
                        reason: reason.to_string(),
                    });
                }
            }
            let resume_at = started + self.config.restart_interval;
            tokio::select! {
                _ = sleep_until(resume_at) => {}
                _ = wait_for_shutdown(&mut shutdown) => {}
            }
        }
        tracing::info!(target: "beach_cam::supervisor", attempts = attempt, "supervisor stopped");
        self.emit(SessionEvent::Stopped);
        Ok(())
    }

    async fn attempt(&self, attempt: u64, shutdown: &mut watch::Receiver<bool>) -> Exit {
        tracing::info!(
            target: "beach_cam::supervisor",
            attempt,
            relay = %self.config.relay_url,
            "connecting to relay"
        );
        self.emit(SessionEvent::Connecting { attempt });
        let mut channel = match self.connector.connect(&self.config.relay_url).await {
            Ok(channel) => channel,
            Err(err) => return Exit::Reset(err.into()),
        };
        let agent = match self.agents.create().await {
            Ok(agent) => agent,
            Err(err) => {
                channel.close().await;
                return Exit::Reset(SignalingError::negotiation(err));
            }
        };
        let mut negotiator = Negotiator::new(
            Arc::clone(&self.config),
            attempt,
            channel,
            agent,
            self.events.clone(),
        );
        let exit = negotiator.run(shutdown).await;
        negotiator.teardown().await;
        exit
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
