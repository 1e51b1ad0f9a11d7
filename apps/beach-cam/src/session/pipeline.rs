//! Inbound candidate buffering/application and outbound candidate batching.
//!
//! Every candidate failure is handled here: malformed or rejected candidates
//! are logged and dropped, and nothing escapes to the negotiator.

use std::collections::HashSet;

use crate::agent::PeerAgent;
use crate::config::TricklePolicy;
use crate::error::SignalingError;
use crate::protocol::sdp::{self, MediaTag};
use crate::protocol::{CandidatePayload, IceCandidate};
use crate::session::PeerSession;

/// What happened to one inbound candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Held until the remote description is applied.
    Buffered,
    Applied,
    /// Already applied in this session; the agent was not called again.
    Duplicate,
    /// The remote signalled the end of its candidate list.
    EndOfCandidates,
    Dropped(String),
}

#[derive(Debug)]
pub struct CandidatePipeline {
    policy: TricklePolicy,
    tag: MediaTag,
    applied: HashSet<IceCandidate>,
    gathered: Vec<String>,
    burst_sent: bool,
}

impl CandidatePipeline {
    pub fn new(policy: TricklePolicy) -> Self {
        Self {
            policy,
            tag: MediaTag::default(),
            applied: HashSet::new(),
            gathered: Vec::new(),
            burst_sent: false,
        }
    }

    pub fn policy(&self) -> TricklePolicy {
        self.policy
    }

    /// Media section used to tag outbound candidates.
    pub fn set_media_tag(&mut self, tag: MediaTag) {
        self.tag = tag;
    }

    /// Handles one `ice-candidate` payload from the relay.
    pub async fn receive(
        &mut self,
        session: &mut PeerSession,
        agent: &dyn PeerAgent,
        payload: &CandidatePayload,
    ) -> Disposition {
        if payload.is_end_of_candidates() {
            tracing::debug!(target: "beach_cam::candidates", "remote end of candidates");
            return Disposition::EndOfCandidates;
        }
        let candidate = match payload.parse() {
            Ok(candidate) => candidate,
            Err(err) => return dropped(SignalingError::MalformedCandidate(err), &payload.candidate),
        };
        if !session.has_remote_description() {
            tracing::debug!(
                target: "beach_cam::candidates",
                candidate = %candidate,
                pending = session.pending_remote_candidates.len() + 1,
                "buffering candidate until offer is applied"
            );
            session.pending_remote_candidates.push_back(candidate);
            return Disposition::Buffered;
        }
        self.apply(agent, candidate).await
    }

    /// Applies buffered candidates in arrival order. Called once, right after
    /// the remote description is set.
    pub async fn flush_pending(
        &mut self,
        session: &mut PeerSession,
        agent: &dyn PeerAgent,
    ) -> Vec<Disposition> {
        let mut outcomes = Vec::with_capacity(session.pending_remote_candidates.len());
        while let Some(candidate) = session.pending_remote_candidates.pop_front() {
            outcomes.push(self.apply(agent, candidate).await);
        }
        if !outcomes.is_empty() {
            tracing::debug!(
                target: "beach_cam::candidates",
                flushed = outcomes.len(),
                "flushed buffered candidates"
            );
        }
        outcomes
    }

    async fn apply(&mut self, agent: &dyn PeerAgent, candidate: IceCandidate) -> Disposition {
        if self.applied.contains(&candidate) {
            tracing::trace!(target: "beach_cam::candidates", candidate = %candidate, "duplicate candidate ignored");
            return Disposition::Duplicate;
        }
        match agent.add_ice_candidate(&candidate).await {
            Ok(()) => {
                tracing::trace!(target: "beach_cam::candidates", candidate = %candidate, "applied remote candidate");
                self.applied.insert(candidate);
                Disposition::Applied
            }
            Err(err) => dropped(
                SignalingError::CandidateApplyFailure(err.to_string()),
                &candidate.to_string(),
            ),
        }
    }

    /// Accepts a locally gathered candidate. A returned payload must be sent
    /// right away: always under eager trickle, and under batch policy for
    /// stragglers that show up after the burst went out. Otherwise the
    /// candidate is held for [`CandidatePipeline::take_burst`].
    pub fn local_candidate(&mut self, candidate: String) -> Option<CandidatePayload> {
        if candidate.trim().is_empty() {
            return None;
        }
        if self.policy == TricklePolicy::Eager || self.burst_sent {
            return Some(self.payload(candidate));
        }
        self.gathered.push(candidate);
        None
    }

    /// Drains the batched candidates, in discovery order. When the agent
    /// reported none, falls back to the candidates embedded in the final
    /// local description.
    pub fn take_burst(&mut self, local_description: Option<&str>) -> Vec<CandidatePayload> {
        self.burst_sent = true;
        let gathered = std::mem::take(&mut self.gathered);
        if !gathered.is_empty() {
            return gathered
                .into_iter()
                .map(|candidate| self.payload(candidate))
                .collect();
        }
        local_description
            .map(sdp::extract_candidates)
            .unwrap_or_default()
            .into_iter()
            .map(|found| CandidatePayload::new(found.candidate, found.tag.mid, found.tag.mline_index))
            .collect()
    }

    fn payload(&self, candidate: String) -> CandidatePayload {
        CandidatePayload::new(candidate, self.tag.mid.clone(), self.tag.mline_index)
    }
}

fn dropped(err: SignalingError, candidate: &str) -> Disposition {
    debug_assert!(!err.is_fatal());
    tracing::warn!(
        target: "beach_cam::candidates",
        error = %err,
        candidate = %candidate,
        "dropping remote candidate"
    );
    Disposition::Dropped(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::{AgentCall, MockAgent};

    const HOST: &str = "1 1 UDP 2122260223 10.0.0.5 54400 typ host";
    const SRFLX: &str =
        "candidate:2 1 udp 1686052607 203.0.113.7 61002 typ srflx raddr 10.0.0.5 rport 54400";

    fn with_remote(session_id: &str) -> PeerSession {
        let mut session = PeerSession::new(session_id);
        session.remote_description = Some("v=0".into());
        session
    }

    #[tokio::test]
    async fn buffers_until_remote_description_then_flushes_in_order() {
        let (handle, control) = MockAgent::new();
        let mut pipeline = CandidatePipeline::new(TricklePolicy::Batch);
        let mut session = PeerSession::new("dev-1");

        for raw in [SRFLX, HOST] {
            let outcome = pipeline
                .receive(&mut session, handle.agent.as_ref(), &CandidatePayload::new(raw, "0", 0))
                .await;
            assert_eq!(outcome, Disposition::Buffered);
        }
        assert!(control.applied_candidates().is_empty());

        session.remote_description = Some("v=0".into());
        let outcomes = pipeline.flush_pending(&mut session, handle.agent.as_ref()).await;
        assert_eq!(outcomes, vec![Disposition::Applied, Disposition::Applied]);
        let applied = control.applied_candidates();
        assert_eq!(applied[0].foundation, "2");
        assert_eq!(applied[1].foundation, "1");
        assert!(session.pending_remote_candidates.is_empty());

        let again = pipeline.flush_pending(&mut session, handle.agent.as_ref()).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn duplicate_candidate_reaches_agent_once() {
        let (handle, control) = MockAgent::new();
        let mut pipeline = CandidatePipeline::new(TricklePolicy::Batch);
        let mut session = with_remote("dev-1");
        let payload = CandidatePayload::new(HOST, "0", 0);

        let first = pipeline.receive(&mut session, handle.agent.as_ref(), &payload).await;
        let second = pipeline.receive(&mut session, handle.agent.as_ref(), &payload).await;
        assert_eq!(first, Disposition::Applied);
        assert_eq!(second, Disposition::Duplicate);
        assert_eq!(control.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn malformed_candidate_leaves_session_untouched() {
        let (handle, control) = MockAgent::new();
        let mut pipeline = CandidatePipeline::new(TricklePolicy::Batch);
        let mut session = PeerSession::new("dev-1");
        let before = session.state;

        let outcome = pipeline
            .receive(
                &mut session,
                handle.agent.as_ref(),
                &CandidatePayload::new("bad candidate string", "0", 0),
            )
            .await;
        assert!(matches!(outcome, Disposition::Dropped(reason) if reason.contains("found 3")));
        assert_eq!(session.state, before);
        assert!(session.pending_remote_candidates.is_empty());
        assert!(control.calls().is_empty());
    }

    #[tokio::test]
    async fn agent_rejection_is_not_remembered_as_applied() {
        let (handle, control) = MockAgent::new();
        control.reject_candidates();
        let mut pipeline = CandidatePipeline::new(TricklePolicy::Batch);
        let mut session = with_remote("dev-1");
        let payload = CandidatePayload::new(HOST, "0", 0);

        let outcome = pipeline.receive(&mut session, handle.agent.as_ref(), &payload).await;
        assert!(matches!(outcome, Disposition::Dropped(_)));
        let retry = pipeline.receive(&mut session, handle.agent.as_ref(), &payload).await;
        assert!(matches!(retry, Disposition::Dropped(_)));
        assert_eq!(
            control
                .calls()
                .iter()
                .filter(|call| matches!(call, AgentCall::AddCandidate(_)))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn end_of_candidates_and_missing_tags() {
        let (handle, _control) = MockAgent::new();
        let mut pipeline = CandidatePipeline::new(TricklePolicy::Batch);
        let mut session = with_remote("dev-1");

        let end = pipeline
            .receive(&mut session, handle.agent.as_ref(), &CandidatePayload::new("", "0", 0))
            .await;
        assert_eq!(end, Disposition::EndOfCandidates);

        let untagged = CandidatePayload {
            candidate: HOST.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: None,
        };
        let outcome = pipeline.receive(&mut session, handle.agent.as_ref(), &untagged).await;
        assert!(matches!(outcome, Disposition::Dropped(reason) if reason.contains("sdpMLineIndex")));
    }

    #[test]
    fn batch_policy_holds_candidates_for_the_burst() {
        let mut pipeline = CandidatePipeline::new(TricklePolicy::Batch);
        pipeline.set_media_tag(MediaTag {
            mid: "video".into(),
            mline_index: 0,
        });
        assert!(pipeline.local_candidate(SRFLX.into()).is_none());
        assert!(pipeline.local_candidate(HOST.into()).is_none());
        let burst = pipeline.take_burst(None);
        assert_eq!(burst.len(), 2);
        assert_eq!(burst[0].candidate, SRFLX);
        assert_eq!(burst[1].sdp_mid.as_deref(), Some("video"));
        assert!(pipeline.take_burst(None).is_empty());

        let late = pipeline.local_candidate(HOST.into()).expect("late candidate forwarded");
        assert_eq!(late.candidate, HOST);
    }

    #[test]
    fn burst_falls_back_to_local_description() {
        let mut pipeline = CandidatePipeline::new(TricklePolicy::Batch);
        let local = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 102\r\na=mid:0\r\na=candidate:1 1 udp 2122260223 10.0.0.9 50000 typ host\r\n";
        let burst = pipeline.take_burst(Some(local));
        assert_eq!(burst.len(), 1);
        assert_eq!(
            burst[0].candidate,
            "candidate:1 1 udp 2122260223 10.0.0.9 50000 typ host"
        );
    }

    #[test]
    fn eager_policy_forwards_immediately() {
        let mut pipeline = CandidatePipeline::new(TricklePolicy::Eager);
        let payload = pipeline.local_candidate(HOST.into()).expect("forwarded");
        assert_eq!(payload.sdp_mid.as_deref(), Some("0"));
        assert_eq!(payload.sdp_mline_index, Some(0));
        assert!(pipeline.take_burst(None).is_empty());
    }
}
