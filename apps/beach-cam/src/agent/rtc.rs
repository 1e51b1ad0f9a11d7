use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    AgentError, AgentEvent, AgentFactory, AgentHandle, IceConnectionState, IceGatheringState,
    PeerAgent,
};
use crate::config::IceServerConfig;
use crate::media::{self, EncodedFrame, MediaError, SampleSink, SharedFrameSource};
use crate::protocol::IceCandidate;

const DIAGNOSTICS_GREETING: &str = "beach-cam ready";

/// Builds `webrtc` peer connections configured from [`crate::config::DeviceConfig`].
#[derive(Clone, Default)]
pub struct RtcAgentFactory {
    ice_servers: Vec<IceServerConfig>,
    frame_source: Option<SharedFrameSource>,
    diagnostics_channel: Option<String>,
}

impl RtcAgentFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            ice_servers,
            ..Self::default()
        }
    }

    pub fn with_frame_source(mut self, source: SharedFrameSource) -> Self {
        self.frame_source = Some(source);
        self
    }

    pub fn with_diagnostics_channel(mut self, label: Option<String>) -> Self {
        self.diagnostics_channel = label;
        self
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl AgentFactory for RtcAgentFactory {
    async fn create(&self) -> Result<AgentHandle, AgentError> {
        let api = build_api(SettingEngine::default())?;
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_setup_error)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pump: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));

        let candidate_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(AgentEvent::LocalCandidate(init.candidate));
                    }
                    Err(err) => {
                        tracing::warn!(target: "beach_cam::agent", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let gathering_tx = events_tx.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            let events = gathering_tx.clone();
            Box::pin(async move {
                tracing::trace!(target: "beach_cam::agent", ?state, "ice gathering state");
                let mapped = match state {
                    RTCIceGathererState::New => IceGatheringState::New,
                    RTCIceGathererState::Gathering => IceGatheringState::Gathering,
                    RTCIceGathererState::Complete => IceGatheringState::Complete,
                    _ => return,
                };
                let _ = events.send(AgentEvent::GatheringState(mapped));
            })
        }));

        let track = match &self.frame_source {
            Some(_) => Some(add_video_track(&pc).await?),
            None => None,
        };

        let connection_tx = events_tx;
        let source_for_pump = self.frame_source.clone();
        let pump_slot = Arc::clone(&pump);
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let events = connection_tx.clone();
            let mapped = map_connection_state(state);
            if let (Some(IceConnectionState::Connected), Some(track), Some(source)) =
                (mapped, track.clone(), source_for_pump.clone())
            {
                start_pump(&pump_slot, source, track);
            }
            Box::pin(async move {
                if let Some(mapped) = mapped {
                    let _ = events.send(AgentEvent::ConnectionState(mapped));
                }
            })
        }));

        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            tracing::debug!(target: "beach_cam::agent", %state, "signaling state");
            Box::pin(async {})
        }));

        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                tracing::debug!(
                    target: "beach_cam::agent",
                    kind = %track.kind(),
                    id = %track.id(),
                    "remote track received"
                );
                Box::pin(async {})
            },
        ));

        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            Box::pin(async move {
                tracing::debug!(
                    target: "beach_cam::agent",
                    label = channel.label(),
                    "remote opened data channel"
                );
                log_messages(&channel);
            })
        }));

        if let Some(label) = &self.diagnostics_channel {
            let channel = pc
                .create_data_channel(label, None)
                .await
                .map_err(to_setup_error)?;
            let greeter = Arc::downgrade(&channel);
            channel.on_open(Box::new(move || {
                let greeter = greeter.upgrade();
                Box::pin(async move {
                    let Some(greeter) = greeter else {
                        return;
                    };
                    if let Err(err) = greeter.send_text(DIAGNOSTICS_GREETING).await {
                        tracing::warn!(target: "beach_cam::agent", error = %err, "diagnostics greeting failed");
                    }
                })
            }));
            log_messages(&channel);
        }

        Ok(AgentHandle {
            agent: Box::new(RtcPeerAgent {
                pc,
                pump,
                closed: AtomicBool::new(false),
            }),
            events: events_rx,
        })
    }
}

pub struct RtcPeerAgent {
    pc: Arc<RTCPeerConnection>,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
    closed: AtomicBool,
}

impl RtcPeerAgent {
    fn ensure_open(&self) -> Result<(), AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerAgent for RtcPeerAgent {
    async fn set_remote_description(&self, offer_sdp: &str) -> Result<(), AgentError> {
        self.ensure_open()?;
        let offer = RTCSessionDescription::offer(offer_sdp.to_string()).map_err(to_description_error)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(to_description_error)
    }

    async fn create_answer(&self) -> Result<String, AgentError> {
        self.ensure_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_description_error)?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, answer_sdp: &str) -> Result<(), AgentError> {
        self.ensure_open()?;
        let answer =
            RTCSessionDescription::answer(answer_sdp.to_string()).map_err(to_description_error)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(to_description_error)
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|description| description.sdp)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), AgentError> {
        self.ensure_open()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.to_sdp_attribute(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| AgentError::Candidate(err.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target: "beach_cam::agent", error = %err, "peer connection close failed");
        }
    }
}

struct TrackSink(Arc<TrackLocalStaticSample>);

#[async_trait]
impl SampleSink for TrackSink {
    async fn write_frame(&self, frame: &EncodedFrame) -> Result<(), MediaError> {
        let sample = Sample {
            data: frame.data.clone(),
            duration: frame.duration,
            ..Default::default()
        };
        self.0.write_sample(&sample).await?;
        Ok(())
    }
}

fn build_api(setting: SettingEngine) -> Result<API, AgentError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

async fn add_video_track(
    pc: &Arc<RTCPeerConnection>,
) -> Result<Arc<TrackLocalStaticSample>, AgentError> {
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        "beach-cam".to_owned(),
    ));
    let sender = pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(to_setup_error)?;
    // RTCP has to be drained for the interceptors to run.
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while sender.read(&mut rtcp_buf).await.is_ok() {}
    });
    Ok(track)
}

fn start_pump(
    slot: &Arc<Mutex<Option<JoinHandle<()>>>>,
    source: SharedFrameSource,
    track: Arc<TrackLocalStaticSample>,
) {
    let mut slot = slot.lock().unwrap_or_else(|p| p.into_inner());
    if slot.is_some() {
        return;
    }
    tracing::debug!(target: "beach_cam::media", "starting video pump");
    *slot = Some(tokio::spawn(async move {
        media::pump(source, Arc::new(TrackSink(track))).await;
    }));
}

fn log_messages(channel: &Arc<RTCDataChannel>) {
    let label = channel.label().to_string();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let label = label.clone();
        Box::pin(async move {
            if message.is_string {
                tracing::info!(
                    target: "beach_cam::agent",
                    channel = %label,
                    text = %String::from_utf8_lossy(&message.data),
                    "data channel message"
                );
            } else {
                tracing::debug!(
                    target: "beach_cam::agent",
                    channel = %label,
                    len = message.data.len(),
                    "data channel binary message"
                );
            }
        })
    }));
}

fn map_connection_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> AgentError {
    AgentError::Setup(err.to_string())
}

fn to_description_error<E: std::fmt::Display>(err: E) -> AgentError {
    AgentError::Description(err.to_string())
}
