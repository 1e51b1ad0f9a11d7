use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;

use beach_cam::config::{ConfigError, DeviceConfig, TricklePolicy, load_ice_servers};
use beach_cam::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "beach-cam",
    about = "Stream a camera to a controller over WebRTC, negotiated through a signaling relay",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "BEACH_CAM_RELAY_URL",
        value_name = "URL",
        help = "Signaling relay endpoint (ws, wss, http or https)"
    )]
    pub relay_url: String,

    #[arg(
        long = "device-id",
        env = "BEACH_CAM_DEVICE_ID",
        value_name = "ID",
        help = "Identity this device registers with the relay"
    )]
    pub device_id: String,

    #[arg(
        long = "controller-id",
        env = "BEACH_CAM_CONTROLLER_ID",
        value_name = "ID",
        help = "Controller that receives answers and candidates unless the offer names one"
    )]
    pub controller_id: String,

    #[command(flatten)]
    pub negotiation: NegotiationArgs,

    #[command(flatten)]
    pub video: VideoArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct NegotiationArgs {
    #[arg(
        long,
        value_enum,
        env = "BEACH_CAM_TRICKLE",
        default_value_t = TricklePolicy::Batch,
        help = "Send candidates in one burst after gathering (batch) or as they are found (eager)"
    )]
    pub trickle: TricklePolicy,

    #[arg(
        long = "ice-config",
        value_name = "PATH",
        help = "TOML file with [[ice_servers]] entries replacing the default STUN server"
    )]
    pub ice_config: Option<PathBuf>,

    #[arg(long = "gathering-timeout-ms", default_value_t = 10_000)]
    pub gathering_timeout_ms: u64,

    #[arg(long = "negotiation-timeout-ms", default_value_t = 30_000)]
    pub negotiation_timeout_ms: u64,

    #[arg(long = "restart-interval-ms", default_value_t = 1_000)]
    pub restart_interval_ms: u64,

    #[arg(
        long = "heartbeat-secs",
        default_value_t = 30,
        help = "WebSocket ping interval towards the relay; 0 disables pings"
    )]
    pub heartbeat_secs: u64,

    #[arg(
        long = "diagnostics-channel",
        value_name = "LABEL",
        help = "Open a data channel with this label and greet the controller on it"
    )]
    pub diagnostics_channel: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct VideoArgs {
    #[arg(
        long = "h264-file",
        value_name = "PATH",
        env = "BEACH_CAM_H264_FILE",
        help = "Annex-B H.264 stream to send as the video track"
    )]
    pub h264_file: Option<PathBuf>,

    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..=120))]
    pub fps: u32,

    #[arg(long = "loop-video", help = "Restart the H.264 stream when it ends")]
    pub loop_video: bool,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "BEACH_CAM_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "BEACH_CAM_LOG_FILE",
        help = "Append logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    pub fn device_config(&self) -> Result<DeviceConfig, ConfigError> {
        let args = &self.negotiation;
        let mut config =
            DeviceConfig::new(&self.relay_url, &self.device_id, &self.controller_id);
        if let Some(path) = &args.ice_config {
            config.ice_servers = load_ice_servers(path)?;
        }
        config.trickle = args.trickle;
        config.gathering_timeout = Duration::from_millis(args.gathering_timeout_ms);
        config.negotiation_timeout = Duration::from_millis(args.negotiation_timeout_ms);
        config.restart_interval = Duration::from_millis(args.restart_interval_ms);
        config.heartbeat_interval =
            Some(Duration::from_secs(args.heartbeat_secs)).filter(|interval| !interval.is_zero());
        config.diagnostics_channel = args.diagnostics_channel.clone();
        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
