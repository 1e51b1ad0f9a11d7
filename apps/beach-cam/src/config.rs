use std::env;
use std::fs;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::transport::websocket_url;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DISABLE_STUN_ENV: &str = "BEACH_CAM_DISABLE_STUN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("invalid relay url: {0}")]
    RelayUrl(String),
    #[error("restart interval must be greater than zero")]
    ZeroRestartInterval,
    #[error("failed to read ICE config {path}: {source}")]
    IceConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse ICE config {path}: {source}")]
    IceConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// How locally gathered candidates reach the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TricklePolicy {
    /// Hold candidates until gathering completes, then send them as one burst
    /// followed by the answer.
    #[default]
    Batch,
    /// Send the answer as soon as it is applied and forward every candidate as
    /// it is discovered.
    Eager,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IceConfigFile {
    #[serde(default)]
    ice_servers: Vec<IceServerConfig>,
}

/// Reads `[[ice_servers]]` tables from a TOML file.
pub fn load_ice_servers(path: &Path) -> Result<Vec<IceServerConfig>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::IceConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    let file: IceConfigFile =
        toml::from_str(&contents).map_err(|source| ConfigError::IceConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(file.ice_servers)
}

/// Everything one device needs to negotiate sessions.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub relay_url: String,
    /// Identity registered with the relay. Stable across restarts.
    pub unique_id: String,
    /// Default destination for answers and candidates.
    pub controller_id: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub trickle: TricklePolicy,
    pub gathering_timeout: Duration,
    /// Bound on the offer to connected path.
    pub negotiation_timeout: Duration,
    /// Minimum spacing between negotiation attempts.
    pub restart_interval: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub diagnostics_channel: Option<String>,
}

impl DeviceConfig {
    pub fn new(
        relay_url: impl Into<String>,
        unique_id: impl Into<String>,
        controller_id: impl Into<String>,
    ) -> Self {
        Self {
            relay_url: relay_url.into(),
            unique_id: unique_id.into(),
            controller_id: controller_id.into(),
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN_SERVER)],
            trickle: TricklePolicy::Batch,
            gathering_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(30),
            restart_interval: Duration::from_secs(1),
            heartbeat_interval: Some(Duration::from_secs(30)),
            diagnostics_channel: None,
        }
    }

    /// Applies process-level switches that are not part of the CLI surface.
    pub fn apply_env_overrides(mut self) -> Self {
        if env::var(DISABLE_STUN_ENV).is_ok_and(|value| value == "1") {
            tracing::debug!(target: "beach_cam::config", "stun servers disabled via environment");
            self.ice_servers.clear();
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unique_id.trim().is_empty() {
            return Err(ConfigError::Empty("device id"));
        }
        if self.controller_id.trim().is_empty() {
            return Err(ConfigError::Empty("controller id"));
        }
        if self.restart_interval.is_zero() {
            return Err(ConfigError::ZeroRestartInterval);
        }
        websocket_url(&self.relay_url).map_err(|err| ConfigError::RelayUrl(err.to_string()))?;
        Ok(())
    }
}
