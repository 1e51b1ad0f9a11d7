pub mod agent;
pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::{DeviceConfig, IceServerConfig, TricklePolicy};
pub use error::SignalingError;
pub use session::{NegotiationState, PeerSession, SessionEvent, Supervisor};
