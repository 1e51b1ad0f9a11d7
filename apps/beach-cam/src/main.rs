mod cli;

use std::sync::Arc;

use anyhow::Context;
use beach_cam::agent::rtc::RtcAgentFactory;
use beach_cam::media::{self, H264FileSource};
use beach_cam::session::Supervisor;
use beach_cam::telemetry::logging;
use beach_cam::transport::websocket::WebSocketConnector;
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("beach-cam: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("initializing logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = cli.device_config().context("invalid configuration")?;
    info!(
        unique_id = %config.unique_id,
        controller_id = %config.controller_id,
        relay = %config.relay_url,
        trickle = ?config.trickle,
        ice_servers = config.ice_servers.len(),
        "starting beach-cam"
    );

    let mut agents = RtcAgentFactory::new(config.ice_servers.clone())
        .with_diagnostics_channel(config.diagnostics_channel.clone());
    if let Some(path) = &cli.video.h264_file {
        let source = H264FileSource::open(path, cli.video.fps, cli.video.loop_video)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        agents = agents.with_frame_source(media::shared(source));
    }
    let connector = WebSocketConnector::new().with_heartbeat(config.heartbeat_interval);

    let supervisor = Supervisor::new(config, Arc::new(connector), Arc::new(agents))?;
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; shutting down");
                let _ = stop_tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for ctrl-c");
                // Keep the sender alive so the supervisor is not told to stop.
                std::future::pending::<()>().await;
                drop(stop_tx);
            }
        }
    });

    supervisor.run(stop_rx).await?;
    Ok(())
}
