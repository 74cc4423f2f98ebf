//! CLI definition and gateway wiring.
//!
//! The gateway runs until the control channel closes or a `SHUTDOWN`
//! command is acknowledged.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpStream;
use tracing::info;

use crate::channel::LineChannel;
use crate::dispatcher::{serve, Dispatcher};
use crate::engine::{ContainerSpec, DockerEngine};
use crate::lifecycle::LifecycleController;
use crate::monitor::ExecutionMonitor;
use crate::resources::ResourceManager;

/// Fixed backoff before the single retry of a timed-out engine call.
const ENGINE_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Serial-protocol gateway bridging an on-board computer to a managed
/// payload container.
#[derive(Parser, Debug, Clone)]
#[command(name = "payload-gateway")]
#[command(about = "Bridge an OBC control channel to a managed payload container")]
#[command(version)]
pub struct Cli {
    /// Control channel endpoint: a host:port to connect to, or the path
    /// of an already-created serial device.
    #[arg(long, env = "GATEWAY_CHANNEL", default_value = "127.0.0.1:5760")]
    pub channel: String,

    /// Base URL of the processing service's HTTP API.
    #[arg(long, env = "GATEWAY_API_BASE", default_value = "http://localhost:3000")]
    pub api_base: String,

    /// Name of the managed container.
    #[arg(long, default_value = "payload-container")]
    pub container_name: String,

    /// Image the managed container is created from.
    #[arg(long, default_value = "payload-service:latest")]
    pub image: String,

    /// TCP port of the processing service, published host:container 1:1.
    #[arg(long, default_value_t = 3000)]
    pub service_port: u16,

    /// Deadline in seconds for each container engine call.
    #[arg(long, default_value_t = 5)]
    pub engine_timeout: u64,

    /// Deadline in seconds for each HTTP request to the processing
    /// service.
    #[arg(long, default_value_t = 5)]
    pub poll_timeout: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

/// Where the control channel lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTarget {
    /// TCP endpoint of the serial bridge.
    Tcp(String),
    /// Path of an already-created character device.
    Device(PathBuf),
}

impl Cli {
    /// Interprets the `--channel` value: anything with a path separator
    /// is a device, everything else a TCP endpoint.
    pub fn channel_target(&self) -> ChannelTarget {
        if self.channel.contains('/') {
            ChannelTarget::Device(PathBuf::from(&self.channel))
        } else {
            ChannelTarget::Tcp(self.channel.clone())
        }
    }
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Builds the gateway components and runs the dispatch loop on the
/// configured control channel.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let engine = Arc::new(DockerEngine::new(Duration::from_secs(cli.engine_timeout))?);

    let template = ContainerSpec::new(&cli.container_name, &cli.image)
        .with_service_port(cli.service_port);
    let lifecycle = LifecycleController::new(engine.clone(), template, ENGINE_RETRY_BACKOFF);
    let resources = ResourceManager::new(engine);
    let monitor = ExecutionMonitor::new(&cli.api_base, Duration::from_secs(cli.poll_timeout));
    let dispatcher = Dispatcher::new(lifecycle, resources, monitor);

    match cli.channel_target() {
        ChannelTarget::Tcp(addr) => {
            info!(%addr, "connecting to control channel");
            let stream = TcpStream::connect(&addr).await?;
            serve(LineChannel::new(stream), dispatcher).await?;
        }
        ChannelTarget::Device(path) => {
            info!(path = %path.display(), "opening control channel device");
            let device = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .await?;
            serve(LineChannel::new(device), dispatcher).await?;
        }
    }

    info!("gateway stopped");
    Ok(())
}
