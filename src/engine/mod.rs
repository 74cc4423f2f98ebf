//! Container engine abstraction.
//!
//! The gateway drives one named container through a narrow interface:
//! create/start/stop/remove, a state probe, one-shot runtime stats, and a
//! live resource-limit update. The production implementation talks to the
//! Docker Engine API ([`docker::DockerEngine`]); tests substitute a
//! scripted fake through the [`ContainerEngine`] trait.

pub mod docker;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::resources::ResourceLimits;

pub use docker::DockerEngine;

/// Configuration for creating the managed container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name; the gateway addresses the container by name only.
    pub name: String,
    /// Image to create the container from.
    pub image: String,
    /// Environment variables, `KEY=value` form.
    pub env: Vec<String>,
    /// TCP port of the processing service, published host:container 1:1.
    pub service_port: Option<u16>,
    /// Resource limits baked into the container's host configuration.
    pub limits: ResourceLimits,
}

impl ContainerSpec {
    /// Creates a spec with the given name and image and no limits.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: Vec::new(),
            service_port: None,
            limits: ResourceLimits::unlimited(),
        }
    }

    /// Publishes the processing service port.
    pub fn with_service_port(mut self, port: u16) -> Self {
        self.service_port = Some(port);
        self
    }

    /// Adds environment variables.
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Sets the resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// State of the named container as the engine reports it.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    /// No container of that name exists.
    Absent,
    /// Created but not started.
    Created,
    /// Running.
    Running,
    /// Paused.
    Paused,
    /// Restarting.
    Restarting,
    /// Being removed.
    Removing,
    /// Exited with the given code.
    Exited { exit_code: i64 },
    /// Dead.
    Dead,
    /// Anything the engine reports that we do not model.
    Unknown(String),
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Absent => write!(f, "absent"),
            EngineState::Created => write!(f, "created"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
            EngineState::Restarting => write!(f, "restarting"),
            EngineState::Removing => write!(f, "removing"),
            EngineState::Exited { exit_code } => write!(f, "exited ({})", exit_code),
            EngineState::Dead => write!(f, "dead"),
            EngineState::Unknown(s) => write!(f, "unknown ({})", s),
        }
    }
}

/// Best-effort runtime usage snapshot for the managed container.
///
/// Every field is optional: the engine may be mid-transition or a stats
/// counter may be missing, and a partial snapshot is still worth reporting.
#[derive(Debug, Clone, Default)]
pub struct ContainerUsage {
    /// Engine-reported status string (e.g. "running").
    pub engine_status: Option<String>,
    /// Image the container was created from.
    pub image: Option<String>,
    /// Engine-reported start timestamp.
    pub started_at: Option<String>,
    /// CPU usage percentage over the sampling window.
    pub cpu_percent: Option<f64>,
    /// Memory in use, bytes.
    pub memory_usage_bytes: Option<u64>,
    /// Memory ceiling, bytes.
    pub memory_limit_bytes: Option<u64>,
    /// Memory usage as a percentage of the ceiling.
    pub memory_percent: Option<f64>,
    /// Bytes received across all container interfaces.
    pub network_rx_bytes: Option<u64>,
    /// Bytes sent across all container interfaces.
    pub network_tx_bytes: Option<u64>,
    /// Bytes read from block devices.
    pub block_read_bytes: Option<u64>,
    /// Bytes written to block devices.
    pub block_write_bytes: Option<u64>,
}

/// Control interface of the container engine.
///
/// All methods address the container by name. Implementations bound every
/// call with a deadline and map transport failures to
/// [`EngineError::Unavailable`] so callers can distinguish "engine gone"
/// from "engine said no".
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creates the container described by `spec`, pulling the image if
    /// needed. Returns the engine-assigned container id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    /// Starts the named container.
    async fn start(&self, name: &str) -> Result<(), EngineError>;

    /// Stops the named container.
    async fn stop(&self, name: &str) -> Result<(), EngineError>;

    /// Removes the named container (force, with volumes).
    async fn remove(&self, name: &str) -> Result<(), EngineError>;

    /// Probes the current state of the named container. A missing
    /// container is [`EngineState::Absent`], not an error.
    async fn state(&self, name: &str) -> Result<EngineState, EngineError>;

    /// Fetches a one-shot usage snapshot, never cached.
    async fn usage(&self, name: &str) -> Result<ContainerUsage, EngineError>;

    /// Applies CPU/memory limits to the running container.
    async fn update_limits(&self, name: &str, limits: &ResourceLimits)
        -> Result<(), EngineError>;
}
