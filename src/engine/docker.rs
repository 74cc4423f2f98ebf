//! Docker Engine implementation of [`ContainerEngine`] using bollard.
//!
//! Every call is bounded by the configured deadline; image pulls get a
//! longer one since a cold pull is dominated by the registry, not the
//! daemon.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions, UpdateContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ContainerEngine, ContainerSpec, ContainerUsage, EngineState};
use crate::error::EngineError;
use crate::resources::ResourceLimits;

/// Deadline for image pulls, which can legitimately outlast a control call.
const PULL_TIMEOUT: Duration = Duration::from_secs(120);

/// Seconds the daemon waits after SIGTERM before SIGKILL on stop.
const STOP_GRACE_SECONDS: i64 = 10;

/// Docker client wrapper for the managed container.
pub struct DockerEngine {
    docker: Docker,
    call_timeout: Duration,
}

impl DockerEngine {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Unavailable` if the daemon is not accessible.
    pub fn new(call_timeout: Duration) -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(format!("failed to connect: {e}")))?;

        Ok(Self {
            docker,
            call_timeout,
        })
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(docker: Docker, call_timeout: Duration) -> Self {
        Self {
            docker,
            call_timeout,
        }
    }

    async fn deadline<T, F>(&self, name: &str, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.map_err(name, err)),
            Err(_) => Err(EngineError::Timeout {
                seconds: self.call_timeout.as_secs(),
            }),
        }
    }

    fn map_err(&self, name: &str, err: bollard::errors::Error) -> EngineError {
        use bollard::errors::Error as Bollard;

        match err {
            Bollard::DockerResponseServerError {
                status_code: 404, ..
            } => EngineError::NotFound {
                name: name.to_string(),
            },
            Bollard::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Rejected(format!("{status_code}: {message}")),
            Bollard::RequestTimeoutError => EngineError::Timeout {
                seconds: self.call_timeout.as_secs(),
            },
            other => EngineError::Unavailable(other.to_string()),
        }
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        debug!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let pull = async {
            let mut stream = self.docker.create_image(Some(options), None, None);
            while let Some(result) = stream.next().await {
                result?;
            }
            Ok::<(), bollard::errors::Error>(())
        };

        match tokio::time::timeout(PULL_TIMEOUT, pull).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.map_err(image, err)),
            Err(_) => Err(EngineError::Timeout {
                seconds: PULL_TIMEOUT.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        if !self.image_exists(&spec.image).await {
            self.pull_image(&spec.image).await?;
        }

        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        if let Some(port) = spec.service_port {
            let key = format!("{port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            memory: spec.limits.memory_bytes(),
            cpu_period: spec.limits.cpu_period(),
            cpu_quota: spec.limits.cpu_quota(),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .deadline(
                &spec.name,
                self.docker.create_container(Some(options), container_config),
            )
            .await?;

        debug!(id = %response.id, name = %spec.name, "container created");
        Ok(response.id)
    }

    async fn start(&self, name: &str) -> Result<(), EngineError> {
        self.deadline(
            name,
            self.docker
                .start_container(name, None::<StartContainerOptions<String>>),
        )
        .await
    }

    async fn stop(&self, name: &str) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: STOP_GRACE_SECONDS,
        };

        self.deadline(name, self.docker.stop_container(name, Some(options)))
            .await
    }

    async fn remove(&self, name: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.deadline(name, self.docker.remove_container(name, Some(options)))
            .await
    }

    async fn state(&self, name: &str) -> Result<EngineState, EngineError> {
        let info = match self
            .deadline(
                name,
                self.docker
                    .inspect_container(name, None::<InspectContainerOptions>),
            )
            .await
        {
            Ok(info) => info,
            Err(EngineError::NotFound { .. }) => return Ok(EngineState::Absent),
            Err(err) => return Err(err),
        };

        let (status, exit_code) = match &info.state {
            Some(s) => (
                s.status.map(|x| x.to_string()).unwrap_or_default(),
                s.exit_code.unwrap_or(0),
            ),
            None => (String::new(), 0),
        };

        Ok(map_status(&status, exit_code))
    }

    async fn usage(&self, name: &str) -> Result<ContainerUsage, EngineError> {
        let info = self
            .deadline(
                name,
                self.docker
                    .inspect_container(name, None::<InspectContainerOptions>),
            )
            .await?;

        let mut usage = ContainerUsage {
            engine_status: info
                .state
                .as_ref()
                .and_then(|s| s.status)
                .map(|s| s.to_string()),
            started_at: info.state.as_ref().and_then(|s| s.started_at.clone()),
            image: info.config.and_then(|c| c.image),
            ..Default::default()
        };

        // Stats are best-effort: a container that just exited has none.
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(name, Some(options));
        match tokio::time::timeout(self.call_timeout, stream.next()).await {
            Ok(Some(Ok(stats))) => fill_from_stats(&mut usage, &stats),
            Ok(Some(Err(err))) => warn!(name, error = %err, "stats fetch failed"),
            Ok(None) => {}
            Err(_) => warn!(name, "stats fetch timed out"),
        }

        Ok(usage)
    }

    async fn update_limits(
        &self,
        name: &str,
        limits: &ResourceLimits,
    ) -> Result<(), EngineError> {
        // Memory of 0 and CpuQuota of -1 clear the respective ceilings.
        // MemorySwap stays unlimited so a lowered memory ceiling never
        // collides with a previously set swap ceiling.
        let options = UpdateContainerOptions::<String> {
            memory: Some(limits.memory_bytes().unwrap_or(0)),
            memory_swap: Some(-1),
            cpu_period: limits.cpu_period(),
            cpu_quota: Some(limits.cpu_quota().unwrap_or(-1)),
            ..Default::default()
        };

        self.deadline(name, self.docker.update_container(name, options))
            .await?;

        debug!(name, "live resource limits updated");
        Ok(())
    }
}

fn map_status(status: &str, exit_code: i64) -> EngineState {
    match status {
        "created" => EngineState::Created,
        "running" => EngineState::Running,
        "paused" => EngineState::Paused,
        "restarting" => EngineState::Restarting,
        "removing" => EngineState::Removing,
        "exited" => EngineState::Exited { exit_code },
        "dead" => EngineState::Dead,
        other => EngineState::Unknown(other.to_string()),
    }
}

fn fill_from_stats(usage: &mut ContainerUsage, stats: &Stats) {
    usage.cpu_percent = cpu_percent(stats);
    usage.memory_usage_bytes = stats.memory_stats.usage;
    usage.memory_limit_bytes = stats.memory_stats.limit;
    usage.memory_percent = match (stats.memory_stats.usage, stats.memory_stats.limit) {
        (Some(used), Some(limit)) if limit > 0 => Some(used as f64 / limit as f64 * 100.0),
        _ => None,
    };

    if let Some(networks) = &stats.networks {
        usage.network_rx_bytes = Some(networks.values().map(|n| n.rx_bytes).sum());
        usage.network_tx_bytes = Some(networks.values().map(|n| n.tx_bytes).sum());
    }

    if let Some(entries) = &stats.blkio_stats.io_service_bytes_recursive {
        let total_for = |op: &str| -> u64 {
            entries
                .iter()
                .filter(|e| e.op.eq_ignore_ascii_case(op))
                .map(|e| e.value)
                .sum()
        };
        usage.block_read_bytes = Some(total_for("read"));
        usage.block_write_bytes = Some(total_for("write"));
    }
}

/// CPU percentage over the stats sampling window, the same delta formula
/// `docker stats` uses.
fn cpu_percent(stats: &Stats) -> Option<f64> {
    let system = stats.cpu_stats.system_cpu_usage?;
    let pre_system = stats.precpu_stats.system_cpu_usage.unwrap_or(0);

    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .checked_sub(stats.precpu_stats.cpu_usage.total_usage)? as f64;
    let system_delta = system.checked_sub(pre_system)? as f64;
    if system_delta <= 0.0 {
        return None;
    }

    let online = stats
        .cpu_stats
        .online_cpus
        .filter(|n| *n > 0)
        .or_else(|| {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as u64)
        })
        .unwrap_or(1) as f64;

    Some(cpu_delta / system_delta * online * 100.0)
}
