//! Lifecycle control for the managed payload container.
//!
//! Owns the gateway-side container state machine:
//!
//! ```text
//! STOPPED --start--> STARTING --(engine reports running)--> RUNNING
//! RUNNING --stop--> STOPPING --(engine confirms removal)--> STOPPED
//! ```
//!
//! Engine rejections during a transition land in ERROR; from there only
//! `start` (recovery) or `stop` (cleanup) are accepted. An unreachable
//! engine rolls the state back to where it was, never updating
//! optimistically.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, ContainerSpec, EngineState};
use crate::error::{EngineError, LifecycleError, StateError};
use crate::resources::ResourceLimits;

/// Gateway-side view of the managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Stopped => write!(f, "STOPPED"),
            ContainerState::Starting => write!(f, "STARTING"),
            ContainerState::Running => write!(f, "RUNNING"),
            ContainerState::Stopping => write!(f, "STOPPING"),
            ContainerState::Error => write!(f, "ERROR"),
        }
    }
}

/// Point-in-time status of the managed container, serialized into the
/// `CONTAINER_STATUS` response. Engine-derived fields are best-effort and
/// omitted when the engine cannot be reached.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatusReport {
    pub container_name: String,
    pub state: ContainerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_rx_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_tx_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_read_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_write_bytes: Option<u64>,
    pub timestamp: String,
}

/// Drives the managed container through the engine; sole writer of
/// [`ContainerState`].
pub struct LifecycleController {
    engine: Arc<dyn ContainerEngine>,
    template: ContainerSpec,
    state: ContainerState,
    retry_backoff: Duration,
}

impl LifecycleController {
    /// Creates a controller in `STOPPED` with the given container
    /// template. `retry_backoff` is the fixed delay before the single
    /// retry of a timed-out engine call.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        template: ContainerSpec,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            engine,
            template,
            state: ContainerState::Stopped,
            retry_backoff,
        }
    }

    /// Current state of the state machine.
    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// Container name when (and only when) the container is `RUNNING`,
    /// for callers that need the engine's live-update path.
    pub fn running_container(&self) -> Option<&str> {
        (self.state == ContainerState::Running).then(|| self.template.name.as_str())
    }

    /// Starts the container with the given resource limits.
    ///
    /// Idempotent while `RUNNING`; rejected with BUSY while a transition
    /// is in flight. From `ERROR` this is the recovery path: any stale
    /// container is removed and a fresh one created.
    pub async fn start(
        &mut self,
        limits: ResourceLimits,
    ) -> Result<ContainerState, LifecycleError> {
        match self.state {
            ContainerState::Running => {
                debug!("start requested while already running");
                return Ok(self.state);
            }
            ContainerState::Starting | ContainerState::Stopping => {
                return Err(StateError::Busy {
                    op: "start",
                    state: self.state.to_string(),
                }
                .into());
            }
            ContainerState::Stopped | ContainerState::Error => {}
        }

        let rollback = self.state;
        self.state = ContainerState::Starting;

        match self.start_inner(limits).await {
            Ok(()) => {
                self.state = ContainerState::Running;
                info!(container = %self.template.name, "container running");
                Ok(self.state)
            }
            Err(err @ EngineError::Unavailable(_)) => {
                self.state = rollback;
                Err(err.into())
            }
            Err(err) => {
                warn!(container = %self.template.name, error = %err, "start failed");
                self.state = ContainerState::Error;
                Err(err.into())
            }
        }
    }

    /// Stops and removes the container.
    ///
    /// Trivially succeeds while `STOPPED`; rejected with BUSY while a
    /// transition is in flight. From `ERROR` this is the cleanup path.
    pub async fn stop(&mut self) -> Result<ContainerState, LifecycleError> {
        match self.state {
            ContainerState::Stopped => {
                debug!("stop requested while already stopped");
                return Ok(self.state);
            }
            ContainerState::Starting | ContainerState::Stopping => {
                return Err(StateError::Busy {
                    op: "stop",
                    state: self.state.to_string(),
                }
                .into());
            }
            ContainerState::Running | ContainerState::Error => {}
        }

        let rollback = self.state;
        self.state = ContainerState::Stopping;

        match self.stop_inner().await {
            Ok(()) => {
                self.state = ContainerState::Stopped;
                info!(container = %self.template.name, "container stopped");
                Ok(self.state)
            }
            Err(err @ EngineError::Unavailable(_)) => {
                self.state = rollback;
                Err(err.into())
            }
            Err(err) => {
                warn!(container = %self.template.name, error = %err, "stop failed");
                self.state = ContainerState::Error;
                Err(err.into())
            }
        }
    }

    /// Builds a fresh status report; engine-derived fields degrade to
    /// `None` when the engine cannot answer.
    pub async fn status_report(&self) -> ContainerStatusReport {
        let mut report = ContainerStatusReport {
            container_name: self.template.name.clone(),
            state: self.state,
            engine_status: None,
            image: None,
            started_at: None,
            cpu_percent: None,
            memory_usage_bytes: None,
            memory_limit_bytes: None,
            memory_percent: None,
            network_rx_bytes: None,
            network_tx_bytes: None,
            block_read_bytes: None,
            block_write_bytes: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        match self.engine.usage(&self.template.name).await {
            Ok(usage) => {
                report.engine_status = usage.engine_status;
                report.image = usage.image;
                report.started_at = usage.started_at;
                report.cpu_percent = usage.cpu_percent;
                report.memory_usage_bytes = usage.memory_usage_bytes;
                report.memory_limit_bytes = usage.memory_limit_bytes;
                report.memory_percent = usage.memory_percent;
                report.network_rx_bytes = usage.network_rx_bytes;
                report.network_tx_bytes = usage.network_tx_bytes;
                report.block_read_bytes = usage.block_read_bytes;
                report.block_write_bytes = usage.block_write_bytes;
            }
            Err(err) => {
                debug!(container = %self.template.name, error = %err, "usage probe failed");
            }
        }

        report
    }

    async fn start_inner(&self, limits: ResourceLimits) -> Result<(), EngineError> {
        let name = self.template.name.clone();

        match self.probe().await? {
            EngineState::Absent => {}
            EngineState::Running => {
                // Engine already runs a container of our name (e.g. started
                // out of band); adopt it instead of churning it.
                info!(container = %name, "adopting already-running container");
                return Ok(());
            }
            stale => {
                debug!(container = %name, state = %stale, "removing stale container");
                self.retrying("remove", || self.engine.remove(&name)).await?;
            }
        }

        let spec = self.template.clone().with_limits(limits);
        self.retrying("create", || self.engine.create(&spec)).await?;
        self.retrying("start", || self.engine.start(&name)).await?;

        match self.probe().await? {
            EngineState::Running => Ok(()),
            other => Err(EngineError::Rejected(format!(
                "container reported '{other}' after start"
            ))),
        }
    }

    async fn stop_inner(&self) -> Result<(), EngineError> {
        let name = self.template.name.clone();

        match self.probe().await? {
            EngineState::Absent => return Ok(()),
            EngineState::Running | EngineState::Paused | EngineState::Restarting => {
                self.retrying("stop", || self.engine.stop(&name)).await?;
            }
            _ => {}
        }

        self.retrying("remove", || self.engine.remove(&name)).await?;

        match self.probe().await? {
            EngineState::Absent => Ok(()),
            other => Err(EngineError::Rejected(format!(
                "container reported '{other}' after removal"
            ))),
        }
    }

    async fn probe(&self) -> Result<EngineState, EngineError> {
        self.retrying("state", || self.engine.state(&self.template.name))
            .await
    }

    /// Runs an engine call, retrying exactly once after a fixed backoff
    /// when it times out. All other failures pass straight through.
    async fn retrying<T, Fut>(
        &self,
        op: &'static str,
        call: impl Fn() -> Fut,
    ) -> Result<T, EngineError>
    where
        Fut: Future<Output = Result<T, EngineError>>,
    {
        match call().await {
            Err(EngineError::Timeout { seconds }) => {
                warn!(op, seconds, "engine call timed out, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                call().await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::FakeEngine;

    fn controller(engine: Arc<FakeEngine>) -> LifecycleController {
        let template = ContainerSpec::new("payload", "payload-service:latest");
        LifecycleController::new(engine, template, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn start_from_stopped_reaches_running() {
        let engine = Arc::new(FakeEngine::new());
        let mut ctl = controller(engine.clone());

        let state = ctl.start(ResourceLimits::unlimited()).await.unwrap();

        assert_eq!(state, ContainerState::Running);
        assert_eq!(ctl.state(), ContainerState::Running);
        assert_eq!(engine.current_state(), EngineState::Running);
        assert_eq!(ctl.running_container(), Some("payload"));
    }

    #[tokio::test]
    async fn start_while_running_is_an_idempotent_no_op() {
        let engine = Arc::new(FakeEngine::new());
        let mut ctl = controller(engine.clone());

        ctl.start(ResourceLimits::unlimited()).await.unwrap();
        let calls_after_first = engine.calls().len();

        let state = ctl.start(ResourceLimits::unlimited()).await.unwrap();

        assert_eq!(state, ContainerState::Running);
        assert_eq!(engine.calls().len(), calls_after_first);
    }

    #[tokio::test]
    async fn transitions_in_flight_reject_with_busy() {
        let engine = Arc::new(FakeEngine::new());
        let mut ctl = controller(engine);

        for wedged in [ContainerState::Starting, ContainerState::Stopping] {
            ctl.state = wedged;
            let start_err = ctl.start(ResourceLimits::unlimited()).await.unwrap_err();
            assert!(matches!(start_err, LifecycleError::State(StateError::Busy { .. })));

            let stop_err = ctl.stop().await.unwrap_err();
            assert!(matches!(stop_err, LifecycleError::State(StateError::Busy { .. })));
            assert_eq!(ctl.state(), wedged);
        }
    }

    #[tokio::test]
    async fn unreachable_engine_rolls_the_state_back() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_unavailable(true);
        let mut ctl = controller(engine.clone());

        let err = ctl.start(ResourceLimits::unlimited()).await.unwrap_err();

        assert!(matches!(
            err,
            LifecycleError::Engine(EngineError::Unavailable(_))
        ));
        assert_eq!(ctl.state(), ContainerState::Stopped);
    }

    #[tokio::test]
    async fn engine_rejection_moves_to_error_and_start_recovers() {
        let engine = Arc::new(FakeEngine::new());
        engine.reject_start(true);
        let mut ctl = controller(engine.clone());

        let err = ctl.start(ResourceLimits::unlimited()).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Engine(EngineError::Rejected(_))
        ));
        assert_eq!(ctl.state(), ContainerState::Error);

        engine.reject_start(false);
        let state = ctl.start(ResourceLimits::unlimited()).await.unwrap();
        assert_eq!(state, ContainerState::Running);
    }

    #[tokio::test]
    async fn timed_out_call_is_retried_exactly_once() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_with_timeouts(1);
        let mut ctl = controller(engine.clone());

        let state = ctl.start(ResourceLimits::unlimited()).await.unwrap();

        assert_eq!(state, ContainerState::Running);
        // First probe timed out and was replayed before anything else.
        let calls = engine.calls();
        assert_eq!(calls[0], "state payload");
        assert_eq!(calls[1], "state payload");
    }

    #[tokio::test]
    async fn second_timeout_surfaces_and_marks_error() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_with_timeouts(2);
        let mut ctl = controller(engine);

        let err = ctl.start(ResourceLimits::unlimited()).await.unwrap_err();

        assert!(matches!(
            err,
            LifecycleError::Engine(EngineError::Timeout { .. })
        ));
        assert_eq!(ctl.state(), ContainerState::Error);
    }

    #[tokio::test]
    async fn stop_while_stopped_is_trivial() {
        let engine = Arc::new(FakeEngine::new());
        let mut ctl = controller(engine.clone());

        let state = ctl.stop().await.unwrap();

        assert_eq!(state, ContainerState::Stopped);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn full_cycle_confirms_removal() {
        let engine = Arc::new(FakeEngine::new());
        let mut ctl = controller(engine.clone());

        ctl.start(ResourceLimits::unlimited()).await.unwrap();
        let state = ctl.stop().await.unwrap();

        assert_eq!(state, ContainerState::Stopped);
        assert_eq!(engine.current_state(), EngineState::Absent);
        assert_eq!(ctl.running_container(), None);
    }

    #[tokio::test]
    async fn stop_from_error_cleans_up_a_stale_container() {
        let engine = Arc::new(FakeEngine::new());
        let mut ctl = controller(engine.clone());
        ctl.state = ContainerState::Error;
        engine.set_state(EngineState::Exited { exit_code: 1 });

        let state = ctl.stop().await.unwrap();

        assert_eq!(state, ContainerState::Stopped);
        assert_eq!(engine.current_state(), EngineState::Absent);
    }

    #[tokio::test]
    async fn status_report_degrades_to_state_only_when_engine_is_gone() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_unavailable(true);
        let ctl = controller(engine);

        let report = ctl.status_report().await;

        assert_eq!(report.state, ContainerState::Stopped);
        assert_eq!(report.container_name, "payload");
        assert!(report.cpu_percent.is_none());
        assert!(report.engine_status.is_none());
    }

    #[tokio::test]
    async fn status_report_carries_engine_usage_when_running() {
        let engine = Arc::new(FakeEngine::new());
        let mut ctl = controller(engine);
        ctl.start(ResourceLimits::unlimited()).await.unwrap();

        let report = ctl.status_report().await;

        assert_eq!(report.state, ContainerState::Running);
        assert_eq!(report.engine_status.as_deref(), Some("running"));
        assert!(report.cpu_percent.is_some());

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"state\":\"RUNNING\""));
    }
}
