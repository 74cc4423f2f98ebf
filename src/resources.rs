//! Resource limits for the managed payload container.
//!
//! The gateway tracks one pair of logical limits (CPU fraction, memory
//! bytes) and translates them into container-engine configuration. Limits
//! live here; the engine call that applies them lives behind the
//! [`ContainerEngine`] trait.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, info};

use crate::engine::ContainerEngine;
use crate::error::LimitsError;

/// Smallest memory limit the engine will accept without rejecting the
/// container outright.
pub const MEMORY_FLOOR_BYTES: u64 = 4 * 1024 * 1024;

/// CPU scheduler period used when deriving a quota from a core fraction,
/// in microseconds.
pub const CPU_PERIOD_MICROS: i64 = 100_000;

/// Resource ceiling applied to the managed container.
///
/// `None` in either field is the "unlimited" sentinel. The struct always
/// reflects the last limits successfully applied to the container engine,
/// never merely requested ones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU ceiling as a fraction of host cores (e.g. 0.5, 2.0).
    pub cpu: Option<f64>,
    /// Memory ceiling in bytes.
    pub memory: Option<u64>,
}

impl ResourceLimits {
    /// Limits with both ceilings removed.
    pub const fn unlimited() -> Self {
        Self {
            cpu: None,
            memory: None,
        }
    }

    /// Returns true when neither ceiling is set.
    pub fn is_unlimited(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }

    /// Memory ceiling in the signed form the engine API expects.
    pub fn memory_bytes(&self) -> Option<i64> {
        self.memory.map(|m| m as i64)
    }

    /// CPU quota derived from the core fraction.
    ///
    /// Formula: quota = period * fraction, so 1.0 core = 100000 (100% of
    /// one CPU over a 100ms period).
    pub fn cpu_quota(&self) -> Option<i64> {
        self.cpu.map(|f| (CPU_PERIOD_MICROS as f64 * f) as i64)
    }

    /// CPU period to pair with [`cpu_quota`](Self::cpu_quota); `None` when
    /// no CPU ceiling is set.
    pub fn cpu_period(&self) -> Option<i64> {
        self.cpu.map(|_| CPU_PERIOD_MICROS)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// A parsed `SET_RESOURCE_LIMITS` request.
///
/// Unlike [`ResourceLimits`], `None` here means "not mentioned in the
/// command", leaving the stored value untouched. At least one field must
/// be present; the protocol parser rejects an empty kv-list.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LimitsUpdate {
    /// Requested CPU fraction, if the command named one.
    pub cpu: Option<f64>,
    /// Requested memory ceiling in bytes, if the command named one.
    pub memory: Option<u64>,
}

impl LimitsUpdate {
    /// Returns true when the update names no limit at all.
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

/// Owns the gateway's resource limits and pushes them to the engine.
///
/// While the container is stopped, `set_limits` only records the desired
/// values (baked into the next start). While it is running, the engine's
/// live-update path is called first and the stored state changes only on
/// confirmed success.
pub struct ResourceManager {
    engine: Arc<dyn ContainerEngine>,
    applied: ResourceLimits,
    host_cores: f64,
}

impl ResourceManager {
    /// Creates a manager with unlimited defaults, detecting the host core
    /// count for CPU bound validation.
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        let host_cores = sys.cpus().len().max(1) as f64;
        debug!(host_cores, "detected host cores for limit validation");
        Self::with_host_cores(engine, host_cores)
    }

    /// Creates a manager with an explicit host core count.
    pub fn with_host_cores(engine: Arc<dyn ContainerEngine>, host_cores: f64) -> Self {
        Self {
            engine,
            applied: ResourceLimits::unlimited(),
            host_cores,
        }
    }

    /// The last limits successfully applied (or stored while stopped).
    pub fn current(&self) -> ResourceLimits {
        self.applied
    }

    /// Applies a limits update.
    ///
    /// `running` names the container when the lifecycle controller reports
    /// it running; in that case the engine's live-update path is invoked
    /// before the stored limits change.
    ///
    /// # Errors
    ///
    /// Fails fast with a validation error before any engine call when a
    /// requested value is out of range; engine failures leave the stored
    /// limits untouched.
    pub async fn set_limits(
        &mut self,
        update: LimitsUpdate,
        running: Option<&str>,
    ) -> Result<ResourceLimits, LimitsError> {
        self.validate(&update)?;

        let next = ResourceLimits {
            cpu: update.cpu.or(self.applied.cpu),
            memory: update.memory.or(self.applied.memory),
        };

        if let Some(name) = running {
            self.engine.update_limits(name, &next).await?;
        }

        self.applied = next;
        info!(cpu = ?next.cpu, memory = ?next.memory, "resource limits applied");
        Ok(next)
    }

    /// Removes both ceilings, through the live-update path when the
    /// container is running.
    pub async fn reset_limits(
        &mut self,
        running: Option<&str>,
    ) -> Result<ResourceLimits, LimitsError> {
        let next = ResourceLimits::unlimited();

        if let Some(name) = running {
            self.engine.update_limits(name, &next).await?;
        }

        self.applied = next;
        info!("resource limits reset to unlimited");
        Ok(next)
    }

    fn validate(&self, update: &LimitsUpdate) -> Result<(), LimitsError> {
        if let Some(cpu) = update.cpu {
            if !(cpu > 0.0 && cpu <= self.host_cores) {
                return Err(LimitsError::CpuOutOfRange {
                    requested: cpu,
                    max_cores: self.host_cores,
                });
            }
        }

        if let Some(memory) = update.memory {
            if memory < MEMORY_FLOOR_BYTES {
                return Err(LimitsError::MemoryBelowFloor {
                    requested: memory,
                    floor: MEMORY_FLOOR_BYTES,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::FakeEngine;
    use crate::error::EngineError;

    fn manager(engine: Arc<FakeEngine>) -> ResourceManager {
        ResourceManager::with_host_cores(engine, 8.0)
    }

    #[tokio::test]
    async fn set_limits_while_stopped_stores_without_engine_call() {
        let engine = Arc::new(FakeEngine::new());
        let mut mgr = manager(engine.clone());

        let update = LimitsUpdate {
            cpu: Some(0.5),
            memory: Some(512 * 1024 * 1024),
        };
        let applied = mgr.set_limits(update, None).await.unwrap();

        assert_eq!(applied.cpu, Some(0.5));
        assert_eq!(applied.memory, Some(536_870_912));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn set_limits_while_running_goes_through_engine() {
        let engine = Arc::new(FakeEngine::new());
        let mut mgr = manager(engine.clone());

        let update = LimitsUpdate {
            cpu: Some(2.0),
            memory: None,
        };
        mgr.set_limits(update, Some("payload")).await.unwrap();

        assert_eq!(engine.calls(), vec!["update_limits payload"]);
        assert_eq!(mgr.current().cpu, Some(2.0));
    }

    #[tokio::test]
    async fn engine_failure_leaves_stored_limits_unchanged() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_unavailable(true);
        let mut mgr = manager(engine.clone());

        let update = LimitsUpdate {
            cpu: Some(1.0),
            memory: None,
        };
        let err = mgr.set_limits(update, Some("payload")).await.unwrap_err();

        assert!(matches!(err, LimitsError::Engine(EngineError::Unavailable(_))));
        assert_eq!(mgr.current(), ResourceLimits::unlimited());
    }

    #[tokio::test]
    async fn negative_cpu_is_rejected_before_any_engine_call() {
        let engine = Arc::new(FakeEngine::new());
        let mut mgr = manager(engine.clone());

        let update = LimitsUpdate {
            cpu: Some(-1.0),
            memory: Some(1),
        };
        let err = mgr.set_limits(update, Some("payload")).await.unwrap_err();

        assert!(matches!(err, LimitsError::CpuOutOfRange { .. }));
        assert!(engine.calls().is_empty());
        assert_eq!(mgr.current(), ResourceLimits::unlimited());
    }

    #[tokio::test]
    async fn tiny_memory_is_rejected() {
        let engine = Arc::new(FakeEngine::new());
        let mut mgr = manager(engine);

        let update = LimitsUpdate {
            cpu: None,
            memory: Some(MEMORY_FLOOR_BYTES - 1),
        };
        let err = mgr.set_limits(update, None).await.unwrap_err();

        assert!(matches!(err, LimitsError::MemoryBelowFloor { .. }));
    }

    #[tokio::test]
    async fn cpu_above_host_cores_is_rejected() {
        let engine = Arc::new(FakeEngine::new());
        let mut mgr = manager(engine);

        let update = LimitsUpdate {
            cpu: Some(8.5),
            memory: None,
        };
        assert!(mgr.set_limits(update, None).await.is_err());
    }

    #[tokio::test]
    async fn partial_update_keeps_the_other_field() {
        let engine = Arc::new(FakeEngine::new());
        let mut mgr = manager(engine);

        let first = LimitsUpdate {
            cpu: Some(0.5),
            memory: Some(512 * 1024 * 1024),
        };
        mgr.set_limits(first, None).await.unwrap();

        let second = LimitsUpdate {
            cpu: Some(1.5),
            memory: None,
        };
        let applied = mgr.set_limits(second, None).await.unwrap();

        assert_eq!(applied.cpu, Some(1.5));
        assert_eq!(applied.memory, Some(536_870_912));
    }

    #[tokio::test]
    async fn reset_restores_the_unlimited_sentinel() {
        let engine = Arc::new(FakeEngine::new());
        let mut mgr = manager(engine.clone());

        let update = LimitsUpdate {
            cpu: Some(0.5),
            memory: Some(512 * 1024 * 1024),
        };
        mgr.set_limits(update, None).await.unwrap();
        let applied = mgr.reset_limits(Some("payload")).await.unwrap();

        assert!(applied.is_unlimited());
        assert_eq!(engine.calls(), vec!["update_limits payload"]);
    }

    #[test]
    fn quota_derivation_matches_period_times_fraction() {
        let limits = ResourceLimits {
            cpu: Some(2.0),
            memory: None,
        };
        assert_eq!(limits.cpu_period(), Some(100_000));
        assert_eq!(limits.cpu_quota(), Some(200_000));

        assert_eq!(ResourceLimits::unlimited().cpu_quota(), None);
    }
}
