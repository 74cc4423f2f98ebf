//! Error types for gateway operations.
//!
//! Defines error types for the major subsystems:
//! - Control-channel command parsing
//! - Container engine interactions
//! - Lifecycle state machine conflicts
//! - Resource limit validation
//! - Execution status monitoring (HTTP)
//!
//! Every error is caught at the dispatcher boundary and rendered as a
//! single-line protocol response; nothing here crosses the read loop.

use thiserror::Error;

/// Errors that can occur while parsing a command line.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown command verb '{0}'")]
    UnknownVerb(String),

    #[error("Invalid resource limits argument: {0}")]
    InvalidLimits(String),
}

/// Errors reported by the container engine layer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Container engine unreachable: {0}")]
    Unavailable(String),

    #[error("Engine rejected the call: {0}")]
    Rejected(String),

    #[error("Engine call timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Container '{name}' not found")]
    NotFound { name: String },
}

/// Errors that can occur when a lifecycle operation conflicts with the
/// current container state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Operation '{op}' rejected: container is {state}")]
    Busy { op: &'static str, state: String },
}

/// Errors that can occur while validating or applying resource limits.
#[derive(Debug, Error)]
pub enum LimitsError {
    #[error("cpu must be in (0, {max_cores}], got {requested}")]
    CpuOutOfRange { requested: f64, max_cores: f64 },

    #[error("memory must be at least {floor} bytes, got {requested}")]
    MemoryBelowFloor { requested: u64, floor: u64 },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors that can occur while talking to the processing service over HTTP.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed {
        endpoint: &'static str,
        reason: String,
    },

    #[error("Request to {endpoint} timed out")]
    Timeout { endpoint: &'static str },

    #[error("Unexpected status {code} from {endpoint}")]
    BadStatus { endpoint: &'static str, code: u16 },

    #[error("Failed to decode response from {endpoint}: {reason}")]
    Decode {
        endpoint: &'static str,
        reason: String,
    },
}

/// Errors surfaced by lifecycle operations: either a state-machine conflict
/// or a failure from the engine underneath.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
