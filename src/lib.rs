//! payload-gateway: protocol translator between an OBC control channel
//! and a containerized processing service.
//!
//! The gateway reads newline-framed commands from a serial-like byte
//! channel, drives the lifecycle and resource limits of one managed
//! container, polls the container's HTTP status API, and answers with
//! single-line protocol tokens.

pub mod channel;
pub mod cli;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod protocol;
pub mod resources;

// Re-export commonly used error types
pub use error::{
    EngineError, LifecycleError, LimitsError, MonitorError, ProtocolError, StateError,
};
