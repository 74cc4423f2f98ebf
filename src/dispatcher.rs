//! Command dispatch for the control channel.
//!
//! One command at a time: the read loop owns the dispatcher exclusively
//! and awaits each handler before reading the next line, so a
//! `STOP_CONTAINER` can never race a `START_CONTAINER`. Every failure is
//! converted to a protocol response here; nothing propagates past the
//! dispatch boundary.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::channel::LineChannel;
use crate::error::{EngineError, LifecycleError, LimitsError, ProtocolError};
use crate::lifecycle::LifecycleController;
use crate::monitor::ExecutionMonitor;
use crate::protocol::{Command, Response};
use crate::resources::ResourceManager;

/// Lines with this prefix are OBC-side log output interleaved on the
/// control channel; they are dropped without a response.
const LOG_PREFIX: &str = "[LOG]";

/// Routes parsed commands to the lifecycle controller, resource manager,
/// and execution monitor.
pub struct Dispatcher {
    lifecycle: LifecycleController,
    resources: ResourceManager,
    monitor: ExecutionMonitor,
    shutdown: bool,
}

impl Dispatcher {
    pub fn new(
        lifecycle: LifecycleController,
        resources: ResourceManager,
        monitor: ExecutionMonitor,
    ) -> Self {
        Self {
            lifecycle,
            resources,
            monitor,
            shutdown: false,
        }
    }

    /// True once a `SHUTDOWN` command has been acknowledged.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
    }

    /// Processes one raw line into at most one response line.
    ///
    /// Blank lines and `[LOG]`-prefixed lines yield no response. This
    /// method never panics past the boundary: parse failures and handler
    /// errors all render as protocol tokens.
    pub async fn dispatch(&mut self, raw: &str) -> Option<String> {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(LOG_PREFIX) {
            return None;
        }

        debug!(command = %line, "processing command");

        let response = match Command::parse(line) {
            Ok(command) => self.execute(command).await,
            Err(ProtocolError::UnknownVerb(verb)) => {
                warn!(verb = %verb, "unknown command");
                Response::UnknownCommand
            }
            Err(ProtocolError::InvalidLimits(reason)) => Response::LimitsInvalid(reason),
        };

        Some(response.to_line())
    }

    async fn execute(&mut self, command: Command) -> Response {
        match command {
            Command::Ping => Response::Pong,

            Command::StartContainer => {
                match self.lifecycle.start(self.resources.current()).await {
                    Ok(_) => Response::ContainerStarted,
                    Err(err) => lifecycle_response(err),
                }
            }

            Command::StopContainer => match self.lifecycle.stop().await {
                Ok(_) => Response::ContainerStopped,
                Err(err) => lifecycle_response(err),
            },

            Command::GetContainerStatus => {
                let report = self.lifecycle.status_report().await;
                match serde_json::to_string(&report) {
                    Ok(json) => Response::ContainerStatus(json),
                    Err(err) => Response::Error(format!("status serialization: {err}")),
                }
            }

            Command::RunPayload => match self.monitor.trigger_run().await {
                Ok(()) => Response::ModelStarted,
                Err(err) => Response::Error(err.to_string()),
            },

            Command::GetStatus => Response::Status(self.monitor.poll().await.state),

            Command::GetFiles => match self.monitor.file_counters().await {
                Ok(counters) => Response::Files(counters.latest_result),
                Err(err) => Response::Error(err.to_string()),
            },

            Command::SetResourceLimits(update) => {
                let running = self.lifecycle.running_container().map(str::to_string);
                match self.resources.set_limits(update, running.as_deref()).await {
                    Ok(_) => Response::LimitsSet,
                    Err(err) => limits_response(err),
                }
            }

            Command::ResetResourceLimits => {
                let running = self.lifecycle.running_container().map(str::to_string);
                match self.resources.reset_limits(running.as_deref()).await {
                    Ok(_) => Response::LimitsReset,
                    Err(err) => limits_response(err),
                }
            }

            Command::TextPrompt(message) => Response::Echo(message),

            Command::Shutdown => {
                // Best effort: the service may already be gone, and the
                // acknowledgment must go out either way.
                if let Err(err) = self.monitor.request_shutdown().await {
                    warn!(error = %err, "service shutdown request failed");
                }
                self.shutdown = true;
                Response::ShutdownAck
            }
        }
    }
}

fn lifecycle_response(err: LifecycleError) -> Response {
    match err {
        LifecycleError::State(_) => Response::Busy,
        LifecycleError::Engine(EngineError::Unavailable(_)) => Response::EngineUnavailable,
        LifecycleError::Engine(EngineError::Timeout { .. }) => Response::Timeout,
        LifecycleError::Engine(err) => Response::Error(err.to_string()),
    }
}

fn limits_response(err: LimitsError) -> Response {
    match err {
        LimitsError::CpuOutOfRange { .. } | LimitsError::MemoryBelowFloor { .. } => {
            Response::LimitsInvalid(err.to_string())
        }
        LimitsError::Engine(EngineError::Unavailable(_)) => Response::EngineUnavailable,
        LimitsError::Engine(EngineError::Timeout { .. }) => Response::Timeout,
        LimitsError::Engine(err) => Response::Error(err.to_string()),
    }
}

/// Reads commands off the channel until EOF or an acknowledged
/// `SHUTDOWN`, writing one response per command.
pub async fn serve<S>(
    mut channel: LineChannel<S>,
    mut dispatcher: Dispatcher,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    info!("gateway ready, listening for commands");

    while let Some(line) = channel.recv().await? {
        if let Some(response) = dispatcher.dispatch(&line).await {
            debug!(response = %response, "sending response");
            channel.send(&response).await?;
        }

        if dispatcher.shutdown_requested() {
            info!("shutdown acknowledged, closing control channel");
            break;
        }
    }

    Ok(())
}
