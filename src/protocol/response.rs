//! Response tokens written back on the control channel.

use crate::monitor::RunState;

/// A single-line protocol response.
///
/// `to_line` renders the exact wire token; the OBC branches on these
/// strings, so they are part of the external interface and never change
/// shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `CONTAINER_STARTED`
    ContainerStarted,
    /// `CONTAINER_STOPPED`
    ContainerStopped,
    /// `CONTAINER_STATUS:{json}`, carrying a pre-serialized status report.
    ContainerStatus(String),
    /// `MODEL_STARTED`
    ModelStarted,
    /// `STATUS:{state}`
    Status(RunState),
    /// `FILES:{count}`
    Files(u64),
    /// `SHUTDOWN_ACK`
    ShutdownAck,
    /// `PONG`
    Pong,
    /// `RESOURCE_LIMITS_SET`
    LimitsSet,
    /// `RESOURCE_LIMITS_RESET`
    LimitsReset,
    /// `RESOURCE_LIMITS_INVALID:{reason}`
    LimitsInvalid(String),
    /// `{message} OK`
    Echo(String),
    /// `BUSY`
    Busy,
    /// `ENGINE_UNAVAILABLE`
    EngineUnavailable,
    /// `TIMEOUT`
    Timeout,
    /// `ERROR:{detail}`
    Error(String),
    /// `UNKNOWN_COMMAND`
    UnknownCommand,
}

impl Response {
    /// Renders the wire form, without the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            Response::ContainerStarted => "CONTAINER_STARTED".to_string(),
            Response::ContainerStopped => "CONTAINER_STOPPED".to_string(),
            Response::ContainerStatus(json) => format!("CONTAINER_STATUS:{json}"),
            Response::ModelStarted => "MODEL_STARTED".to_string(),
            Response::Status(state) => format!("STATUS:{state}"),
            Response::Files(count) => format!("FILES:{count}"),
            Response::ShutdownAck => "SHUTDOWN_ACK".to_string(),
            Response::Pong => "PONG".to_string(),
            Response::LimitsSet => "RESOURCE_LIMITS_SET".to_string(),
            Response::LimitsReset => "RESOURCE_LIMITS_RESET".to_string(),
            Response::LimitsInvalid(reason) => format!("RESOURCE_LIMITS_INVALID:{reason}"),
            Response::Echo(message) => format!("{message} OK"),
            Response::Busy => "BUSY".to_string(),
            Response::EngineUnavailable => "ENGINE_UNAVAILABLE".to_string(),
            Response::Timeout => "TIMEOUT".to_string(),
            Response::Error(detail) => format!("ERROR:{detail}"),
            Response::UnknownCommand => "UNKNOWN_COMMAND".to_string(),
        }
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tokens_are_stable() {
        assert_eq!(Response::ContainerStarted.to_line(), "CONTAINER_STARTED");
        assert_eq!(Response::ContainerStopped.to_line(), "CONTAINER_STOPPED");
        assert_eq!(Response::ModelStarted.to_line(), "MODEL_STARTED");
        assert_eq!(Response::Pong.to_line(), "PONG");
        assert_eq!(Response::ShutdownAck.to_line(), "SHUTDOWN_ACK");
        assert_eq!(Response::Busy.to_line(), "BUSY");
        assert_eq!(Response::EngineUnavailable.to_line(), "ENGINE_UNAVAILABLE");
        assert_eq!(Response::Timeout.to_line(), "TIMEOUT");
        assert_eq!(Response::UnknownCommand.to_line(), "UNKNOWN_COMMAND");
        assert_eq!(Response::LimitsSet.to_line(), "RESOURCE_LIMITS_SET");
        assert_eq!(Response::LimitsReset.to_line(), "RESOURCE_LIMITS_RESET");
    }

    #[test]
    fn parameterized_tokens_carry_their_payload() {
        assert_eq!(Response::Files(7).to_line(), "FILES:7");
        assert_eq!(Response::Status(RunState::Success).to_line(), "STATUS:SUCCESS");
        assert_eq!(Response::Echo("hello".into()).to_line(), "hello OK");
        assert_eq!(
            Response::LimitsInvalid("no limits specified".into()).to_line(),
            "RESOURCE_LIMITS_INVALID:no limits specified"
        );
        assert_eq!(
            Response::ContainerStatus("{\"state\":\"STOPPED\"}".into()).to_line(),
            "CONTAINER_STATUS:{\"state\":\"STOPPED\"}"
        );
    }
}
