//! Command parsing for the control channel.

use crate::error::ProtocolError;
use crate::resources::LimitsUpdate;

/// A parsed control-channel command. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `START_CONTAINER`
    StartContainer,
    /// `STOP_CONTAINER`
    StopContainer,
    /// `GET_CONTAINER_STATUS`
    GetContainerStatus,
    /// `RUN_PAYLOAD`
    RunPayload,
    /// `GET_STATUS`
    GetStatus,
    /// `GET_FILES`
    GetFiles,
    /// `SHUTDOWN`
    Shutdown,
    /// `PING`
    Ping,
    /// `SET_RESOURCE_LIMITS:cpu=<f>,memory=<m>`
    SetResourceLimits(LimitsUpdate),
    /// `RESET_RESOURCE_LIMITS`
    ResetResourceLimits,
    /// `TEXT_PROMPT:<message>`
    TextPrompt(String),
}

impl Command {
    /// Parses one line into a command.
    ///
    /// The verb (left of the first `:`) is trimmed and matched
    /// case-sensitively; the argument, when present, is passed through
    /// untouched. A verb given an argument it does not take, or missing
    /// one it requires, is an unknown command.
    ///
    /// # Errors
    ///
    /// `ProtocolError::UnknownVerb` for anything outside the verb set,
    /// `ProtocolError::InvalidLimits` for a malformed limits kv-list.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (verb, arg) = match line.split_once(':') {
            Some((verb, arg)) => (verb.trim(), Some(arg)),
            None => (line.trim(), None),
        };

        match (verb, arg) {
            ("START_CONTAINER", None) => Ok(Command::StartContainer),
            ("STOP_CONTAINER", None) => Ok(Command::StopContainer),
            ("GET_CONTAINER_STATUS", None) => Ok(Command::GetContainerStatus),
            ("RUN_PAYLOAD", None) => Ok(Command::RunPayload),
            ("GET_STATUS", None) => Ok(Command::GetStatus),
            ("GET_FILES", None) => Ok(Command::GetFiles),
            ("SHUTDOWN", None) => Ok(Command::Shutdown),
            ("PING", None) => Ok(Command::Ping),
            ("RESET_RESOURCE_LIMITS", None) => Ok(Command::ResetResourceLimits),
            ("SET_RESOURCE_LIMITS", Some(arg)) => {
                Ok(Command::SetResourceLimits(parse_limits(arg)?))
            }
            ("TEXT_PROMPT", Some(message)) => Ok(Command::TextPrompt(message.to_string())),
            _ => Err(ProtocolError::UnknownVerb(verb.to_string())),
        }
    }
}

/// Parses the `SET_RESOURCE_LIMITS` kv-list: comma-separated `key=value`
/// pairs with keys `cpu` and `memory`.
fn parse_limits(arg: &str) -> Result<LimitsUpdate, ProtocolError> {
    let mut update = LimitsUpdate::default();

    for pair in arg.split(',') {
        let pair = pair.trim();
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ProtocolError::InvalidLimits(format!("expected key=value, got '{pair}'")))?;

        match key.trim().to_ascii_lowercase().as_str() {
            "cpu" => {
                let cpu = value.trim().parse::<f64>().map_err(|_| {
                    ProtocolError::InvalidLimits(format!("cpu value '{}' is not a number", value.trim()))
                })?;
                update.cpu = Some(cpu);
            }
            "memory" => {
                update.memory = Some(parse_memory_size(value.trim())?);
            }
            other => {
                return Err(ProtocolError::InvalidLimits(format!("unknown key '{other}'")));
            }
        }
    }

    if update.is_empty() {
        return Err(ProtocolError::InvalidLimits("no limits specified".to_string()));
    }

    Ok(update)
}

/// Parses a memory size literal with an optional binary `K`/`M`/`G`
/// suffix (case-insensitive) into bytes.
fn parse_memory_size(value: &str) -> Result<u64, ProtocolError> {
    let (digits, multiplier) = match value.chars().last() {
        Some('K') | Some('k') => (&value[..value.len() - 1], 1024),
        Some('M') | Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };

    let base = digits.parse::<u64>().map_err(|_| {
        ProtocolError::InvalidLimits(format!("memory value '{value}' is not a valid size"))
    })?;

    base.checked_mul(multiplier)
        .ok_or_else(|| ProtocolError::InvalidLimits(format!("memory value '{value}' overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_verbs_parse() {
        assert_eq!(Command::parse("PING").unwrap(), Command::Ping);
        assert_eq!(
            Command::parse("START_CONTAINER").unwrap(),
            Command::StartContainer
        );
        assert_eq!(
            Command::parse("RESET_RESOURCE_LIMITS").unwrap(),
            Command::ResetResourceLimits
        );
        assert_eq!(Command::parse("  SHUTDOWN  ").unwrap(), Command::Shutdown);
    }

    #[test]
    fn verbs_are_case_sensitive() {
        assert!(matches!(
            Command::parse("ping"),
            Err(ProtocolError::UnknownVerb(_))
        ));
        assert!(matches!(
            Command::parse("Start_Container"),
            Err(ProtocolError::UnknownVerb(_))
        ));
    }

    #[test]
    fn unknown_verb_is_reported() {
        let err = Command::parse("FOO_BAR").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownVerb(v) if v == "FOO_BAR"));
    }

    #[test]
    fn bare_verb_with_unexpected_argument_is_unknown() {
        assert!(matches!(
            Command::parse("PING:now"),
            Err(ProtocolError::UnknownVerb(_))
        ));
    }

    #[test]
    fn argument_verbs_without_argument_are_unknown() {
        assert!(matches!(
            Command::parse("TEXT_PROMPT"),
            Err(ProtocolError::UnknownVerb(_))
        ));
        assert!(matches!(
            Command::parse("SET_RESOURCE_LIMITS"),
            Err(ProtocolError::UnknownVerb(_))
        ));
    }

    #[test]
    fn text_prompt_keeps_message_verbatim() {
        let cmd = Command::parse("TEXT_PROMPT:hello there").unwrap();
        assert_eq!(cmd, Command::TextPrompt("hello there".to_string()));

        // Embedded colons belong to the message.
        let cmd = Command::parse("TEXT_PROMPT:a:b:c").unwrap();
        assert_eq!(cmd, Command::TextPrompt("a:b:c".to_string()));
    }

    #[test]
    fn limits_kv_list_parses_both_keys() {
        let cmd = Command::parse("SET_RESOURCE_LIMITS:cpu=0.5,memory=512M").unwrap();
        assert_eq!(
            cmd,
            Command::SetResourceLimits(LimitsUpdate {
                cpu: Some(0.5),
                memory: Some(536_870_912),
            })
        );
    }

    #[test]
    fn limits_accept_a_single_key() {
        let cmd = Command::parse("SET_RESOURCE_LIMITS:memory=64K").unwrap();
        assert_eq!(
            cmd,
            Command::SetResourceLimits(LimitsUpdate {
                cpu: None,
                memory: Some(65_536),
            })
        );
    }

    #[test]
    fn memory_suffixes_are_binary_and_case_insensitive() {
        assert_eq!(parse_memory_size("1K").unwrap(), 1024);
        assert_eq!(parse_memory_size("1m").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_size("4096").unwrap(), 4096);
    }

    #[test]
    fn malformed_limits_are_invalid_not_unknown() {
        for line in [
            "SET_RESOURCE_LIMITS:",
            "SET_RESOURCE_LIMITS:cpu",
            "SET_RESOURCE_LIMITS:cpu=fast",
            "SET_RESOURCE_LIMITS:memory=12X",
            "SET_RESOURCE_LIMITS:disk=1G",
            "SET_RESOURCE_LIMITS:memory=-5",
        ] {
            assert!(
                matches!(
                    Command::parse(line),
                    Err(ProtocolError::InvalidLimits(_))
                ),
                "expected InvalidLimits for {line}"
            );
        }
    }
}
