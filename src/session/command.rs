//! Operator commands
//!
//! Commands arrive as untyped `{action, args}` payloads and are validated
//! here, at the boundary, before they can reach the state machine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::{SessionError, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Start,
    Stop,
    Pause,
    Resume,
    /// Clears the Error state
    Acknowledge,
}

impl FromStr for CommandAction {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" | "timelapse_start" => Ok(CommandAction::Start),
            "stop" | "timelapse_stop" => Ok(CommandAction::Stop),
            "pause" => Ok(CommandAction::Pause),
            "resume" => Ok(CommandAction::Resume),
            "acknowledge" | "ack" => Ok(CommandAction::Acknowledge),
            other => Err(SessionError::InvalidCommand(format!(
                "unknown action '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandAction::Start => "start",
            CommandAction::Stop => "stop",
            CommandAction::Pause => "pause",
            CommandAction::Resume => "resume",
            CommandAction::Acknowledge => "acknowledge",
        };
        f.write_str(name)
    }
}

/// Raw operator command as delivered by the command channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub action: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[cfg(test)]
impl Command {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            args: Map::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }
}

impl Command {
    /// Check the action name and its arguments
    pub fn validate(&self) -> Result<ValidatedCommand, SessionError> {
        let action: CommandAction = self.action.parse()?;

        let interval_override = match self.args.get("interval_ms") {
            None | Some(Value::Null) => None,
            Some(value) if action == CommandAction::Start => match value.as_u64() {
                Some(ms) if ms > 0 => Some(Duration::from_millis(ms)),
                _ => {
                    return Err(SessionError::InvalidCommand(
                        "interval_ms must be a positive integer".to_string(),
                    ))
                }
            },
            Some(_) => {
                return Err(SessionError::InvalidCommand(format!(
                    "interval_ms is not valid for {}",
                    action
                )))
            }
        };

        Ok(ValidatedCommand {
            action,
            interval_override,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedCommand {
    pub action: CommandAction,
    pub interval_override: Option<Duration>,
}

/// Acknowledgement or rejection sent back to the command's originator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReply {
    pub accepted: bool,
    pub action: String,
    pub state: SessionState,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl CommandReply {
    pub fn accepted(action: CommandAction, state: SessionState) -> Self {
        Self {
            accepted: true,
            action: action.to_string(),
            state,
            reason: format!("{} accepted, session is now {:?}", action, state),
            error: None,
        }
    }

    pub fn rejected(action: &str, state: SessionState, error: &SessionError) -> Self {
        Self {
            accepted: false,
            action: action.to_string(),
            state,
            reason: error.to_string(),
            error: Some(error.kind()),
        }
    }
}
