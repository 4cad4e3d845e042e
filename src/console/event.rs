use serde::{Deserialize, Serialize};

use super::LogSource;
use crate::supervisor::state_machine::InstanceStatus;
use crate::utils::current_timestamp;

/// Why a restart cycle was started.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    Scheduled,
    Crash,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PlayerConnected { username: String, address: String },
    PlayerDisconnected { username: String, reason: String },
    ChatMessage { username: String, message: String },
    /// A console line no pattern matched.
    Unmatched,
    /// Pre-restart warning, `seconds_remaining` is the configured lead time.
    RestartAlert { seconds_remaining: u64 },
    RestartTriggered { reason: RestartReason },
    StatusChanged { status: InstanceStatus },
    CommandSent { command: String },
}

/// Event published to subscribers. Console-derived events carry the raw line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleEvent {
    pub alias: String,
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<LogSource>,
}

impl ConsoleEvent {
    pub fn new(alias: &str, kind: EventKind) -> Self {
        Self {
            alias: alias.to_string(),
            timestamp: current_timestamp(),
            kind,
            line: None,
            source: None,
        }
    }

    pub fn with_line(mut self, line: &str, source: Option<LogSource>) -> Self {
        self.line = Some(line.to_string());
        self.source = source;
        self
    }

    /// Whether this event came from a line of process output.
    pub fn is_console_line(&self) -> bool {
        self.line.is_some()
    }
}
