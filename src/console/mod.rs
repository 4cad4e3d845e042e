//! Console pipeline: raw output lines, their classification into events,
//! the per-instance scrollback and the fan-out bus to subscribers.

pub mod buffer;
pub mod bus;
pub mod event;
pub mod matcher;

use serde::{Deserialize, Serialize};

pub use buffer::{ConsoleBuffer, ConsoleLine};
pub use bus::{EventBus, Subscription, SubscriptionFilter};
pub use event::{ConsoleEvent, EventKind, RestartReason};
pub use matcher::{EventMatcher, PatternKind, PatternWarning};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}
