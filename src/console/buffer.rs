use std::collections::VecDeque;
use serde::{Deserialize, Serialize};

use super::LogSource;
use crate::utils::current_timestamp;

/// A single line of console output kept in the scrollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleLine {
    /// Sequential ID for polling (`console_since(alias, id)`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    pub text: String,
}

/// Ring buffer that stores recent console lines with sequential IDs.
///
/// IDs start at 1 and keep increasing across restarts of the same instance,
/// so `since(0)` returns everything still buffered.
#[derive(Debug)]
pub struct ConsoleBuffer {
    lines: VecDeque<ConsoleLine>,
    next_id: u64,
    max_size: usize,
}

impl ConsoleBuffer {
    pub fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size.min(4096)),
            next_id: 1,
            max_size,
        }
    }

    /// Push a new line and return the stored copy.
    pub fn push(&mut self, source: LogSource, text: String) -> ConsoleLine {
        let line = ConsoleLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            text,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// All lines with `id > since_id`.
    pub fn since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.lines.iter().filter(|l| l.id > since_id).cloned().collect()
    }

    /// The most recent `count` lines, oldest first.
    pub fn recent(&self, count: usize) -> Vec<ConsoleLine> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
