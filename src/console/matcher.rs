//! Regex event matcher
//!
//! Patterns are compiled once per instance. Evaluation order is fixed:
//! connect, disconnect, chat. A pattern that does not compile (or lacks
//! the `username` group) disables only its own event kind.

use regex::{Captures, Regex};
use std::fmt;

use super::event::EventKind;
use crate::config::ConsolePatterns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    PlayerConnected,
    PlayerDisconnected,
    ChatMessage,
}

impl PatternKind {
    /// Priority order used by `classify`.
    pub const ORDER: [PatternKind; 3] = [
        PatternKind::PlayerConnected,
        PatternKind::PlayerDisconnected,
        PatternKind::ChatMessage,
    ];

    fn config_key(self) -> &'static str {
        match self {
            PatternKind::PlayerConnected => "console.player_connected",
            PatternKind::PlayerDisconnected => "console.player_disconnected",
            PatternKind::ChatMessage => "console.player_chat",
        }
    }

    fn source(self, patterns: &ConsolePatterns) -> &str {
        match self {
            PatternKind::PlayerConnected => &patterns.player_connected,
            PatternKind::PlayerDisconnected => &patterns.player_disconnected,
            PatternKind::ChatMessage => &patterns.player_chat,
        }
    }
}

/// A pattern that was dropped at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternWarning {
    pub kind: PatternKind,
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for PatternWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} disabled: {}", self.field, self.reason)
    }
}

#[derive(Debug, Clone)]
enum CompiledPattern {
    Active(Regex),
    Disabled,
}

#[derive(Debug, Clone)]
pub struct EventMatcher {
    patterns: Vec<(PatternKind, CompiledPattern)>,
}

impl EventMatcher {
    pub fn compile(patterns: &ConsolePatterns) -> (Self, Vec<PatternWarning>) {
        let mut compiled = Vec::with_capacity(PatternKind::ORDER.len());
        let mut warnings = Vec::new();

        for kind in PatternKind::ORDER {
            let pattern = match compile_one(kind, kind.source(patterns)) {
                Ok(re) => CompiledPattern::Active(re),
                Err(reason) => {
                    warnings.push(PatternWarning { kind, field: kind.config_key(), reason });
                    CompiledPattern::Disabled
                }
            };
            compiled.push((kind, pattern));
        }

        (Self { patterns: compiled }, warnings)
    }

    pub fn is_enabled(&self, kind: PatternKind) -> bool {
        self.patterns
            .iter()
            .any(|(k, p)| *k == kind && matches!(p, CompiledPattern::Active(_)))
    }

    /// Classify one console line. Lines no active pattern matches are `Unmatched`.
    pub fn classify(&self, line: &str) -> EventKind {
        // chat 본문 위치: 이 안에서 시작하는 접속/퇴장 매치는 위조로 간주
        let chat_body = self.chat_body_start(line);

        for (kind, pattern) in &self.patterns {
            let CompiledPattern::Active(re) = pattern else { continue };
            let Some(caps) = re.captures(line) else { continue };

            if *kind != PatternKind::ChatMessage {
                let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
                let user_start = caps.name("username").map(|m| m.start()).unwrap_or(start);
                if chat_body.is_some_and(|body| user_start >= body) {
                    continue;
                }
            }

            return build_event(*kind, &caps);
        }
        EventKind::Unmatched
    }

    fn chat_body_start(&self, line: &str) -> Option<usize> {
        self.patterns.iter().find_map(|(kind, pattern)| match (kind, pattern) {
            (PatternKind::ChatMessage, CompiledPattern::Active(re)) => re
                .captures(line)
                .and_then(|caps| caps.name("message"))
                .map(|m| m.start()),
            _ => None,
        })
    }
}

fn compile_one(kind: PatternKind, source: &str) -> Result<Regex, String> {
    if source.trim().is_empty() {
        return Err("pattern is empty".to_string());
    }
    let re = Regex::new(source).map_err(|e| e.to_string())?;
    if !re.capture_names().flatten().any(|name| name == "username") {
        return Err("pattern has no (?P<username>...) group".to_string());
    }
    if kind == PatternKind::ChatMessage && !re.capture_names().flatten().any(|n| n == "message") {
        return Err("pattern has no (?P<message>...) group".to_string());
    }
    Ok(re)
}

fn group(caps: &Captures<'_>, name: &str) -> String {
    caps.name(name).map(|m| m.as_str().trim().to_string()).unwrap_or_default()
}

fn build_event(kind: PatternKind, caps: &Captures<'_>) -> EventKind {
    let username = group(caps, "username");
    match kind {
        PatternKind::PlayerConnected => {
            let address = match caps.name("address") {
                Some(m) => m.as_str().to_string(),
                None => group(caps, "ip"),
            };
            EventKind::PlayerConnected { username, address }
        }
        PatternKind::PlayerDisconnected => EventKind::PlayerDisconnected {
            username,
            reason: group(caps, "reason"),
        },
        PatternKind::ChatMessage => EventKind::ChatMessage {
            username,
            message: caps.name("message").map(|m| m.as_str().to_string()).unwrap_or_default(),
        },
    }
}
