//! TOML configuration: global settings plus one `[[servers]]` table per
//! supervised instance.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("alias '{0}' is defined more than once")]
    DuplicateAlias(String),
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

// ─── Global ──────────────────────────────────────────────────

#[derive(Serialize, Debug, Clone, Default)]
pub struct GlobalConfig {
    pub general: GeneralConfig,
    pub servers: Vec<ServerEntry>,
    /// `[[servers]]` entries that could not be read; the rest still load.
    #[serde(skip)]
    pub skipped: Vec<SkippedEntry>,
}

/// A `[[servers]]` entry dropped while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    /// The entry's `name`, or `#<index>` when it has none.
    pub name: String,
    pub reason: String,
}

/// 파일 형태 그대로 읽은 뒤 서버 항목은 하나씩 변환
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    general: GeneralConfig,
    #[serde(default)]
    servers: Vec<toml::Value>,
}

/// Settings read by the daemon and the transport layer in front of it.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where issued API keys are persisted.
    #[serde(default = "default_key_store")]
    pub key_store: PathBuf,
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            key_store: default_key_store(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
        }
    }
}

impl GeneralConfig {
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(10))
    }
}

/// One `[[servers]]` entry.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerEntry {
    pub name: String,
    #[serde(default)]
    pub autostart: bool,
    #[serde(flatten)]
    pub config: ServerConfig,
}

impl GlobalConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_toml(&content)?;
        tracing::info!("Loaded config from {} ({} servers)", path.display(), cfg.servers.len());
        Ok(cfg)
    }

    /// Parse a whole config file. Only malformed TOML, a bad `[general]`
    /// table or a duplicate alias fail the file; a `[[servers]]` entry with
    /// missing or mistyped fields is recorded in `skipped` instead.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;

        let mut servers = Vec::with_capacity(raw.servers.len());
        let mut skipped = Vec::new();
        for (index, value) in raw.servers.into_iter().enumerate() {
            let name = value
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{}", index));
            match value.try_into::<ServerEntry>() {
                Ok(entry) => servers.push(entry),
                Err(e) => skipped.push(SkippedEntry { name, reason: e.to_string() }),
            }
        }

        // alias 중복은 전체 설정 오류로 처리
        let mut seen = std::collections::HashSet::new();
        for entry in &servers {
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::DuplicateAlias(entry.name.clone()));
            }
        }
        Ok(Self {
            general: raw.general,
            servers,
            skipped,
        })
    }

    pub fn get_server(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Aliases are used as log prefixes and path segments by transports.
pub fn validate_alias(alias: &str) -> Result<(), ConfigError> {
    if alias.is_empty() {
        return Err(ConfigError::invalid("name", "alias must not be empty"));
    }
    if alias.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(ConfigError::invalid(
            "name",
            format!("alias '{}' must not contain whitespace or '/'", alias),
        ));
    }
    Ok(())
}

// ─── Per-instance ────────────────────────────────────────────

/// Immutable launch and policy settings of one instance.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    /// Program to run. May contain a glob wildcard.
    #[serde(alias = "java_path")]
    pub executable: String,
    #[serde(default, alias = "jvm_args")]
    pub args: Vec<String>,
    /// Optional jar, resolved relative to `working_dir` (wildcards allowed)
    /// and passed as `-jar <path>` after `args`.
    #[serde(default, alias = "server_jar")]
    pub jar: Option<String>,
    /// Arguments placed after the jar (e.g. `nogui`).
    #[serde(default)]
    pub server_args: Vec<String>,
    #[serde(default = "default_working_dir", alias = "path")]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Line written to stdin for a polite shutdown.
    #[serde(default = "default_stop_command")]
    pub stop_command: Option<String>,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// How long a fresh process must stay alive before it counts as Running.
    #[serde(default = "default_startup_probe_ms")]
    pub startup_probe_ms: u64,
    /// Fail instead of picking the first match when a wildcard is ambiguous.
    #[serde(default)]
    pub strict_wildcards: bool,
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,
    #[serde(default = "default_command_reply_timeout_ms")]
    pub command_reply_timeout_ms: u64,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default)]
    pub console: ConsolePatterns,
}

impl ServerConfig {
    /// Minimal config for `executable`, everything else defaulted.
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            jar: None,
            server_args: Vec::new(),
            working_dir: default_working_dir(),
            env: BTreeMap::new(),
            stop_command: default_stop_command(),
            stop_timeout_secs: default_stop_timeout_secs(),
            startup_probe_ms: default_startup_probe_ms(),
            strict_wildcards: false,
            scrollback_lines: default_scrollback_lines(),
            command_reply_timeout_ms: default_command_reply_timeout_ms(),
            restart: RestartPolicy::default(),
            console: ConsolePatterns::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executable.trim().is_empty() {
            return Err(ConfigError::invalid("executable", "must not be empty"));
        }
        if self.stop_timeout_secs == 0 {
            return Err(ConfigError::invalid("stop_timeout_secs", "must be greater than zero"));
        }
        if self.scrollback_lines == 0 {
            return Err(ConfigError::invalid("scrollback_lines", "must be greater than zero"));
        }
        if self.restart.enabled && self.restart.interval_secs == 0 {
            return Err(ConfigError::invalid("restart.interval_secs", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn startup_probe(&self) -> Duration {
        Duration::from_millis(self.startup_probe_ms)
    }

    pub fn command_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.command_reply_timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RestartPolicy {
    #[serde(default, alias = "auto_restart")]
    pub enabled: bool,
    #[serde(default = "default_restart_interval_secs")]
    pub interval_secs: u64,
    /// Lead times (seconds before the restart) at which alerts fire.
    #[serde(default = "default_alert_offsets", alias = "alert_intervals")]
    pub alert_offsets: Vec<u64>,
    /// Written to stdin on every alert; `{time}` becomes the remaining time.
    #[serde(default = "default_alert_command")]
    pub alert_command: Option<String>,
    #[serde(default = "default_true")]
    pub restart_on_crash: bool,
    #[serde(default = "default_crash_restart_delay_secs")]
    pub crash_restart_delay_secs: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_restart_interval_secs(),
            alert_offsets: default_alert_offsets(),
            alert_command: default_alert_command(),
            restart_on_crash: true,
            crash_restart_delay_secs: default_crash_restart_delay_secs(),
        }
    }
}

impl RestartPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn crash_restart_delay(&self) -> Duration {
        Duration::from_secs(self.crash_restart_delay_secs)
    }
}

/// Regex sources for console event classification.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConsolePatterns {
    #[serde(default = "default_connect_pattern")]
    pub player_connected: String,
    #[serde(default = "default_disconnect_pattern")]
    pub player_disconnected: String,
    #[serde(default = "default_chat_pattern")]
    pub player_chat: String,
    #[serde(default = "default_unknown_command_marker")]
    pub unknown_command_marker: String,
}

impl Default for ConsolePatterns {
    fn default() -> Self {
        Self {
            player_connected: default_connect_pattern(),
            player_disconnected: default_disconnect_pattern(),
            player_chat: default_chat_pattern(),
            unknown_command_marker: default_unknown_command_marker(),
        }
    }
}

// ─── Defaults ────────────────────────────────────────────────

/// Optional `[HH:MM:SS] [thread/LEVEL]: ` prefix of vanilla server logs.
const LOG_PREFIX: &str = r"^(?:\[[^\]]*\]\s*)*:?\s*";

fn default_connect_pattern() -> String {
    format!(
        r"{}(?P<username>[A-Za-z0-9_]{{1,16}})\[/(?P<address>[^\]]+)\] logged in with entity id",
        LOG_PREFIX
    )
}

fn default_disconnect_pattern() -> String {
    format!(
        r"{}(?P<username>[A-Za-z0-9_]{{1,16}}) lost connection: (?P<reason>.*)$",
        LOG_PREFIX
    )
}

fn default_chat_pattern() -> String {
    format!(r"{}<(?P<username>[A-Za-z0-9_]{{1,16}})> (?P<message>.*)$", LOG_PREFIX)
}

fn default_unknown_command_marker() -> String {
    "unknown command".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_key_store() -> PathBuf {
    PathBuf::from("api_keys.json")
}

fn default_scheduler_tick_ms() -> u64 {
    1000
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_stop_command() -> Option<String> {
    Some("stop".to_string())
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_startup_probe_ms() -> u64 {
    500
}

fn default_scrollback_lines() -> usize {
    1000
}

fn default_command_reply_timeout_ms() -> u64 {
    1000
}

fn default_restart_interval_secs() -> u64 {
    6 * 3600
}

fn default_alert_offsets() -> Vec<u64> {
    vec![3600, 1800, 300, 30]
}

fn default_alert_command() -> Option<String> {
    Some("say WARNING: PLANNED SERVER RESTART IN {time}".to_string())
}

fn default_crash_restart_delay_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}
