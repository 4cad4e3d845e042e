use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ServerConfig;
use crate::path_detector::{resolve_executable, resolve_pattern};

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("no file matches '{pattern}'")]
    NotFound { pattern: String },

    #[error("'{pattern}' is ambiguous: {} matches", .matches.len())]
    Ambiguous { pattern: String, matches: Vec<PathBuf> },

    #[error("invalid wildcard '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("permission denied executing '{program}'")]
    PermissionDenied { program: String },

    #[error("working directory '{}' does not exist", .0.display())]
    WorkingDir(PathBuf),

    #[error("failed to spawn '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl SpawnError {
    pub(crate) fn from_io(program: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { pattern: program.to_string() },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { program: program.to_string() },
            _ => Self::Io { program: program.to_string(), source },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("process is not running")]
    NotRunning,

    #[error("process is not reading its input")]
    InputStalled,
}

/// How a managed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub success: bool,
}

impl ProcessExit {
    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }

    /// Used when the exit status could not be collected.
    pub(crate) fn unknown() -> Self {
        Self { code: None, success: false }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "signal"),
        }
    }
}

/// Fully resolved command line for one spawn.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub stop_command: Option<String>,
    pub grace_period: Duration,
}

impl LaunchSpec {
    /// Resolve wildcards in the executable and jar against the filesystem.
    pub fn resolve(config: &ServerConfig) -> Result<Self, SpawnError> {
        if !config.working_dir.is_dir() {
            return Err(SpawnError::WorkingDir(config.working_dir.clone()));
        }

        let program = resolve_executable(&config.executable, &config.working_dir, config.strict_wildcards)?;

        let mut args = config.args.clone();
        if let Some(jar) = &config.jar {
            let jar_path = resolve_pattern(jar, &config.working_dir, config.strict_wildcards)?;
            args.push("-jar".to_string());
            args.push(jar_path.to_string_lossy().into_owned());
        }
        args.extend(config.server_args.iter().cloned());

        Ok(Self {
            program,
            args,
            working_dir: config.working_dir.clone(),
            env: config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            stop_command: config.stop_command.clone().filter(|c| !c.trim().is_empty()),
            grace_period: config.stop_timeout(),
        })
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Ask a process to terminate (SIGTERM). No-op where signals are unavailable.
pub(crate) fn request_terminate(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!("SIGTERM to pid {} failed: {}", pid, e);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_resolve_with_jar() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("paper-1.20.jar"), b"").unwrap();

        let mut cfg = ServerConfig::new("java");
        cfg.working_dir = dir.path().to_path_buf();
        cfg.args = vec!["-Xmx2G".into()];
        cfg.jar = Some("paper-*.jar".into());
        cfg.server_args = vec!["nogui".into()];

        let spec = LaunchSpec::resolve(&cfg).unwrap();
        assert_eq!(spec.program, PathBuf::from("java"));
        assert_eq!(spec.args[0], "-Xmx2G");
        assert_eq!(spec.args[1], "-jar");
        assert!(spec.args[2].ends_with("paper-1.20.jar"));
        assert_eq!(spec.args[3], "nogui");
        assert_eq!(spec.stop_command.as_deref(), Some("stop"));
    }

    #[test]
    fn test_resolve_missing_jar() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ServerConfig::new("java");
        cfg.working_dir = dir.path().to_path_buf();
        cfg.jar = Some("paper-*.jar".into());

        assert!(matches!(LaunchSpec::resolve(&cfg), Err(SpawnError::NotFound { .. })));
    }

    #[test]
    fn test_resolve_missing_working_dir() {
        let mut cfg = ServerConfig::new("java");
        cfg.working_dir = PathBuf::from("/definitely/not/a/dir");
        assert!(matches!(LaunchSpec::resolve(&cfg), Err(SpawnError::WorkingDir(_))));
    }

    #[test]
    fn test_spawn_error_from_io() {
        let err = SpawnError::from_io("x", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(matches!(err, SpawnError::NotFound { .. }));
        let err = SpawnError::from_io("x", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(matches!(err, SpawnError::PermissionDenied { .. }));
    }

    #[test]
    fn test_exit_display() {
        assert_eq!(ProcessExit { code: Some(3), success: false }.to_string(), "exit code 3");
        assert_eq!(ProcessExit::unknown().to_string(), "signal");
    }
}
