//! Shared utility functions for the console supervisor.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Command;

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Human readable duration used in restart warnings.
///
/// `3600` → `"1 hour"`, `5430` → `"1 hour, 30 minutes, 30 seconds"`.
pub fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    let mut parts = Vec::new();
    for (value, unit) in [(hours, "hour"), (minutes, "minute"), (seconds, "second")] {
        if value > 0 {
            let plural = if value > 1 { "s" } else { "" };
            parts.push(format!("{} {}{}", value, unit, plural));
        }
    }

    if parts.is_empty() {
        return "0 seconds".to_string();
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(3600), "1 hour");
        assert_eq!(format_duration(1800), "30 minutes");
        assert_eq!(format_duration(30), "30 seconds");
        assert_eq!(format_duration(7261), "2 hours, 1 minute, 1 second");
        assert_eq!(format_duration(0), "0 seconds");
    }

    #[test]
    fn test_timestamp_nonzero() {
        assert!(current_timestamp() > 0);
    }
}
