use std::path::{Path, PathBuf};
use glob::glob;

use crate::supervisor::process::SpawnError;

/// Characters that turn a path into a glob pattern.
const WILDCARD_CHARS: &[char] = &['*', '?', '['];

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(WILDCARD_CHARS)
}

/// Resolve a configured path that may contain a wildcard.
///
/// Relative patterns are taken from `base_dir`. Matches are sorted
/// lexicographically and the first one wins; with `strict` set, more
/// than one match is an error instead. Zero matches is always an error.
pub fn resolve_pattern(pattern: &str, base_dir: &Path, strict: bool) -> Result<PathBuf, SpawnError> {
    let candidate = Path::new(pattern);
    let joined = if candidate.is_absolute() {
        pattern.to_string()
    } else {
        // base_dir 자체에 glob 문자가 있어도 리터럴로 취급
        let escaped_base = glob::Pattern::escape(&base_dir.to_string_lossy());
        format!("{}/{}", escaped_base.trim_end_matches('/'), pattern)
    };

    if !has_wildcard(pattern) {
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            base_dir.join(candidate)
        };
        if path.exists() {
            return Ok(path);
        }
        return Err(SpawnError::NotFound { pattern: pattern.to_string() });
    }

    let entries = glob(&joined).map_err(|source| SpawnError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })?;

    let mut matches: Vec<PathBuf> = entries
        .flatten()
        .filter(|p| p.is_file())
        .collect();
    matches.sort();

    match matches.len() {
        0 => {
            tracing::warn!("No file matches pattern '{}' in {}", pattern, base_dir.display());
            Err(SpawnError::NotFound { pattern: pattern.to_string() })
        }
        1 => Ok(matches.remove(0)),
        n if strict => {
            tracing::warn!("Pattern '{}' is ambiguous ({} matches)", pattern, n);
            Err(SpawnError::Ambiguous {
                pattern: pattern.to_string(),
                matches,
            })
        }
        n => {
            tracing::info!(
                "Pattern '{}' matched {} files, using {}",
                pattern,
                n,
                matches[0].display()
            );
            Ok(matches.remove(0))
        }
    }
}

/// Resolve the program to launch.
///
/// Bare names without a path separator or wildcard are left for the OS
/// to find on `PATH`; anything else must exist on disk.
pub fn resolve_executable(executable: &str, working_dir: &Path, strict: bool) -> Result<PathBuf, SpawnError> {
    let bare = !has_wildcard(executable) && !executable.contains(['/', '\\']);
    if bare {
        return Ok(PathBuf::from(executable));
    }
    resolve_pattern(executable, working_dir, strict)
}
