//! Event filtering for temp-file churn and user-defined patterns.
//!
//! Provides deterministic path filtering with the following precedence:
//! 1. Built-in temp-file patterns (always active)
//! 2. User patterns (only when user filtering is enabled)
//!
//! User patterns are tried against the full path first, then the basename;
//! first match wins. All filtering is a pure function over the path: same
//! input always produces the same output, and no I/O happens here.

use regex::Regex;
use std::path::Path;

use crate::config::FilterConfig;

/// Temp-file patterns that are always filtered (hard-coded).
///
/// Matched against the basename only: editor swap files, trailing-tilde
/// backups, partial downloads and OS metadata files.
const TEMP_FILE_PATTERNS: &[&str] = &[
    r".*\.swp$",
    r".*\.swo$",
    r".*~$",
    r".*\.tmp$",
    r".*\.temp$",
    r".*\.bak$",
    r"\.DS_Store$",
    r"Thumbs\.db$",
    r"desktop\.ini$",
    r".*\.crdownload$",
    r".*\.part$",
    r".*\.filepart$",
];

/// Pattern counts reported in the engine statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FilterStats {
    pub enabled: bool,
    pub user_patterns: usize,
    pub temp_patterns: usize,
}

/// Compiled path filter.
///
/// Patterns compile once at construction. Invalid user patterns are logged
/// and skipped so a single bad pattern does not prevent startup.
pub struct EventFilter {
    enabled: bool,
    user_patterns: Vec<Regex>,
    temp_patterns: Vec<Regex>,
}

impl EventFilter {
    /// Compile the built-in temp patterns and the configured user patterns.
    pub fn new(config: &FilterConfig) -> Self {
        let temp_patterns = TEMP_FILE_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();

        let mut user_patterns = Vec::new();
        if config.enabled {
            for pattern in &config.patterns {
                match Regex::new(pattern) {
                    Ok(compiled) => user_patterns.push(compiled),
                    Err(err) => {
                        tracing::warn!(pattern, error = %err, "skipping invalid filter pattern");
                    }
                }
            }
        }

        tracing::debug!(
            enabled = config.enabled,
            user_patterns = user_patterns.len(),
            "file filter initialized"
        );

        Self {
            enabled: config.enabled,
            user_patterns,
            temp_patterns,
        }
    }

    /// Whether events for this path should be dropped.
    pub fn should_ignore(&self, path: &Path) -> bool {
        if self.is_temp_file(path) {
            return true;
        }
        self.enabled && self.matches_user_pattern(path)
    }

    fn is_temp_file(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy();
        self.temp_patterns.iter().any(|p| p.is_match(&name))
    }

    fn matches_user_pattern(&self, path: &Path) -> bool {
        let full = path.to_string_lossy();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.user_patterns
            .iter()
            .any(|p| p.is_match(&full) || p.is_match(&name))
    }

    /// Pattern counts for the statistics snapshot.
    pub fn stats(&self) -> FilterStats {
        FilterStats {
            enabled: self.enabled,
            user_patterns: self.user_patterns.len(),
            temp_patterns: self.temp_patterns.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_with(enabled: bool, patterns: &[&str]) -> EventFilter {
        EventFilter::new(&FilterConfig {
            enabled,
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_temp_files_always_filtered() {
        let filter = filter_with(false, &[]);
        assert!(filter.should_ignore(Path::new("/w/.foo.swp")));
        assert!(filter.should_ignore(Path::new("/w/notes.txt~")));
        assert!(filter.should_ignore(Path::new("/w/dl.part")));
        assert!(filter.should_ignore(Path::new("/w/.DS_Store")));
        assert!(!filter.should_ignore(Path::new("/w/notes.txt")));
    }

    #[test]
    fn test_user_patterns_respect_enabled_flag() {
        let disabled = filter_with(false, &[r".*\.log$"]);
        assert!(!disabled.should_ignore(Path::new("/w/app.log")));

        let enabled = filter_with(true, &[r".*\.log$"]);
        assert!(enabled.should_ignore(Path::new("/w/app.log")));
    }

    #[test]
    fn test_user_pattern_matches_basename() {
        // Anchored pattern that only matches the basename, not the full path
        let filter = filter_with(true, &["^secret"]);
        assert!(filter.should_ignore(Path::new("/w/sub/secret.txt")));
        assert!(!filter.should_ignore(Path::new("/w/sub/public.txt")));
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let filter = filter_with(true, &["([unclosed", r".*\.log$"]);
        assert_eq!(filter.stats().user_patterns, 1);
        assert!(filter.should_ignore(Path::new("/w/app.log")));
    }
}
