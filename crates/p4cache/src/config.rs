//! Server and cache configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CacheError, Result};

/// How the connection authenticates against the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[default]
    Password,
    AuthTicket,
    Sso,
}

/// Connection settings for one server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server address, e.g. `ssl:perforce:1666`.
    pub port: String,
    /// User name.
    pub user: String,
    #[serde(default)]
    pub auth: AuthKind,
    /// Go offline automatically instead of prompting when the server drops.
    #[serde(default)]
    pub auto_offline: bool,
    /// Glob patterns for files the workspace never submits.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

impl ServerConfig {
    pub fn new(port: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            user: user.into(),
            auth: AuthKind::default(),
            auto_offline: false,
            ignore_patterns: Vec::new(),
        }
    }

    /// Add an ignore pattern.
    pub fn with_ignore_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.ignore_patterns.push(pattern.into());
        self
    }

    /// Stable identity of the server configuration.
    pub fn id(&self) -> String {
        format!("{}@{}", self.user, self.port)
    }

    /// Whether both configurations reach the same server as the same user.
    pub fn is_same_connection_as(&self, other: &ServerConfig) -> bool {
        self.port == other.port && self.user == other.user
    }

    /// Compile the ignore patterns. Invalid patterns are logged and skipped.
    pub fn ignore_matcher(&self) -> IgnoreMatcher {
        IgnoreMatcher::lenient(&self.ignore_patterns)
    }
}

/// Compiled set of ignore globs.
///
/// `*` and `?` never cross a `/`; `**` does. A pattern without a `/` is
/// matched against the file name, otherwise against the path relative to a
/// workspace root. Blank lines and `#` comments are skipped.
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    names: GlobSet,
    paths: GlobSet,
}

impl Default for IgnoreMatcher {
    fn default() -> Self {
        Self {
            names: GlobSet::empty(),
            paths: GlobSet::empty(),
        }
    }
}

impl IgnoreMatcher {
    /// Compile `patterns`, failing on the first invalid one.
    pub fn new(patterns: &[String]) -> Result<Self> {
        Self::compile(patterns, true)
    }

    /// Compile `patterns`, logging and skipping invalid ones.
    pub fn lenient(patterns: &[String]) -> Self {
        Self::compile(patterns, false).unwrap_or_else(|e| {
            warn!(error = %e, "ignore patterns unusable, nothing is ignored by pattern");
            Self::default()
        })
    }

    fn compile(patterns: &[String], strict: bool) -> Result<Self> {
        let mut names = GlobSetBuilder::new();
        let mut paths = GlobSetBuilder::new();
        for raw in patterns
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty() && !value.starts_with('#'))
        {
            let glob = GlobBuilder::new(raw.trim_start_matches('/'))
                .literal_separator(true)
                .build();
            match glob {
                Ok(glob) if raw.contains('/') => {
                    paths.add(glob);
                }
                Ok(glob) => {
                    names.add(glob);
                }
                Err(e) if strict => {
                    return Err(CacheError::InvalidConfig(format!(
                        "invalid ignore pattern `{}`: {}",
                        raw, e
                    )));
                }
                Err(e) => warn!(pattern = %raw, error = %e, "ignoring invalid ignore pattern"),
            }
        }
        let build = |builder: GlobSetBuilder| {
            builder
                .build()
                .map_err(|e| CacheError::InvalidConfig(format!("ignore patterns: {}", e)))
        };
        Ok(Self {
            names: build(names)?,
            paths: build(paths)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.paths.is_empty()
    }

    /// Check a file name and, when known, its root-relative path.
    pub fn is_match(&self, file_name: &str, relative_path: Option<&str>) -> bool {
        if self.names.is_match(file_name) {
            return true;
        }
        relative_path.is_some_and(|rel| self.paths.is_match(rel))
    }
}

/// Tuning for the cache and its synchronization.
///
/// All intervals are in seconds; an interval of 0 means "refresh on every
/// read while online".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub file_actions_refresh_secs: u64,
    pub job_status_refresh_secs: u64,
    pub changelist_refresh_secs: u64,
    pub command_timeout_secs: u64,
    /// Edit requests for files the server does not know are dropped instead of added.
    pub ignore_adds_if_edit_only: bool,
    /// Where workspace documents are persisted.
    pub state_dir: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            file_actions_refresh_secs: 0,
            job_status_refresh_secs: 24 * 60 * 60,
            changelist_refresh_secs: 0,
            command_timeout_secs: 30,
            ignore_adds_if_edit_only: true,
            state_dir: None,
        }
    }
}

impl CacheSettings {
    /// Load settings from a JSON file; absent keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn file_actions_refresh(&self) -> chrono::Duration {
        secs(self.file_actions_refresh_secs)
    }

    pub fn job_status_refresh(&self) -> chrono::Duration {
        secs(self.job_status_refresh_secs)
    }

    pub fn changelist_refresh(&self) -> chrono::Duration {
        secs(self.changelist_refresh_secs)
    }

    /// The configured state directory, or an error naming the setting.
    pub fn require_state_dir(&self) -> Result<&Path> {
        self.state_dir
            .as_deref()
            .ok_or_else(|| CacheError::Internal("state_dir is not configured".into()))
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_server_config_identity() {
        let a = ServerConfig::new("ssl:perforce:1666", "alice");
        let mut b = a.clone();
        b.auto_offline = true;

        assert_eq!(a.id(), "alice@ssl:perforce:1666");
        assert!(a.is_same_connection_as(&b));
        assert!(!a.is_same_connection_as(&ServerConfig::new("perforce:1666", "alice")));
    }

    #[test]
    fn test_ignore_patterns() {
        let config = ServerConfig::new("p4:1666", "bob")
            .with_ignore_pattern("*.iml")
            .with_ignore_pattern("build/**")
            .with_ignore_pattern("**/target/*.class")
            .with_ignore_pattern("# comment");
        let matcher = config.ignore_matcher();

        assert!(matcher.is_match("project.iml", Some("module/project.iml")));
        assert!(matcher.is_match("out.o", Some("build/objs/out.o")));
        assert!(matcher.is_match("A.class", Some("target/A.class")));
        assert!(matcher.is_match("A.class", Some("a/b/target/A.class")));
        assert!(!matcher.is_match("A.java", Some("src/A.java")));
        assert!(!matcher.is_match("out.o", None));
    }

    #[test]
    fn test_glob_single_star_stays_in_segment() {
        let matcher = IgnoreMatcher::new(&["src/*.rs".to_string()]).unwrap();
        assert!(matcher.is_match("lib.rs", Some("src/lib.rs")));
        assert!(!matcher.is_match("mod.rs", Some("src/sync/mod.rs")));
    }

    #[test]
    fn test_glob_classes_and_nested_directories() {
        let matcher = IgnoreMatcher::new(&["[ab].txt".to_string(), "**/build/*".to_string()]).unwrap();
        assert!(matcher.is_match("a.txt", None));
        assert!(matcher.is_match("b.txt", None));
        assert!(!matcher.is_match("c.txt", None));
        assert!(matcher.is_match("out.o", Some("build/out.o")));
        assert!(matcher.is_match("out.o", Some("lib/core/build/out.o")));
        assert!(!matcher.is_match("out.o", Some("lib/build/objs/out.o")));
    }

    #[test]
    fn test_invalid_ignore_pattern() {
        let patterns = vec!["*.log".to_string(), "src/[".to_string()];
        assert!(matches!(
            IgnoreMatcher::new(&patterns),
            Err(CacheError::InvalidConfig(_))
        ));

        let config = ServerConfig {
            ignore_patterns: patterns,
            ..ServerConfig::new("p4:1666", "bob")
        };
        let matcher = config.ignore_matcher();
        assert!(matcher.is_match("debug.log", None));
        assert!(!matcher.is_empty());
    }

    #[test]
    fn test_settings_defaults() {
        let settings = CacheSettings::default();
        assert_eq!(settings.job_status_refresh(), chrono::Duration::hours(24));
        assert_eq!(settings.file_actions_refresh(), chrono::Duration::zero());
        assert_eq!(settings.command_timeout(), Duration::from_secs(30));
        assert!(settings.ignore_adds_if_edit_only);
    }

    #[test]
    fn test_settings_from_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"command_timeout_secs": 5, "state_dir": "/tmp/p4"}}"#).unwrap();

        let settings = CacheSettings::from_json_file(file.path()).unwrap();
        assert_eq!(settings.command_timeout_secs, 5);
        assert_eq!(settings.state_dir, Some(PathBuf::from("/tmp/p4")));
        assert_eq!(settings.job_status_refresh_secs, 24 * 60 * 60);
    }
}
