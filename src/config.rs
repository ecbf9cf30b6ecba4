use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding the state/config root
pub const HOME_ENV: &str = "ASMGR_HOME";
const CONFIG_FILE: &str = "config.json";
const APP_DIR: &str = "agent-session-manager";

/// Runtime configuration, read from `<root>/config.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root for persisted state, logs and snapshots (not serialized)
    #[serde(skip)]
    pub root: PathBuf,
    pub tmux_binary: String,
    /// Dedicated tmux server socket (`tmux -L <name>`)
    pub tmux_socket: Option<String>,
    pub git_binary: String,
    pub session_prefix: String,
    pub tick_interval_ms: u64,
    /// Lines captured per tick for activity classification
    pub activity_lines: usize,
    /// Lines captured for the selected instance's preview
    pub preview_lines: usize,
    pub capture_timeout_ms: u64,
    pub diff_timeout_ms: u64,
    /// Consecutive `has-session = false` ticks before Running -> Stopped
    pub missed_ticks_before_stop: u32,
    pub max_parallel_polls: usize,
    pub default_cols: u16,
    pub default_rows: u16,
    pub detach_key: String,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            tmux_binary: "tmux".to_string(),
            tmux_socket: None,
            git_binary: "git".to_string(),
            session_prefix: "asmgr-".to_string(),
            tick_interval_ms: 100,
            activity_lines: 40,
            preview_lines: 100,
            capture_timeout_ms: 2000,
            diff_timeout_ms: 10_000,
            missed_ticks_before_stop: 3,
            max_parallel_polls: 8,
            default_cols: 200,
            default_rows: 50,
            detach_key: "C-q".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Resolve the root directory and load `config.json` from it
    pub fn load() -> Result<Self> {
        Self::load_from(default_root()?)
    }

    /// Load from an explicit root; a missing file yields defaults
    pub fn load_from(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let path = root.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Config::default(),
            Ok(content) => serde_json::from_str::<Config>(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(Error::Config(format!("{}: {}", path.display(), e))),
        };
        config.root = root;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.session_prefix.is_empty() {
            return Err(Error::Config("session_prefix must not be empty".into()));
        }
        if self.session_prefix.contains([':', '.']) {
            return Err(Error::Config(
                "session_prefix must not contain ':' or '.'".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn diff_timeout(&self) -> Duration {
        Duration::from_millis(self.diff_timeout_ms)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("asmgr.log")
    }

    /// Session name for an instance id
    pub fn session_name(&self, instance_id: &str) -> String {
        format!("{}{}", self.session_prefix, instance_id)
    }
}

fn default_root() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .ok_or_else(|| Error::Config("cannot determine the user configuration directory".into()))
}

/// Home directory used for agent history discovery
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| Path::new(".").to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(dir.path()).unwrap();
        assert_eq!(config.root, dir.path());
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.session_name("abc"), "asmgr-abc");
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"tick_interval_ms": 250, "tmux_socket": "test", "unknown": 1}"#,
        )
        .unwrap();
        let config = Config::load_from(dir.path()).unwrap();
        assert_eq!(config.tick_interval_ms, 250);
        assert_eq!(config.tmux_socket.as_deref(), Some("test"));
        assert_eq!(config.preview_lines, 100);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert!(matches!(
            Config::load_from(dir.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_rejects_bad_prefix() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"session_prefix": "a:b"}"#).unwrap();
        assert!(Config::load_from(dir.path()).is_err());
    }
}
