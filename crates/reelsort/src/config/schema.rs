use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::ClassificationOptions;
use crate::job::SourceRoot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Folder where downloads start appearing.
    pub inbox_directory: String,
    /// Folder where finished downloads land.
    pub completed_directory: String,
    /// Optional drop folder whose files are organized as soon as they are named.
    #[serde(default)]
    pub staging_directory: Option<String>,
    pub library_directory: String,
    /// Library subfolder where an existing file may be overwritten.
    #[serde(default)]
    pub catch_all_subfolder: Option<String>,
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    #[serde(default = "default_missing_grace_secs")]
    pub missing_grace_secs: u64,
    #[serde(default = "default_completed_grace_secs")]
    pub completed_grace_secs: u64,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub classification: ClassificationOptions,
    /// Endpoint notified (POST) whenever a file lands in the library.
    #[serde(default)]
    pub library_hook_url: Option<String>,
    /// JSON-lines file recording every move.
    #[serde(default)]
    pub movement_log_path: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_stall_threshold_secs() -> u64 {
    30
}

fn default_missing_grace_secs() -> u64 {
    5
}

fn default_completed_grace_secs() -> u64 {
    10
}

impl Config {
    /// Returns the directory configured for a watched root, if any.
    pub fn root_directory(&self, root: SourceRoot) -> Option<PathBuf> {
        match root {
            SourceRoot::Inbox => Some(PathBuf::from(&self.inbox_directory)),
            SourceRoot::Completion => Some(PathBuf::from(&self.completed_directory)),
            SourceRoot::Staging => self.staging_directory.as_ref().map(PathBuf::from),
        }
    }

    /// All configured watched roots with their directories.
    pub fn watched_roots(&self) -> Vec<(SourceRoot, PathBuf)> {
        SourceRoot::ALL
            .iter()
            .filter_map(|root| self.root_directory(*root).map(|dir| (*root, dir)))
            .collect()
    }

    pub fn library_path(&self) -> PathBuf {
        PathBuf::from(&self.library_directory)
    }

    pub fn catch_all_path(&self) -> Option<PathBuf> {
        self.catch_all_subfolder
            .as_ref()
            .map(|sub| self.library_path().join(sub))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn stall_threshold(&self) -> chrono::Duration {
        seconds_delta(self.stall_threshold_secs)
    }

    pub fn missing_grace(&self) -> chrono::Duration {
        seconds_delta(self.missing_grace_secs)
    }

    pub fn completed_grace(&self) -> chrono::Duration {
        seconds_delta(self.completed_grace_secs)
    }
}

/// Upper bound for every `*_secs` duration setting (ten years).
pub const MAX_DURATION_SECS: u64 = 315_360_000;

fn seconds_delta(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// What to do when the destination file already exists outside the catch-all folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Append `_1`, `_2`, ... before the extension.
    #[default]
    Rename,
    /// Refuse to place the file.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
}

fn default_poll_interval() -> u64 {
    2
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        "*.part".to_string(),
        "*.tmp".to_string(),
        "*.crdownload".to_string(),
        ".*".to_string(),
    ]
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            debounce_ms: default_debounce_ms(),
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
