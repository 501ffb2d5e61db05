//! Watched-root scanning and polling.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use notify::{Config as NotifyConfig, PollWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer_opt, Config as DebouncerConfig, DebouncedEventKind};
use walkdir::WalkDir;

use crate::config::{Config, WatchConfig};
use crate::error::WorkerError;
use crate::job::SourceRoot;

/// A file reported by a watcher or a rescan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedFile {
    pub root: SourceRoot,
    pub path: PathBuf,
    pub relative_path: PathBuf,
}

pub struct RootWatcher {
    root: SourceRoot,
    directory: PathBuf,
    ignore: Vec<glob::Pattern>,
    poll_interval: Duration,
    debounce: Duration,
}

impl RootWatcher {
    pub fn new<P: AsRef<Path>>(root: SourceRoot, directory: P, watch: &WatchConfig) -> Self {
        let ignore = watch
            .ignore_patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Skipping invalid ignore pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();

        Self {
            root,
            directory: directory.as_ref().to_path_buf(),
            ignore,
            poll_interval: watch.poll_interval(),
            debounce: watch.debounce(),
        }
    }

    /// Watcher for `root` as configured, or `None` when the root is not configured.
    pub fn from_config(root: SourceRoot, config: &Config) -> Option<Self> {
        config
            .root_directory(root)
            .map(|dir| Self::new(root, dir, &config.watch))
    }

    pub fn root(&self) -> SourceRoot {
        self.root
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// True when any component of `relative` matches an ignore pattern
    /// (partial downloads, hidden files and folders).
    pub fn is_ignored(&self, relative: &Path) -> bool {
        relative.components().any(|component| {
            let name = component.as_os_str().to_string_lossy();
            self.ignore.iter().any(|p| p.matches(&name))
        })
    }

    fn detected(&self, path: &Path) -> Option<DetectedFile> {
        let relative = path.strip_prefix(&self.directory).ok()?;
        if relative.as_os_str().is_empty() || self.is_ignored(relative) {
            return None;
        }
        if !path.is_file() {
            return None;
        }

        Some(DetectedFile {
            root: self.root,
            path: path.to_path_buf(),
            relative_path: relative.to_path_buf(),
        })
    }

    /// Lists every eligible file under the root, recursively and in name order.
    pub fn scan(&self) -> Result<Vec<DetectedFile>, WorkerError> {
        if !self.directory.exists() {
            warn!(
                "{} root {} does not exist, nothing to scan",
                self.root,
                self.directory.display()
            );
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.directory)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(WorkerError::ScanFailed {
                        path: self.directory.clone(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(file) = self.detected(entry.path()) {
                debug!("Found {}", file.relative_path.display());
                files.push(file);
            }
        }

        info!(
            "Scanned {} files in {} root {}",
            files.len(),
            self.root,
            self.directory.display()
        );
        Ok(files)
    }

    /// Polls the root until `shutdown` is set, reporting new or changed files. Blocks.
    pub fn watch<F>(&self, callback: F, shutdown: Arc<AtomicBool>) -> Result<(), WorkerError>
    where
        F: Fn(DetectedFile),
    {
        // PollWatcher for Docker/NFS compatibility
        let poll_config = NotifyConfig::default().with_poll_interval(self.poll_interval);
        let debouncer_config = DebouncerConfig::default()
            .with_timeout(self.debounce)
            .with_notify_config(poll_config);

        let (tx, rx) = std::sync::mpsc::channel();

        let mut debouncer = new_debouncer_opt::<_, PollWatcher>(debouncer_config, tx)
            .map_err(|e| WorkerError::WatchError(e.to_string()))?;

        debouncer
            .watcher()
            .watch(&self.directory, RecursiveMode::Recursive)
            .map_err(|e| WorkerError::WatchError(e.to_string()))?;

        info!("Watching {} root: {}", self.root, self.directory.display());

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Stopped watching {} root", self.root);
                break;
            }

            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(events)) => {
                    for event in events {
                        if !matches!(
                            event.kind,
                            DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
                        ) {
                            continue;
                        }
                        // Vanished paths are the sweeper's business
                        if let Some(file) = self.detected(&event.path) {
                            callback(file);
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("Watch error on {} root: {:?}", self.root, e);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    error!("Watch channel for {} root disconnected", self.root);
                    break;
                }
            }
        }

        Ok(())
    }
}
