//! Live configuration: a shared, swappable config plus a file watcher that
//! reloads it when the file on disk changes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, Debouncer};
use tokio::sync::broadcast;

use super::loader::load_config;
use super::schema::Config;
use crate::error::WorkerError;

/// Published whenever the active configuration is replaced.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub previous: Arc<Config>,
    pub current: Arc<Config>,
}

/// Thread-safe handle to the active configuration.
///
/// Readers take a cheap `Arc` snapshot; a replacement never mutates a
/// snapshot somebody already holds, so in-flight work keeps the values it
/// started with.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
    sender: broadcast::Sender<ConfigChange>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            sender,
        }
    }

    /// Returns the current configuration snapshot.
    pub fn current(&self) -> Arc<Config> {
        let guard = match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Config lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        Arc::clone(&guard)
    }

    /// Replaces the configuration and notifies subscribers.
    /// Returns false when the new config equals the current one.
    pub fn replace(&self, config: Config) -> bool {
        let current = Arc::new(config);
        let previous = {
            let mut guard = match self.inner.write() {
                Ok(g) => g,
                Err(poisoned) => {
                    log::warn!("Config lock was poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            if **guard == *current {
                return false;
            }
            std::mem::replace(&mut *guard, Arc::clone(&current))
        };

        let _ = self.sender.send(ConfigChange { previous, current });
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.sender.subscribe()
    }
}

/// Watches the configuration file and pushes valid reloads into a [`SharedConfig`].
pub struct ConfigWatcher {
    path: PathBuf,
    shared: SharedConfig,
    force_dry_run: bool,
    shutdown: Arc<AtomicBool>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, shared: SharedConfig) -> Self {
        Self {
            path: path.into(),
            shared,
            force_dry_run: false,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Keeps `dry_run` on across reloads, for a dry run requested on the command line.
    pub fn force_dry_run(mut self, force: bool) -> Self {
        self.force_dry_run = force;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file. Invalid files are logged and the old config stays active.
    pub fn reload(&self) -> bool {
        match load_config(&self.path) {
            Ok(mut config) => {
                config.dry_run |= self.force_dry_run;
                let changed = self.shared.replace(config);
                if changed {
                    log::info!("Configuration reloaded from {}", self.path.display());
                }
                changed
            }
            Err(e) => {
                log::error!(
                    "Ignoring invalid configuration in {}: {}",
                    self.path.display(),
                    e
                );
                false
            }
        }
    }

    /// Watches the file until [`ConfigWatcher::stop`] is called. Blocks.
    pub fn watch(&self) -> Result<(), WorkerError> {
        let (tx, rx) = std::sync::mpsc::channel();

        let mut debouncer: Debouncer<RecommendedWatcher> =
            new_debouncer(Duration::from_millis(500), tx)
                .map_err(|e| WorkerError::WatchError(e.to_string()))?;

        // Editors often replace the file, so watch its directory
        let watch_dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        debouncer
            .watcher()
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| WorkerError::WatchError(e.to_string()))?;

        log::info!("Watching configuration file: {}", self.path.display());

        let file_name = self.path.file_name().map(|n| n.to_os_string());

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(events)) => {
                    let touched = events
                        .iter()
                        .any(|event| event.path.file_name().map(|n| n.to_os_string()) == file_name);
                    if touched {
                        self.reload();
                    }
                }
                Ok(Err(e)) => {
                    log::error!("Config watch error: {}", e);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        log::info!("Stopped watching configuration file");
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
