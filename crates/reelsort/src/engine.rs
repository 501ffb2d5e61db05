//! Runs the organizer as a service: one watcher thread per configured root,
//! the single classification worker, a housekeeping thread and a listener
//! that re-targets watchers when the configuration changes.
//!
//! The entry points (`on_file_detected`, `on_file_completed`, `manual_edit`,
//! `resubmit_for_classification`) are also usable without [`Engine::start`],
//! which is how the integration tests drive it deterministically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::classify::{ClassificationOptions, Classifier};
use crate::config::{Config, SharedConfig, WatchConfig};
use crate::error::{RegistryError, Result, StorageError, WorkerError};
use crate::events::JobEvent;
use crate::grouping::GroupingResolver;
use crate::job::{Job, JobPatch, JobRegistry, JobStatus, SourceRoot};
use crate::library_hook::LibraryNotifier;
use crate::movement_log::MovementLog;
use crate::organizer::placement::ensure_directory;
use crate::organizer::Organizer;
use crate::sanitize::{redact_path, safe_relative_path};
use crate::watcher::{DetectedFile, RootWatcher};
use crate::worker::{QueueWorker, SweepReport, Sweeper};

const CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn spawn<F>(name: &str, f: F) -> std::result::Result<JoinHandle<()>, WorkerError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| WorkerError::SpawnFailed {
            name: name.to_string(),
            source,
        })
}

struct RunningWatcher {
    directory: PathBuf,
    watch: WatchConfig,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl RunningWatcher {
    fn stop(self, root: SourceRoot) {
        self.stop.store(true, Ordering::Relaxed);
        if let Err(e) = self.handle.join() {
            error!("{} watcher panicked: {:?}", root, e);
        }
    }
}

/// State shared by every engine thread.
struct Core {
    config: SharedConfig,
    registry: Arc<JobRegistry>,
    resolver: GroupingResolver,
    organizer: Arc<Organizer>,
    classifier: Arc<dyn Classifier>,
    sweeper: Sweeper,
    wake_tx: Sender<()>,
    watchers: Mutex<HashMap<SourceRoot, RunningWatcher>>,
}

impl Core {
    fn wake(&self) {
        // A pending wake-up already covers this one
        let _ = self.wake_tx.try_send(());
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<SourceRoot, RunningWatcher>> {
        match self.watchers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Watcher table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn on_file_detected(&self, root: SourceRoot, path: &Path, relative: &Path) -> Option<Job> {
        if root == SourceRoot::Completion {
            return self.on_file_completed(path, relative);
        }

        let config = self.config.current();
        let job = self.resolver.on_detected(
            root,
            path,
            relative,
            &config.classification,
            config.max_retries,
        )?;
        self.wake();
        Some(job)
    }

    fn on_file_completed(&self, path: &Path, relative: &Path) -> Option<Job> {
        let Some(job) = self.registry.find_for_completed(relative) else {
            let config = self.config.current();
            let job = self.resolver.on_detected(
                SourceRoot::Completion,
                path,
                relative,
                &config.classification,
                config.max_retries,
            )?;
            self.wake();
            return Some(job);
        };

        if job.completed_path.as_deref() == Some(path) {
            return Some(job);
        }

        let Some(job) = self.registry.link_completed(&job.id, path) else {
            debug!("Job {} completed before its download was linked", job.id);
            return self.registry.get(&job.id);
        };
        info!(
            "Download of {} finished ({})",
            redact_path(&job.relative_path),
            job.status
        );

        if job.status == JobStatus::PendingCompletion {
            self.organizer.organize(&job.id);
            return self.registry.get(&job.id).or(Some(job));
        }
        Some(job)
    }

    fn manual_edit(
        &self,
        job_id: &str,
        name: &str,
        destination_override: Option<&Path>,
    ) -> Result<Job> {
        let job = self
            .registry
            .get(job_id)
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;
        if job.status == JobStatus::Completed {
            return Err(RegistryError::InvalidTransition {
                job_id: job.id,
                from: JobStatus::Completed,
                to: JobStatus::ManualEdit,
            }
            .into());
        }

        let name = safe_relative_path(name)
            .ok_or_else(|| StorageError::InvalidDestination(name.to_string()))?;
        let destination_override = match destination_override {
            Some(path) => Some(
                safe_relative_path(&path.to_string_lossy())
                    .ok_or_else(|| StorageError::InvalidDestination(path.display().to_string()))?,
            ),
            None => None,
        };

        let edit = JobPatch {
            status: Some(JobStatus::ManualEdit),
            ai_determined_name: Some(Some(name.to_string_lossy().to_string())),
            destination_override: Some(destination_override),
            confidence: Some(Some(100)),
            error_message: Some(None),
            failure: Some(None),
            priority: Some(false),
            ..Default::default()
        };
        self.registry.update(job_id, edit)?;
        let job = self
            .registry
            .update(job_id, JobPatch::status(JobStatus::PendingCompletion))?;
        info!(
            "Manual edit of {}: {}",
            redact_path(&job.relative_path),
            job.destination_relative().display()
        );

        let file_present = job
            .completed_path
            .as_deref()
            .is_some_and(|p| std::fs::symlink_metadata(p).is_ok());
        if file_present {
            self.organizer.organize(job_id);
            return Ok(self.registry.get(job_id).unwrap_or(job));
        }
        Ok(job)
    }

    fn housekeep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let report = self.sweeper.sweep_at(now);
        for (path, relative) in &report.relocated {
            self.on_file_completed(path, relative);
        }
        if !report.removed.is_empty() || !report.expired.is_empty() {
            debug!(
                "Housekeeping removed {} missing and {} completed job(s)",
                report.removed.len(),
                report.expired.len()
            );
        }
        report
    }
}

/// Starts the watcher for `root`, creating its directory and rescanning it first.
fn start_watcher(
    core: &Arc<Core>,
    root: SourceRoot,
    config: &Config,
) -> std::result::Result<Option<RunningWatcher>, WorkerError> {
    let Some(watcher) = RootWatcher::from_config(root, config) else {
        return Ok(None);
    };
    if let Err(e) = ensure_directory(watcher.directory()) {
        warn!("{} root unavailable: {}", root, e);
    }

    for file in watcher.scan()? {
        core.on_file_detected(file.root, &file.path, &file.relative_path);
    }

    let directory = watcher.directory().to_path_buf();
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let thread_core = Arc::clone(core);
    let handle = spawn(&format!("watch-{}", root), move || {
        let report = |file: DetectedFile| {
            thread_core.on_file_detected(file.root, &file.path, &file.relative_path);
        };
        if let Err(e) = watcher.watch(report, thread_stop) {
            error!("{} watcher stopped: {}", root, e);
        }
    })?;

    Ok(Some(RunningWatcher {
        directory,
        watch: config.watch.clone(),
        stop,
        handle,
    }))
}

/// Restarts the watchers whose directory or watch settings differ from the
/// current configuration.
fn sync_watchers(core: &Arc<Core>) {
    let config = core.config.current();
    let mut watchers = core.watchers();

    for root in SourceRoot::ALL {
        let desired = config.root_directory(root);
        let unchanged = match (watchers.get(&root), &desired) {
            (Some(running), Some(directory)) => {
                running.directory == *directory && running.watch == config.watch
            }
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            continue;
        }

        if let Some(old) = watchers.remove(&root) {
            info!("Stopping {} watcher on {}", root, old.directory.display());
            old.stop(root);
        }
        match start_watcher(core, root, &config) {
            Ok(Some(running)) => {
                watchers.insert(root, running);
            }
            Ok(None) => {}
            Err(e) => error!("Could not start {} watcher: {}", root, e),
        }
    }
}

fn run_queue_worker(
    mut worker: QueueWorker,
    wake_rx: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    config: SharedConfig,
) {
    debug!("Queue worker started");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        if let Some(submitted) = worker.tick() {
            debug!(
                "Submitted {} job(s) ({:?}), success: {}",
                submitted.job_ids.len(),
                submitted.reason,
                submitted.succeeded
            );
        }

        match wake_rx.recv_timeout(config.current().tick_interval()) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("Queue worker stopped");
}

fn run_housekeeping(core: Arc<Core>, stop_rx: Receiver<()>) {
    debug!("Housekeeping started");

    loop {
        let interval = core.config.current().tick_interval();
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                core.housekeep_at(Utc::now());
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("Housekeeping stopped");
}

fn run_config_listener(core: Arc<Core>, stop_rx: Receiver<()>) {
    let mut changes = core.config.subscribe();

    loop {
        let mut changed = false;
        loop {
            match changes.try_recv() {
                Ok(_) => changed = true,
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!("Skipped {} config change notifications", skipped);
                    changed = true;
                }
                Err(broadcast::error::TryRecvError::Closed) => return,
            }
        }
        if changed {
            info!("Configuration changed, checking watched roots");
            sync_watchers(&core);
        }

        match stop_rx.recv_timeout(CONFIG_POLL_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// The running organizer service.
pub struct Engine {
    core: Arc<Core>,
    wake_rx: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    stop_rx: Receiver<()>,
    threads: Vec<(String, JoinHandle<()>)>,
}

impl Engine {
    /// Builds the engine without starting any thread.
    pub fn new(
        config: SharedConfig,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn LibraryNotifier>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let organizer = Arc::new(Organizer::new(
            Arc::clone(&registry),
            config.clone(),
            notifier,
        ));
        let (wake_tx, wake_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(1);

        let core = Core {
            resolver: GroupingResolver::new(Arc::clone(&registry)),
            sweeper: Sweeper::new(Arc::clone(&registry), config.clone()),
            config,
            registry,
            organizer,
            classifier,
            wake_tx,
            watchers: Mutex::new(HashMap::new()),
        };

        Self {
            core: Arc::new(core),
            wake_rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            stop_tx: Some(stop_tx),
            stop_rx,
            threads: Vec::new(),
        }
    }

    /// Builds the engine, rescans every configured root and starts all threads.
    pub fn start(
        config: SharedConfig,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn LibraryNotifier>,
    ) -> std::result::Result<Self, WorkerError> {
        let mut engine = Self::new(config, classifier, notifier);
        if let Err(e) = engine.spawn_threads() {
            engine.shutdown();
            return Err(e);
        }
        Ok(engine)
    }

    fn spawn_threads(&mut self) -> std::result::Result<(), WorkerError> {
        let config = self.core.config.current();

        // Inbox before completion, so finished downloads find their inbox job
        for root in SourceRoot::ALL {
            if let Some(running) = start_watcher(&self.core, root, &config)? {
                self.core.watchers().insert(root, running);
            }
        }

        let worker = self.queue_worker();
        let wake_rx = self.wake_rx.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let shared = self.core.config.clone();
        let handle = spawn("queue-worker", move || {
            run_queue_worker(worker, wake_rx, shutdown, shared)
        })?;
        self.threads.push(("queue-worker".to_string(), handle));

        let core = Arc::clone(&self.core);
        let stop_rx = self.stop_rx.clone();
        let handle = spawn("housekeeping", move || run_housekeeping(core, stop_rx))?;
        self.threads.push(("housekeeping".to_string(), handle));

        let core = Arc::clone(&self.core);
        let stop_rx = self.stop_rx.clone();
        let handle = spawn("config-listener", move || run_config_listener(core, stop_rx))?;
        self.threads.push(("config-listener".to_string(), handle));

        info!(
            "Engine started: {} watched root(s), {} job(s) tracked",
            self.core.watchers().len(),
            self.core.registry.len()
        );
        Ok(())
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.core.registry
    }

    pub fn organizer(&self) -> &Arc<Organizer> {
        &self.core.organizer
    }

    pub fn config(&self) -> &SharedConfig {
        &self.core.config
    }

    pub fn movement_log(&self) -> Option<Arc<MovementLog>> {
        self.core.organizer.movement_log()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.core.registry.subscribe()
    }

    /// A queue worker over this engine's registry. [`Engine::start`] runs one
    /// on its own thread; there must never be two submitting at once.
    pub fn queue_worker(&self) -> QueueWorker {
        QueueWorker::new(
            Arc::clone(&self.core.registry),
            Arc::clone(&self.core.classifier),
            Arc::clone(&self.core.organizer),
            self.core.config.clone(),
        )
    }

    /// Registers a file reported in a watched root. Files in the completion
    /// root are linked to their inbox job when there is one.
    pub fn on_file_detected(&self, root: SourceRoot, path: &Path, relative: &Path) -> Option<Job> {
        self.core.on_file_detected(root, path, relative)
    }

    /// Records that a download finished at `path` and places the job if it
    /// was already classified.
    pub fn on_file_completed(&self, path: &Path, relative: &Path) -> Option<Job> {
        self.core.on_file_completed(path, relative)
    }

    /// Sets the destination by hand; the job skips classification and is
    /// placed right away when its file is present.
    pub fn manual_edit(
        &self,
        job_id: &str,
        name: &str,
        destination_override: Option<&Path>,
    ) -> Result<Job> {
        self.core.manual_edit(job_id, name, destination_override)
    }

    /// Sends a job back to the classifier ahead of regular work.
    pub fn resubmit_for_classification(
        &self,
        job_id: &str,
        options: Option<ClassificationOptions>,
    ) -> std::result::Result<Job, RegistryError> {
        let job = self.core.registry.requeue(job_id, options)?;
        info!("Resubmitted {} for classification", redact_path(&job.relative_path));
        self.core.wake();
        Ok(job)
    }

    /// One staleness sweep as of `now`; files found in the completion root
    /// are linked to their jobs.
    pub fn housekeep_at(&self, now: DateTime<Utc>) -> SweepReport {
        self.core.housekeep_at(now)
    }

    /// Stops every thread and waits for them. An in-flight classification is
    /// awaited, not cancelled.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("Shutting down engine...");

        self.stop_tx.take();
        self.core.wake();

        let watchers: Vec<(SourceRoot, RunningWatcher)> = self.core.watchers().drain().collect();
        for (root, running) in watchers {
            running.stop(root);
        }

        for (name, handle) in self.threads.drain(..) {
            if let Err(e) = handle.join() {
                error!("Thread {} panicked: {:?}", name, e);
            } else {
                debug!("Thread {} finished", name);
            }
        }

        info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
