//! Places finished files into the library.

pub mod cleanup;
pub mod placement;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, info_span, warn};

use crate::config::SharedConfig;
use crate::error::StorageError;
use crate::job::{FailureKind, Job, JobPatch, JobRegistry, JobStatus};
use crate::library_hook::LibraryNotifier;
use crate::movement_log::{MovementEntry, MovementLog};
use crate::sanitize::{redact_path, safe_relative_path};

pub use placement::{plan_destination, PlannedMove};

/// Result of one organize attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrganizeOutcome {
    Placed(PathBuf),
    /// Dry run: the job completed without touching the file.
    DryRun(PathBuf),
    /// The physical file has not been seen yet, or vanished.
    NotReady,
    /// The job is gone or not awaiting placement.
    Skipped,
    Failed(String),
}

pub struct Organizer {
    registry: Arc<JobRegistry>,
    config: SharedConfig,
    notifier: Arc<dyn LibraryNotifier>,
    placement_lock: Mutex<()>,
    movement_log: Mutex<Option<Arc<MovementLog>>>,
}

impl Organizer {
    pub fn new(
        registry: Arc<JobRegistry>,
        config: SharedConfig,
        notifier: Arc<dyn LibraryNotifier>,
    ) -> Self {
        Self {
            registry,
            config,
            notifier,
            placement_lock: Mutex::new(()),
            movement_log: Mutex::new(None),
        }
    }

    /// Movement log at the currently configured location, if any.
    ///
    /// One instance is shared per path so appends go through a single lock.
    pub fn movement_log(&self) -> Option<Arc<MovementLog>> {
        let config = self.config.current();
        let path = config.movement_log_path.as_ref()?;

        let mut cached = match self.movement_log.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cached.as_ref() {
            Some(log) if log.path() == Path::new(path) => Some(Arc::clone(log)),
            _ => {
                let log = Arc::new(MovementLog::new(path));
                *cached = Some(Arc::clone(&log));
                Some(log)
            }
        }
    }

    fn record(&self, entry: MovementEntry) {
        if let Some(log) = self.movement_log() {
            if let Err(e) = log.record(&entry) {
                warn!("Failed to record movement: {}", e);
            }
        }
    }

    /// Moves the job's file into the library and completes the job.
    ///
    /// Only `PendingCompletion` jobs whose physical file is known are placed.
    /// Errors become a `Failed` job with the error text; they are not retried.
    pub fn organize(&self, job_id: &str) -> OrganizeOutcome {
        // Held from the status check through the move, so two jobs never pick
        // one free slot and one job is never placed twice
        let placement = match self.placement_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(job) = self.registry.get(job_id) else {
            return OrganizeOutcome::Skipped;
        };

        let _span = info_span!("organize",
            job_id = %job.id,
            filename = %redact_path(&job.relative_path),
        )
        .entered();

        if job.status != JobStatus::PendingCompletion {
            debug!("Job is {}, not placing", job.status);
            return OrganizeOutcome::Skipped;
        }

        let Some(source) = job.completed_path.clone() else {
            debug!("File not complete yet");
            return OrganizeOutcome::NotReady;
        };
        if std::fs::symlink_metadata(&source).is_err() {
            debug!("Completed file {} is missing", redact_path(&source));
            return OrganizeOutcome::NotReady;
        }

        let config = self.config.current();
        let library = config.library_path();

        let requested = job.destination_relative();
        let Some(relative) = safe_relative_path(&requested.to_string_lossy()) else {
            let err = StorageError::InvalidDestination(requested.display().to_string());
            return self.fail(&job, &source, &library, err);
        };

        let catch_all = config.catch_all_path();
        let planned = match plan_destination(
            &library,
            catch_all.as_deref(),
            &relative,
            config.collision_policy,
        ) {
            Ok(planned) => planned,
            Err(e) => return self.fail(&job, &source, &library.join(&relative), e),
        };

        if config.dry_run {
            info!(
                "DRY RUN: would move {} -> {}",
                source.display(),
                planned.destination.display()
            );
            self.record(MovementEntry::success(&source, &planned.destination, &job.id).dry_run());
            self.complete(&job, &planned.destination);
            return OrganizeOutcome::DryRun(planned.destination);
        }

        {
            let _step = info_span!("move_file", overwrite = planned.overwrite, renamed = planned.renamed)
                .entered();
            if let Err(e) = placement::execute(&source, &planned) {
                return self.fail(&job, &source, &planned.destination, e);
            }
        }

        info!(
            "Placed {} at {}",
            redact_path(&source),
            planned.destination.display()
        );
        self.record(MovementEntry::success(&source, &planned.destination, &job.id));
        self.complete(&job, &planned.destination);
        drop(placement);
        self.notifier.notify(&planned.destination, &job.id);

        if let (Some(parent), Some(root)) = (source.parent(), self.root_containing(&source)) {
            cleanup::remove_empty_parents(parent, &root);
        }

        OrganizeOutcome::Placed(planned.destination)
    }

    fn root_containing(&self, path: &Path) -> Option<PathBuf> {
        self.config
            .current()
            .watched_roots()
            .into_iter()
            .map(|(_, dir)| dir)
            .find(|dir| path.starts_with(dir))
    }

    fn complete(&self, job: &Job, destination: &Path) {
        match self.registry.update_if(
            &job.id,
            &[JobStatus::PendingCompletion],
            JobPatch::completed(destination.to_path_buf()),
        ) {
            Ok(Some(_)) => {}
            Ok(None) => warn!("Job {} changed while its file was being placed", job.id),
            Err(e) => error!("Failed to complete job {}: {}", job.id, e),
        }
    }

    fn fail(
        &self,
        job: &Job,
        source: &Path,
        destination: &Path,
        err: StorageError,
    ) -> OrganizeOutcome {
        let message = err.to_string();
        error!("Failed to place {}: {}", redact_path(source), message);

        self.record(MovementEntry::failed(source, destination, &job.id, &message));
        if let Err(e) = self.registry.update_if(
            &job.id,
            &[JobStatus::PendingCompletion],
            JobPatch::failed(FailureKind::Organize, &message),
        ) {
            error!("Failed to mark job {} as failed: {}", job.id, e);
        }

        OrganizeOutcome::Failed(message)
    }
}
