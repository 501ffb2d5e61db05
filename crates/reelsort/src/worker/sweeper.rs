use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span};

use crate::config::SharedConfig;
use crate::job::{Job, JobPatch, JobRegistry, JobStatus, SourceRoot};
use crate::sanitize::redact_path;

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs whose file stayed missing past the grace window.
    pub removed: Vec<String>,
    /// Completed jobs dropped after their grace period.
    pub expired: Vec<String>,
    /// Inbox files found in the completion root: `(absolute, relative)`.
    pub relocated: Vec<(PathBuf, PathBuf)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.expired.is_empty() && self.relocated.is_empty()
    }
}

/// Prunes jobs whose backing file is gone and completed jobs past their grace.
pub struct Sweeper {
    registry: Arc<JobRegistry>,
    config: SharedConfig,
}

fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

impl Sweeper {
    pub fn new(registry: Arc<JobRegistry>, config: SharedConfig) -> Self {
        Self { registry, config }
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let _span = info_span!("sweep").entered();
        let config = self.config.current();
        let completion_root = config.root_directory(SourceRoot::Completion);
        let mut report = SweepReport::default();

        for job in self.registry.snapshot() {
            if job.status == JobStatus::Completed {
                if now - job.updated_at >= config.completed_grace() {
                    if self.registry.delete(&job.id).is_some() {
                        debug!("Dropped completed job {}", job.id);
                        report.expired.push(job.id);
                    }
                }
                continue;
            }
            if job.is_terminal() {
                continue;
            }

            if exists(job.expected_path()) {
                if job.missing_since.is_some() {
                    self.set_missing(&job, None);
                }
                continue;
            }

            // The download may have finished before the completion watcher noticed
            if let Some(found) = self.find_in_completion_root(&job, completion_root.as_deref()) {
                debug!("Found {} in the completion root", redact_path(&found));
                if job.missing_since.is_some() {
                    self.set_missing(&job, None);
                }
                report.relocated.push((found, job.relative_path.clone()));
                continue;
            }

            match job.missing_since {
                None => self.set_missing(&job, Some(now)),
                Some(since) if now - since >= config.missing_grace() => {
                    if self.registry.delete(&job.id).is_some() {
                        info!(
                            "Removed job {}: {} has been missing since {}",
                            job.id,
                            redact_path(job.expected_path()),
                            since
                        );
                        report.removed.push(job.id);
                    }
                }
                Some(_) => {}
            }
        }

        report
    }

    fn find_in_completion_root(&self, job: &Job, completion_root: Option<&Path>) -> Option<PathBuf> {
        if job.source_root != SourceRoot::Inbox || job.completed_path.is_some() {
            return None;
        }
        let candidate = completion_root?.join(&job.relative_path);
        exists(&candidate).then_some(candidate)
    }

    fn set_missing(&self, job: &Job, since: Option<DateTime<Utc>>) {
        let patch = JobPatch {
            missing_since: Some(since),
            ..Default::default()
        };
        // A job that changed status meanwhile is picked up next sweep
        let _ = self.registry.update_if(&job.id, &[job.status], patch);
    }
}
