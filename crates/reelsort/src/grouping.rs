//! Sibling grouping: files that share a directory and a base name (a video
//! and its subtitles, say) are classified and placed together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::classify::ClassificationOptions;
use crate::job::{Job, JobRegistry, NewJob, SourceRoot};
use crate::sanitize::redact_path;

/// Identity shared by all members of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub root: SourceRoot,
    pub directory: PathBuf,
    /// File name without its final extension.
    pub base_name: String,
}

impl GroupKey {
    pub fn new(root: SourceRoot, relative_path: &Path) -> Self {
        let directory = relative_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let base_name = relative_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        Self {
            root,
            directory,
            base_name,
        }
    }

    pub fn of(job: &Job) -> Self {
        Self::new(job.source_root, &job.relative_path)
    }
}

/// How a newly detected file relates to the jobs already tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupDecision {
    /// No live sibling: the new job is primary on its own.
    Standalone,
    /// A sibling already belongs to a group; join it as a secondary.
    Join { group_id: String },
    /// A lone sibling exists; mint a group with it as primary.
    Form { primary_id: String },
}

/// Picks the group for a new file at `key` among `jobs`.
///
/// Only non-terminal siblings count. The oldest one wins when several match.
pub fn decide<'a>(key: &GroupKey, jobs: impl IntoIterator<Item = &'a Job>) -> GroupDecision {
    let sibling = jobs
        .into_iter()
        .filter(|job| !job.is_terminal() && GroupKey::of(job) == *key)
        .min_by_key(|job| (job.group_id.is_none(), job.seq));

    match sibling {
        None => GroupDecision::Standalone,
        Some(job) => match &job.group_id {
            Some(group_id) => GroupDecision::Join {
                group_id: group_id.clone(),
            },
            None => GroupDecision::Form {
                primary_id: job.id.clone(),
            },
        },
    }
}

/// Turns watcher reports into registered jobs.
pub struct GroupingResolver {
    registry: Arc<JobRegistry>,
}

impl GroupingResolver {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    /// Registers a detected file. Returns `None` when the path is already tracked.
    pub fn on_detected(
        &self,
        root: SourceRoot,
        path: &Path,
        relative_path: &Path,
        options: &ClassificationOptions,
        max_retries: u32,
    ) -> Option<Job> {
        let new_job = NewJob::new(path, relative_path, root)
            .with_options(options.clone())
            .with_max_retries(max_retries);

        match self.registry.create(new_job) {
            Ok(job) => {
                match (&job.group_id, job.is_primary) {
                    (Some(group_id), false) => log::info!(
                        "Detected {} in {} root, joined group {}",
                        redact_path(path),
                        root,
                        group_id
                    ),
                    _ => log::info!("Detected {} in {} root", redact_path(path), root),
                }
                Some(job)
            }
            Err(e) => {
                log::debug!("Ignoring detection of {}: {}", redact_path(path), e);
                None
            }
        }
    }
}
