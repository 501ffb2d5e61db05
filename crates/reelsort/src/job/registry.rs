//! In-memory job registry. A single mutex guards jobs, the path index and the
//! group index so watchers, the worker and the sweeper can all mutate it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use super::model::{Job, JobPatch, JobStatus, NewJob, SourceRoot};
use crate::classify::ClassificationOptions;
use crate::error::RegistryError;
use crate::events::{JobEvent, JobEventBroadcaster};
use crate::grouping::{self, GroupDecision, GroupKey};

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub queued_for_ai: usize,
    pub processing_ai: usize,
    pub pending_completion: usize,
    pub completed: usize,
    pub failed: usize,
    pub manual_edit: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.queued_for_ai
            + self.processing_ai
            + self.pending_completion
            + self.completed
            + self.failed
            + self.manual_edit
    }
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<String, Job>,
    paths: HashMap<(SourceRoot, PathBuf), String>,
    groups: HashMap<String, Vec<String>>,
    next_seq: u64,
}

impl RegistryState {
    fn sorted<F>(&self, mut keep: F) -> Vec<Job>
    where
        F: FnMut(&Job) -> bool,
    {
        let mut jobs: Vec<Job> = self.jobs.values().filter(|j| keep(*j)).cloned().collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }
}

pub struct JobRegistry {
    state: Mutex<RegistryState>,
    events: JobEventBroadcaster,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_events(JobEventBroadcaster::default())
    }

    pub fn with_events(events: JobEventBroadcaster) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Registers a detected file and resolves its group in the same critical
    /// section, so two siblings reported concurrently still end up together.
    pub fn create(&self, new_job: NewJob) -> Result<Job, RegistryError> {
        let mut state = self.lock();

        let path_key = (new_job.source_root, new_job.relative_path.clone());
        if state.paths.contains_key(&path_key) {
            return Err(RegistryError::DuplicatePath(
                new_job.relative_path.display().to_string(),
            ));
        }

        let group_key = GroupKey::new(new_job.source_root, &new_job.relative_path);
        let decision = grouping::decide(&group_key, state.jobs.values());

        let now = Utc::now();
        state.next_seq += 1;
        let mut job = new_job.into_job(state.next_seq, now);

        match decision {
            GroupDecision::Standalone => {}
            GroupDecision::Join { group_id } => {
                job.group_id = Some(group_id.clone());
                job.is_primary = false;
                state.groups.entry(group_id).or_default().push(job.id.clone());
            }
            GroupDecision::Form { primary_id } => {
                let group_id = uuid::Uuid::new_v4().to_string();
                if let Some(primary) = state.jobs.get_mut(&primary_id) {
                    let previous = primary.status;
                    primary.group_id = Some(group_id.clone());
                    primary.is_primary = true;
                    primary.updated_at = now;
                    self.events.send(JobEvent::updated(primary, previous));
                }
                job.group_id = Some(group_id.clone());
                job.is_primary = false;
                state
                    .groups
                    .insert(group_id, vec![primary_id, job.id.clone()]);
            }
        }

        state.paths.insert(path_key, job.id.clone());
        state.jobs.insert(job.id.clone(), job.clone());
        self.events.send(JobEvent::created(&job));

        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.lock().jobs.get(job_id).cloned()
    }

    /// Looks a job up by its root-relative path.
    pub fn get_by_path(&self, root: SourceRoot, relative_path: &Path) -> Option<Job> {
        let state = self.lock();
        state
            .paths
            .get(&(root, relative_path.to_path_buf()))
            .and_then(|id| state.jobs.get(id))
            .cloned()
    }

    pub fn by_status(&self, status: JobStatus) -> Vec<Job> {
        self.lock().sorted(|j| j.status == status)
    }

    pub fn by_group(&self, group_id: &str) -> Vec<Job> {
        let state = self.lock();
        let mut members: Vec<Job> = state
            .groups
            .get(group_id)
            .map(|ids| ids.iter().filter_map(|id| state.jobs.get(id)).cloned().collect())
            .unwrap_or_default();
        members.sort_by_key(|j| j.seq);
        members
    }

    /// Queued priority jobs, oldest first.
    pub fn priority_eligible(&self) -> Vec<Job> {
        self.lock()
            .sorted(|j| j.priority && j.status == JobStatus::QueuedForAi)
    }

    /// Failed jobs that may still be retried automatically, oldest first.
    pub fn retry_eligible(&self) -> Vec<Job> {
        self.lock().sorted(Job::is_retry_eligible)
    }

    /// All jobs, oldest first.
    pub fn snapshot(&self) -> Vec<Job> {
        self.lock().sorted(|_| true)
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    pub fn counts(&self) -> JobCounts {
        let state = self.lock();
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::QueuedForAi => counts.queued_for_ai += 1,
                JobStatus::ProcessingAi => counts.processing_ai += 1,
                JobStatus::PendingCompletion => counts.pending_completion += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::ManualEdit => counts.manual_edit += 1,
            }
        }
        counts
    }

    /// Applies a patch, rejecting status changes the lifecycle forbids.
    pub fn update(&self, job_id: &str, patch: JobPatch) -> Result<Job, RegistryError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;

        self.apply(job, patch)
    }

    /// Applies a patch only while the job is in one of `expected` statuses.
    ///
    /// Returns `Ok(None)` when the job is gone or has moved on, which is how
    /// late classification results are discarded.
    pub fn update_if(
        &self,
        job_id: &str,
        expected: &[JobStatus],
        patch: JobPatch,
    ) -> Result<Option<Job>, RegistryError> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if !expected.contains(&job.status) {
            return Ok(None);
        }

        self.apply(job, patch).map(Some)
    }

    /// Records where a job's finished download now lives.
    ///
    /// Applies whatever status the job has reached; only completed jobs and
    /// jobs that are gone are left alone (`None`).
    pub fn link_completed(&self, job_id: &str, completed_path: &Path) -> Option<Job> {
        let mut state = self.lock();
        let job = state.jobs.get_mut(job_id)?;
        if job.status == JobStatus::Completed {
            return None;
        }

        let previous = job.status;
        let patch = JobPatch {
            completed_path: Some(Some(completed_path.to_path_buf())),
            missing_since: Some(None),
            ..Default::default()
        };
        patch.apply(job, Utc::now());
        self.events.send(JobEvent::updated(job, previous));
        Some(job.clone())
    }

    fn apply(&self, job: &mut Job, patch: JobPatch) -> Result<Job, RegistryError> {
        let previous = job.status;
        if let Some(next) = patch.status {
            if !previous.can_advance_to(next) {
                return Err(RegistryError::InvalidTransition {
                    job_id: job.id.clone(),
                    from: previous,
                    to: next,
                });
            }
        }

        patch.apply(job, Utc::now());
        self.events.send(JobEvent::updated(job, previous));
        Ok(job.clone())
    }

    /// Sends a job back to the classifier ahead of the regular queue.
    ///
    /// Clears previous naming and failure state; completed jobs are refused.
    pub fn requeue(
        &self,
        job_id: &str,
        options: Option<ClassificationOptions>,
    ) -> Result<Job, RegistryError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;

        let previous = job.status;
        if previous == JobStatus::Completed {
            return Err(RegistryError::InvalidTransition {
                job_id: job.id.clone(),
                from: previous,
                to: JobStatus::QueuedForAi,
            });
        }

        job.status = JobStatus::QueuedForAi;
        job.priority = true;
        job.retry_count = 0;
        job.failure = None;
        job.error_message = None;
        job.ai_determined_name = None;
        job.destination_override = None;
        job.confidence = None;
        if let Some(options) = options {
            job.options = options;
        }
        job.updated_at = Utc::now();

        self.events.send(JobEvent::updated(job, previous));
        Ok(job.clone())
    }

    /// Removes a job. A removed primary hands the role to the oldest remaining member.
    pub fn delete(&self, job_id: &str) -> Option<Job> {
        let mut state = self.lock();
        let job = state.jobs.remove(job_id)?;

        state
            .paths
            .remove(&(job.source_root, job.relative_path.clone()));

        if let Some(group_id) = &job.group_id {
            let remaining = match state.groups.get_mut(group_id) {
                Some(members) => {
                    members.retain(|id| id != job_id);
                    members.clone()
                }
                None => Vec::new(),
            };

            if remaining.is_empty() {
                state.groups.remove(group_id);
            } else if job.is_primary {
                let successor = remaining
                    .iter()
                    .filter_map(|id| state.jobs.get(id))
                    .min_by_key(|j| j.seq)
                    .map(|j| j.id.clone());

                if let Some(successor_id) = successor {
                    if let Some(successor) = state.jobs.get_mut(&successor_id) {
                        successor.is_primary = true;
                        successor.updated_at = Utc::now();
                        log::debug!("Promoted job {} to primary of group {}", successor.id, group_id);
                        self.events.send(JobEvent::updated(successor, successor.status));
                    }
                }
            }
        }

        self.events.send(JobEvent::removed(&job));
        Some(job)
    }

    /// Finds the inbox job a file that appeared in the completion root belongs to.
    ///
    /// Matches on the relative path first, then on the file name alone.
    pub fn find_for_completed(&self, relative_path: &Path) -> Option<Job> {
        let state = self.lock();

        if let Some(job) = state
            .paths
            .get(&(SourceRoot::Inbox, relative_path.to_path_buf()))
            .and_then(|id| state.jobs.get(id))
            .filter(|j| j.status != JobStatus::Completed)
        {
            return Some(job.clone());
        }

        let file_name = relative_path.file_name()?;
        state
            .jobs
            .values()
            .filter(|j| {
                j.source_root == SourceRoot::Inbox
                    && j.status != JobStatus::Completed
                    && j.completed_path.is_none()
                    && j.relative_path.file_name() == Some(file_name)
            })
            .min_by_key(|j| j.seq)
            .cloned()
    }
}
