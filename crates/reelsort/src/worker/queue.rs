//! Single-flight classification queue.
//!
//! Every tick picks at most one unit of work, in this order:
//!
//! 1. the oldest queued priority job, on its own;
//! 2. the oldest queued primary whose whole group is queued (or a lone job);
//! 3. the oldest failed job that may still be retried.
//!
//! When queued work has been waiting longer than the stall threshold without
//! anything being submitted, the oldest non-blocked queued job is forced out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn};

use crate::classify::{match_results, ClassificationRequest, Classifier, Suggestion};
use crate::config::SharedConfig;
use crate::error::ClassifyError;
use crate::job::{FailureKind, Job, JobPatch, JobRegistry, JobStatus};
use crate::organizer::Organizer;
use crate::sanitize::{redact_path, safe_relative_path};

/// Why a unit of work was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitReason {
    Priority,
    Regular,
    Retry,
    Stalled,
}

/// Jobs submitted together in one classification call. The first job leads:
/// its options are used and, for a group, it is the primary.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub reason: SubmitReason,
    pub jobs: Vec<Job>,
}

impl WorkUnit {
    fn new(reason: SubmitReason, jobs: Vec<Job>) -> Self {
        Self { reason, jobs }
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.id.clone()).collect()
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub reason: SubmitReason,
    pub job_ids: Vec<String>,
    pub succeeded: bool,
}

pub struct QueueWorker {
    registry: Arc<JobRegistry>,
    classifier: Arc<dyn Classifier>,
    organizer: Arc<Organizer>,
    config: SharedConfig,
    waiting_since: Option<DateTime<Utc>>,
}

impl QueueWorker {
    pub fn new(
        registry: Arc<JobRegistry>,
        classifier: Arc<dyn Classifier>,
        organizer: Arc<Organizer>,
        config: SharedConfig,
    ) -> Self {
        Self {
            registry,
            classifier,
            organizer,
            config,
            waiting_since: None,
        }
    }

    /// When queued work started waiting without a submission, if it is.
    pub fn waiting_since(&self) -> Option<DateTime<Utc>> {
        self.waiting_since
    }

    pub fn tick(&mut self) -> Option<Submitted> {
        self.tick_at(Utc::now())
    }

    /// Runs one scheduling round as of `now`.
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> Option<Submitted> {
        let snapshot = self.registry.snapshot();

        if let Some(unit) = select(&snapshot) {
            self.waiting_since = None;
            return Some(self.submit(unit));
        }

        let has_queued = snapshot.iter().any(|j| j.status == JobStatus::QueuedForAi);
        if !has_queued {
            self.waiting_since = None;
            return None;
        }

        let since = *self.waiting_since.get_or_insert(now);
        let threshold = self.config.current().stall_threshold();
        if now - since < threshold {
            return None;
        }

        match select_stalled(&snapshot) {
            Some(unit) => {
                warn!(
                    "Queue stalled since {}, forcing submission of {} job(s)",
                    since,
                    unit.jobs.len()
                );
                self.waiting_since = None;
                Some(self.submit(unit))
            }
            None => None,
        }
    }

    /// Classifies a unit and records the outcome on every member.
    pub fn submit(&mut self, unit: WorkUnit) -> Submitted {
        let reason = unit.reason;
        let mut in_flight: Vec<Job> = Vec::with_capacity(unit.jobs.len());
        for job in &unit.jobs {
            match self.registry.update_if(
                &job.id,
                &[JobStatus::QueuedForAi, JobStatus::Failed],
                JobPatch::status(JobStatus::ProcessingAi),
            ) {
                Ok(Some(job)) => in_flight.push(job),
                Ok(None) => debug!("Job {} moved on before submission", job.id),
                Err(e) => warn!("Could not start job {}: {}", job.id, e),
            }
        }

        let job_ids: Vec<String> = in_flight.iter().map(|j| j.id.clone()).collect();
        let Some(lead) = in_flight.first() else {
            return Submitted {
                reason,
                job_ids,
                succeeded: false,
            };
        };

        let _span = info_span!("classify",
            reason = ?reason,
            jobs = in_flight.len(),
            lead = %redact_path(&lead.relative_path),
            classifier = self.classifier.name(),
        )
        .entered();

        let request = ClassificationRequest {
            inputs: in_flight.iter().map(|j| j.relative_path.clone()).collect(),
            options: lead.options.clone(),
        };

        let outcome = self
            .classifier
            .classify(&request)
            .and_then(|results| match_results(&request.inputs, results));

        let succeeded = match outcome {
            Ok(results) => {
                self.apply_results(&in_flight, results);
                true
            }
            Err(e) => {
                self.fail_all(&in_flight, &e);
                false
            }
        };

        Submitted {
            reason,
            job_ids,
            succeeded,
        }
    }

    fn fail_all(&self, jobs: &[Job], err: &ClassifyError) {
        for job in jobs {
            match self.registry.update_if(
                &job.id,
                &[JobStatus::ProcessingAi],
                JobPatch::failed(FailureKind::Classification, err.to_string()),
            ) {
                Ok(Some(failed)) => warn!(
                    "Classification failed for {} (attempt {}/{}): {}",
                    redact_path(&failed.relative_path),
                    failed.retry_count,
                    failed.max_retries,
                    err
                ),
                Ok(None) => debug!("Discarding failure for job {}, it moved on", job.id),
                Err(e) => warn!("Could not record failure for job {}: {}", job.id, e),
            }
        }
    }

    fn apply_results(&self, jobs: &[Job], results: HashMap<PathBuf, Suggestion>) {
        // Library-relative names, sanitized
        let names: HashMap<&str, Option<PathBuf>> = jobs
            .iter()
            .map(|job| {
                let name = results
                    .get(&job.relative_path)
                    .and_then(|s| safe_relative_path(&s.suggested_name));
                (job.id.as_str(), name)
            })
            .collect();

        for job in jobs {
            let Some(suggestion) = results.get(&job.relative_path) else {
                continue;
            };
            let Some(name) = names.get(job.id.as_str()).cloned().flatten() else {
                let err = ClassifyError::MalformedResponse(format!(
                    "unusable suggested name '{}'",
                    suggestion.suggested_name
                ));
                self.fail_all(std::slice::from_ref(job), &err);
                continue;
            };

            let destination_override = if job.is_secondary() {
                self.primary_directory(job, jobs, &names)
                    .map(|dir| dir.join(name.file_name().unwrap_or(name.as_os_str())))
            } else {
                None
            };

            let patch = JobPatch::classified(
                name.to_string_lossy().to_string(),
                suggestion.confidence.min(100),
            )
            .with_destination_override(destination_override);

            match self
                .registry
                .update_if(&job.id, &[JobStatus::ProcessingAi], patch)
            {
                Ok(Some(updated)) => {
                    info!(
                        "Classified {} as {} ({}%)",
                        redact_path(&updated.relative_path),
                        updated.destination_relative().display(),
                        suggestion.confidence.min(100)
                    );
                    if updated.completed_path.is_some() {
                        self.organizer.organize(&updated.id);
                    }
                }
                Ok(None) => debug!("Discarding result for job {}, it moved on", job.id),
                Err(e) => warn!("Could not record result for job {}: {}", job.id, e),
            }
        }
    }

    /// Destination directory of a secondary's primary: from this batch when
    /// the primary was classified alongside, otherwise from the registry.
    fn primary_directory(
        &self,
        secondary: &Job,
        batch: &[Job],
        names: &HashMap<&str, Option<PathBuf>>,
    ) -> Option<PathBuf> {
        let group_id = secondary.group_id.as_deref()?;

        if let Some(primary) = batch
            .iter()
            .find(|j| j.is_primary && j.group_id.as_deref() == Some(group_id))
        {
            let name = names.get(primary.id.as_str())?.as_ref()?;
            return Some(parent_of(name));
        }

        let primary = self
            .registry
            .by_group(group_id)
            .into_iter()
            .find(|j| j.is_primary)?;
        if primary.destination_override.is_none() && primary.ai_determined_name.is_none() {
            return None;
        }
        Some(parent_of(&primary.destination_relative()))
    }
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn group_members<'a>(snapshot: &'a [Job], group_id: &str) -> impl Iterator<Item = &'a Job> + 'a {
    let group_id = group_id.to_string();
    snapshot
        .iter()
        .filter(move |j| j.group_id.as_deref() == Some(group_id.as_str()))
}

/// Lead first, then siblings oldest first.
fn lead_first(lead: &Job, mut siblings: Vec<Job>) -> Vec<Job> {
    siblings.retain(|j| j.id != lead.id);
    siblings.sort_by_key(|j| j.seq);
    let mut jobs = Vec::with_capacity(siblings.len() + 1);
    jobs.push(lead.clone());
    jobs.extend(siblings);
    jobs
}

/// Regular selection. `snapshot` must be ordered oldest first.
pub fn select(snapshot: &[Job]) -> Option<WorkUnit> {
    let queued = || snapshot.iter().filter(|j| j.status == JobStatus::QueuedForAi);

    if let Some(job) = queued().find(|j| j.priority) {
        return Some(WorkUnit::new(SubmitReason::Priority, vec![job.clone()]));
    }

    for job in queued().filter(|j| !j.priority && j.is_primary) {
        let Some(group_id) = job.group_id.as_deref() else {
            return Some(WorkUnit::new(SubmitReason::Regular, vec![job.clone()]));
        };

        let members: Vec<Job> = group_members(snapshot, group_id).cloned().collect();
        let complete = members
            .iter()
            .all(|m| m.status == JobStatus::QueuedForAi && !m.priority);
        if complete {
            return Some(WorkUnit::new(SubmitReason::Regular, lead_first(job, members)));
        }
    }

    let failed = snapshot.iter().find(|j| j.is_retry_eligible())?;
    let siblings: Vec<Job> = match (&failed.group_id, failed.is_primary) {
        (Some(group_id), true) => group_members(snapshot, group_id)
            .filter(|m| m.is_retry_eligible())
            .cloned()
            .collect(),
        _ => Vec::new(),
    };
    Some(WorkUnit::new(SubmitReason::Retry, lead_first(failed, siblings)))
}

/// Forced selection after a stall: the oldest queued job that is not a
/// secondary waiting on a still-queued primary. A primary takes its queued
/// siblings along.
pub fn select_stalled(snapshot: &[Job]) -> Option<WorkUnit> {
    let queued_primary = |group_id: &str| {
        group_members(snapshot, group_id)
            .any(|m| m.is_primary && m.status == JobStatus::QueuedForAi)
    };

    let job = snapshot.iter().find(|j| {
        j.status == JobStatus::QueuedForAi
            && !(j.is_secondary() && j.group_id.as_deref().is_some_and(queued_primary))
    })?;

    let siblings: Vec<Job> = match (&job.group_id, job.is_primary) {
        (Some(group_id), true) => group_members(snapshot, group_id)
            .filter(|m| m.status == JobStatus::QueuedForAi && !m.priority)
            .cloned()
            .collect(),
        _ => Vec::new(),
    };
    Some(WorkUnit::new(SubmitReason::Stalled, lead_first(job, siblings)))
}
