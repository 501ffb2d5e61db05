//! Job change broadcaster for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{Job, JobStatus};

/// What happened to a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Created,
    Updated,
    Removed,
}

/// Change event for a job, carrying the job as it looks afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: String,
    pub status: JobStatus,
    /// Status before an update; only set when the status changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<JobStatus>,
    pub job: Job,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn created(job: &Job) -> Self {
        Self::new(JobEventKind::Created, job, None)
    }

    pub fn updated(job: &Job, previous: JobStatus) -> Self {
        let previous_status = (previous != job.status).then_some(previous);
        Self::new(JobEventKind::Updated, job, previous_status)
    }

    pub fn removed(job: &Job) -> Self {
        Self::new(JobEventKind::Removed, job, None)
    }

    fn new(kind: JobEventKind, job: &Job, previous_status: Option<JobStatus>) -> Self {
        Self {
            kind,
            job_id: job.id.clone(),
            status: job.status,
            previous_status,
            job: job.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Broadcasts job events to any number of subscribers.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
