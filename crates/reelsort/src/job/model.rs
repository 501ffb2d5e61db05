use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::ClassificationOptions;

/// Lifecycle of a job.
///
/// ```text
/// QueuedForAi -> ProcessingAi -> PendingCompletion -> Completed
///                     |                 |
///                     +----> Failed <---+
/// ManualEdit always falls straight back to PendingCompletion.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    QueuedForAi,
    ProcessingAi,
    PendingCompletion,
    Completed,
    Failed,
    ManualEdit,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::QueuedForAi,
        JobStatus::ProcessingAi,
        JobStatus::PendingCompletion,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::ManualEdit,
    ];

    /// Whether a regular update may move a job from `self` to `next`.
    ///
    /// Re-entering `QueuedForAi` is not an update; it goes through
    /// [`crate::job::JobRegistry::requeue`].
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (QueuedForAi, ProcessingAi)
                | (QueuedForAi, ManualEdit)
                | (ProcessingAi, PendingCompletion)
                | (ProcessingAi, Failed)
                | (ProcessingAi, ManualEdit)
                | (PendingCompletion, Completed)
                | (PendingCompletion, Failed)
                | (PendingCompletion, ManualEdit)
                | (ManualEdit, PendingCompletion)
                | (Failed, ProcessingAi)
                | (Failed, ManualEdit)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::QueuedForAi => "queued_for_ai",
            JobStatus::ProcessingAi => "processing_ai",
            JobStatus::PendingCompletion => "pending_completion",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::ManualEdit => "manual_edit",
        };
        f.write_str(s)
    }
}

/// The watched folder a job was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRoot {
    Inbox,
    Completion,
    Staging,
}

impl SourceRoot {
    pub const ALL: [SourceRoot; 3] = [SourceRoot::Inbox, SourceRoot::Completion, SourceRoot::Staging];

    /// Files in this root are complete the moment they are detected.
    pub fn file_is_final(self) -> bool {
        matches!(self, SourceRoot::Completion | SourceRoot::Staging)
    }
}

impl fmt::Display for SourceRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRoot::Inbox => f.write_str("inbox"),
            SourceRoot::Completion => f.write_str("completion"),
            SourceRoot::Staging => f.write_str("staging"),
        }
    }
}

/// Which step produced a `Failed` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Gateway error or unusable response. Retried automatically.
    Classification,
    /// The move into the library failed. Needs an operator.
    Organize,
}

/// One tracked file on its way from a watched root into the library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    /// Absolute path where the file was detected.
    pub source_path: PathBuf,
    /// Path relative to the watched root.
    pub relative_path: PathBuf,
    pub source_root: SourceRoot,
    pub status: JobStatus,
    /// Suggested library-relative path (may contain subfolders).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_determined_name: Option<String>,
    /// Library-relative path that wins over the suggestion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_override: Option<PathBuf>,
    /// 0-100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub priority: bool,
    pub options: ClassificationOptions,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_since: Option<DateTime<Utc>>,
    /// Where the finished file was seen; organization waits for this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_path: Option<PathBuf>,
    /// Where the file ended up in the library.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub is_primary: bool,
    /// Registry insertion order; lower is older.
    pub seq: u64,
}

impl Job {
    pub fn filename(&self) -> String {
        self.relative_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Terminal jobs are never picked up again without an explicit request.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed => true,
            JobStatus::Failed => !self.is_retry_eligible(),
            _ => false,
        }
    }

    pub fn is_retry_eligible(&self) -> bool {
        self.status == JobStatus::Failed
            && self.failure == Some(FailureKind::Classification)
            && self.retry_count < self.max_retries
    }

    pub fn is_secondary(&self) -> bool {
        self.group_id.is_some() && !self.is_primary
    }

    /// Path at which the physical file is currently expected to exist.
    pub fn expected_path(&self) -> &Path {
        self.completed_path.as_deref().unwrap_or(&self.source_path)
    }

    /// Library-relative destination: override, then suggestion, then the original name.
    pub fn destination_relative(&self) -> PathBuf {
        if let Some(path) = &self.destination_override {
            return path.clone();
        }
        match &self.ai_determined_name {
            Some(name) => PathBuf::from(name),
            None => PathBuf::from(self.filename()),
        }
    }
}

/// Everything needed to register a freshly detected file.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub source_path: PathBuf,
    pub relative_path: PathBuf,
    pub source_root: SourceRoot,
    pub options: ClassificationOptions,
    pub max_retries: u32,
}

impl NewJob {
    pub fn new(
        source_path: impl Into<PathBuf>,
        relative_path: impl Into<PathBuf>,
        source_root: SourceRoot,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            relative_path: relative_path.into(),
            source_root,
            options: ClassificationOptions::default(),
            max_retries: 3,
        }
    }

    pub fn with_options(mut self, options: ClassificationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub(crate) fn into_job(self, seq: u64, now: DateTime<Utc>) -> Job {
        let completed_path = if self.source_root.file_is_final() {
            Some(self.source_path.clone())
        } else {
            None
        };

        Job {
            id: uuid::Uuid::new_v4().to_string(),
            source_path: self.source_path,
            relative_path: self.relative_path,
            source_root: self.source_root,
            status: JobStatus::QueuedForAi,
            ai_determined_name: None,
            destination_override: None,
            confidence: None,
            error_message: None,
            failure: None,
            created_at: now,
            updated_at: now,
            priority: false,
            options: self.options,
            retry_count: 0,
            max_retries: self.max_retries,
            missing_since: None,
            completed_path,
            final_path: None,
            group_id: None,
            is_primary: true,
            seq,
        }
    }
}

/// Partial update applied atomically by the registry.
///
/// `Some(None)` clears a nullable field, `None` leaves it alone.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub ai_determined_name: Option<Option<String>>,
    pub destination_override: Option<Option<PathBuf>>,
    pub confidence: Option<Option<u8>>,
    pub error_message: Option<Option<String>>,
    pub failure: Option<Option<FailureKind>>,
    pub priority: Option<bool>,
    pub bump_retry: bool,
    pub missing_since: Option<Option<DateTime<Utc>>>,
    pub completed_path: Option<Option<PathBuf>>,
    pub final_path: Option<Option<PathBuf>>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Successful classification.
    pub fn classified(name: String, confidence: u8) -> Self {
        Self {
            status: Some(JobStatus::PendingCompletion),
            ai_determined_name: Some(Some(name)),
            confidence: Some(Some(confidence)),
            error_message: Some(None),
            failure: Some(None),
            priority: Some(false),
            ..Default::default()
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error_message: Some(Some(message.into())),
            failure: Some(Some(kind)),
            bump_retry: kind == FailureKind::Classification,
            priority: Some(false),
            ..Default::default()
        }
    }

    /// The file is in the library at `final_path`.
    pub fn completed(final_path: PathBuf) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            final_path: Some(Some(final_path)),
            error_message: Some(None),
            failure: Some(None),
            missing_since: Some(None),
            ..Default::default()
        }
    }

    pub fn with_destination_override(mut self, path: Option<PathBuf>) -> Self {
        self.destination_override = Some(path);
        self
    }

    pub(crate) fn apply(self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(v) = self.ai_determined_name {
            job.ai_determined_name = v;
        }
        if let Some(v) = self.destination_override {
            job.destination_override = v;
        }
        if let Some(v) = self.confidence {
            job.confidence = v.map(|c| c.min(100));
        }
        if let Some(v) = self.error_message {
            job.error_message = v;
        }
        if let Some(v) = self.failure {
            job.failure = v;
        }
        if let Some(v) = self.priority {
            job.priority = v;
        }
        if self.bump_retry {
            job.retry_count = (job.retry_count + 1).min(job.max_retries);
        }
        if let Some(v) = self.missing_since {
            job.missing_since = v;
        }
        if let Some(v) = self.completed_path {
            job.completed_path = v;
        }
        if let Some(v) = self.final_path {
            job.final_path = v;
        }
        job.updated_at = now;
    }
}
