pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod grouping;
pub mod job;
pub mod library_hook;
pub mod logging;
pub mod movement_log;
pub mod organizer;
pub mod sanitize;
pub mod watcher;
pub mod worker;

pub use classify::{ClassificationOptions, ClassificationRequest, Classifier, DryRunClassifier, Suggestion};
pub use config::{load_config, Config, ConfigWatcher, SharedConfig};
pub use engine::Engine;
pub use error::{ClassifyError, ConfigError, ReelsortError, RegistryError, Result, StorageError, WorkerError};
pub use events::{JobEvent, JobEventBroadcaster, JobEventKind};
pub use job::{FailureKind, Job, JobPatch, JobRegistry, JobStatus, NewJob, SourceRoot};
pub use library_hook::{ConfiguredNotifier, LibraryNotifier, NoopNotifier, WebhookNotifier};
pub use movement_log::{MovementEntry, MovementLog, MovementStatus};
pub use organizer::{OrganizeOutcome, Organizer};
pub use worker::{QueueWorker, SubmitReason, Submitted, SweepReport, Sweeper};
