mod model;
mod registry;

pub use model::{FailureKind, Job, JobPatch, JobStatus, NewJob, SourceRoot};
pub use registry::{JobCounts, JobRegistry};
