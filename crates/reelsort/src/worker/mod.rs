pub mod queue;
pub mod sweeper;

pub use queue::{select, select_stalled, QueueWorker, SubmitReason, Submitted, WorkUnit};
pub use sweeper::{SweepReport, Sweeper};
