pub mod backoff;
pub mod config;
pub mod dlq;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod pool;
pub mod queue;
pub mod reaper;
pub mod runner;
pub mod storage;
pub mod worker;

pub use config::{ConfigKey, QueueConfig};
pub use error::{QueueError, Result};
pub use job::{DlqEntry, Job, JobId, JobSpec, JobState, QueueStatus};
pub use lifecycle::{ClaimedJob, FailureOutcome};
pub use queue::JobQueue;
pub use runner::{CommandOutput, CommandRunner, RunError, ShellRunner};
