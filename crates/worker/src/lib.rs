//! docjobs job orchestration.
//!
//! - [`JobOrchestrator`]: the public job API over a bounded [`WorkerPool`].
//! - [`ProgressTracker`]: the single writer of job status and lifecycle
//!   events.
//! - [`CancellationRegistry`]: per-job cancel tokens and kill hooks.
//! - [`CommandTool`]: a tool executor that shells out to a runner program.
//! - [`cleanup::run`]: the retention sweep loop.

pub mod cancellation;
pub mod cleanup;
pub mod config;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod runner;
pub mod storage;
pub mod subprocess;
pub mod tools;

pub use cancellation::CancellationRegistry;
pub use config::WorkerConfig;
pub use orchestrator::{CleanupReport, JobOrchestrator, JobStatistics, PoolOptions, SubmitReceipt};
pub use pool::WorkerPool;
pub use progress::{CancelRequest, JobProgressSink, ProgressTracker};
pub use runner::{JobRunner, QueuedJob, RetryPolicy};
pub use storage::{LocalOutputStorage, OutputStorage};
pub use tools::CommandTool;
