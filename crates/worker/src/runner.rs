//! Executes one dequeued job from start to terminal state.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use docjobs_core::{
    CancelToken, JobErrorCode, JobResult, Outcome, ProgressSink, ToolError, ToolExecutor,
    ToolName, ToolRequest,
};

use crate::cancellation::CancellationRegistry;
use crate::progress::{JobProgressSink, ProgressTracker};

/// A job waiting in the pool queue, with its executor already resolved.
pub struct QueuedJob {
    pub request: ToolRequest,
    pub executor: Arc<dyn ToolExecutor>,
}

/// How often a failed tool execution is repeated before the job fails.
///
/// Only generic failures (`Failed`, `Io`, a panic) are retried. Cancellation,
/// timeouts and invalid parameters end the job on the first attempt, and no
/// attempt starts once the job's token has fired. The job stays PROCESSING
/// across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const NONE: Self = Self {
        max_retries: 0,
        delay: Duration::ZERO,
    };
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

/// Result of a single executor run.
enum Attempt {
    Done(Outcome),
    Retryable(String),
}

/// Drives a [`QueuedJob`] through the tool executor.
///
/// The executor runs in its own task, so a panicking tool ends the job as
/// FAILED instead of taking the worker down with it.
pub struct JobRunner {
    tracker: Arc<ProgressTracker>,
    cancellations: Arc<CancellationRegistry>,
    retry: RetryPolicy,
}

impl JobRunner {
    pub fn new(
        tracker: Arc<ProgressTracker>,
        cancellations: Arc<CancellationRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tracker,
            cancellations,
            retry,
        }
    }

    pub async fn run(&self, job: QueuedJob) {
        let job_id = job.request.job_id.clone();
        self.execute(job).await;
        self.cancellations.release(&job_id);
    }

    async fn execute(&self, job: QueuedJob) {
        let QueuedJob { request, executor } = job;
        let job_id = request.job_id.clone();
        let token = self.cancellations.token(&job_id);

        let started = if token.is_cancelled() {
            None
        } else {
            match self.tracker.mark_started(&job_id).await {
                Ok(started) => started,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to start job");
                    return;
                }
            }
        };
        if started.is_none() {
            // Cancelled while queued. Finalize if still PENDING.
            if let Err(e) = self.tracker.cancel_pending(&job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to cancel skipped job");
            }
            return;
        }

        let sink: Arc<dyn ProgressSink> =
            Arc::new(JobProgressSink::new(Arc::clone(&self.tracker), job_id.clone()));
        let mut attempt: u32 = 0;
        let outcome = loop {
            attempt += 1;
            let message = match self.attempt(&executor, &request, &sink, &token).await {
                Attempt::Done(outcome) => break outcome,
                Attempt::Retryable(message) => message,
            };
            if attempt > self.retry.max_retries {
                break Outcome::processing_error(message);
            }

            tracing::warn!(
                job_id = %job_id,
                attempt,
                max_retries = self.retry.max_retries,
                error = %message,
                "Tool attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => break Outcome::Cancelled,
                _ = tokio::time::sleep(self.retry.delay) => {}
            }
        };

        if let Err(e) = self.tracker.mark_terminal(&job_id, outcome).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
        }
    }

    /// Run the executor once in its own task.
    async fn attempt(
        &self,
        executor: &Arc<dyn ToolExecutor>,
        request: &ToolRequest,
        sink: &Arc<dyn ProgressSink>,
        token: &CancelToken,
    ) -> Attempt {
        let job_id = request.job_id.clone();
        let tool = request.tool;
        let handle = {
            let executor = Arc::clone(executor);
            let (request, sink, token) = (request.clone(), Arc::clone(sink), token.clone());
            tokio::spawn(async move { executor.execute(request, sink, token).await })
        };

        match handle.await {
            Ok(result) => classify(tool, result),
            Err(join_err) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                tracing::error!(job_id = %job_id, %tool, panic = %message, "Tool executor panicked");
                Attempt::Retryable(format!("Tool '{tool}' panicked: {message}"))
            }
            Err(_) => Attempt::Done(Outcome::processing_error(format!(
                "Tool '{tool}' task was aborted"
            ))),
        }
    }
}

fn classify(tool: ToolName, result: Result<JobResult, ToolError>) -> Attempt {
    match result {
        Ok(result) => Attempt::Done(Outcome::Completed(result)),
        Err(ToolError::Cancelled) => Attempt::Done(Outcome::Cancelled),
        Err(ToolError::Timeout { elapsed_ms }) => Attempt::Done(Outcome::Failed {
            code: JobErrorCode::Timeout,
            message: format!("Tool '{tool}' timed out after {elapsed_ms}ms"),
        }),
        Err(e @ ToolError::InvalidParameters(_)) => {
            Attempt::Done(Outcome::processing_error(e.to_string()))
        }
        Err(e @ (ToolError::Failed { .. } | ToolError::Io(_))) => Attempt::Retryable(e.to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
