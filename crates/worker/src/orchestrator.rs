//! The public job API: submit, inspect, cancel, list, report, clean up.
//!
//! [`JobOrchestrator`] never blocks on execution. A submission reserves a
//! queue slot, persists the PENDING record and returns; a worker picks the
//! job up later. All status writes go through the [`ProgressTracker`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use docjobs_core::{
    CoreError, EventKind, JobId, JobRecord, JobStatus, Timestamp, ToolRegistry, ToolRequest,
};
use docjobs_db::{JobQuery, JobStore, MAX_LIMIT};
use docjobs_events::{EventBus, JobEvent};
use serde::Serialize;

use crate::cancellation::CancellationRegistry;
use crate::pool::WorkerPool;
use crate::progress::{CancelRequest, ProgressTracker};
use crate::runner::{JobRunner, QueuedJob, RetryPolicy};
use crate::storage::OutputStorage;

/// Interval between status reads in [`JobOrchestrator::wait_for_completion`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Window used for `throughputPerMinute`.
const THROUGHPUT_WINDOW_MINUTES: i64 = 60;

/// Returned by [`JobOrchestrator::submit`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Aggregate job statistics, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatistics {
    /// Every status is present, zero when no job has it.
    pub count_by_status: BTreeMap<JobStatus, u64>,
    pub average_duration_ms: Option<f64>,
    pub throughput_per_minute: f64,
    pub average_duration_ms_by_tool: BTreeMap<String, f64>,
    pub queued_tasks: usize,
    pub running_tasks: usize,
}

/// Result of one retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub deleted_jobs: u64,
    pub removed_artifacts: u64,
    /// Another sweep was already running; nothing was done.
    pub skipped: bool,
}

/// Sizing and retry behaviour for the pool started by [`JobOrchestrator::start`].
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub size: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    tools: ToolRegistry,
    bus: Arc<EventBus>,
    tracker: Arc<ProgressTracker>,
    cancellations: Arc<CancellationRegistry>,
    storage: Arc<dyn OutputStorage>,
    pool: WorkerPool,
    cleanup_lock: tokio::sync::Mutex<()>,
}

impl JobOrchestrator {
    /// Build the tracker and runner, and start the worker pool.
    pub fn start(
        store: Arc<dyn JobStore>,
        tools: ToolRegistry,
        bus: Arc<EventBus>,
        storage: Arc<dyn OutputStorage>,
        options: PoolOptions,
    ) -> Arc<Self> {
        let tracker = Arc::new(ProgressTracker::new(Arc::clone(&store), Arc::clone(&bus)));
        let cancellations = Arc::new(CancellationRegistry::new());
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&tracker),
            Arc::clone(&cancellations),
            options.retry,
        ));
        let pool = WorkerPool::start(options.size, options.queue_capacity, runner);

        Arc::new(Self {
            store,
            tools,
            bus,
            tracker,
            cancellations,
            storage,
            pool,
            cleanup_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Queue a new job and return immediately.
    pub async fn submit(
        &self,
        tool_name: &str,
        input_ref: &str,
        parameters: serde_json::Value,
    ) -> Result<SubmitReceipt, CoreError> {
        let (tool, executor) = self.tools.resolve(tool_name)?;
        let (input_ref, parameters) = normalize_input(input_ref, parameters)?;

        // Take the slot first so a full queue never leaves a PENDING row.
        let slot = self.pool.reserve()?;

        let job = JobRecord::new(tool.as_str(), &input_ref, parameters);
        self.store.insert(&job).await?;
        tracing::info!(job_id = %job.id, %tool, "Job submitted");
        self.bus
            .publish(JobEvent::from_record(EventKind::JobCreated, &job));

        slot.send(QueuedJob {
            request: ToolRequest {
                job_id: job.id.clone(),
                tool,
                input_ref: job.input_ref.clone(),
                parameters: job.parameters.clone(),
            },
            executor,
        });

        Ok(SubmitReceipt {
            job_id: job.id,
            status: job.status,
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_status(&self, job_id: &str) -> Result<JobRecord, CoreError> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| CoreError::job_not_found(job_id))
    }

    pub async fn list(&self, query: &JobQuery) -> Result<Vec<JobRecord>, CoreError> {
        Ok(self.store.list(query).await?)
    }

    /// Jobs created within the last `days` days, newest first, capped at
    /// [`MAX_LIMIT`] records.
    pub async fn recent(&self, days: u32) -> Result<Vec<JobRecord>, CoreError> {
        let since = cutoff(days)?;
        let query = JobQuery {
            created_after: Some(since),
            limit: Some(MAX_LIMIT),
            ..JobQuery::default()
        };
        Ok(self.store.list(&query).await?)
    }

    /// The newest COMPLETED job that ran the same tool on the same input
    /// with the same parameters, if any.
    ///
    /// Arguments are normalized exactly as [`submit`](Self::submit) does, so
    /// a caller can look up a prior result before queueing a repeat.
    pub async fn find_duplicate(
        &self,
        tool_name: &str,
        input_ref: &str,
        parameters: serde_json::Value,
    ) -> Result<Option<JobRecord>, CoreError> {
        let (tool, _) = self.tools.resolve(tool_name)?;
        let (input_ref, parameters) = normalize_input(input_ref, parameters)?;
        let found = self
            .store
            .find_completed(tool.as_str(), &input_ref, &parameters)
            .await?;
        if let Some(job) = &found {
            tracing::debug!(job_id = %job.id, %tool, "Duplicate of completed job found");
        }
        Ok(found)
    }

    pub async fn statistics(&self) -> Result<JobStatistics, CoreError> {
        let since = Utc::now() - chrono::Duration::minutes(THROUGHPUT_WINDOW_MINUTES);
        let stats = self.store.stats(since).await?;

        let mut count_by_status: BTreeMap<JobStatus, u64> =
            JobStatus::ALL.iter().map(|status| (*status, 0)).collect();
        count_by_status.extend(stats.count_by_status);

        Ok(JobStatistics {
            count_by_status,
            average_duration_ms: stats.average_duration_ms,
            throughput_per_minute: stats.completed_since as f64 / THROUGHPUT_WINDOW_MINUTES as f64,
            average_duration_ms_by_tool: stats.average_duration_ms_by_tool,
            queued_tasks: self.pool.queued(),
            running_tasks: self.pool.running(),
        })
    }

    /// Poll until the job is terminal or `timeout` elapses, returning the
    /// latest record either way.
    pub async fn wait_for_completion(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<JobRecord, CoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.get_status(job_id).await?;
            let now = tokio::time::Instant::now();
            if job.is_terminal() || now >= deadline {
                return Ok(job);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel a job. `false` when it had already reached a terminal state.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, CoreError> {
        match self.tracker.request_cancel(job_id).await? {
            CancelRequest::CancelledPending(_) => Ok(true),
            CancelRequest::Signalled(_) => {
                self.cancellations.cancel(job_id);
                // The worker releases its token after the terminal write. If
                // that already happened, the token created above is ours to drop.
                let finished = self
                    .store
                    .get(job_id)
                    .await?
                    .map_or(true, |job| job.is_terminal());
                if finished {
                    self.cancellations.release(job_id);
                }
                Ok(true)
            }
            CancelRequest::AlreadyTerminal(job) => {
                tracing::debug!(job_id = %job_id, status = %job.status, "Cancel ignored for finished job");
                Ok(false)
            }
            CancelRequest::Missing => Err(CoreError::job_not_found(job_id)),
        }
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Delete terminal jobs older than `retention_days` with their outputs.
    ///
    /// Single-flight: while a sweep runs, other callers get `skipped: true`.
    pub async fn cleanup(&self, retention_days: u32) -> Result<CleanupReport, CoreError> {
        let Ok(_guard) = self.cleanup_lock.try_lock() else {
            tracing::debug!("Cleanup already in progress, skipping");
            return Ok(CleanupReport {
                skipped: true,
                ..CleanupReport::default()
            });
        };

        let cutoff = cutoff(retention_days)?;
        let expired = self.store.find_expired(cutoff).await?;
        let mut report = CleanupReport::default();

        for job in expired {
            let removed = match self.storage.remove_outputs(&job).await {
                Ok(removed) => removed,
                Err(e) => {
                    // Keep the row so the next sweep retries the files.
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to remove job outputs");
                    continue;
                }
            };
            if !self.store.delete_terminal(&job.id).await? {
                continue;
            }

            report.deleted_jobs += 1;
            report.removed_artifacts += removed;
            if job.status == JobStatus::Completed && removed > 0 {
                self.bus
                    .publish(JobEvent::from_record(EventKind::FileExpired, &job));
            }
        }

        if report.deleted_jobs > 0 {
            tracing::info!(
                deleted_jobs = report.deleted_jobs,
                removed_artifacts = report.removed_artifacts,
                retention_days,
                "Expired jobs purged"
            );
        } else {
            tracing::debug!(retention_days, "No expired jobs to purge");
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Stop accepting submissions and drain the pool within `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!(
            queued = self.pool.queued(),
            running = self.pool.running(),
            "Orchestrator shutting down"
        );
        self.pool.shutdown(grace).await;
    }
}

/// Trim `input_ref` and turn null parameters into an empty object.
fn normalize_input(
    input_ref: &str,
    parameters: serde_json::Value,
) -> Result<(String, serde_json::Value), CoreError> {
    let input_ref = input_ref.trim();
    if input_ref.is_empty() {
        return Err(CoreError::Validation("inputRef must not be empty".into()));
    }
    let parameters = match parameters {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        serde_json::Value::Object(map) => serde_json::Value::Object(map),
        _ => {
            return Err(CoreError::Validation(
                "parameters must be a JSON object".into(),
            ))
        }
    };
    Ok((input_ref.to_string(), parameters))
}

/// `now - days`, or a validation error when that leaves chrono's range.
fn cutoff(days: u32) -> Result<Timestamp, CoreError> {
    chrono::Duration::try_days(i64::from(days))
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .ok_or_else(|| CoreError::Validation(format!("{days} days is out of range")))
}
