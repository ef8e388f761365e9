//! Job state writes and the lifecycle events they produce.
//!
//! [`ProgressTracker`] is the only writer of job status. Each method is one
//! optimistic read-modify-write through [`update_with`], so concurrent
//! callers (a worker finishing a job while a user cancels it) serialize on
//! the row `version` and exactly one terminal transition ever commits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use docjobs_core::{CoreError, EventKind, JobRecord, JobStatus, Outcome, ProgressSink};
use docjobs_db::{update_with, JobStore, WriteOutcome};
use docjobs_events::{EventBus, JobEvent};

/// What [`ProgressTracker::request_cancel`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelRequest {
    /// The job had not started and is now CANCELLED.
    CancelledPending(JobRecord),
    /// The job is PROCESSING and `cancelRequested` is set.
    Signalled(JobRecord),
    /// The job was already terminal; nothing changed.
    AlreadyTerminal(JobRecord),
    Missing,
}

fn terminal_event(status: JobStatus) -> Option<EventKind> {
    match status {
        JobStatus::Completed => Some(EventKind::JobCompleted),
        JobStatus::Failed => Some(EventKind::JobFailed),
        JobStatus::Cancelled => Some(EventKind::JobCancelled),
        JobStatus::Pending | JobStatus::Processing => None,
    }
}

pub struct ProgressTracker {
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    fn emit(&self, kind: EventKind, job: &JobRecord) {
        self.bus.publish(JobEvent::from_record(kind, job));
    }

    /// Record progress on a PROCESSING job.
    ///
    /// Returns `false` without writing when the job is not PROCESSING (not
    /// yet started, already terminal, or unknown).
    pub async fn update(&self, job_id: &str, percent: u8, message: &str) -> Result<bool, CoreError> {
        let outcome = update_with(self.store.as_ref(), job_id, |job| job.advance(percent, message)).await?;
        match outcome {
            WriteOutcome::Modified(job) => {
                self.emit(EventKind::JobProgress, &job);
                Ok(true)
            }
            WriteOutcome::Unchanged(job) => {
                tracing::debug!(job_id = %job_id, status = %job.status, "Ignoring progress for job that is not processing");
                Ok(false)
            }
            WriteOutcome::Missing => Ok(false),
        }
    }

    /// PENDING -> PROCESSING. `None` when the job was cancelled (or had a
    /// cancel requested) before it could start.
    pub async fn mark_started(&self, job_id: &str) -> Result<Option<JobRecord>, CoreError> {
        let now = Utc::now();
        match update_with(self.store.as_ref(), job_id, |job| job.start(now)).await? {
            WriteOutcome::Modified(job) => {
                tracing::info!(job_id = %job_id, tool = %job.tool_name, "Job started");
                self.emit(EventKind::JobStarted, &job);
                Ok(Some(job))
            }
            WriteOutcome::Unchanged(job) => {
                tracing::info!(
                    job_id = %job_id,
                    status = %job.status,
                    cancel_requested = job.cancel_requested,
                    "Job not runnable, skipping start"
                );
                Ok(None)
            }
            WriteOutcome::Missing => {
                tracing::warn!(job_id = %job_id, "Job vanished before start");
                Ok(None)
            }
        }
    }

    /// Move a PROCESSING job to its terminal state.
    ///
    /// Idempotent: once a terminal state has been written, later calls are
    /// logged and return `None`.
    pub async fn mark_terminal(
        &self,
        job_id: &str,
        outcome: Outcome,
    ) -> Result<Option<JobRecord>, CoreError> {
        let now = Utc::now();
        let written = update_with(self.store.as_ref(), job_id, |job| {
            job.finish(outcome.clone(), now)
        })
        .await?;

        match written {
            WriteOutcome::Modified(job) => {
                match job.status {
                    JobStatus::Failed => tracing::warn!(
                        job_id = %job_id,
                        tool = %job.tool_name,
                        error_code = job.error_code.map(|c| c.as_str()).unwrap_or_default(),
                        error = job.error_message.as_deref().unwrap_or_default(),
                        "Job failed"
                    ),
                    status => tracing::info!(job_id = %job_id, tool = %job.tool_name, %status, "Job finished"),
                }
                if let Some(kind) = terminal_event(job.status) {
                    self.emit(kind, &job);
                }
                if job.result_url().is_some() {
                    self.emit(EventKind::FileReady, &job);
                }
                Ok(Some(job))
            }
            WriteOutcome::Unchanged(job) => {
                tracing::info!(
                    job_id = %job_id,
                    status = %job.status,
                    attempted = %outcome.status(),
                    "Ignoring terminal write for job already in a final state"
                );
                Ok(None)
            }
            WriteOutcome::Missing => {
                tracing::warn!(job_id = %job_id, "Terminal write for unknown job");
                Ok(None)
            }
        }
    }

    /// PENDING -> CANCELLED. `None` when the job is no longer PENDING.
    pub async fn cancel_pending(&self, job_id: &str) -> Result<Option<JobRecord>, CoreError> {
        let now = Utc::now();
        let written = update_with(self.store.as_ref(), job_id, |job| {
            if job.status != JobStatus::Pending {
                return false;
            }
            job.cancel_requested = true;
            job.finish(Outcome::Cancelled, now)
        })
        .await?;

        Ok(written.modified().inspect(|job| {
            tracing::info!(job_id = %job_id, "Pending job cancelled");
            self.emit(EventKind::JobCancelled, job);
        }))
    }

    /// Cancel a PENDING job outright, or flag a PROCESSING one.
    pub async fn request_cancel(&self, job_id: &str) -> Result<CancelRequest, CoreError> {
        let now = Utc::now();
        let written = update_with(self.store.as_ref(), job_id, |job| match job.status {
            JobStatus::Pending => {
                job.cancel_requested = true;
                job.finish(Outcome::Cancelled, now)
            }
            JobStatus::Processing if !job.cancel_requested => {
                job.cancel_requested = true;
                true
            }
            _ => false,
        })
        .await?;

        Ok(match written {
            WriteOutcome::Missing => CancelRequest::Missing,
            WriteOutcome::Modified(job) if job.status == JobStatus::Cancelled => {
                tracing::info!(job_id = %job_id, "Pending job cancelled");
                self.emit(EventKind::JobCancelled, &job);
                CancelRequest::CancelledPending(job)
            }
            WriteOutcome::Modified(job) => {
                tracing::info!(job_id = %job_id, "Cancellation requested for running job");
                CancelRequest::Signalled(job)
            }
            WriteOutcome::Unchanged(job) if job.is_terminal() => CancelRequest::AlreadyTerminal(job),
            // PROCESSING with the flag already set.
            WriteOutcome::Unchanged(job) => CancelRequest::Signalled(job),
        })
    }
}

// ---------------------------------------------------------------------------
// ProgressSink adapter
// ---------------------------------------------------------------------------

/// The [`ProgressSink`] handed to a tool executor for one job.
pub struct JobProgressSink {
    tracker: Arc<ProgressTracker>,
    job_id: String,
}

impl JobProgressSink {
    pub fn new(tracker: Arc<ProgressTracker>, job_id: impl Into<String>) -> Self {
        Self {
            tracker,
            job_id: job_id.into(),
        }
    }
}

#[async_trait]
impl ProgressSink for JobProgressSink {
    async fn report(&self, percent: u8, message: &str) {
        if let Err(e) = self.tracker.update(&self.job_id, percent, message).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to record progress");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use docjobs_core::{JobErrorCode, JobResult, RESULT_URL_KEY};
    use docjobs_db::MemoryJobStore;
    use tokio::sync::broadcast;

    use super::*;

    async fn setup() -> (Arc<ProgressTracker>, Arc<MemoryJobStore>, broadcast::Receiver<JobEvent>, JobRecord) {
        let store = Arc::new(MemoryJobStore::new());
        let bus = Arc::new(EventBus::default());
        let rx = bus.subscribe();
        let job = JobRecord::new("merge", "/in.pdf", serde_json::Value::Null);
        store.insert(&job).await.unwrap();
        let tracker = Arc::new(ProgressTracker::new(store.clone(), bus));
        (tracker, store, rx, job)
    }

    fn drain(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn progress_before_start_is_ignored() {
        let (tracker, store, mut rx, job) = setup().await;
        assert!(!tracker.update(&job.id, 50, "early").await.unwrap());
        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress_percent, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let (tracker, store, mut rx, job) = setup().await;
        tracker.mark_started(&job.id).await.unwrap().unwrap();
        assert!(tracker.update(&job.id, 60, "a").await.unwrap());
        assert!(tracker.update(&job.id, 30, "b").await.unwrap());

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress_percent, 60);
        assert_eq!(
            drain(&mut rx),
            vec![EventKind::JobStarted, EventKind::JobProgress, EventKind::JobProgress]
        );
    }

    #[tokio::test]
    async fn terminal_write_happens_once() {
        let (tracker, store, mut rx, job) = setup().await;
        tracker.mark_started(&job.id).await.unwrap();

        let mut result = JobResult::new();
        result.insert(RESULT_URL_KEY.into(), "/files/out.pdf".into());
        let first = tracker
            .mark_terminal(&job.id, Outcome::Completed(result))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = tracker
            .mark_terminal(
                &job.id,
                Outcome::Failed {
                    code: JobErrorCode::Timeout,
                    message: "late".into(),
                },
            )
            .await
            .unwrap();
        assert!(second.is_none());

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress_percent, 100);
        assert!(stored.error_code.is_none());
        assert_eq!(
            drain(&mut rx),
            vec![EventKind::JobStarted, EventKind::JobCompleted, EventKind::FileReady]
        );
        assert!(!tracker.update(&job.id, 100, "after").await.unwrap());
    }

    #[tokio::test]
    async fn cancel_pending_blocks_start() {
        let (tracker, _store, mut rx, job) = setup().await;
        assert_matches!(
            tracker.request_cancel(&job.id).await.unwrap(),
            CancelRequest::CancelledPending(j) if j.status == JobStatus::Cancelled
        );
        assert!(tracker.mark_started(&job.id).await.unwrap().is_none());
        assert!(tracker.cancel_pending(&job.id).await.unwrap().is_none());
        assert_eq!(drain(&mut rx), vec![EventKind::JobCancelled]);
    }

    #[tokio::test]
    async fn cancel_processing_only_sets_flag() {
        let (tracker, _store, _rx, job) = setup().await;
        tracker.mark_started(&job.id).await.unwrap();

        assert_matches!(
            tracker.request_cancel(&job.id).await.unwrap(),
            CancelRequest::Signalled(j) if j.cancel_requested && j.status == JobStatus::Processing
        );
        assert_matches!(
            tracker.request_cancel(&job.id).await.unwrap(),
            CancelRequest::Signalled(_)
        );

        tracker.mark_terminal(&job.id, Outcome::Cancelled).await.unwrap();
        assert_matches!(
            tracker.request_cancel(&job.id).await.unwrap(),
            CancelRequest::AlreadyTerminal(_)
        );
        assert_matches!(tracker.request_cancel("nope").await.unwrap(), CancelRequest::Missing);
    }
}
