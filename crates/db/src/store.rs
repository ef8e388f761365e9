//! The `JobStore` persistence contract and the optimistic write helper.
//!
//! Every mutation of a job goes through [`update_with`]: read the row, apply
//! a closure to a copy, then write it back only if the stored `version` is
//! still the one that was read. Conflicting writers simply retry against the
//! fresh row, so two callers can never both move a job out of the same state.

use std::collections::BTreeMap;

use async_trait::async_trait;
use docjobs_core::{CoreError, JobRecord, JobStatus, Timestamp};
use serde::{Deserialize, Serialize};

/// Maximum page size for job listing.
pub const MAX_LIMIT: i64 = 100;

/// Default page size for job listing.
pub const DEFAULT_LIMIT: i64 = 50;

/// Attempts [`update_with`] makes before giving up on a contended row.
pub const MAX_WRITE_ATTEMPTS: u32 = 8;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job row {id}: {message}")]
    Decode { id: String, message: String },

    #[error("Job {id} still contended after {attempts} write attempts")]
    Contended { id: String, attempts: u32 },
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Contended { .. } => CoreError::Conflict(err.to_string()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Queries and aggregates
// ---------------------------------------------------------------------------

/// Filters for [`JobStore::list`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub tool_name: Option<String>,
    /// Only jobs whose `createdAt` is at or after this instant.
    pub created_after: Option<Timestamp>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

impl JobQuery {
    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self
                .tool_name
                .as_deref()
                .map_or(true, |t| job.tool_name.eq_ignore_ascii_case(t))
            && self.created_after.map_or(true, |at| job.created_at >= at)
    }
}

/// Raw aggregates the store computes for job statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub count_by_status: BTreeMap<JobStatus, u64>,
    /// Mean `completedAt - startedAt` over COMPLETED jobs.
    pub average_duration_ms: Option<f64>,
    pub average_duration_ms_by_tool: BTreeMap<String, f64>,
    /// COMPLETED jobs whose `completedAt` is at or after the `since` cutoff.
    pub completed_since: u64,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Persistence for job records.
///
/// Implementations must make [`update`](Self::update) an atomic
/// compare-and-swap on `version`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Write `job` if the stored version equals `job.version`.
    ///
    /// Returns the stored record (with its bumped version) on success and
    /// `None` when the row is missing or was modified concurrently.
    async fn update(&self, job: &JobRecord) -> Result<Option<JobRecord>, StoreError>;

    /// Newest `createdAt` first.
    async fn list(&self, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError>;

    async fn stats(&self, since: Timestamp) -> Result<JobStats, StoreError>;

    /// The most recently completed COMPLETED job with this tool (compared
    /// case-insensitively), input and parameters.
    async fn find_completed(
        &self,
        tool_name: &str,
        input_ref: &str,
        parameters: &serde_json::Value,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Terminal jobs whose `completedAt` is strictly before `cutoff`.
    async fn find_expired(&self, cutoff: Timestamp) -> Result<Vec<JobRecord>, StoreError>;

    /// Delete a job only if it is terminal. Returns whether a row was removed.
    async fn delete_terminal(&self, id: &str) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// Optimistic write helper
// ---------------------------------------------------------------------------

/// Result of [`update_with`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The closure changed the record and the write was committed.
    Modified(JobRecord),
    /// The closure declined to change the record. Carries the current row.
    Unchanged(JobRecord),
    /// No job with that id.
    Missing,
}

impl WriteOutcome {
    pub fn modified(self) -> Option<JobRecord> {
        match self {
            Self::Modified(job) => Some(job),
            _ => None,
        }
    }
}

/// Read-modify-write a job under optimistic concurrency.
///
/// `mutate` returns `false` to leave the record alone. It may run more than
/// once when writers race, always against the latest stored row.
pub async fn update_with<F>(
    store: &dyn JobStore,
    id: &str,
    mut mutate: F,
) -> Result<WriteOutcome, StoreError>
where
    F: FnMut(&mut JobRecord) -> bool + Send,
{
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let Some(current) = store.get(id).await? else {
            return Ok(WriteOutcome::Missing);
        };
        let mut next = current.clone();
        if !mutate(&mut next) {
            return Ok(WriteOutcome::Unchanged(current));
        }
        if let Some(saved) = store.update(&next).await? {
            return Ok(WriteOutcome::Modified(saved));
        }
        tracing::debug!(job_id = %id, attempt, "Job write conflict, retrying");
        tokio::task::yield_now().await;
    }
    Err(StoreError::Contended {
        id: id.to_string(),
        attempts: MAX_WRITE_ATTEMPTS,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
