//! Job entity and lifecycle state machine.
//!
//! A [`JobRecord`] moves through `PENDING -> PROCESSING -> {COMPLETED,
//! FAILED, CANCELLED}`, with `PENDING -> CANCELLED` allowed for jobs that are
//! cancelled before a worker picks them up. Terminal states have no exits.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{new_job_id, JobId, Timestamp};

/// Result payload of a completed job: an opaque JSON object.
pub type JobResult = serde_json::Map<String, serde_json::Value>;

/// Key under which tools publish the download location of their output.
pub const RESULT_URL_KEY: &str = "resultUrl";

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub const TERMINAL: [JobStatus; 3] = [
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Cancelled)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::Validation(format!("Unknown job status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// JobErrorCode
// ---------------------------------------------------------------------------

/// Error code recorded on a FAILED job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobErrorCode {
    /// The tool executor returned an error or panicked.
    ProcessingError,
    /// A subprocess exceeded its deadline and was killed.
    Timeout,
}

impl JobErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessingError => "PROCESSING_ERROR",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl FromStr for JobErrorCode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING_ERROR" => Ok(Self::ProcessingError),
            "TIMEOUT" => Ok(Self::Timeout),
            other => Err(CoreError::Validation(format!(
                "Unknown job error code '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How a job ended. Consumed by [`JobRecord::finish`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(JobResult),
    Failed {
        code: JobErrorCode,
        message: String,
    },
    Cancelled,
}

impl Outcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed(_) => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn processing_error(message: impl Into<String>) -> Self {
        Self::Failed {
            code: JobErrorCode::ProcessingError,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

/// A single invocation of a named tool against one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub tool_name: String,
    pub input_ref: String,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub progress_message: String,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<JobErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    /// Optimistic-concurrency counter owned by the job store.
    #[serde(skip)]
    pub version: i64,
}

impl JobRecord {
    /// Build a fresh PENDING record.
    pub fn new(
        tool_name: impl Into<String>,
        input_ref: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            id: new_job_id(),
            tool_name: tool_name.into(),
            input_ref: input_ref.into(),
            parameters,
            status: JobStatus::Pending,
            progress_percent: 0,
            progress_message: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error_code: None,
            error_message: None,
            cancel_requested: false,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a worker may start executing this job.
    pub fn is_runnable(&self) -> bool {
        self.status == JobStatus::Pending && !self.cancel_requested
    }

    /// PENDING -> PROCESSING. Returns `false` if the transition is illegal.
    pub fn start(&mut self, now: Timestamp) -> bool {
        if !self.is_runnable() {
            return false;
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        true
    }

    /// Apply a progress update, clamping to `[current, 100]`.
    ///
    /// Returns `false` (and leaves the record untouched) unless the job is
    /// PROCESSING.
    pub fn advance(&mut self, percent: u8, message: &str) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.progress_percent = percent.clamp(self.progress_percent, 100);
        self.progress_message = message.to_string();
        true
    }

    /// Move into a terminal state. Returns `false` if the transition is
    /// illegal (already terminal, or a non-cancel outcome on a PENDING job).
    pub fn finish(&mut self, outcome: Outcome, now: Timestamp) -> bool {
        let next = outcome.status();
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.completed_at = Some(now);
        match outcome {
            Outcome::Completed(result) => {
                self.progress_percent = 100;
                self.progress_message = "Completed".to_string();
                self.result = Some(result);
            }
            Outcome::Failed { code, message } => {
                self.error_code = Some(code);
                self.progress_message = "Failed".to_string();
                self.error_message = Some(message);
            }
            Outcome::Cancelled => {
                self.progress_message = "Cancelled".to_string();
            }
        }
        true
    }

    /// Wall-clock execution time (`startedAt` to `completedAt`).
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }

    /// The `resultUrl` entry of a completed job's result, if any.
    pub fn result_url(&self) -> Option<&str> {
        self.result
            .as_ref()?
            .get(RESULT_URL_KEY)?
            .as_str()
            .filter(|url| !url.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobRecord {
        JobRecord::new("merge", "/tmp/in.pdf", serde_json::Value::Null)
    }

    // -- transitions ----------------------------------------------------------

    #[test]
    fn legal_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));
    }

    #[test]
    fn no_transition_out_of_terminal_states() {
        for from in JobStatus::TERMINAL {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn pending_cannot_complete_or_fail_directly() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<JobStatus>().is_err());
    }

    // -- record lifecycle -----------------------------------------------------

    #[test]
    fn new_record_is_pending_and_runnable() {
        let job = job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress_percent, 0);
        assert!(job.is_runnable());
        assert!(!job.id.is_empty());
    }

    #[test]
    fn cancel_requested_job_is_not_runnable() {
        let mut job = job();
        job.cancel_requested = true;
        assert!(!job.start(Utc::now()));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn advance_clamps_to_previous_and_100() {
        let mut job = job();
        assert!(!job.advance(10, "before start"));
        assert!(job.start(Utc::now()));

        assert!(job.advance(40, "halfway"));
        assert_eq!(job.progress_percent, 40);

        assert!(job.advance(20, "backwards"));
        assert_eq!(job.progress_percent, 40);
        assert_eq!(job.progress_message, "backwards");

        assert!(job.advance(250, "overflow"));
        assert_eq!(job.progress_percent, 100);
    }

    #[test]
    fn finish_completed_sets_result_and_full_progress() {
        let mut job = job();
        job.start(Utc::now());
        let mut result = JobResult::new();
        result.insert(RESULT_URL_KEY.into(), "/files/out.pdf".into());

        assert!(job.finish(Outcome::Completed(result), Utc::now()));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100);
        assert_eq!(job.result_url(), Some("/files/out.pdf"));
        assert!(job.duration().is_some());
    }

    #[test]
    fn finish_is_rejected_once_terminal() {
        let mut job = job();
        job.start(Utc::now());
        assert!(job.finish(Outcome::processing_error("boom"), Utc::now()));
        let snapshot = job.clone();

        assert!(!job.finish(Outcome::Completed(JobResult::new()), Utc::now()));
        assert_eq!(job, snapshot);
    }

    #[test]
    fn pending_job_can_only_finish_as_cancelled() {
        let mut job = job();
        assert!(!job.finish(Outcome::Completed(JobResult::new()), Utc::now()));
        assert!(job.finish(Outcome::Cancelled, Utc::now()));
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.duration().is_none());
    }

    #[test]
    fn serializes_camel_case_without_version() {
        let job = job();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["toolName"], "merge");
        assert_eq!(json["progressPercent"], 0);
        assert!(json.get("version").is_none());
        assert!(json.get("result").is_none());
    }
}
