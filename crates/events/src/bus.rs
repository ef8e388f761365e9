//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`JobEvent`]s. It is shared
//! via `Arc<EventBus>` between the job orchestrator (publisher) and the
//! webhook dispatcher (subscriber).

use chrono::Utc;
use docjobs_core::{EventKind, JobErrorCode, JobId, JobRecord, JobResult, JobStatus, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// A lifecycle event for one job.
///
/// Its JSON form is exactly the webhook body delivered to JSON subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub job_id: JobId,
    pub tool_name: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<JobErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobEvent {
    /// Snapshot `job` as an event of `kind`, timestamped now.
    pub fn from_record(kind: EventKind, job: &JobRecord) -> Self {
        Self {
            kind,
            job_id: job.id.clone(),
            tool_name: job.tool_name.clone(),
            status: job.status,
            progress: job.progress_percent,
            message: Some(job.progress_message.clone()).filter(|m| !m.is_empty()),
            timestamp: Utc::now(),
            result: job.result.clone(),
            error_code: job.error_code,
            error_message: job.error_message.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use docjobs_core::{EventKind, JobRecord};
/// use docjobs_events::bus::{EventBus, JobEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// let job = JobRecord::new("merge", "in.pdf", serde_json::Value::Null);
/// bus.publish(JobEvent::from_record(EventKind::JobCreated, &job));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: JobEvent) {
        // A SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
