/// Job identifiers are opaque strings (UUIDv7, time-ordered).
pub type JobId = String;

/// Webhook subscription identifiers are opaque strings (UUIDv4).
pub type WebhookId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a new job id.
pub fn new_job_id() -> JobId {
    uuid::Uuid::now_v7().to_string()
}

/// Generate a new webhook id.
pub fn new_webhook_id() -> WebhookId {
    uuid::Uuid::new_v4().to_string()
}
