//! Webhook subscription model, event kinds, and delivery filters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{new_webhook_id, Timestamp, WebhookId};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 30;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub const MAX_RETRIES_LIMIT: u32 = 10;
pub const MAX_RETRY_DELAY_SECS: u64 = 3600;
pub const MAX_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Lifecycle events a subscription can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    JobCreated,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCancelled,
    FileReady,
    FileExpired,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::JobCreated,
        EventKind::JobStarted,
        EventKind::JobProgress,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::JobCancelled,
        EventKind::FileReady,
        EventKind::FileExpired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobCreated => "JOB_CREATED",
            Self::JobStarted => "JOB_STARTED",
            Self::JobProgress => "JOB_PROGRESS",
            Self::JobCompleted => "JOB_COMPLETED",
            Self::JobFailed => "JOB_FAILED",
            Self::JobCancelled => "JOB_CANCELLED",
            Self::FileReady => "FILE_READY",
            Self::FileExpired => "FILE_EXPIRED",
        }
    }

    /// Events that close out a job.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::JobCompleted | Self::JobFailed | Self::JobCancelled
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::Validation(format!("Unknown event type '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// ContentType
// ---------------------------------------------------------------------------

/// Body encoding used when delivering to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    #[default]
    Json,
    #[serde(alias = "FORM_URLENCODED")]
    Form,
    Xml,
}

impl ContentType {
    pub fn mime(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Form => "application/x-www-form-urlencoded",
            Self::Xml => "application/xml",
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A registered endpoint that receives lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    pub id: WebhookId,
    pub url: String,
    pub events: BTreeSet<EventKind>,
    /// HMAC signing key. Accepted on input, never echoed back.
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub active: bool,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub timeout_seconds: u64,
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub filter_job_ids: BTreeSet<String>,
    pub filter_tool_names: BTreeSet<String>,
    pub created_at: Timestamp,
    pub last_triggered_at: Option<Timestamp>,
}

impl WebhookSubscription {
    /// Validate a create request and build the subscription from it.
    pub fn create(request: CreateWebhook) -> Result<Self, CoreError> {
        let subscription = Self {
            id: new_webhook_id(),
            url: request.url.trim().to_string(),
            events: request.events.into_iter().collect(),
            secret: request.secret.filter(|s| !s.is_empty()),
            headers: request.headers,
            active: request.active,
            max_retries: request.max_retries,
            retry_delay_seconds: request.retry_delay_seconds,
            timeout_seconds: request.timeout_seconds,
            content_type: request.content_type,
            description: request.description,
            filter_job_ids: request.filter_job_ids.into_iter().collect(),
            filter_tool_names: request.filter_tool_names.into_iter().collect(),
            created_at: Utc::now(),
            last_triggered_at: None,
        };
        subscription.validate()?;
        Ok(subscription)
    }

    /// Apply a partial update. The subscription is left untouched when the
    /// merged result fails validation.
    pub fn apply(&mut self, update: UpdateWebhook) -> Result<(), CoreError> {
        let mut next = self.clone();
        if let Some(url) = update.url {
            next.url = url.trim().to_string();
        }
        if let Some(events) = update.events {
            next.events = events.into_iter().collect();
        }
        if let Some(secret) = update.secret {
            next.secret = Some(secret).filter(|s| !s.is_empty());
        }
        if let Some(headers) = update.headers {
            next.headers = headers;
        }
        if let Some(active) = update.active {
            next.active = active;
        }
        if let Some(max_retries) = update.max_retries {
            next.max_retries = max_retries;
        }
        if let Some(delay) = update.retry_delay_seconds {
            next.retry_delay_seconds = delay;
        }
        if let Some(timeout) = update.timeout_seconds {
            next.timeout_seconds = timeout;
        }
        if let Some(content_type) = update.content_type {
            next.content_type = content_type;
        }
        if let Some(description) = update.description {
            next.description = Some(description).filter(|d| !d.is_empty());
        }
        if let Some(ids) = update.filter_job_ids {
            next.filter_job_ids = ids.into_iter().collect();
        }
        if let Some(tools) = update.filter_tool_names {
            next.filter_tool_names = tools.into_iter().collect();
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| CoreError::Validation(format!("Invalid webhook URL '{}': {e}", self.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CoreError::Validation(format!(
                "Webhook URL must use http or https, got '{}'",
                parsed.scheme()
            )));
        }
        if self.events.is_empty() {
            return Err(CoreError::Validation(
                "At least one event type is required".to_string(),
            ));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_seconds) {
            return Err(CoreError::Validation(format!(
                "timeoutSeconds must be between 1 and {MAX_TIMEOUT_SECS}"
            )));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(CoreError::Validation(format!(
                "maxRetries must be at most {MAX_RETRIES_LIMIT}"
            )));
        }
        if self.retry_delay_seconds > MAX_RETRY_DELAY_SECS {
            return Err(CoreError::Validation(format!(
                "retryDelaySeconds must be at most {MAX_RETRY_DELAY_SECS}"
            )));
        }
        for (name, value) in &self.headers {
            if !is_header_name(name) {
                return Err(CoreError::Validation(format!(
                    "Invalid header name '{}'",
                    name.escape_debug()
                )));
            }
            if !is_header_value(value) {
                return Err(CoreError::Validation(format!(
                    "Invalid value for header '{name}'"
                )));
            }
        }
        Ok(())
    }

    /// Whether an event of `kind` for `job_id` / `tool_name` should be sent
    /// here. Empty filters match everything.
    pub fn matches(&self, kind: EventKind, job_id: &str, tool_name: &str) -> bool {
        self.active
            && self.events.contains(&kind)
            && (self.filter_job_ids.is_empty() || self.filter_job_ids.contains(job_id))
            && (self.filter_tool_names.is_empty()
                || self
                    .filter_tool_names
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(tool_name)))
    }

    /// Total attempts for one event: the first try plus every retry.
    pub fn max_attempts(&self) -> u32 {
        1 + self.max_retries
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// RFC 9110 `token`: one or more visible ASCII characters, no separators.
fn is_header_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

/// No control characters other than horizontal tab.
fn is_header_value(value: &str) -> bool {
    value.bytes().all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Input for registering a webhook.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebhook {
    pub url: String,
    pub events: Vec<EventKind>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub filter_job_ids: Vec<String>,
    #[serde(default)]
    pub filter_tool_names: Vec<String>,
}

impl CreateWebhook {
    /// A request with every optional field at its default.
    pub fn new(url: impl Into<String>, events: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            url: url.into(),
            events: events.into_iter().collect(),
            secret: None,
            headers: BTreeMap::new(),
            active: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_seconds: DEFAULT_RETRY_DELAY_SECS,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            content_type: ContentType::Json,
            description: None,
            filter_job_ids: Vec::new(),
            filter_tool_names: Vec::new(),
        }
    }
}

/// Partial update. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWebhook {
    pub url: Option<String>,
    pub events: Option<Vec<EventKind>>,
    pub secret: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub active: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub content_type: Option<ContentType>,
    pub description: Option<String>,
    pub filter_job_ids: Option<Vec<String>>,
    pub filter_tool_names: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn request() -> CreateWebhook {
        CreateWebhook::new("https://hooks.example.com/jobs", [EventKind::JobCompleted])
    }

    #[test]
    fn defaults_from_json() {
        let req: CreateWebhook = serde_json::from_value(serde_json::json!({
            "url": "http://localhost:9000/hook",
            "events": ["JOB_COMPLETED", "JOB_FAILED"],
        }))
        .unwrap();
        assert!(req.active);
        assert_eq!(req.max_retries, 3);
        assert_eq!(req.retry_delay_seconds, 30);
        assert_eq!(req.timeout_seconds, 30);
        assert_eq!(req.content_type, ContentType::Json);
    }

    #[test]
    fn form_alias_is_accepted() {
        let ct: ContentType = serde_json::from_str("\"FORM_URLENCODED\"").unwrap();
        assert_eq!(ct, ContentType::Form);
    }

    #[test]
    fn rejects_non_http_urls() {
        let mut req = request();
        req.url = "ftp://example.com/hook".into();
        assert_matches!(WebhookSubscription::create(req), Err(CoreError::Validation(_)));

        let mut req = request();
        req.url = "not a url".into();
        assert_matches!(WebhookSubscription::create(req), Err(CoreError::Validation(_)));
    }

    #[test]
    fn rejects_out_of_range_settings() {
        let mut req = request();
        req.events.clear();
        assert_matches!(WebhookSubscription::create(req), Err(CoreError::Validation(_)));

        let mut req = request();
        req.timeout_seconds = 0;
        assert_matches!(WebhookSubscription::create(req), Err(CoreError::Validation(_)));

        let mut req = request();
        req.max_retries = 11;
        assert_matches!(WebhookSubscription::create(req), Err(CoreError::Validation(_)));

        let mut req = request();
        req.retry_delay_seconds = 3601;
        assert_matches!(WebhookSubscription::create(req), Err(CoreError::Validation(_)));
    }

    #[test]
    fn secret_is_never_serialized() {
        let mut req = request();
        req.secret = Some("s3cret".into());
        let sub = WebhookSubscription::create(req).unwrap();
        let json = serde_json::to_value(&sub).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["events"], serde_json::json!(["JOB_COMPLETED"]));
    }

    #[test]
    fn matching_honours_events_and_filters() {
        let mut req = request();
        req.filter_tool_names = vec!["merge".into()];
        let mut sub = WebhookSubscription::create(req).unwrap();

        assert!(sub.matches(EventKind::JobCompleted, "job-1", "merge"));
        assert!(sub.matches(EventKind::JobCompleted, "job-1", "MERGE"));
        assert!(!sub.matches(EventKind::JobCompleted, "job-1", "split"));
        assert!(!sub.matches(EventKind::JobFailed, "job-1", "merge"));

        sub.filter_job_ids.insert("job-2".into());
        assert!(!sub.matches(EventKind::JobCompleted, "job-1", "merge"));
        assert!(sub.matches(EventKind::JobCompleted, "job-2", "merge"));

        sub.active = false;
        assert!(!sub.matches(EventKind::JobCompleted, "job-2", "merge"));
    }

    #[test]
    fn invalid_update_leaves_subscription_unchanged() {
        let mut sub = WebhookSubscription::create(request()).unwrap();
        let before = sub.clone();
        let update = UpdateWebhook {
            max_retries: Some(5),
            timeout_seconds: Some(0),
            ..Default::default()
        };
        assert_matches!(sub.apply(update), Err(CoreError::Validation(_)));
        assert_eq!(sub, before);

        sub.apply(UpdateWebhook {
            max_retries: Some(5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(sub.max_retries, 5);
        assert_eq!(sub.max_attempts(), 6);
    }

    #[test]
    fn rejects_malformed_headers() {
        for name in ["", "X Token", "X-Token:", "X-T\u{f6}ken", "X-Token\n"] {
            let mut req = request();
            req.headers.insert(name.into(), "abc".into());
            assert_matches!(
                WebhookSubscription::create(req),
                Err(CoreError::Validation(_)),
                "header name {name:?} accepted"
            );
        }

        let mut req = request();
        req.headers
            .insert("X-Token".into(), "abc\r\nX-Injected: 1".into());
        assert_matches!(WebhookSubscription::create(req), Err(CoreError::Validation(_)));

        let mut req = request();
        req.headers.insert("X-Api-Key".into(), "Bearer a\tb".into());
        req.headers.insert("x_trace.id".into(), String::new());
        assert!(WebhookSubscription::create(req).is_ok());
    }

    #[test]
    fn update_with_malformed_header_is_rejected() {
        let mut sub = WebhookSubscription::create(request()).unwrap();
        let before = sub.clone();
        let update = UpdateWebhook {
            headers: Some([("Bad Header".to_string(), "v".to_string())].into()),
            ..Default::default()
        };
        assert_matches!(sub.apply(update), Err(CoreError::Validation(_)));
        assert_eq!(sub, before);
    }
}
