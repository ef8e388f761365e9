//! Single-attempt webhook delivery.
//!
//! [`WebhookDelivery`] POSTs one pre-encoded body to one subscription and
//! reports the outcome. Retry scheduling lives in the
//! [`dispatcher`](crate::dispatcher); this type only knows how to build a
//! signed request and classify the response.

use std::time::Duration;

use docjobs_core::signing::{signature_header_value, SIGNATURE_HEADER};
use docjobs_core::{EventKind, WebhookSubscription};
use reqwest::header::CONTENT_TYPE;

/// Response bodies kept for delivery history are cut to this many chars.
const MAX_RESPONSE_CHARS: usize = 1000;

const USER_AGENT: &str = concat!("docjobs-webhook/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type for webhook delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Webhook returned HTTP {status}")]
    HttpStatus { status: u16, body: String },

    /// The event could not be rendered in the subscription's content type.
    #[error("Failed to encode webhook body: {0}")]
    Encode(String),
}

impl WebhookError {
    /// HTTP status of the response, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            Self::Encode(_) => None,
        }
    }
}

/// A 2xx response.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub status: u16,
    pub body: String,
}

/// Identifies one attempt of one delivery.
#[derive(Debug, Clone, Copy)]
pub struct AttemptMeta<'a> {
    pub event: EventKind,
    pub delivery_id: &'a str,
    pub attempt: u32,
}

// ---------------------------------------------------------------------------
// WebhookDelivery
// ---------------------------------------------------------------------------

/// Sends webhook bodies to subscriber endpoints.
pub struct WebhookDelivery {
    client: reqwest::Client,
}

impl WebhookDelivery {
    /// Create a new delivery service with a pre-configured HTTP client.
    ///
    /// Timeouts are applied per request from the subscription.
    pub fn new() -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }

    /// Execute a single POST and check the response status.
    pub async fn send(
        &self,
        subscription: &WebhookSubscription,
        meta: AttemptMeta<'_>,
        body: &[u8],
    ) -> Result<Delivered, WebhookError> {
        let mut request = self
            .client
            .post(&subscription.url)
            .timeout(Duration::from_secs(subscription.timeout_seconds));

        // Subscription headers first so the protocol headers always win.
        for (name, value) in &subscription.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = request
            .header(CONTENT_TYPE, subscription.content_type.mime())
            .header("X-Webhook-Id", subscription.id.as_str())
            .header("X-Delivery-Id", meta.delivery_id)
            .header("X-Event-Type", meta.event.as_str())
            .header("X-Webhook-Attempt", meta.attempt.to_string());
        if let Some(secret) = &subscription.secret {
            request = request.header(SIGNATURE_HEADER, signature_header_value(secret, body));
        }

        let response = request.body(body.to_vec()).send().await?;
        let status = response.status();
        // A body that cannot be read does not change the outcome.
        let text = response.text().await.unwrap_or_default();
        let text = truncate(&text, MAX_RESPONSE_CHARS);

        if !status.is_success() {
            return Err(WebhookError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(Delivered {
            status: status.as_u16(),
            body: text,
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_does_not_fail() {
        assert!(WebhookDelivery::new().is_ok());
    }

    #[test]
    fn webhook_error_display_http_status() {
        let err = WebhookError::HttpStatus {
            status: 502,
            body: String::new(),
        };
        assert_eq!(err.to_string(), "Webhook returned HTTP 502");
        assert_eq!(err.status(), Some(502));
    }

    #[test]
    fn webhook_error_display_request() {
        // Build a reqwest error from an invalid URL.
        let req_err = reqwest::Client::new().get("://bad").build().unwrap_err();
        let err = WebhookError::Request(req_err);
        assert!(err.to_string().contains("HTTP request failed"));
        assert_eq!(err.status(), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 2), "éé...");
    }
}
