//! Domain types shared by every docjobs crate.
//!
//! - [`JobRecord`] and its lifecycle state machine.
//! - [`ToolName`], the [`ToolExecutor`] trait and the startup-validated
//!   [`ToolRegistry`].
//! - [`CancelToken`], the cooperative cancellation handle handed to tools.
//! - [`WebhookSubscription`] with its event filters, plus HMAC signing.
//! - [`CoreError`], the error type every public operation returns.

pub mod cancel;
pub mod error;
pub mod job;
pub mod signing;
pub mod tool;
pub mod types;
pub mod webhook;

pub use cancel::CancelToken;
pub use error::CoreError;
pub use job::{JobErrorCode, JobRecord, JobResult, JobStatus, Outcome, RESULT_URL_KEY};
pub use tool::{
    ProgressSink, ToolError, ToolExecutor, ToolName, ToolRegistry, ToolRegistryBuilder,
    ToolRequest,
};
pub use types::{JobId, Timestamp, WebhookId};
pub use webhook::{ContentType, CreateWebhook, EventKind, UpdateWebhook, WebhookSubscription};
