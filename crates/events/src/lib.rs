//! docjobs event bus and webhook delivery.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`JobEvent`]: a lifecycle event snapshot of one job.
//! - [`WebhookRegistry`]: subscriptions, their delivery history and stats.
//! - [`WebhookDispatcher`]: throttled, signed, retrying fan-out to
//!   subscribers.

pub mod bus;
pub mod delivery;
pub mod dispatcher;
pub mod payload;
pub mod registry;
pub mod throttle;

pub use bus::{EventBus, JobEvent};
pub use delivery::webhook::{WebhookDelivery, WebhookError};
pub use dispatcher::{DeliveryAttempt, DispatcherConfig, WebhookDispatcher};
pub use registry::{DeliveryRecord, WebhookRegistry, WebhookStats};
pub use throttle::ProgressThrottle;
