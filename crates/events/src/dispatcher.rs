//! Webhook dispatcher: fans job events out to matching subscriptions.
//!
//! The dispatcher subscribes to the [`EventBus`](crate::bus::EventBus) and,
//! for every event that passes the [`ProgressThrottle`], spawns one delivery
//! task per matching subscription. Delivery tasks retry with a fixed delay
//! and share a semaphore so that slow endpoints cannot exhaust the process.
//! Nothing here ever touches job state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use docjobs_core::{EventKind, Timestamp, WebhookId, WebhookSubscription};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bus::JobEvent;
use crate::delivery::webhook::{AttemptMeta, WebhookDelivery, WebhookError};
use crate::payload;
use crate::registry::{DeliveryRecord, WebhookRegistry};
use crate::throttle::ProgressThrottle;

/// Tunables for [`WebhookDispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Attempts allowed in flight at once across all subscriptions.
    pub max_concurrency: usize,
    pub progress_interval: Duration,
    pub progress_step: u8,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            progress_interval: Duration::from_millis(2000),
            progress_step: 10,
        }
    }
}

/// In-flight retry bookkeeping for one (subscription, event) delivery.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub subscription_id: WebhookId,
    pub event: EventKind,
    pub attempt_number: u32,
    pub next_attempt_at: Timestamp,
    pub last_error: Option<String>,
}

/// Background webhook fan-out service.
pub struct WebhookDispatcher {
    registry: Arc<WebhookRegistry>,
    delivery: Arc<WebhookDelivery>,
    throttle: ProgressThrottle,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl WebhookDispatcher {
    pub fn new(
        registry: Arc<WebhookRegistry>,
        config: DispatcherConfig,
    ) -> Result<Arc<Self>, WebhookError> {
        Ok(Arc::new(Self {
            registry,
            delivery: Arc::new(WebhookDelivery::new()?),
            throttle: ProgressThrottle::new(config.progress_interval, config.progress_step),
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn registry(&self) -> &Arc<WebhookRegistry> {
        &self.registry
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self: &Arc<Self>, receiver: broadcast::Receiver<JobEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(receiver).await })
    }

    /// Consume events until the bus closes or shutdown begins.
    pub async fn run(&self, mut receiver: broadcast::Receiver<JobEvent>) {
        tracing::info!("Webhook dispatcher started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Webhook dispatcher shutting down");
                    break;
                }
                received = receiver.recv() => match received {
                    Ok(event) => {
                        self.dispatch(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            skipped = n,
                            "Webhook dispatcher lagged, some events were not delivered"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bus closed, webhook dispatcher stopping");
                        break;
                    }
                },
            }
        }
    }

    /// Schedule deliveries of `event`. Returns how many were scheduled.
    pub async fn dispatch(&self, event: JobEvent) -> usize {
        if self.shutdown.is_cancelled() || !self.throttle.admit(&event) {
            return 0;
        }

        let subscriptions = self.registry.matching(&event).await;
        let mut scheduled = 0;
        for subscription in subscriptions {
            let body = match payload::encode(&event, subscription.content_type) {
                Ok(body) => body,
                Err(e) => {
                    let e = WebhookError::Encode(e.to_string());
                    tracing::error!(
                        webhook_id = %subscription.id,
                        job_id = %event.job_id,
                        error = %e,
                        "Skipping webhook delivery"
                    );
                    continue;
                }
            };
            let task = DeliveryTask {
                registry: Arc::clone(&self.registry),
                delivery: Arc::clone(&self.delivery),
                permits: Arc::clone(&self.permits),
                shutdown: self.shutdown.clone(),
                delivery_id: uuid::Uuid::new_v4().to_string(),
                job_id: event.job_id.clone(),
                attempt: DeliveryAttempt {
                    subscription_id: subscription.id.clone(),
                    event: event.kind,
                    attempt_number: 1,
                    next_attempt_at: Utc::now(),
                    last_error: None,
                },
                subscription,
                body,
            };
            self.tracker.spawn(task.run());
            scheduled += 1;
        }
        scheduled
    }

    /// Delivery tasks still running, including those waiting to retry.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop consuming events, abandon pending retries, and wait up to
    /// `grace` for attempts already on the wire.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tracker.len(),
                "Webhook deliveries still running after shutdown grace period"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery task
// ---------------------------------------------------------------------------

struct DeliveryTask {
    registry: Arc<WebhookRegistry>,
    delivery: Arc<WebhookDelivery>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    subscription: WebhookSubscription,
    delivery_id: String,
    job_id: String,
    body: Vec<u8>,
    attempt: DeliveryAttempt,
}

impl DeliveryTask {
    async fn run(mut self) {
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let meta = AttemptMeta {
                event: self.attempt.event,
                delivery_id: &self.delivery_id,
                attempt: self.attempt.attempt_number,
            };
            let started = Instant::now();
            let outcome = self.delivery.send(&self.subscription, meta, &self.body).await;
            drop(permit);
            let latency_ms = started.elapsed().as_millis() as u64;

            let record = DeliveryRecord {
                delivery_id: self.delivery_id.clone(),
                event: self.attempt.event,
                job_id: self.job_id.clone(),
                attempt_number: self.attempt.attempt_number,
                success: outcome.is_ok(),
                response_code: match &outcome {
                    Ok(delivered) => Some(delivered.status),
                    Err(e) => e.status(),
                },
                response_body: match &outcome {
                    Ok(delivered) => Some(delivered.body.clone()),
                    Err(WebhookError::HttpStatus { body, .. }) => Some(body.clone()),
                    Err(_) => None,
                },
                error: outcome.as_ref().err().map(|e| e.to_string()),
                latency_ms,
                timestamp: Utc::now(),
            };
            self.registry
                .record_delivery(&self.attempt.subscription_id, record)
                .await;

            let error = match outcome {
                Ok(delivered) => {
                    tracing::info!(
                        webhook_id = %self.attempt.subscription_id,
                        delivery_id = %self.delivery_id,
                        event = %self.attempt.event,
                        job_id = %self.job_id,
                        attempt = self.attempt.attempt_number,
                        status = delivered.status,
                        latency_ms,
                        "Webhook delivered"
                    );
                    return;
                }
                Err(e) => e,
            };

            if self.attempt.attempt_number >= self.subscription.max_attempts() {
                tracing::error!(
                    code = "WEBHOOK_DELIVERY_FAILED",
                    webhook_id = %self.attempt.subscription_id,
                    delivery_id = %self.delivery_id,
                    event = %self.attempt.event,
                    job_id = %self.job_id,
                    attempts = self.attempt.attempt_number,
                    error = %error,
                    "Webhook delivery failed after all retries"
                );
                return;
            }

            let delay = Duration::from_secs(self.subscription.retry_delay_seconds);
            self.attempt.next_attempt_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            tracing::warn!(
                webhook_id = %self.attempt.subscription_id,
                delivery_id = %self.delivery_id,
                attempt = self.attempt.attempt_number,
                retry_in_secs = delay.as_secs(),
                error = %error,
                "Webhook delivery attempt failed, retrying"
            );
            self.attempt.last_error = Some(error.to_string());

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!(
                        webhook_id = %self.attempt.subscription_id,
                        delivery_id = %self.delivery_id,
                        "Abandoning webhook retry on shutdown"
                    );
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            // Pick up edits and stop if the subscription went away.
            match self.registry.active(&self.attempt.subscription_id).await {
                Some(current) => self.subscription = current,
                None => {
                    tracing::info!(
                        webhook_id = %self.attempt.subscription_id,
                        delivery_id = %self.delivery_id,
                        "Subscription deleted or inactive, dropping retries"
                    );
                    return;
                }
            }
            self.attempt.attempt_number += 1;
        }
    }
}
