//! Webhook subscription registry with per-subscription delivery history.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use docjobs_core::{CoreError, CreateWebhook, UpdateWebhook, WebhookId, WebhookSubscription};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::bus::JobEvent;

/// Delivery records retained per subscription.
pub const HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Delivery bookkeeping
// ---------------------------------------------------------------------------

/// One delivery attempt as seen by the subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub event: docjobs_core::EventKind,
    pub job_id: String,
    pub attempt_number: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    pub timestamp: docjobs_core::Timestamp,
}

/// Attempt counters for one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStats {
    pub total_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
}

impl WebhookStats {
    /// Percentage of successful attempts, `0.0` before the first one.
    pub fn success_rate(&self) -> f64 {
        if self.total_deliveries == 0 {
            0.0
        } else {
            self.successful_deliveries as f64 / self.total_deliveries as f64 * 100.0
        }
    }
}

struct Entry {
    subscription: WebhookSubscription,
    stats: WebhookStats,
    history: VecDeque<DeliveryRecord>,
}

// ---------------------------------------------------------------------------
// WebhookRegistry
// ---------------------------------------------------------------------------

/// In-memory store of webhook subscriptions.
#[derive(Default)]
pub struct WebhookRegistry {
    entries: RwLock<HashMap<WebhookId, Entry>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a new subscription.
    pub async fn register(&self, request: CreateWebhook) -> Result<WebhookSubscription, CoreError> {
        let subscription = WebhookSubscription::create(request)?;
        tracing::info!(
            webhook_id = %subscription.id,
            url = %subscription.url,
            events = subscription.events.len(),
            "Webhook registered"
        );
        self.entries.write().await.insert(
            subscription.id.clone(),
            Entry {
                subscription: subscription.clone(),
                stats: WebhookStats::default(),
                history: VecDeque::new(),
            },
        );
        Ok(subscription)
    }

    pub async fn get(&self, id: &str) -> Result<WebhookSubscription, CoreError> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.subscription.clone())
            .ok_or_else(|| CoreError::webhook_not_found(id))
    }

    /// All subscriptions, newest first.
    pub async fn list(&self) -> Vec<WebhookSubscription> {
        let entries = self.entries.read().await;
        let mut subs: Vec<WebhookSubscription> =
            entries.values().map(|e| e.subscription.clone()).collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        subs
    }

    pub async fn update(
        &self,
        id: &str,
        update: UpdateWebhook,
    ) -> Result<WebhookSubscription, CoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| CoreError::webhook_not_found(id))?;
        entry.subscription.apply(update)?;
        Ok(entry.subscription.clone())
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<WebhookSubscription, CoreError> {
        self.update(
            id,
            UpdateWebhook {
                active: Some(active),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        match self.entries.write().await.remove(id) {
            Some(_) => {
                tracing::info!(webhook_id = %id, "Webhook deleted");
                Ok(())
            }
            None => Err(CoreError::webhook_not_found(id)),
        }
    }

    /// Active subscriptions whose event set and filters accept `event`.
    pub async fn matching(&self, event: &JobEvent) -> Vec<WebhookSubscription> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.subscription.matches(event.kind, &event.job_id, &event.tool_name))
            .map(|e| e.subscription.clone())
            .collect()
    }

    /// The subscription if it still exists and is active.
    pub async fn active(&self, id: &str) -> Option<WebhookSubscription> {
        self.entries
            .read()
            .await
            .get(id)
            .filter(|e| e.subscription.active)
            .map(|e| e.subscription.clone())
    }

    /// Append an attempt to the history and update counters.
    ///
    /// Unknown ids are ignored; the subscription may have been deleted while
    /// the attempt was in flight.
    pub async fn record_delivery(&self, id: &str, record: DeliveryRecord) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        entry.stats.total_deliveries += 1;
        if record.success {
            entry.stats.successful_deliveries += 1;
        } else {
            entry.stats.failed_deliveries += 1;
        }
        entry.subscription.last_triggered_at = Some(Utc::now());
        entry.history.push_back(record);
        while entry.history.len() > HISTORY_LIMIT {
            entry.history.pop_front();
        }
    }

    pub async fn stats(&self, id: &str) -> Result<WebhookStats, CoreError> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.stats)
            .ok_or_else(|| CoreError::webhook_not_found(id))
    }

    /// Up to `limit` most recent attempts, oldest first.
    pub async fn recent_deliveries(
        &self,
        id: &str,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, CoreError> {
        let entries = self.entries.read().await;
        let entry = entries.get(id).ok_or_else(|| CoreError::webhook_not_found(id))?;
        let skip = entry.history.len().saturating_sub(limit);
        Ok(entry.history.iter().skip(skip).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
