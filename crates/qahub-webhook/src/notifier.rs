//! Event intake
//!
//! Called by the rest of the application when a domain event fires. Fans the
//! event out into one pending delivery per subscribed active config and
//! returns without waiting for any delivery.

use crate::{
    delivery::{DeliveryStore, WebhookDelivery},
    events::{shape_payload, validate_event_name, QaEventType},
    matcher::match_subscribers,
    subscription::ConfigStore,
    Result, WebhookError,
};
use qahub_core::{Clock, DeliveryId};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns domain events into pending deliveries
pub struct WebhookNotifier {
    configs: Arc<dyn ConfigStore>,
    deliveries: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
}

impl WebhookNotifier {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        deliveries: Arc<dyn DeliveryStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            configs,
            deliveries,
            clock,
        }
    }

    /// Record a pending delivery for every matching subscriber
    ///
    /// `payload` must be a JSON document. Returns the created delivery IDs.
    pub async fn notify(&self, event_type: &str, payload: &[u8]) -> Result<Vec<DeliveryId>> {
        validate_event_name(event_type)?;
        serde_json::from_slice::<serde::de::IgnoredAny>(payload)
            .map_err(|e| WebhookError::InvalidPayload(format!("payload is not JSON: {e}")))?;

        let active = self.configs.list_active().await?;
        let subscribers = match_subscribers(event_type, &active);
        if subscribers.is_empty() {
            debug!(event_type, "No webhook subscribers for event");
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let deliveries = subscribers
            .iter()
            .map(|config| {
                let body = shape_payload(config.kind, event_type, payload)?;
                Ok(WebhookDelivery::pending(config.id, event_type, body, now))
            })
            .collect::<Result<Vec<_>>>()?;

        self.deliveries.insert(&deliveries).await?;

        info!(
            event_type,
            subscribers = deliveries.len(),
            "Queued webhook deliveries"
        );
        Ok(deliveries.into_iter().map(|d| d.id).collect())
    }

    /// Serialize and notify a catalogue event
    pub async fn notify_event<T: Serialize>(
        &self,
        event_type: QaEventType,
        data: &T,
    ) -> Result<Vec<DeliveryId>> {
        let payload = serde_json::to_vec(data)?;
        self.notify(event_type.as_str(), &payload).await
    }
}
