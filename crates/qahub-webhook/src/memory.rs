//! In-memory webhook store
//!
//! Backs both [`ConfigStore`] and [`DeliveryStore`] with `DashMap`s. Claims
//! re-check each candidate under its shard write lock, so concurrent
//! schedulers in one process never receive the same row. Use the Postgres
//! store for anything spanning processes.

use crate::{
    delivery::{BacklogStats, DeliveryClaim, DeliveryStatus, DeliveryStore, WebhookDelivery},
    subscription::{ConfigStore, WebhookConfig},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use qahub_core::{ConfigId, DeliveryId, LeaseId};
use std::time::Duration;
use tracing::debug;

/// In-memory config and delivery store
#[derive(Debug, Default)]
pub struct InMemoryWebhookStore {
    configs: DashMap<ConfigId, WebhookConfig>,
    deliveries: DashMap<DeliveryId, WebhookDelivery>,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.len()
    }

    fn is_active(&self, config_id: ConfigId) -> bool {
        self.configs.get(&config_id).is_some_and(|c| c.active)
    }
}

#[async_trait]
impl ConfigStore for InMemoryWebhookStore {
    async fn upsert(&self, config: &WebhookConfig) -> Result<()> {
        self.configs.insert(config.id, config.clone());
        Ok(())
    }

    async fn get(&self, id: ConfigId) -> Result<Option<WebhookConfig>> {
        Ok(self.configs.get(&id).map(|c| c.clone()))
    }

    async fn list_active(&self) -> Result<Vec<WebhookConfig>> {
        let mut configs: Vec<_> = self
            .configs
            .iter()
            .filter(|c| c.active)
            .map(|c| c.clone())
            .collect();
        configs.sort_by_key(|c| c.created_at);
        Ok(configs)
    }

    async fn set_active(&self, id: ConfigId, active: bool, now: DateTime<Utc>) -> Result<bool> {
        match self.configs.get_mut(&id) {
            Some(mut config) => {
                config.active = active;
                config.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: ConfigId) -> Result<bool> {
        if self.configs.remove(&id).is_none() {
            return Ok(false);
        }
        self.deliveries.retain(|_, d| d.config_id != id);
        Ok(true)
    }
}

#[async_trait]
impl DeliveryStore for InMemoryWebhookStore {
    async fn insert(&self, deliveries: &[WebhookDelivery]) -> Result<()> {
        for delivery in deliveries {
            self.deliveries.insert(delivery.id, delivery.clone());
        }
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeliveryClaim>> {
        let mut candidates: Vec<_> = self
            .deliveries
            .iter()
            .filter(|d| d.is_due(now))
            .map(|d| (d.due_at(), d.created_at, d.id, d.config_id))
            .collect();
        candidates.sort();

        let mut claims = Vec::with_capacity(limit.min(candidates.len()));
        for (_, _, id, config_id) in candidates {
            if claims.len() >= limit {
                break;
            }
            let Some(config) = self.configs.get(&config_id).map(|c| c.clone()) else {
                continue;
            };
            if !config.active {
                continue;
            }

            // Another claimer may have taken the row since the scan
            let Some(mut entry) = self.deliveries.get_mut(&id) else {
                continue;
            };
            if !entry.is_due(now) {
                continue;
            }

            let lease = LeaseId::new();
            entry.claim(lease, now)?;
            claims.push(DeliveryClaim {
                delivery: entry.clone(),
                config,
                lease,
            });
        }

        Ok(claims)
    }

    async fn record_outcome(&self, delivery: &WebhookDelivery, lease: LeaseId) -> Result<bool> {
        let Some(mut entry) = self.deliveries.get_mut(&delivery.id) else {
            return Ok(false);
        };
        if entry.status != DeliveryStatus::Delivering || entry.lease_id != Some(lease) {
            debug!(delivery_id = %delivery.id, "Outcome for lost claim discarded");
            return Ok(false);
        }

        *entry = delivery.clone();
        Ok(true)
    }

    async fn reclaim_stale(&self, now: DateTime<Utc>, lease_timeout: Duration) -> Result<u64> {
        let mut reclaimed = 0;
        for mut entry in self.deliveries.iter_mut() {
            if entry.is_stale(now, lease_timeout) {
                entry.reclaim(now)?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>> {
        Ok(self.deliveries.get(&id).map(|d| d.clone()))
    }

    async fn recent_for_config(
        &self,
        config_id: ConfigId,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>> {
        let mut deliveries: Vec<_> = self
            .deliveries
            .iter()
            .filter(|d| d.config_id == config_id)
            .map(|d| d.clone())
            .collect();
        deliveries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        deliveries.truncate(limit);
        Ok(deliveries)
    }

    async fn failed_count_for_config(&self, config_id: ConfigId) -> Result<u64> {
        Ok(self
            .deliveries
            .iter()
            .filter(|d| d.config_id == config_id && d.status == DeliveryStatus::Failed)
            .count() as u64)
    }

    async fn backlog(&self) -> Result<BacklogStats> {
        let mut stats = BacklogStats::default();
        for delivery in self.deliveries.iter() {
            match delivery.status {
                DeliveryStatus::Pending => stats.pending += 1,
                DeliveryStatus::Retrying => stats.retrying += 1,
                DeliveryStatus::Delivering => stats.delivering += 1,
                DeliveryStatus::Delivered | DeliveryStatus::Failed => {}
            }
        }
        Ok(stats)
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let before = self.deliveries.len();
        self.deliveries
            .retain(|_, d| !d.completed_at.is_some_and(|at| at < older_than));
        Ok((before - self.deliveries.len()) as u64)
    }
}
