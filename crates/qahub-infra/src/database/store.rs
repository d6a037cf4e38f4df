//! Postgres webhook store
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of scheduler processes
//! can poll the same table: a row locked by one claimer is invisible to the
//! others until that transaction commits, after which it is no longer due.
//! Every claim mints a fresh lease id and `record_outcome` only writes while
//! that lease is still the current one.

use super::rows::{in_due_order, sanitize_text, ClaimedRow, ConfigRow, DeliveryRow};
use crate::{InfraError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qahub_core::{ConfigId, DeliveryId, LeaseId};
use qahub_webhook::{
    BacklogStats, ConfigStore, DeliveryClaim, DeliveryStore, WebhookConfig, WebhookDelivery,
};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Postgres-backed config and delivery store
#[derive(Debug, Clone)]
pub struct PgWebhookStore {
    pool: PgPool,
}

impl PgWebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_config(&self, config: &WebhookConfig) -> Result<()> {
        let events: Vec<String> = config.events.iter().cloned().collect();

        sqlx::query(
            r"
            INSERT INTO webhook_configs
                (id, url, kind, events, headers, secret, active, owner, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                url = EXCLUDED.url,
                kind = EXCLUDED.kind,
                events = EXCLUDED.events,
                headers = EXCLUDED.headers,
                secret = EXCLUDED.secret,
                active = EXCLUDED.active,
                owner = EXCLUDED.owner,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(config.id.as_uuid())
        .bind(&config.url)
        .bind(config.kind.as_str())
        .bind(&events)
        .bind(Json(&config.headers))
        .bind(config.secret.as_ref().map(|s| s.expose()))
        .bind(config.active)
        .bind(config.owner.as_str())
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_config(&self, id: ConfigId) -> Result<Option<WebhookConfig>> {
        let row: Option<ConfigRow> =
            sqlx::query_as(r"SELECT * FROM webhook_configs WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        row.map(WebhookConfig::try_from).transpose()
    }

    async fn fetch_active_configs(&self) -> Result<Vec<WebhookConfig>> {
        let rows: Vec<ConfigRow> = sqlx::query_as(
            r"SELECT * FROM webhook_configs WHERE active ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookConfig::try_from).collect()
    }

    async fn update_active(&self, id: ConfigId, active: bool, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE webhook_configs SET active = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(active)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_config(&self, id: ConfigId) -> Result<bool> {
        let result = sqlx::query(r"DELETE FROM webhook_configs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_deliveries(&self, deliveries: &[WebhookDelivery]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for delivery in deliveries {
            sqlx::query(
                r"
                INSERT INTO webhook_deliveries
                    (id, config_id, event_type, payload, status, attempt_count,
                     next_retry_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(delivery.id.as_uuid())
            .bind(delivery.config_id.as_uuid())
            .bind(&delivery.event_type)
            .bind(&delivery.payload)
            .bind(delivery.status.as_str())
            .bind(attempts_column(delivery.attempt_count)?)
            .bind(delivery.next_retry_at)
            .bind(delivery.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn claim_rows(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeliveryClaim>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows: Vec<ClaimedRow> = sqlx::query_as(
            r"
            WITH due AS (
                SELECT d.id, COALESCE(d.next_retry_at, d.created_at) AS due_at
                FROM webhook_deliveries d
                JOIN webhook_configs c ON c.id = d.config_id
                WHERE c.active
                  AND (d.status = 'pending'
                       OR (d.status = 'retrying' AND d.next_retry_at <= $1))
                ORDER BY COALESCE(d.next_retry_at, d.created_at), d.created_at, d.id
                LIMIT $2
                FOR UPDATE OF d SKIP LOCKED
            )
            UPDATE webhook_deliveries d
            SET status = 'delivering',
                next_retry_at = NULL,
                claimed_at = $1,
                lease_id = gen_random_uuid()
            FROM due
            WHERE d.id = due.id
            RETURNING d.*, due.due_at
            ",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let deliveries = in_due_order(rows)?;

        let config_ids: Vec<Uuid> = deliveries.iter().map(|d| *d.config_id.as_uuid()).collect();
        let config_rows: Vec<ConfigRow> =
            sqlx::query_as(r"SELECT * FROM webhook_configs WHERE id = ANY($1)")
                .bind(&config_ids)
                .fetch_all(&self.pool)
                .await?;
        let configs = config_rows
            .into_iter()
            .map(|row| WebhookConfig::try_from(row).map(|c| (c.id, c)))
            .collect::<Result<HashMap<_, _>>>()?;

        let mut claims = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let Some(lease) = delivery.lease_id else {
                return Err(InfraError::Decode(format!(
                    "claimed delivery {} has no lease",
                    delivery.id
                )));
            };
            match configs.get(&delivery.config_id) {
                Some(config) => claims.push(DeliveryClaim {
                    config: config.clone(),
                    delivery,
                    lease,
                }),
                // Config deleted between the claim and the lookup; the
                // cascade removes the row, so there is nothing to hand back.
                None => warn!(
                    delivery_id = %delivery.id,
                    config_id = %delivery.config_id,
                    "Claimed delivery lost its config"
                ),
            }
        }

        debug!(claimed = claims.len(), "Claimed due deliveries");
        Ok(claims)
    }

    async fn write_outcome(&self, delivery: &WebhookDelivery, lease: LeaseId) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE webhook_deliveries
            SET status = $3,
                attempt_count = $4,
                last_attempt_at = $5,
                next_retry_at = $6,
                last_status_code = $7,
                last_response_body = $8,
                last_error = $9,
                failure_kind = $10,
                lease_id = $11,
                claimed_at = $12,
                completed_at = $13
            WHERE id = $1 AND lease_id = $2 AND status = 'delivering'
            ",
        )
        .bind(delivery.id.as_uuid())
        .bind(lease.as_uuid())
        .bind(delivery.status.as_str())
        .bind(attempts_column(delivery.attempt_count)?)
        .bind(delivery.last_attempt_at)
        .bind(delivery.next_retry_at)
        .bind(delivery.last_status_code.map(i32::from))
        .bind(sanitize_text(delivery.last_response_body.as_deref()))
        .bind(sanitize_text(delivery.last_error.as_deref()))
        .bind(delivery.failure_kind.map(|k| k.as_str()))
        .bind(delivery.lease_id.map(|l| *l.as_uuid()))
        .bind(delivery.claimed_at)
        .bind(delivery.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reclaim_rows(&self, now: DateTime<Utc>, lease_timeout: Duration) -> Result<u64> {
        let lease_timeout = chrono::Duration::from_std(lease_timeout)
            .map_err(|e| InfraError::Configuration(format!("lease timeout: {e}")))?;

        let result = sqlx::query(
            r"
            UPDATE webhook_deliveries
            SET status = 'retrying',
                next_retry_at = $1,
                failure_kind = 'stale_claim_recovered',
                lease_id = NULL,
                claimed_at = NULL
            WHERE status = 'delivering'
              AND (claimed_at IS NULL OR claimed_at < $2)
            ",
        )
        .bind(now)
        .bind(now - lease_timeout)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn fetch_delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>> {
        let row: Option<DeliveryRow> =
            sqlx::query_as(r"SELECT * FROM webhook_deliveries WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        row.map(WebhookDelivery::try_from).transpose()
    }

    async fn fetch_recent(&self, config_id: ConfigId, limit: usize) -> Result<Vec<WebhookDelivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            r"
            SELECT * FROM webhook_deliveries
            WHERE config_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            ",
        )
        .bind(config_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookDelivery::try_from).collect()
    }

    async fn count_failed(&self, config_id: ConfigId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r"SELECT COUNT(*) FROM webhook_deliveries WHERE config_id = $1 AND status = 'failed'",
        )
        .bind(config_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn count_backlog(&self) -> Result<BacklogStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r"
            SELECT status, COUNT(*)
            FROM webhook_deliveries
            WHERE status IN ('pending', 'retrying', 'delivering')
            GROUP BY status
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = BacklogStats::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.as_str() {
                "pending" => stats.pending = count,
                "retrying" => stats.retrying = count,
                "delivering" => stats.delivering = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn delete_completed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"DELETE FROM webhook_deliveries WHERE completed_at IS NOT NULL AND completed_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn attempts_column(attempts: u32) -> Result<i32> {
    i32::try_from(attempts)
        .map_err(|_| InfraError::Decode(format!("attempt count {attempts} out of range")))
}

#[async_trait]
impl ConfigStore for PgWebhookStore {
    async fn upsert(&self, config: &WebhookConfig) -> qahub_webhook::Result<()> {
        Ok(self.upsert_config(config).await?)
    }

    async fn get(&self, id: ConfigId) -> qahub_webhook::Result<Option<WebhookConfig>> {
        Ok(self.fetch_config(id).await?)
    }

    async fn list_active(&self) -> qahub_webhook::Result<Vec<WebhookConfig>> {
        Ok(self.fetch_active_configs().await?)
    }

    async fn set_active(
        &self,
        id: ConfigId,
        active: bool,
        now: DateTime<Utc>,
    ) -> qahub_webhook::Result<bool> {
        Ok(self.update_active(id, active, now).await?)
    }

    async fn delete(&self, id: ConfigId) -> qahub_webhook::Result<bool> {
        Ok(self.delete_config(id).await?)
    }
}

#[async_trait]
impl DeliveryStore for PgWebhookStore {
    async fn insert(&self, deliveries: &[WebhookDelivery]) -> qahub_webhook::Result<()> {
        Ok(self.insert_deliveries(deliveries).await?)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> qahub_webhook::Result<Vec<DeliveryClaim>> {
        Ok(self.claim_rows(now, limit).await?)
    }

    async fn record_outcome(
        &self,
        delivery: &WebhookDelivery,
        lease: LeaseId,
    ) -> qahub_webhook::Result<bool> {
        Ok(self.write_outcome(delivery, lease).await?)
    }

    async fn reclaim_stale(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> qahub_webhook::Result<u64> {
        Ok(self.reclaim_rows(now, lease_timeout).await?)
    }

    async fn get(&self, id: DeliveryId) -> qahub_webhook::Result<Option<WebhookDelivery>> {
        Ok(self.fetch_delivery(id).await?)
    }

    async fn recent_for_config(
        &self,
        config_id: ConfigId,
        limit: usize,
    ) -> qahub_webhook::Result<Vec<WebhookDelivery>> {
        Ok(self.fetch_recent(config_id, limit).await?)
    }

    async fn failed_count_for_config(&self, config_id: ConfigId) -> qahub_webhook::Result<u64> {
        Ok(self.count_failed(config_id).await?)
    }

    async fn backlog(&self) -> qahub_webhook::Result<BacklogStats> {
        Ok(self.count_backlog().await?)
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> qahub_webhook::Result<u64> {
        Ok(self.delete_completed(older_than).await?)
    }
}
