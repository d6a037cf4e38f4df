//! Row mappings between Postgres and the webhook domain types

use crate::InfraError;
use chrono::{DateTime, Utc};
use qahub_core::{ConfigId, DeliveryId, LeaseId, OwnerId};
use qahub_webhook::{
    DeliveryKind, DeliveryStatus, FailureKind, WebhookConfig, WebhookDelivery, WebhookSecret,
};
use sqlx::types::Json;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ConfigRow {
    pub id: Uuid,
    pub url: String,
    pub kind: String,
    pub events: Vec<String>,
    pub headers: Json<BTreeMap<String, String>>,
    pub secret: Option<Vec<u8>>,
    pub active: bool,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ConfigRow> for WebhookConfig {
    type Error = InfraError;

    fn try_from(row: ConfigRow) -> Result<Self, Self::Error> {
        let kind = DeliveryKind::parse(&row.kind)
            .ok_or_else(|| InfraError::Decode(format!("unknown delivery kind '{}'", row.kind)))?;

        Ok(WebhookConfig {
            id: ConfigId::from_uuid(row.id),
            url: row.url,
            kind,
            events: row.events.into_iter().collect(),
            headers: row.headers.0,
            secret: row.secret.map(WebhookSecret::new),
            active: row.active,
            owner: OwnerId::new(row.owner),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DeliveryRow {
    pub id: Uuid,
    pub config_id: Uuid,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub status: String,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_status_code: Option<i32>,
    pub last_response_body: Option<String>,
    pub last_error: Option<String>,
    pub failure_kind: Option<String>,
    pub lease_id: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeliveryRow> for WebhookDelivery {
    type Error = InfraError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let status = DeliveryStatus::parse(&row.status)
            .ok_or_else(|| InfraError::Decode(format!("unknown delivery status '{}'", row.status)))?;
        let failure_kind = row
            .failure_kind
            .map(|kind| {
                FailureKind::parse(&kind)
                    .ok_or_else(|| InfraError::Decode(format!("unknown failure kind '{kind}'")))
            })
            .transpose()?;
        let attempt_count = u32::try_from(row.attempt_count)
            .map_err(|_| InfraError::Decode(format!("negative attempt count on {}", row.id)))?;
        let last_status_code = row
            .last_status_code
            .map(|code| {
                u16::try_from(code)
                    .map_err(|_| InfraError::Decode(format!("status code {code} out of range")))
            })
            .transpose()?;

        Ok(WebhookDelivery {
            id: DeliveryId::from_uuid(row.id),
            config_id: ConfigId::from_uuid(row.config_id),
            event_type: row.event_type,
            payload: row.payload,
            status,
            attempt_count,
            last_attempt_at: row.last_attempt_at,
            next_retry_at: row.next_retry_at,
            last_status_code,
            last_response_body: row.last_response_body,
            last_error: row.last_error,
            failure_kind,
            lease_id: row.lease_id.map(LeaseId::from_uuid),
            claimed_at: row.claimed_at,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

/// A claimed delivery with the due time it was selected by
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ClaimedRow {
    #[sqlx(flatten)]
    pub delivery: DeliveryRow,
    pub due_at: DateTime<Utc>,
}

/// Decode a claimed batch in due order
///
/// `UPDATE .. RETURNING` does not keep the order of the selecting CTE.
pub(crate) fn in_due_order(mut rows: Vec<ClaimedRow>) -> Result<Vec<WebhookDelivery>, InfraError> {
    rows.sort_by_key(|row| (row.due_at, row.delivery.created_at, row.delivery.id));
    rows.into_iter()
        .map(|row| WebhookDelivery::try_from(row.delivery))
        .collect()
}

/// Postgres TEXT cannot hold NUL; receivers do occasionally send it
pub(crate) fn sanitize_text(value: Option<&str>) -> Option<String> {
    value.map(|text| text.replace('\0', ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery_row(status: &str) -> DeliveryRow {
        let now = Utc::now();
        DeliveryRow {
            id: Uuid::new_v4(),
            config_id: Uuid::new_v4(),
            event_type: "run.failed".into(),
            payload: b"{}".to_vec(),
            status: status.into(),
            attempt_count: 2,
            last_attempt_at: Some(now),
            next_retry_at: Some(now),
            last_status_code: Some(503),
            last_response_body: None,
            last_error: Some("receiver responded with HTTP 503".into()),
            failure_kind: Some("transient_delivery_failure".into()),
            lease_id: None,
            claimed_at: None,
            created_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn test_delivery_row_decodes() {
        let delivery = WebhookDelivery::try_from(delivery_row("retrying")).unwrap();

        assert_eq!(delivery.status, DeliveryStatus::Retrying);
        assert_eq!(delivery.attempt_count, 2);
        assert_eq!(delivery.last_status_code, Some(503));
        assert_eq!(delivery.failure_kind, Some(FailureKind::TransientDeliveryFailure));
    }

    #[test]
    fn test_unknown_status_is_decode_error() {
        let err = WebhookDelivery::try_from(delivery_row("exploded")).unwrap_err();
        assert!(matches!(err, InfraError::Decode(_)));
    }

    #[test]
    fn test_config_row_decodes() {
        let now = Utc::now();
        let row = ConfigRow {
            id: Uuid::new_v4(),
            url: "https://hooks.example.com/qa".into(),
            kind: "slack".into(),
            events: vec!["run.*".into(), "package.completed".into()],
            headers: Json(BTreeMap::from([("x-team".to_string(), "qa".to_string())])),
            secret: Some(b"s3cret".to_vec()),
            active: true,
            owner: "qa-team".into(),
            created_at: now,
            updated_at: now,
        };

        let config = WebhookConfig::try_from(row).unwrap();

        assert_eq!(config.kind, DeliveryKind::Slack);
        assert_eq!(config.events.len(), 2);
        assert_eq!(config.secret.as_ref().unwrap().expose(), b"s3cret");
        assert_eq!(config.owner.as_str(), "qa-team");
    }

    #[test]
    fn test_claimed_rows_sorted_by_due_time() {
        let now = Utc::now();

        // Created first but retried late
        let mut retried = delivery_row("delivering");
        retried.created_at = now - chrono::Duration::hours(1);
        let retried_id = retried.id;

        let mut fresh = delivery_row("delivering");
        fresh.created_at = now - chrono::Duration::minutes(30);
        let fresh_id = fresh.id;

        let rows = vec![
            ClaimedRow {
                delivery: retried,
                due_at: now - chrono::Duration::minutes(1),
            },
            ClaimedRow {
                due_at: fresh.created_at,
                delivery: fresh,
            },
        ];

        let ordered: Vec<_> = in_due_order(rows).unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(
            ordered,
            vec![DeliveryId::from_uuid(fresh_id), DeliveryId::from_uuid(retried_id)]
        );
    }

    #[test]
    fn test_sanitize_text_strips_nul() {
        assert_eq!(sanitize_text(Some("a\0b")).as_deref(), Some("ab"));
        assert_eq!(sanitize_text(None), None);
    }
}
