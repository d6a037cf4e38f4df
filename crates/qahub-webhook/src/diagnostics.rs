//! Read-only diagnostics for operators

use crate::{
    delivery::{BacklogStats, DeliveryStatus, DeliveryStore, FailureKind, WebhookDelivery},
    events::DeliveryKind,
    subscription::WebhookConfig,
    Result,
};
use chrono::{DateTime, Utc};
use qahub_core::{ConfigId, DeliveryId, OwnerId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use url::Url;

/// Upper bound for one history page
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Delivery as shown to operators; the payload is left out
#[derive(Debug, Clone, Serialize)]
pub struct DeliverySummary {
    pub id: DeliveryId,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_status_code: Option<u16>,
    pub last_response_body: Option<String>,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<WebhookDelivery> for DeliverySummary {
    fn from(d: WebhookDelivery) -> Self {
        Self {
            id: d.id,
            event_type: d.event_type,
            status: d.status,
            attempt_count: d.attempt_count,
            last_status_code: d.last_status_code,
            last_response_body: d.last_response_body,
            last_error: d.last_error,
            failure_kind: d.failure_kind,
            created_at: d.created_at,
            last_attempt_at: d.last_attempt_at,
            next_retry_at: d.next_retry_at,
            completed_at: d.completed_at,
        }
    }
}

/// Config as shown to operators
///
/// Header values and URL credentials are left out; receivers commonly put
/// bearer tokens in either.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub id: ConfigId,
    pub url: String,
    pub kind: DeliveryKind,
    pub events: BTreeSet<String>,
    pub header_names: Vec<String>,
    pub signed: bool,
    pub active: bool,
    pub owner: OwnerId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WebhookConfig> for ConfigSummary {
    fn from(c: WebhookConfig) -> Self {
        Self {
            id: c.id,
            url: redact_url(&c.url),
            kind: c.kind,
            events: c.events,
            header_names: c.headers.into_keys().collect(),
            signed: c.secret.is_some(),
            active: c.active,
            owner: c.owner,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// Drop userinfo, query and fragment
fn redact_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return "<unparseable>".to_string();
    };
    // Only fails for cannot-be-a-base URLs, which carry no userinfo
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

pub struct WebhookDiagnostics {
    deliveries: Arc<dyn DeliveryStore>,
}

impl WebhookDiagnostics {
    pub fn new(deliveries: Arc<dyn DeliveryStore>) -> Self {
        Self { deliveries }
    }

    /// Newest deliveries of a config
    pub async fn recent_history(
        &self,
        config_id: ConfigId,
        limit: usize,
    ) -> Result<Vec<DeliverySummary>> {
        let deliveries = self
            .deliveries
            .recent_for_config(config_id, limit.clamp(1, MAX_HISTORY_LIMIT))
            .await?;
        Ok(deliveries.into_iter().map(DeliverySummary::from).collect())
    }

    pub async fn failed_count(&self, config_id: ConfigId) -> Result<u64> {
        self.deliveries.failed_count_for_config(config_id).await
    }

    pub async fn backlog(&self) -> Result<BacklogStats> {
        self.deliveries.backlog().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryWebhookStore;

    #[tokio::test]
    async fn test_history_is_newest_first_and_bounded() {
        let store = Arc::new(InMemoryWebhookStore::new());
        let config_id = ConfigId::new();
        let start = Utc::now();
        let deliveries: Vec<_> = (0..5)
            .map(|i| {
                WebhookDelivery::pending(
                    config_id,
                    "run.completed",
                    b"{}".to_vec(),
                    start + chrono::Duration::seconds(i),
                )
            })
            .collect();
        store.insert(&deliveries).await.unwrap();

        let diagnostics = WebhookDiagnostics::new(store);
        let history = diagnostics.recent_history(config_id, 3).await.unwrap();

        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, deliveries[4].id);
        assert_eq!(history[2].id, deliveries[2].id);
        assert_eq!(diagnostics.backlog().await.unwrap().pending, 5);
        assert_eq!(diagnostics.failed_count(config_id).await.unwrap(), 0);
    }

    #[test]
    fn test_summary_omits_payload() {
        let payload = br#"{"token":"abc"}"#.to_vec();
        let delivery = WebhookDelivery::pending(ConfigId::new(), "run.failed", payload, Utc::now());
        let json = serde_json::to_value(DeliverySummary::from(delivery)).unwrap();

        assert!(json.get("payload").is_none());
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn test_config_summary_redacts_credentials() {
        let config = WebhookConfig::new(
            OwnerId::new("qa"),
            "https://user:pw@hooks.example.com/x?token=t0k#frag",
            Utc::now(),
        )
        .with_header("Authorization", "Bearer s3cr3t-token")
        .with_header("X-Team", "qa-core")
        .with_secret(b"whsec_test".to_vec());

        let summary = ConfigSummary::from(config);
        let rendered = serde_json::to_string(&summary).unwrap();

        assert_eq!(summary.url, "https://hooks.example.com/x");
        assert_eq!(summary.header_names, vec!["Authorization", "X-Team"]);
        assert!(summary.signed);
        for secret in ["s3cr3t-token", "pw", "t0k", "whsec_test", "qa-core"] {
            assert!(!rendered.contains(secret), "{secret} leaked");
        }
    }

    #[test]
    fn test_redact_url_keeps_plain_urls() {
        assert_eq!(
            redact_url("http://hooks.example.com:8080/a/b"),
            "http://hooks.example.com:8080/a/b"
        );
        assert_eq!(redact_url("not a url"), "<unparseable>");
    }
}
