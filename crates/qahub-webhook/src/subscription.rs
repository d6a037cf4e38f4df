//! Webhook configurations
//!
//! A [`WebhookConfig`] is a subscriber's registration. Configurations are
//! validated (target URL, headers, subscription patterns) every time they
//! are written, and again by the scheduler before every attempt.

use crate::{
    delivery::{DeliveryStatus, DeliveryStore, WebhookDelivery},
    events::DeliveryKind,
    matcher::SubscriptionPattern,
    signature::SIGNATURE_HEADER,
    validation::UrlValidator,
    Result, WebhookError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qahub_core::{Clock, ConfigId, DeliveryId, OwnerId};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Headers a subscriber may not set themselves
const RESERVED_HEADERS: [&str; 7] = [
    "content-type",
    "content-length",
    "host",
    "transfer-encoding",
    "connection",
    "x-webhook-delivery",
    "x-webhook-event",
];

/// Opaque signing secret; never printed
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSecret(Vec<u8>);

impl WebhookSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WebhookSecret(***)")
    }
}

/// Webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Config ID
    pub id: ConfigId,
    /// Target URL
    pub url: String,
    /// Payload shape expected by the receiver
    pub kind: DeliveryKind,
    /// Subscribed event names and patterns
    pub events: BTreeSet<String>,
    /// Custom headers to include
    pub headers: BTreeMap<String, String>,
    /// Secret for signature generation
    #[serde(skip)]
    pub secret: Option<WebhookSecret>,
    /// Whether deliveries are claimed for this config
    pub active: bool,
    /// Owner
    pub owner: OwnerId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    /// Create a new active config
    pub fn new(owner: OwnerId, url: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: ConfigId::new(),
            url: url.trim().to_string(),
            kind: DeliveryKind::Generic,
            events: BTreeSet::new(),
            headers: BTreeMap::new(),
            secret: None,
            active: true,
            owner,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_kind(mut self, kind: DeliveryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = Some(WebhookSecret::new(secret));
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Check everything except the URL, which has its own validator
    pub fn check_shape(&self) -> Result<()> {
        if self.events.is_empty() {
            return Err(WebhookError::InvalidConfig(
                "at least one event subscription is required".to_string(),
            ));
        }
        for pattern in &self.events {
            SubscriptionPattern::parse(pattern)?;
        }

        for (name, value) in &self.headers {
            let parsed = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                WebhookError::InvalidConfig(format!("invalid header name: {name}"))
            })?;
            if is_reserved_header(parsed.as_str()) {
                return Err(WebhookError::InvalidConfig(format!(
                    "header {name} is set by the dispatcher"
                )));
            }
            HeaderValue::from_str(value).map_err(|_| {
                WebhookError::InvalidConfig(format!("invalid value for header {name}"))
            })?;
        }

        Ok(())
    }
}

pub(crate) fn is_reserved_header(lowercase_name: &str) -> bool {
    RESERVED_HEADERS.contains(&lowercase_name)
        || lowercase_name.eq_ignore_ascii_case(SIGNATURE_HEADER)
}

/// Webhook config repository
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Insert or replace a config
    async fn upsert(&self, config: &WebhookConfig) -> Result<()>;

    /// Get config by ID
    async fn get(&self, id: ConfigId) -> Result<Option<WebhookConfig>>;

    /// List configs with the active flag set
    async fn list_active(&self) -> Result<Vec<WebhookConfig>>;

    /// Flip the active flag; returns false if the config does not exist
    async fn set_active(&self, id: ConfigId, active: bool, now: DateTime<Utc>) -> Result<bool>;

    /// Delete a config together with all of its deliveries
    async fn delete(&self, id: ConfigId) -> Result<bool>;
}

/// Outcome of a validated write
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    Saved(WebhookConfig),
    Rejected(String),
}

impl UpsertOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved(_))
    }
}

/// Configuration management entry point
pub struct WebhookConfigService {
    configs: Arc<dyn ConfigStore>,
    deliveries: Arc<dyn DeliveryStore>,
    validator: Arc<UrlValidator>,
    clock: Arc<dyn Clock>,
}

impl WebhookConfigService {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        deliveries: Arc<dyn DeliveryStore>,
        validator: Arc<UrlValidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            configs,
            deliveries,
            validator,
            clock,
        }
    }

    /// Validate and persist a config
    ///
    /// Validation failures are returned as [`UpsertOutcome::Rejected`];
    /// only store failures are errors.
    pub async fn validate_and_upsert(&self, mut config: WebhookConfig) -> Result<UpsertOutcome> {
        if let Some(reason) = self.validator.validate(&config.url).reason() {
            warn!(config_id = %config.id, reason = %reason, "Rejected webhook URL");
            return Ok(UpsertOutcome::Rejected(reason.to_string()));
        }
        if let Err(e) = config.check_shape() {
            warn!(config_id = %config.id, error = %e, "Rejected webhook config");
            return Ok(UpsertOutcome::Rejected(e.to_string()));
        }

        if let Some(existing) = self.configs.get(config.id).await? {
            config.created_at = existing.created_at;
        }
        config.updated_at = self.clock.now();

        self.configs.upsert(&config).await?;
        info!(config_id = %config.id, url = %config.url, "Saved webhook config");

        Ok(UpsertOutcome::Saved(config))
    }

    pub async fn get(&self, id: ConfigId) -> Result<Option<WebhookConfig>> {
        self.configs.get(id).await
    }

    pub async fn list_active(&self) -> Result<Vec<WebhookConfig>> {
        self.configs.list_active().await
    }

    /// Stop future claims for a config; attempts already in flight finish
    pub async fn deactivate(&self, id: ConfigId) -> Result<()> {
        if !self.configs.set_active(id, false, self.clock.now()).await? {
            return Err(WebhookError::ConfigNotFound(id));
        }
        info!(config_id = %id, "Deactivated webhook config");
        Ok(())
    }

    pub async fn activate(&self, id: ConfigId) -> Result<()> {
        let config = self
            .configs
            .get(id)
            .await?
            .ok_or(WebhookError::ConfigNotFound(id))?;
        self.validator.validate(&config.url).into_result()?;

        self.configs.set_active(id, true, self.clock.now()).await?;
        info!(config_id = %id, "Activated webhook config");
        Ok(())
    }

    /// Delete a config and its delivery history
    pub async fn delete(&self, id: ConfigId) -> Result<()> {
        if !self.configs.delete(id).await? {
            return Err(WebhookError::ConfigNotFound(id));
        }
        info!(config_id = %id, "Deleted webhook config");
        Ok(())
    }

    /// Re-trigger a failed delivery as a new lineage with the same payload
    pub async fn redeliver(&self, id: DeliveryId) -> Result<WebhookDelivery> {
        let failed = self
            .deliveries
            .get(id)
            .await?
            .ok_or(WebhookError::DeliveryNotFound(id))?;

        if failed.status != DeliveryStatus::Failed {
            return Err(WebhookError::InvalidTransition {
                from: failed.status,
                to: DeliveryStatus::Pending,
            });
        }
        if self.configs.get(failed.config_id).await?.is_none() {
            return Err(WebhookError::ConfigNotFound(failed.config_id));
        }

        let fresh = WebhookDelivery::pending(
            failed.config_id,
            &failed.event_type,
            failed.payload.clone(),
            self.clock.now(),
        );
        self.deliveries.insert(std::slice::from_ref(&fresh)).await?;

        info!(
            delivery_id = %fresh.id,
            original_delivery_id = %failed.id,
            config_id = %fresh.config_id,
            "Re-triggered failed delivery"
        );
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WebhookConfig {
        WebhookConfig::new(OwnerId::new("user-1"), "https://hooks.example.com/x", Utc::now())
            .with_events(["run.failed"])
    }

    #[test]
    fn test_config_creation() {
        let config = config()
            .with_kind(DeliveryKind::Slack)
            .with_header("X-Team", "qa")
            .with_secret(b"s3cret".to_vec());

        assert!(config.active);
        assert_eq!(config.kind, DeliveryKind::Slack);
        assert_eq!(config.headers.get("X-Team").map(String::as_str), Some("qa"));
        assert_eq!(config.secret.as_ref().unwrap().expose(), b"s3cret");
    }

    #[test]
    fn test_secret_is_redacted() {
        let config = config().with_secret(b"top-secret".to_vec());
        let debug = format!("{:?}", config);
        assert!(!debug.contains("top-secret"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_shape_requires_events() {
        let mut config = config();
        config.events.clear();
        assert!(config.check_shape().is_err());
    }

    #[test]
    fn test_shape_rejects_bad_patterns() {
        let config = config().with_events(["run.*", "Run.Failed"]);
        assert!(matches!(
            config.check_shape(),
            Err(WebhookError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_shape_rejects_reserved_and_invalid_headers() {
        assert!(config().with_header("Content-Type", "text/plain").check_shape().is_err());
        assert!(config().with_header("x-signature", "forged").check_shape().is_err());
        assert!(config().with_header("bad header", "v").check_shape().is_err());
        assert!(config().with_header("X-Ok", "line\nbreak").check_shape().is_err());
        assert!(config().with_header("Authorization", "Bearer t").check_shape().is_ok());
    }
}
