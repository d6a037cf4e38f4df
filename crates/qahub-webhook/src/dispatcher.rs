//! Outbound webhook dispatch
//!
//! Performs exactly one delivery attempt and reports what happened as an
//! [`AttemptOutcome`]; it never decides about retries itself.
//!
//! The HTTP client is hardened against SSRF beyond the syntactic URL check:
//! every resolved address is filtered through the validator's IP rules before
//! the socket connects, and every redirect target is validated again.

use crate::{
    delivery::{AttemptOutcome, WebhookDelivery},
    signature::WebhookSigner,
    subscription::{is_reserved_header, WebhookConfig},
    validation::{RejectReason, UrlValidator, Verdict},
    Result, WebhookError,
};
use async_trait::async_trait;
use qahub_core::DeliveryConfig;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{redirect, Client};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub const EVENT_HEADER: &str = "x-webhook-event";
pub const DELIVERY_HEADER: &str = "x-webhook-delivery";
pub const ATTEMPT_HEADER: &str = "x-webhook-attempt";

/// Performs a single delivery attempt
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn attempt(&self, delivery: &WebhookDelivery, config: &WebhookConfig) -> AttemptOutcome;
}

/// A connection or redirect target refused by the safety policy
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct UnsafeTarget(pub RejectReason);

/// Resolver that only hands out addresses passing the validator's IP rules
#[derive(Debug)]
pub struct PinnedResolver {
    validator: Arc<UrlValidator>,
}

impl PinnedResolver {
    pub fn new(validator: Arc<UrlValidator>) -> Self {
        Self { validator }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

impl Resolve for PinnedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_pinned(self.validator.clone(), name.as_str().to_string()))
    }
}

async fn resolve_pinned(
    validator: Arc<UrlValidator>,
    host: String,
) -> std::result::Result<Addrs, BoxError> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
    let allowed = pin_addresses(&validator, &host, resolved)?;
    Ok(Box::new(allowed.into_iter()))
}

/// Keep only addresses that pass the IP rules
fn pin_addresses(
    validator: &UrlValidator,
    host: &str,
    resolved: Vec<SocketAddr>,
) -> std::result::Result<Vec<SocketAddr>, BoxError> {
    let mut rejected = None;
    let allowed: Vec<SocketAddr> = resolved
        .into_iter()
        .filter(|addr| match validator.check_ip(addr.ip()) {
            Ok(()) => true,
            Err(reason) => {
                rejected.get_or_insert(reason);
                false
            }
        })
        .collect();

    if !allowed.is_empty() {
        return Ok(allowed);
    }
    match rejected {
        Some(reason) => {
            warn!(host = %host, reason = %reason, "Resolved address blocked");
            Err(Box::new(UnsafeTarget(reason)))
        }
        None => Err(format!("{host} did not resolve to any address").into()),
    }
}

/// reqwest based dispatcher
pub struct HttpDispatcher {
    client: Client,
    max_body_bytes: usize,
    signature_header: HeaderName,
    user_agent: HeaderValue,
}

impl HttpDispatcher {
    pub fn new(config: &DeliveryConfig, validator: Arc<UrlValidator>) -> Result<Self> {
        let signature_header = HeaderName::from_bytes(config.signature_header.as_bytes())
            .map_err(|e| WebhookError::InvalidConfig(format!("signature header: {e}")))?;
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| WebhookError::InvalidConfig(format!("user agent: {e}")))?;

        let redirect_validator = validator.clone();
        let max_redirects = config.max_redirects;
        let redirect_policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                return attempt.stop();
            }
            match redirect_validator.validate_url(attempt.url()) {
                Verdict::Allowed => attempt.follow(),
                Verdict::Rejected(reason) => attempt.error(UnsafeTarget(reason)),
            }
        });

        // A proxy resolves the host itself, bypassing the pinned resolver
        let client = Client::builder()
            .no_proxy()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .redirect(redirect_policy)
            .dns_resolver(Arc::new(PinnedResolver::new(validator)))
            .build()
            .map_err(|e| WebhookError::Http(e.to_string()))?;

        Ok(Self {
            client,
            max_body_bytes: config.max_response_body_bytes,
            signature_header,
            user_agent,
        })
    }

    fn headers(&self, delivery: &WebhookDelivery, config: &WebhookConfig) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, self.user_agent.clone());
        if let Ok(value) = HeaderValue::from_str(&delivery.event_type) {
            headers.insert(EVENT_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&delivery.id.to_string()) {
            headers.insert(DELIVERY_HEADER, value);
        }
        headers.insert(ATTEMPT_HEADER, HeaderValue::from(delivery.attempt_count + 1));

        for (name, value) in &config.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                continue;
            };
            if is_reserved_header(name.as_str()) || name == self.signature_header {
                continue;
            }
            headers.insert(name, value);
        }

        if let Some(secret) = &config.secret {
            let signature = WebhookSigner::new(secret.expose()).sign(&delivery.payload);
            if let Ok(value) = HeaderValue::from_str(&signature) {
                headers.insert(self.signature_header.clone(), value);
            }
        }

        headers
    }

    async fn read_body(&self, mut response: reqwest::Response) -> Option<String> {
        let mut body = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = self.max_body_bytes - body.len();
                    body.extend_from_slice(&chunk[..chunk.len().min(room)]);
                    if body.len() >= self.max_body_bytes {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Response body read failed");
                    break;
                }
            }
        }

        if body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&body).into_owned())
        }
    }
}

#[async_trait]
impl Dispatch for HttpDispatcher {
    async fn attempt(&self, delivery: &WebhookDelivery, config: &WebhookConfig) -> AttemptOutcome {
        let started = Instant::now();
        debug!(
            delivery_id = %delivery.id,
            config_id = %config.id,
            attempt = delivery.attempt_count + 1,
            "Dispatching webhook"
        );

        let result = self
            .client
            .post(&config.url)
            .headers(self.headers(delivery, config))
            .body(delivery.payload.clone())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                let body = self.read_body(response).await;
                let duration_ms = elapsed_ms(started);

                if !status.is_success() {
                    warn!(
                        delivery_id = %delivery.id,
                        url = %config.url,
                        status_code = status.as_u16(),
                        "Webhook delivery received non-success response"
                    );
                }
                AttemptOutcome::response(status.as_u16(), body, duration_ms)
            }
            Err(e) => {
                let duration_ms = elapsed_ms(started);
                if let Some(reason) = find_rejection(&e) {
                    warn!(
                        delivery_id = %delivery.id,
                        url = %config.url,
                        reason = %reason,
                        "Webhook target blocked during delivery"
                    );
                    return AttemptOutcome::rejected(reason, duration_ms);
                }

                let message = describe(&e);
                warn!(
                    delivery_id = %delivery.id,
                    url = %config.url,
                    error = %message,
                    "Webhook delivery failed"
                );
                AttemptOutcome::network_error(message, duration_ms)
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u64::MAX as u128) as u64
}

fn find_rejection(err: &reqwest::Error) -> Option<RejectReason> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(UnsafeTarget(reason)) = e.downcast_ref::<UnsafeTarget>() {
            return Some(reason.clone());
        }
        source = e.source();
    }
    None
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        return "request timed out".to_string();
    }

    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinning_filters_blocked_addresses() {
        let validator = UrlValidator::default();
        let public: SocketAddr = "93.184.216.34:0".parse().unwrap();
        let internal: SocketAddr = "10.1.2.3:0".parse().unwrap();

        let allowed = pin_addresses(&validator, "mixed.example.com", vec![internal, public]).unwrap();
        assert_eq!(allowed, vec![public]);
    }

    #[test]
    fn test_pinning_rejects_rebinding_to_internal() {
        let validator = UrlValidator::default();
        let resolved = vec![
            "127.0.0.1:0".parse().unwrap(),
            "[::ffff:169.254.169.254]:0".parse().unwrap(),
        ];

        let err = pin_addresses(&validator, "rebind.example.com", resolved).unwrap_err();
        let target = err.downcast_ref::<UnsafeTarget>().unwrap();
        assert_eq!(target.0.category(), "private/internal");
    }

    #[test]
    fn test_pinning_empty_resolution_is_not_a_rejection() {
        let err = pin_addresses(&UrlValidator::default(), "nowhere.example.com", vec![]).unwrap_err();
        assert!(err.downcast_ref::<UnsafeTarget>().is_none());
    }

    #[test]
    fn test_invalid_signature_header_rejected() {
        let config = DeliveryConfig {
            signature_header: "bad header".to_string(),
            ..DeliveryConfig::default()
        };
        assert!(matches!(
            HttpDispatcher::new(&config, Arc::new(UrlValidator::default())),
            Err(WebhookError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_headers_order_and_overrides() {
        let dispatcher =
            HttpDispatcher::new(&DeliveryConfig::default(), Arc::new(UrlValidator::default()))
                .unwrap();
        let config = WebhookConfig::new(
            qahub_core::OwnerId::new("o"),
            "https://hooks.example.com/x",
            chrono::Utc::now(),
        )
        .with_events(["*"])
        .with_header("User-Agent", "custom-agent")
        .with_header("X-Signature", "forged")
        .with_secret(b"secret".to_vec());
        let delivery = WebhookDelivery::pending(
            config.id,
            "run.failed",
            b"{\"a\":1}".to_vec(),
            chrono::Utc::now(),
        );

        let headers = dispatcher.headers(&delivery, &config);

        assert_eq!(headers[USER_AGENT], "custom-agent");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers[ATTEMPT_HEADER], "1");
        assert_eq!(headers[EVENT_HEADER], "run.failed");
        assert_eq!(
            headers["X-Signature"],
            WebhookSigner::new(b"secret").sign(b"{\"a\":1}").as_str()
        );
    }
}
