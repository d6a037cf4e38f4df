//! Outbound webhook delivery for qahub
//!
//! This crate notifies third-party endpoints of QA domain events (package
//! completed, run failed, ...):
//! - URL safety validation against SSRF, including DNS-rebinding protection
//! - Subscription matching over exact names and category wildcards
//! - A durable delivery state machine with bounded exponential backoff
//! - A horizontally scalable retry scheduler built on atomic claims
//!
//! # Example
//!
//! ```rust,ignore
//! use qahub_webhook::{
//!     HttpDispatcher, InMemoryWebhookStore, RetryPolicy, RetryScheduler, UrlValidator,
//!     WebhookNotifier,
//! };
//!
//! let store = Arc::new(InMemoryWebhookStore::new());
//! let validator = Arc::new(UrlValidator::default());
//! let dispatcher = Arc::new(HttpDispatcher::new(&delivery_config, validator.clone())?);
//!
//! let notifier = WebhookNotifier::new(store.clone(), store.clone(), clock.clone());
//! notifier.notify("run.failed", br#"{"runId":"r-1"}"#).await?;
//!
//! let scheduler = RetryScheduler::new(store, dispatcher, validator, policy, config, clock);
//! scheduler.run(shutdown_token).await;
//! ```

// Module order matters due to dependencies
pub mod validation;
pub mod events;
pub mod signature;
pub mod retry;
pub mod subscription;
pub mod delivery;
pub mod matcher;
pub mod memory;
pub mod dispatcher;
pub mod scheduler;
pub mod notifier;
pub mod diagnostics;

pub use delivery::*;
pub use diagnostics::*;
pub use dispatcher::*;
pub use events::*;
pub use matcher::*;
pub use memory::*;
pub use notifier::*;
pub use retry::*;
pub use scheduler::*;
pub use signature::*;
pub use subscription::*;
pub use validation::*;

use qahub_core::{ConfigId, DeliveryId};
use thiserror::Error;

/// Webhook errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Webhook config not found: {0}")]
    ConfigNotFound(ConfigId),

    #[error("Delivery not found: {0}")]
    DeliveryNotFound(DeliveryId),

    #[error("Rejected by URL safety policy: {0}")]
    UnsafeUrl(#[from] RejectReason),

    #[error("Invalid webhook config: {0}")]
    InvalidConfig(String),

    #[error("Invalid event type: {0}")]
    InvalidEventType(String),

    #[error("Invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("Illegal delivery transition from {from} to {to}")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Store unavailable: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WebhookError {
    /// Whether the error means the backing store could not be reached
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, WebhookError>;
