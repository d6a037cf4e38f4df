//! Webhook delivery tracking
//!
//! A [`WebhookDelivery`] is the attempt lineage for one (config, event) pair.
//! All status changes go through the transition methods on the record, which
//! keep the timestamp invariants intact:
//!
//! - `completed_at` is set iff the status is terminal
//! - `next_retry_at` is set iff the status is `Retrying`
//! - `attempt_count` never decreases

use crate::{retry::RetryPolicy, subscription::WebhookConfig, validation::RejectReason};
use crate::{Result, WebhookError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qahub_core::{ConfigId, DeliveryId, LeaseId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for its first attempt
    Pending,
    /// Claimed by a worker, attempt in flight
    Delivering,
    /// Delivered successfully
    Delivered,
    /// Failed, waiting for `next_retry_at`
    Retrying,
    /// Failed permanently
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "delivering" => Some(Self::Delivering),
            "delivered" => Some(Self::Delivered),
            "retrying" => Some(Self::Retrying),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Whether a worker may claim a record in this status
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a delivery left the happy path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Target failed the URL safety policy; never retried
    ValidationRejected,
    /// Network error, timeout, 5xx or 429
    TransientDeliveryFailure,
    /// 4xx other than 429, or an unexpected status class
    PermanentDeliveryFailure,
    /// Retryable failure with no attempts left
    AttemptsExhausted,
    /// Claim expired and the record was handed back to the queue
    StaleClaimRecovered,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationRejected => "validation_rejected",
            Self::TransientDeliveryFailure => "transient_delivery_failure",
            Self::PermanentDeliveryFailure => "permanent_delivery_failure",
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::StaleClaimRecovered => "stale_claim_recovered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "validation_rejected" => Some(Self::ValidationRejected),
            "transient_delivery_failure" => Some(Self::TransientDeliveryFailure),
            "permanent_delivery_failure" => Some(Self::PermanentDeliveryFailure),
            "attempts_exhausted" => Some(Self::AttemptsExhausted),
            "stale_claim_recovered" => Some(Self::StaleClaimRecovered),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an attempt result maps onto the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    Success,
    Retryable,
    Permanent,
    Rejected,
}

/// Classify an HTTP status code
pub fn classify_status(status: u16) -> OutcomeClass {
    match status {
        200..=299 => OutcomeClass::Success,
        429 | 500..=599 => OutcomeClass::Retryable,
        _ => OutcomeClass::Permanent,
    }
}

/// Result of a single dispatch attempt
#[derive(Debug, Clone, Default)]
pub struct AttemptOutcome {
    /// Response status, absent on network errors
    pub status_code: Option<u16>,
    /// Captured (truncated) response body
    pub body: Option<String>,
    /// Transport error message
    pub error: Option<String>,
    /// Set when a redirect or resolved address failed the safety policy
    pub rejected: Option<RejectReason>,
    pub duration_ms: u64,
}

impl AttemptOutcome {
    pub fn response(status_code: u16, body: Option<String>, duration_ms: u64) -> Self {
        Self {
            status_code: Some(status_code),
            body,
            duration_ms,
            ..Default::default()
        }
    }

    pub fn network_error(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            error: Some(error.into()),
            duration_ms,
            ..Default::default()
        }
    }

    pub fn rejected(reason: RejectReason, duration_ms: u64) -> Self {
        Self {
            error: Some(blocked_message(&reason)),
            rejected: Some(reason),
            duration_ms,
            ..Default::default()
        }
    }

    pub fn classify(&self) -> OutcomeClass {
        if self.rejected.is_some() {
            return OutcomeClass::Rejected;
        }
        match self.status_code {
            Some(status) => classify_status(status),
            None => OutcomeClass::Retryable,
        }
    }
}

fn blocked_message(reason: &RejectReason) -> String {
    format!("blocked by safety policy: {reason}")
}

/// A state change applied to a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
    pub failure: Option<FailureKind>,
}

/// Webhook delivery record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Delivery ID
    pub id: DeliveryId,
    /// Owning config
    pub config_id: ConfigId,
    /// Event type
    pub event_type: String,
    /// Request body, fixed at creation
    pub payload: Vec<u8>,
    /// Current status
    pub status: DeliveryStatus,
    /// Attempts dispatched so far
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Set only while retrying
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_status_code: Option<u16>,
    /// Response body (truncated)
    pub last_response_body: Option<String>,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Current claim, if delivering
    pub lease_id: Option<LeaseId>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Created at
    pub created_at: DateTime<Utc>,
    /// Completed at (success or final failure)
    pub completed_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    /// Create a new pending delivery
    pub fn pending(
        config_id: ConfigId,
        event_type: &str,
        payload: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            config_id,
            event_type: event_type.to_string(),
            payload,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            last_status_code: None,
            last_response_body: None,
            last_error: None,
            failure_kind: None,
            lease_id: None,
            claimed_at: None,
            created_at: now,
            completed_at: None,
        }
    }

    /// Whether a worker may claim this record at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            DeliveryStatus::Pending => true,
            DeliveryStatus::Retrying => self.next_retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    /// Time the record became (or becomes) due, used for claim ordering
    pub fn due_at(&self) -> DateTime<Utc> {
        self.next_retry_at.unwrap_or(self.created_at)
    }

    /// Whether a `Delivering` claim has outlived the lease timeout
    pub fn is_stale(&self, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
        self.status == DeliveryStatus::Delivering
            && self
                .claimed_at
                .map_or(true, |at| at + to_chrono(lease_timeout) < now)
    }

    /// `Pending | Retrying -> Delivering`
    pub fn claim(&mut self, lease: LeaseId, now: DateTime<Utc>) -> Result<Transition> {
        if !self.is_due(now) {
            return Err(self.illegal(DeliveryStatus::Delivering));
        }

        let from = self.status;
        self.status = DeliveryStatus::Delivering;
        self.next_retry_at = None;
        self.lease_id = Some(lease);
        self.claimed_at = Some(now);

        Ok(Transition {
            from,
            to: DeliveryStatus::Delivering,
            failure: None,
        })
    }

    /// `Delivering -> Failed` when the config no longer passes the safety
    /// policy; the dispatcher is never called and no attempt is counted
    pub fn reject_unsafe(&mut self, reason: &RejectReason, now: DateTime<Utc>) -> Result<Transition> {
        self.expect_delivering(DeliveryStatus::Failed)?;

        self.last_error = Some(blocked_message(reason));
        Ok(self.finish(DeliveryStatus::Failed, Some(FailureKind::ValidationRejected), now))
    }

    /// Apply the outcome of a dispatched attempt
    pub fn record_attempt(
        &mut self,
        outcome: &AttemptOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let class = outcome.classify();
        let target = match class {
            OutcomeClass::Success => DeliveryStatus::Delivered,
            OutcomeClass::Retryable if !policy.is_exhausted(self.attempt_count + 1) => {
                DeliveryStatus::Retrying
            }
            _ => DeliveryStatus::Failed,
        };
        self.expect_delivering(target)?;

        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
        self.last_status_code = outcome.status_code;
        self.last_response_body = outcome.body.clone();
        self.last_error = outcome.error.clone().or_else(|| {
            outcome
                .status_code
                .filter(|_| class != OutcomeClass::Success)
                .map(|status| format!("receiver responded with HTTP {status}"))
        });

        let transition = match class {
            OutcomeClass::Success => self.finish(DeliveryStatus::Delivered, None, now),
            OutcomeClass::Rejected => {
                self.finish(DeliveryStatus::Failed, Some(FailureKind::ValidationRejected), now)
            }
            OutcomeClass::Permanent => self.finish(
                DeliveryStatus::Failed,
                Some(FailureKind::PermanentDeliveryFailure),
                now,
            ),
            OutcomeClass::Retryable if target == DeliveryStatus::Failed => {
                self.finish(DeliveryStatus::Failed, Some(FailureKind::AttemptsExhausted), now)
            }
            OutcomeClass::Retryable => {
                let delay = policy.delay_for(self.attempt_count);
                self.status = DeliveryStatus::Retrying;
                self.next_retry_at = Some(now + to_chrono(delay));
                self.failure_kind = Some(FailureKind::TransientDeliveryFailure);
                self.release();
                Transition {
                    from: DeliveryStatus::Delivering,
                    to: DeliveryStatus::Retrying,
                    failure: self.failure_kind,
                }
            }
        };

        Ok(transition)
    }

    /// `Delivering -> Retrying` for a claim whose worker presumably died;
    /// the record is immediately due again
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> Result<Transition> {
        self.expect_delivering(DeliveryStatus::Retrying)?;

        self.status = DeliveryStatus::Retrying;
        self.next_retry_at = Some(now);
        self.failure_kind = Some(FailureKind::StaleClaimRecovered);
        self.release();

        Ok(Transition {
            from: DeliveryStatus::Delivering,
            to: DeliveryStatus::Retrying,
            failure: self.failure_kind,
        })
    }

    fn finish(
        &mut self,
        status: DeliveryStatus,
        failure: Option<FailureKind>,
        now: DateTime<Utc>,
    ) -> Transition {
        let from = self.status;
        self.status = status;
        self.failure_kind = failure;
        self.next_retry_at = None;
        self.completed_at = Some(now);
        if failure.is_none() {
            self.last_error = None;
        }
        self.release();

        Transition {
            from,
            to: status,
            failure,
        }
    }

    fn release(&mut self) {
        self.lease_id = None;
        self.claimed_at = None;
    }

    fn expect_delivering(&self, to: DeliveryStatus) -> Result<()> {
        if self.status != DeliveryStatus::Delivering {
            return Err(self.illegal(to));
        }
        Ok(())
    }

    fn illegal(&self, to: DeliveryStatus) -> WebhookError {
        WebhookError::InvalidTransition {
            from: self.status,
            to,
        }
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

/// A claimed delivery together with its config
#[derive(Debug, Clone)]
pub struct DeliveryClaim {
    pub delivery: WebhookDelivery,
    pub config: WebhookConfig,
    /// Lease that guards the outcome write
    pub lease: LeaseId,
}

/// Global queue depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogStats {
    pub pending: u64,
    pub retrying: u64,
    pub delivering: u64,
}

impl BacklogStats {
    pub fn total(&self) -> u64 {
        self.pending + self.retrying + self.delivering
    }
}

/// Delivery record store
///
/// Every coordination point between scheduler instances goes through these
/// operations; implementations must make `claim_due` and `record_outcome`
/// atomic per row.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert new deliveries
    async fn insert(&self, deliveries: &[WebhookDelivery]) -> Result<()>;

    /// Atomically move up to `limit` due records of active configs to
    /// `Delivering`, oldest due time first. Each row is handed to exactly
    /// one caller.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeliveryClaim>>;

    /// Persist the state of a claimed delivery if `lease` is still current.
    /// Returns false when the claim was lost.
    async fn record_outcome(&self, delivery: &WebhookDelivery, lease: LeaseId) -> Result<bool>;

    /// Hand claims older than `lease_timeout` back to the queue
    async fn reclaim_stale(&self, now: DateTime<Utc>, lease_timeout: Duration) -> Result<u64>;

    /// Get delivery by ID
    async fn get(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>>;

    /// Most recent deliveries of a config, newest first
    async fn recent_for_config(&self, config_id: ConfigId, limit: usize)
        -> Result<Vec<WebhookDelivery>>;

    /// Number of failed deliveries of a config
    async fn failed_count_for_config(&self, config_id: ConfigId) -> Result<u64>;

    /// Queue depth across all configs
    async fn backlog(&self) -> Result<BacklogStats>;

    /// Delete terminal deliveries completed before `older_than`
    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64>;
}
