//! Retry scheduler
//!
//! The only driver of delivery state transitions. Each cycle claims a bounded
//! batch of due deliveries, re-validates every target, dispatches up to
//! `concurrency` attempts at once and writes the resulting transitions back
//! under the claim's lease. A separate reaper loop hands claims of crashed
//! workers back to the queue.
//!
//! Any number of schedulers may share one store; the store's atomic claim is
//! the only coordination between them.

use crate::{
    delivery::{DeliveryClaim, DeliveryStatus, DeliveryStore, FailureKind, Transition},
    dispatcher::Dispatch,
    retry::RetryPolicy,
    validation::{UrlValidator, Verdict},
    Result, WebhookError,
};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use qahub_core::{Clock, SchedulerConfig};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub claimed: u64,
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
    /// Failed by the safety policy, a subset of `failed`
    pub blocked: u64,
    pub reclaimed: u64,
    /// Outcomes discarded because the claim had been reclaimed
    pub lost_claims: u64,
    pub store_errors: u64,
    /// Store failures since the last successful store call
    pub consecutive_store_errors: u64,
}

/// What one cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub blocked: usize,
    pub lost_claims: usize,
    pub store_errors: usize,
}

impl CycleReport {
    fn tally(&mut self, result: &Result<Option<Transition>>) {
        match result {
            Ok(Some(t)) => match t.to {
                DeliveryStatus::Delivered => self.delivered += 1,
                DeliveryStatus::Retrying => self.retried += 1,
                DeliveryStatus::Failed => {
                    self.failed += 1;
                    if t.failure == Some(FailureKind::ValidationRejected) {
                        self.blocked += 1;
                    }
                }
                DeliveryStatus::Pending | DeliveryStatus::Delivering => {}
            },
            Ok(None) => self.lost_claims += 1,
            Err(e) if e.is_store_failure() => self.store_errors += 1,
            Err(_) => {}
        }
    }
}

/// Claims due deliveries and drives them through the state machine
pub struct RetryScheduler {
    store: Arc<dyn DeliveryStore>,
    dispatcher: Arc<dyn Dispatch>,
    validator: Arc<UrlValidator>,
    policy: RetryPolicy,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    stats: RwLock<SchedulerStats>,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        dispatcher: Arc<dyn Dispatch>,
        validator: Arc<UrlValidator>,
        policy: RetryPolicy,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            validator,
            policy,
            config,
            clock,
            stats: RwLock::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        *self.stats.read()
    }

    /// Run the claim loop and the reaper until `shutdown` is cancelled.
    /// The batch in flight when cancellation arrives is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            max_attempts = self.policy.max_attempts,
            "Retry scheduler started"
        );

        tokio::join!(
            self.claim_loop(shutdown.clone()),
            self.reaper_loop(shutdown)
        );

        info!(stats = ?self.stats(), "Retry scheduler stopped");
    }

    async fn claim_loop(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let wait = match self.run_cycle().await {
                // A full batch means more work is likely due right now
                Ok(report) if report.claimed >= self.config.batch_size => Duration::ZERO,
                Ok(_) => self.config.poll_interval(),
                Err(_) => self.config.store_error_backoff(),
            };

            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn reaper_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reaper_interval()) => {}
            }
            // Errors are already logged and counted
            let _ = self.reap_once().await;
        }
    }

    /// Claim one batch and process it to completion
    ///
    /// Only a failed claim is an error; per-delivery failures are logged
    /// and counted in the report.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let claims = match self
            .store
            .claim_due(self.clock.now(), self.config.batch_size)
            .await
        {
            Ok(claims) => claims,
            Err(e) => {
                self.store_failed(&e, "claim due deliveries");
                return Err(e);
            }
        };

        let mut report = CycleReport {
            claimed: claims.len(),
            ..Default::default()
        };
        if claims.is_empty() {
            self.record_cycle(&report);
            return Ok(report);
        }
        debug!(claimed = claims.len(), "Claimed due deliveries");

        let results: Vec<_> = stream::iter(claims)
            .map(|claim| self.process(claim))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for result in &results {
            report.tally(result);
        }
        self.record_cycle(&report);

        Ok(report)
    }

    /// Reclaim claims that outlived the lease timeout
    pub async fn reap_once(&self) -> Result<u64> {
        let reclaimed = match self
            .store
            .reclaim_stale(self.clock.now(), self.config.lease_timeout())
            .await
        {
            Ok(n) => n,
            Err(e) => {
                self.store_failed(&e, "reclaim stale deliveries");
                return Err(e);
            }
        };

        if reclaimed > 0 {
            warn!(
                reclaimed,
                lease_timeout_secs = self.config.lease_timeout_secs,
                failure = %FailureKind::StaleClaimRecovered,
                "Reclaimed stale delivery claims"
            );
        }
        let mut stats = self.stats.write();
        stats.reclaimed += reclaimed;
        stats.consecutive_store_errors = 0;

        Ok(reclaimed)
    }

    async fn process(&self, claim: DeliveryClaim) -> Result<Option<Transition>> {
        let DeliveryClaim {
            mut delivery,
            config,
            lease,
        } = claim;

        // The URL may have changed, or a blocklist grown, since it was saved
        let transition = match self.validator.validate(&config.url) {
            Verdict::Rejected(reason) => {
                warn!(
                    delivery_id = %delivery.id,
                    config_id = %config.id,
                    reason = %reason,
                    "Webhook target failed safety validation"
                );
                delivery.reject_unsafe(&reason, self.clock.now())?
            }
            Verdict::Allowed => {
                let outcome = self.dispatcher.attempt(&delivery, &config).await;
                delivery.record_attempt(&outcome, &self.policy, self.clock.now())?
            }
        };

        match self.store.record_outcome(&delivery, lease).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    delivery_id = %delivery.id,
                    status = %transition.to,
                    "Claim was reclaimed before the outcome was recorded"
                );
                return Ok(None);
            }
            Err(e) => {
                self.store_failed(&e, "record delivery outcome");
                return Err(e);
            }
        }

        match transition.to {
            DeliveryStatus::Delivered => info!(
                delivery_id = %delivery.id,
                config_id = %config.id,
                event_type = %delivery.event_type,
                attempt = delivery.attempt_count,
                status_code = ?delivery.last_status_code,
                "Webhook delivered"
            ),
            DeliveryStatus::Retrying => info!(
                delivery_id = %delivery.id,
                config_id = %config.id,
                attempt = delivery.attempt_count,
                status_code = ?delivery.last_status_code,
                next_retry_at = ?delivery.next_retry_at,
                "Webhook delivery will be retried"
            ),
            _ => error!(
                delivery_id = %delivery.id,
                config_id = %config.id,
                event_type = %delivery.event_type,
                attempt = delivery.attempt_count,
                failure = ?transition.failure,
                error = ?delivery.last_error,
                "Webhook delivery failed permanently"
            ),
        }

        Ok(Some(transition))
    }

    fn record_cycle(&self, report: &CycleReport) {
        let mut stats = self.stats.write();
        stats.cycles += 1;
        stats.claimed += report.claimed as u64;
        stats.delivered += report.delivered as u64;
        stats.retried += report.retried as u64;
        stats.failed += report.failed as u64;
        stats.blocked += report.blocked as u64;
        stats.lost_claims += report.lost_claims as u64;
        if report.store_errors == 0 {
            stats.consecutive_store_errors = 0;
        }
    }

    fn store_failed(&self, err: &WebhookError, operation: &str) {
        let consecutive = {
            let mut stats = self.stats.write();
            stats.store_errors += 1;
            stats.consecutive_store_errors += 1;
            stats.consecutive_store_errors
        };

        error!(
            alert = true,
            operation,
            consecutive_failures = consecutive,
            error = %err,
            "Delivery store unavailable"
        );
    }
}
