//! Shared fixtures for qahub-webhook integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use qahub_core::{ManualClock, OwnerId, SchedulerConfig};
use qahub_webhook::{
    AttemptOutcome, ConfigStore, DeliveryStore, Dispatch, InMemoryWebhookStore, RetryPolicy,
    RetryScheduler, UrlValidator, WebhookConfig, WebhookDelivery,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Dispatcher that replays scripted outcomes and counts calls
pub struct ScriptedDispatcher {
    script: Mutex<VecDeque<AttemptOutcome>>,
    fallback: AttemptOutcome,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedDispatcher {
    pub fn always(outcome: AttemptOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: outcome,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn sequence(outcomes: Vec<AttemptOutcome>, then: AttemptOutcome) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            ..Self::always(then)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatch for ScriptedDispatcher {
    async fn attempt(&self, _delivery: &WebhookDelivery, _config: &WebhookConfig) -> AttemptOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn config(url: &str, events: &[&str]) -> WebhookConfig {
    WebhookConfig::new(OwnerId::new("qa-team"), url, chrono::Utc::now())
        .with_events(events.iter().copied())
}

pub fn no_jitter(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_secs(10), Duration::from_secs(3600))
}

pub struct Harness {
    pub store: Arc<InMemoryWebhookStore>,
    pub clock: Arc<ManualClock>,
    pub dispatcher: Arc<ScriptedDispatcher>,
    pub config: WebhookConfig,
}

impl Harness {
    pub async fn new(url: &str, dispatcher: ScriptedDispatcher) -> Self {
        let store = Arc::new(InMemoryWebhookStore::new());
        let clock = Arc::new(ManualClock::default());
        let config = config(url, &["*"]);
        store.upsert(&config).await.unwrap();

        Self {
            store,
            clock,
            dispatcher: Arc::new(dispatcher),
            config,
        }
    }

    pub fn scheduler(&self, policy: RetryPolicy) -> RetryScheduler {
        self.scheduler_with(policy, SchedulerConfig::default())
    }

    pub fn scheduler_with(&self, policy: RetryPolicy, config: SchedulerConfig) -> RetryScheduler {
        RetryScheduler::new(
            self.store.clone(),
            self.dispatcher.clone(),
            Arc::new(UrlValidator::default()),
            policy,
            config,
            self.clock.clone(),
        )
    }

    pub async fn enqueue(&self) -> WebhookDelivery {
        use qahub_core::Clock;

        let delivery = WebhookDelivery::pending(
            self.config.id,
            "run.failed",
            br#"{"runId":"r-1"}"#.to_vec(),
            self.clock.now(),
        );
        self.store.insert(std::slice::from_ref(&delivery)).await.unwrap();
        delivery
    }

    pub async fn load(&self, delivery: &WebhookDelivery) -> WebhookDelivery {
        DeliveryStore::get(&*self.store, delivery.id)
            .await
            .unwrap()
            .unwrap()
    }
}
