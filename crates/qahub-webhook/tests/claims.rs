//! Claim discipline across concurrent schedulers and the stale-claim reaper.

mod common;

use common::{config, no_jitter, Harness, ScriptedDispatcher};
use futures::future::join_all;
use qahub_core::{Clock, SchedulerConfig};
use qahub_webhook::{
    AttemptOutcome, ConfigStore, DeliveryStatus, DeliveryStore, FailureKind,
    InMemoryWebhookStore, RetryPolicy, WebhookDelivery,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// ==================== Atomic Claim Tests ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_on_one_row_yield_exactly_one_winner() {
    for _ in 0..20 {
        let store = Arc::new(InMemoryWebhookStore::new());
        let config = config("https://hooks.example.com/x", &["*"]);
        store.upsert(&config).await.unwrap();

        let now = chrono::Utc::now();
        let delivery = WebhookDelivery::pending(config.id, "run.failed", b"{}".to_vec(), now);
        store.insert(&[delivery]).await.unwrap();

        let tasks = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_due(now, 10).await.unwrap().len() })
        });
        let won: usize = join_all(tasks).await.into_iter().map(|r| r.unwrap()).sum();

        assert_eq!(won, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_partition_the_backlog() {
    let store = Arc::new(InMemoryWebhookStore::new());
    let config = config("https://hooks.example.com/x", &["*"]);
    store.upsert(&config).await.unwrap();

    let now = chrono::Utc::now();
    let deliveries: Vec<_> = (0..200)
        .map(|_| WebhookDelivery::pending(config.id, "run.failed", b"{}".to_vec(), now))
        .collect();
    store.insert(&deliveries).await.unwrap();

    let tasks = (0..8).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                let batch = store.claim_due(now, 7).await.unwrap();
                if batch.is_empty() {
                    return ids;
                }
                ids.extend(batch.into_iter().map(|c| c.delivery.id));
            }
        })
    });

    let mut seen = HashSet::new();
    for ids in join_all(tasks).await {
        for id in ids.unwrap() {
            assert!(seen.insert(id), "delivery {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_schedulers_dispatch_each_delivery_once() {
    let dispatcher = ScriptedDispatcher::always(AttemptOutcome::response(200, None, 1))
        .with_delay(Duration::from_millis(5));
    let harness = Harness::new("https://hooks.example.com/qa", dispatcher).await;
    for _ in 0..40 {
        harness.enqueue().await;
    }

    let config = SchedulerConfig::default().with_batch_size(5).with_concurrency(4);
    let a = harness.scheduler_with(no_jitter(5), config.clone());
    let b = harness.scheduler_with(no_jitter(5), config);

    loop {
        let (ra, rb) = tokio::join!(a.run_cycle(), b.run_cycle());
        if ra.unwrap().claimed + rb.unwrap().claimed == 0 {
            break;
        }
    }

    assert_eq!(harness.dispatcher.calls(), 40);
    assert_eq!(a.stats().delivered + b.stats().delivered, 40);
    assert_eq!(harness.store.backlog().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_deactivated_config_is_not_claimed() {
    let harness = Harness::new(
        "https://hooks.example.com/qa",
        ScriptedDispatcher::always(AttemptOutcome::response(200, None, 1)),
    )
    .await;
    let scheduler = harness.scheduler(no_jitter(5));
    let delivery = harness.enqueue().await;

    harness
        .store
        .set_active(harness.config.id, false, harness.clock.now())
        .await
        .unwrap();
    assert_eq!(scheduler.run_cycle().await.unwrap().claimed, 0);
    assert_eq!(harness.load(&delivery).await.status, DeliveryStatus::Pending);

    harness
        .store
        .set_active(harness.config.id, true, harness.clock.now())
        .await
        .unwrap();
    assert_eq!(scheduler.run_cycle().await.unwrap().delivered, 1);
}

// ==================== Stale Claim Tests ====================

#[tokio::test]
async fn test_stale_claim_is_reclaimed_and_redelivered() {
    let harness = Harness::new(
        "https://hooks.example.com/qa",
        ScriptedDispatcher::always(AttemptOutcome::response(200, None, 1)),
    )
    .await;
    let scheduler = harness.scheduler(no_jitter(5));
    let delivery = harness.enqueue().await;

    // A worker claims the row and dies
    let crashed = harness
        .store
        .claim_due(harness.clock.now(), 1)
        .await
        .unwrap()
        .remove(0);

    // Within the lease nothing happens
    harness.clock.advance(chrono::Duration::seconds(60));
    assert_eq!(scheduler.reap_once().await.unwrap(), 0);
    assert_eq!(scheduler.run_cycle().await.unwrap().claimed, 0);

    harness.clock.advance(chrono::Duration::seconds(61));
    assert_eq!(scheduler.reap_once().await.unwrap(), 1);

    let reclaimed = harness.load(&delivery).await;
    assert_eq!(reclaimed.status, DeliveryStatus::Retrying);
    assert_eq!(reclaimed.failure_kind, Some(FailureKind::StaleClaimRecovered));
    assert_eq!(reclaimed.attempt_count, 0);

    assert_eq!(scheduler.run_cycle().await.unwrap().delivered, 1);
    assert_eq!(scheduler.stats().reclaimed, 1);

    // The presumed-dead worker wakes up and tries to write its result
    let mut late = crashed.delivery.clone();
    late.record_attempt(
        &AttemptOutcome::response(500, None, 1),
        &RetryPolicy::default(),
        harness.clock.now(),
    )
    .unwrap();
    assert!(!harness.store.record_outcome(&late, crashed.lease).await.unwrap());
    assert_eq!(harness.load(&delivery).await.status, DeliveryStatus::Delivered);
}
