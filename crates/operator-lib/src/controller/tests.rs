//! End-to-end tests for the controller
//!
//! These tests wire a real [`MemoryStore`], the dispatcher and the worker
//! pool together and verify:
//! - A PodMonitor converges to Completed through watch events alone
//! - Startup barrier and shutdown behavior
//! - Retry vs. drop decisions in the worker loop

use super::*;
use crate::health::ComponentStatus;
use crate::models::{MonitorPhase, MonitorResource, MonitorSpec, ObjectKey, Pod, PodPhase};
use crate::reconciler::ReconcileConfig;
use crate::store::{MemoryStore, ResourceStore};
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn context(store: Arc<MemoryStore>) -> Arc<Context> {
    Arc::new(
        ContextBuilder::new()
            .store(store.clone())
            .event_sink(store)
            .reconcile(ReconcileConfig {
                failed_requeue: Duration::from_millis(20),
                resync: Duration::from_millis(20),
                unrecognized_requeue: Duration::from_millis(20),
            })
            .build()
            .unwrap(),
    )
}

async fn wait_for_phase(store: &MemoryStore, name: &str, phase: MonitorPhase) {
    let key = ObjectKey::new("ns", name);
    let reached = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(resource) = store.get_resource(&key).await {
                if resource.status.phase == phase {
                    return;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{name} never reached {phase}");
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_converges_to_completed() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone());
        let controller = Controller::new(ctx.clone(), 2);
        let (shutdown_tx, _) = broadcast::channel(1);

        let dispatcher = tokio::spawn(
            controller
                .dispatcher()
                .run(store.clone(), shutdown_tx.subscribe()),
        );
        let workers = tokio::spawn(controller.run(shutdown_tx.subscribe()));

        store
            .apply_resource(MonitorResource::new("ns", "x", MonitorSpec::default()))
            .await;
        wait_for_phase(&store, "x", MonitorPhase::Failed).await;

        store
            .put_pod(Pod::new("ns", "x").with_phase(PodPhase::Running))
            .await;
        wait_for_phase(&store, "x", MonitorPhase::Running).await;

        let child = ObjectKey::new("ns", "pm-x");
        let created = timeout(Duration::from_secs(5), async {
            while store.get_child_pod(&child).await.is_err() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(created.is_ok());

        store.set_pod_phase(&child, PodPhase::Succeeded).await;
        wait_for_phase(&store, "x", MonitorPhase::Completed).await;

        assert_eq!(store.stats().await.pods_created, 1);
        assert!(ctx.health.readiness().await.ready);

        shutdown_tx.send(()).unwrap();
        timeout(Duration::from_secs(5), workers)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(5), dispatcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ctx.health.status(components::WORKERS).await,
            Some(ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn test_deleted_child_is_recreated() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone());
        let controller = Controller::new(ctx, 1);
        let (shutdown_tx, _) = broadcast::channel(1);

        tokio::spawn(
            controller
                .dispatcher()
                .run(store.clone(), shutdown_tx.subscribe()),
        );
        tokio::spawn(controller.run(shutdown_tx.subscribe()));

        store
            .put_pod(Pod::new("ns", "x").with_phase(PodPhase::Running))
            .await;
        store
            .apply_resource(MonitorResource::new("ns", "x", MonitorSpec::default()))
            .await;
        wait_for_phase(&store, "x", MonitorPhase::Running).await;

        let child = ObjectKey::new("ns", "pm-x");
        timeout(Duration::from_secs(5), async {
            while store.delete_pod(&child).await.is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let recreated = timeout(Duration::from_secs(5), async {
            while store.get_child_pod(&child).await.is_err() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(recreated.is_ok());
        assert_eq!(store.stats().await.pods_created, 2);

        shutdown_tx.send(()).unwrap();
    }
}

mod startup_tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_before_sync_aborts() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store);
        let controller = Controller::new(ctx.clone(), 2);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        shutdown_tx.send(()).unwrap();
        let result = timeout(Duration::from_secs(1), controller.run(shutdown_rx))
            .await
            .unwrap();

        assert!(matches!(result, Err(Error::CacheSyncAborted)));
        assert!(ctx.queue.is_shutting_down().await);
        assert!(!ctx.health.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_workers_wait_for_sync() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone());
        let controller = Controller::new(ctx.clone(), 1);
        let (shutdown_tx, _) = broadcast::channel(1);

        store
            .apply_resource(MonitorResource::new("ns", "x", MonitorSpec::default()))
            .await;
        ctx.queue.add("ns/x").await;
        tokio::spawn(controller.run(shutdown_tx.subscribe()));

        sleep(Duration::from_millis(50)).await;
        // nothing reconciled before the cache reports synced
        assert_eq!(store.stats().await.status_writes, 0);

        ctx.cache.mark_synced();
        wait_for_phase(&store, "x", MonitorPhase::Pending).await;

        shutdown_tx.send(()).unwrap();
    }
}

mod worker_tests {
    use super::*;

    #[tokio::test]
    async fn test_retryable_failure_backs_off_then_recovers() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone());
        let reconciler = Reconciler::new(ctx.clone());
        store
            .apply_resource(MonitorResource::new("ns", "x", MonitorSpec::default()))
            .await;

        store.set_unavailable(true);
        ctx.queue.add("ns/x").await;
        assert!(process_next(&ctx, &reconciler).await);

        assert_eq!(ctx.queue.num_requeues("ns/x"), 1);
        assert_eq!(
            ctx.health.status(components::STORE).await,
            Some(ComponentStatus::Degraded)
        );

        store.set_unavailable(false);
        // the backoff re-add delivers the key again
        let processed = timeout(Duration::from_secs(1), process_next(&ctx, &reconciler)).await;
        assert_eq!(processed.ok(), Some(true));

        assert_eq!(ctx.queue.num_requeues("ns/x"), 0);
        assert_eq!(
            ctx.health.status(components::STORE).await,
            Some(ComponentStatus::Healthy)
        );
        let resource = store.get_resource(&ObjectKey::new("ns", "x")).await.unwrap();
        assert_eq!(resource.status.phase, MonitorPhase::Pending);
    }

    #[tokio::test]
    async fn test_malformed_key_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store);
        let reconciler = Reconciler::new(ctx.clone());

        ctx.queue.add("not-a-key").await;
        assert!(process_next(&ctx, &reconciler).await);

        assert_eq!(ctx.queue.num_requeues("not-a-key"), 0);
        assert!(ctx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_process_next_stops_after_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store);
        let reconciler = Reconciler::new(ctx.clone());

        ctx.queue.shutdown().await;
        assert!(!process_next(&ctx, &reconciler).await);
    }
}
