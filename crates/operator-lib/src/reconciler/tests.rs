//! Behavioural tests for the reconciler
//!
//! These tests verify:
//! - The phase table, one transition per pass
//! - Idempotence once Running
//! - Error propagation and the not-found short-circuit
//! - Child creation races

use super::*;
use crate::builder::{ChildTemplate, ENV_NAME, ENV_SPEED};
use crate::controller::ContextBuilder;
use crate::error::StoreError;
use crate::events::{EventSink, EventType, KubernetesEvent};
use crate::models::{MonitorSpec, PodPhase};
use crate::store::{MemoryStore, ResourceStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Store wrapper counting calls and injecting failures
#[derive(Default)]
struct MockStore {
    inner: MemoryStore,
    get_calls: AtomicUsize,
    status_writes: AtomicUsize,
    create_calls: AtomicUsize,
    /// get_child_pod calls left that report NotFound regardless of contents
    stale_child_reads: AtomicUsize,
    fail_get: Mutex<Option<StoreError>>,
    fail_status_write: Mutex<Option<StoreError>>,
}

impl MockStore {
    fn writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceStore for MockStore {
    async fn get_resource(&self, key: &ObjectKey) -> Result<MonitorResource, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_get.lock().unwrap().take() {
            return Err(err);
        }
        self.inner.get_resource(key).await
    }

    async fn update_status(
        &self,
        resource: &MonitorResource,
    ) -> Result<MonitorResource, StoreError> {
        if let Some(err) = self.fail_status_write.lock().unwrap().take() {
            return Err(err);
        }
        let updated = self.inner.update_status(resource).await?;
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn get_child_pod(&self, key: &ObjectKey) -> Result<Pod, StoreError> {
        let stale = self
            .stale_child_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stale {
            return Err(StoreError::not_found("Pod", key));
        }
        self.inner.get_child_pod(key).await
    }

    async fn create_child_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.create_child_pod(pod).await
    }
}

#[async_trait]
impl EventSink for MockStore {
    async fn publish(&self, event: KubernetesEvent) -> anyhow::Result<()> {
        self.inner.publish(event).await
    }
}

fn setup() -> (Reconciler, Arc<MockStore>, Arc<Context>) {
    let store = Arc::new(MockStore::default());
    let ctx = Arc::new(
        ContextBuilder::new()
            .store(store.clone())
            .event_sink(store.clone())
            .build()
            .unwrap(),
    );
    ctx.cache.mark_synced();
    (Reconciler::new(ctx.clone()), store, ctx)
}

fn spec() -> MonitorSpec {
    MonitorSpec {
        sample_interval_seconds: 10,
        log_directory: "/tmp".to_string(),
    }
}

/// Seed `ns/<name>` directly in the given phase
async fn seed(store: &MockStore, name: &str, phase: MonitorPhase) -> MonitorResource {
    let created = store
        .inner
        .apply_resource(MonitorResource::new("ns", name, spec()))
        .await;
    if phase == MonitorPhase::None {
        return created;
    }
    let mut update = created;
    update.status = MonitorStatus::new(phase);
    store.inner.update_status(&update).await.unwrap()
}

async fn phase_of(store: &MockStore, name: &str) -> MonitorStatus {
    store
        .inner
        .get_resource(&ObjectKey::new("ns", name))
        .await
        .unwrap()
        .status
}

fn target_pod(ctx: &Context, name: &str) {
    ctx.cache
        .apply_pod(Pod::new("ns", name).with_phase(PodPhase::Running));
}

mod transition_tests {
    use super::*;

    #[tokio::test]
    async fn test_convergence_scenario() {
        let (reconciler, store, ctx) = setup();
        seed(&store, "x", MonitorPhase::None).await;

        // sync 1: None -> Pending
        let action = reconciler.sync("ns/x").await.unwrap();
        assert_eq!(action, Action::AwaitChange);
        assert_eq!(phase_of(&store, "x").await.phase, MonitorPhase::Pending);
        assert_eq!(store.writes(), 1);

        // sync 2: monitored pod absent -> Failed
        let action = reconciler.sync("ns/x").await.unwrap();
        assert_eq!(action, Action::Requeue(Duration::from_secs(5)));
        let status = phase_of(&store, "x").await;
        assert_eq!(status.phase, MonitorPhase::Failed);
        assert_eq!(status.reason, "monitored pod ns/x not found");
        assert_eq!(store.writes(), 2);

        // sync 3: pod present -> Running, child created
        target_pod(&ctx, "x");
        reconciler.sync("ns/x").await.unwrap();
        let status = phase_of(&store, "x").await;
        assert_eq!(status.phase, MonitorPhase::Running);
        assert!(status.reason.is_empty());
        assert_eq!(store.writes(), 3);
        assert_eq!(store.creates(), 1);

        let child = store
            .inner
            .get_child_pod(&ObjectKey::new("ns", "pm-x"))
            .await
            .unwrap();
        assert_eq!(child.spec.containers[0].env_value(ENV_NAME), Some("x"));
        assert_eq!(child.spec.containers[0].env_value(ENV_SPEED), Some("10"));

        // sync 4: child succeeded -> Completed
        store
            .inner
            .set_pod_phase(&child.key(), PodPhase::Succeeded)
            .await
            .unwrap();
        let action = reconciler.sync("ns/x").await.unwrap();
        assert_eq!(action, Action::AwaitChange);
        assert_eq!(phase_of(&store, "x").await.phase, MonitorPhase::Completed);
        assert_eq!(store.writes(), 4);

        // sync 5: terminal, nothing to do
        let action = reconciler.sync("ns/x").await.unwrap();
        assert_eq!(action, Action::AwaitChange);
        assert_eq!(store.writes(), 4);
        assert_eq!(store.creates(), 1);
    }

    #[tokio::test]
    async fn test_failed_child_also_completes() {
        let (reconciler, store, _ctx) = setup();
        let resource = seed(&store, "x", MonitorPhase::Running).await;
        let child = build_child_pod(&resource, &ChildTemplate::default())
            .with_phase(PodPhase::Failed);
        store.inner.put_pod(child).await;

        reconciler.sync("ns/x").await.unwrap();
        assert_eq!(phase_of(&store, "x").await.phase, MonitorPhase::Completed);
    }

    #[tokio::test]
    async fn test_failed_retries_to_running_when_pod_appears() {
        let (reconciler, store, ctx) = setup();
        seed(&store, "x", MonitorPhase::Failed).await;

        target_pod(&ctx, "x");
        let action = reconciler.sync("ns/x").await.unwrap();

        assert_eq!(action, Action::Requeue(Duration::from_secs(30)));
        assert_eq!(phase_of(&store, "x").await.phase, MonitorPhase::Running);
    }

    #[tokio::test]
    async fn test_failed_without_pod_is_not_rewritten() {
        let (reconciler, store, _ctx) = setup();
        seed(&store, "x", MonitorPhase::Pending).await;

        reconciler.sync("ns/x").await.unwrap();
        assert_eq!(store.writes(), 1);

        let action = reconciler.sync("ns/x").await.unwrap();
        assert_eq!(action, Action::Requeue(Duration::from_secs(5)));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_unrecognized_phase_is_left_alone() {
        let (reconciler, store, _ctx) = setup();
        seed(
            &store,
            "x",
            MonitorPhase::Unrecognized("Terminating".to_string()),
        )
        .await;

        let action = reconciler.sync("ns/x").await.unwrap();

        assert_eq!(action, Action::Requeue(Duration::from_secs(10)));
        assert_eq!(store.writes(), 0);
        assert_eq!(
            phase_of(&store, "x").await.phase,
            MonitorPhase::Unrecognized("Terminating".to_string())
        );
    }

    #[tokio::test]
    async fn test_transitions_record_events() {
        let (reconciler, store, ctx) = setup();
        seed(&store, "x", MonitorPhase::Pending).await;

        reconciler.sync("ns/x").await.unwrap();
        target_pod(&ctx, "x");
        reconciler.sync("ns/x").await.unwrap();

        let events = store.inner.recorded_events().await;
        let reasons: Vec<&str> = events.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec!["MonitoredPodMissing", "ChildPodCreated", "PhaseChanged"]
        );
        assert_eq!(events[0].event_type, EventType::Warning);
        assert_eq!(events[2].message, "Phase changed from Failed to Running");
    }
}

mod idempotence_tests {
    use super::*;

    #[tokio::test]
    async fn test_running_with_live_child_writes_nothing() {
        let (reconciler, store, _ctx) = setup();
        let resource = seed(&store, "x", MonitorPhase::Running).await;
        store
            .inner
            .put_pod(
                build_child_pod(&resource, &ChildTemplate::default())
                    .with_phase(PodPhase::Running),
            )
            .await;

        for _ in 0..3 {
            let action = reconciler.sync("ns/x").await.unwrap();
            assert_eq!(action, Action::Requeue(Duration::from_secs(30)));
        }

        assert_eq!(store.writes(), 0);
        assert_eq!(store.creates(), 0);
    }

    #[tokio::test]
    async fn test_running_without_child_creates_without_advancing() {
        let (reconciler, store, _ctx) = setup();
        seed(&store, "x", MonitorPhase::Running).await;

        let action = reconciler.sync("ns/x").await.unwrap();

        assert_eq!(action, Action::Requeue(Duration::from_secs(30)));
        assert_eq!(store.creates(), 1);
        assert_eq!(store.writes(), 0);
        assert_eq!(phase_of(&store, "x").await.phase, MonitorPhase::Running);

        // the next pass sees the child and stays put
        reconciler.sync("ns/x").await.unwrap();
        assert_eq!(store.creates(), 1);
    }

    #[test]
    fn test_status_changed_compares_fields() {
        let running = MonitorStatus::new(MonitorPhase::Running);
        assert!(!status_changed(&running, &running.clone()));
        assert!(status_changed(
            &running,
            &MonitorStatus::new(MonitorPhase::Completed)
        ));
        assert!(status_changed(
            &MonitorStatus::failed("a"),
            &MonitorStatus::failed("b")
        ));
    }
}

mod error_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_resource_is_dropped_silently() {
        let (reconciler, store, _ctx) = setup();

        let action = reconciler.sync("ns/missing").await.unwrap();

        assert_eq!(action, Action::AwaitChange);
        assert_eq!(store.writes(), 0);
        assert_eq!(store.creates(), 0);
    }

    #[tokio::test]
    async fn test_malformed_key_is_not_retryable() {
        let (reconciler, store, _ctx) = setup();

        let err = reconciler.sync("no-slash").await.unwrap_err();

        assert!(matches!(err, Error::MalformedKey { .. }));
        assert!(!err.is_retryable());
        assert_eq!(store.get_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_as_retryable() {
        let (reconciler, store, _ctx) = setup();
        seed(&store, "x", MonitorPhase::None).await;
        *store.fail_status_write.lock().unwrap() = Some(StoreError::Conflict {
            kind: "PodMonitor",
            key: "ns/x".to_string(),
            observed: 1,
            current: 2,
        });

        let err = reconciler.sync("ns/x").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Store {
                source: StoreError::Conflict { .. }
            }
        ));
        assert!(err.is_retryable());
        assert_eq!(phase_of(&store, "x").await.phase, MonitorPhase::None);

        // the retry re-reads and succeeds
        reconciler.sync("ns/x").await.unwrap();
        assert_eq!(phase_of(&store, "x").await.phase, MonitorPhase::Pending);
    }

    #[tokio::test]
    async fn test_stale_version_rejected_by_store() {
        let (_reconciler, store, _ctx) = setup();
        let read = seed(&store, "x", MonitorPhase::Pending).await;

        // someone else writes in between
        let mut other = read.clone();
        other.status = MonitorStatus::failed("elsewhere");
        store.update_status(&other).await.unwrap();

        let mut ours = read;
        ours.status = MonitorStatus::new(MonitorPhase::Running);
        let err = store.update_status(&ours).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_transient_read_failure_propagates() {
        let (reconciler, store, _ctx) = setup();
        seed(&store, "x", MonitorPhase::None).await;
        *store.fail_get.lock().unwrap() = Some(StoreError::unavailable("timeout"));

        let err = reconciler.sync("ns/x").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.writes(), 0);
    }
}

mod create_race_tests {
    use super::*;

    #[tokio::test]
    async fn test_already_exists_adopts_own_child() {
        let (reconciler, store, _ctx) = setup();
        let resource = seed(&store, "x", MonitorPhase::Running).await;
        store
            .inner
            .put_pod(build_child_pod(&resource, &ChildTemplate::default()))
            .await;
        store.stale_child_reads.store(1, Ordering::SeqCst);

        let action = reconciler.sync("ns/x").await.unwrap();

        assert_eq!(action, Action::Requeue(Duration::from_secs(30)));
        assert_eq!(store.creates(), 1);
        assert_eq!(store.inner.stats().await.pods_created, 0);
        assert_eq!(phase_of(&store, "x").await.phase, MonitorPhase::Running);
    }

    #[tokio::test]
    async fn test_foreign_pod_with_child_name_fails_resource() {
        let (reconciler, store, ctx) = setup();
        seed(&store, "x", MonitorPhase::Running).await;
        target_pod(&ctx, "x");
        store.inner.put_pod(Pod::new("ns", "pm-x")).await;

        let action = reconciler.sync("ns/x").await.unwrap();

        assert_eq!(action, Action::Requeue(Duration::from_secs(5)));
        assert_eq!(store.creates(), 0);
        let status = phase_of(&store, "x").await;
        assert_eq!(status.phase, MonitorPhase::Failed);
        assert_eq!(
            status.reason,
            "pod ns/pm-x exists but is not controlled by PodMonitor ns/x"
        );

        let events = store.inner.recorded_events().await;
        let warning = events.last().unwrap();
        assert_eq!(warning.event_type, EventType::Warning);
        assert_eq!(warning.reason, reasons::CHILD_NOT_OWNED);

        // the conflict persists: no further status writes while it does
        let writes = store.writes();
        let action = reconciler.sync("ns/x").await.unwrap();
        assert_eq!(action, Action::Requeue(Duration::from_secs(5)));
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_foreign_pod_found_after_race_fails_resource() {
        let (reconciler, store, ctx) = setup();
        seed(&store, "x", MonitorPhase::Pending).await;
        target_pod(&ctx, "x");
        store.inner.put_pod(Pod::new("ns", "pm-x")).await;
        store.stale_child_reads.store(1, Ordering::SeqCst);

        reconciler.sync("ns/x").await.unwrap();

        assert_eq!(store.creates(), 1);
        assert_eq!(phase_of(&store, "x").await.phase, MonitorPhase::Failed);
    }

    #[tokio::test]
    async fn test_recovers_once_foreign_pod_is_gone() {
        let (reconciler, store, ctx) = setup();
        seed(&store, "x", MonitorPhase::Running).await;
        target_pod(&ctx, "x");
        store.inner.put_pod(Pod::new("ns", "pm-x")).await;
        reconciler.sync("ns/x").await.unwrap();
        assert_eq!(phase_of(&store, "x").await.phase, MonitorPhase::Failed);

        store.inner.delete_pod(&ObjectKey::new("ns", "pm-x")).await;
        let action = reconciler.sync("ns/x").await.unwrap();

        assert_eq!(action, Action::Requeue(Duration::from_secs(30)));
        let status = phase_of(&store, "x").await;
        assert_eq!(status.phase, MonitorPhase::Running);
        assert!(status.reason.is_empty());
        assert_eq!(store.inner.stats().await.pods_created, 1);
    }
}
