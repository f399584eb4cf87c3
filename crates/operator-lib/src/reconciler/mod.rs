//! PodMonitor phase state machine
//!
//! One [`Reconciler::sync`] call moves a resource at most one phase forward:
//!
//! ```text
//! None -> Pending -> Running -> Completed
//!            ^  |       |
//!            |  v       v
//!           Failed <----+
//! ```
//!
//! Every pass re-reads the resource from the store and the monitored pod
//! from the watch cache. Nothing from the triggering event is trusted.

#[cfg(test)]
mod tests;

use crate::builder::{build_child_pod, child_key};
use crate::controller::Context;
use crate::error::Error;
use crate::events::reasons;
use crate::models::{MonitorPhase, MonitorResource, MonitorStatus, ObjectKey, Pod};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requeue delays applied after a successful pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Retry interval while the monitored pod is missing
    pub failed_requeue: Duration,
    /// Re-check interval while Running
    pub resync: Duration,
    /// Re-check interval for phases this version does not know
    pub unrecognized_requeue: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            failed_requeue: Duration::from_secs(5),
            resync: Duration::from_secs(30),
            unrecognized_requeue: Duration::from_secs(10),
        }
    }
}

/// What the worker should do with a key after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Re-check after the delay
    Requeue(Duration),
    /// Nothing to do until a watch event arrives
    AwaitChange,
}

/// Whether two statuses differ in any persisted field
pub fn status_changed(observed: &MonitorStatus, desired: &MonitorStatus) -> bool {
    observed.phase != desired.phase || observed.reason != desired.reason
}

/// Outcome of evaluating the transition table
struct Transition {
    status: MonitorStatus,
    action: Action,
    /// Event reason recorded when the pass ends in Failed
    failure: &'static str,
}

impl Transition {
    fn stay(resource: &MonitorResource, action: Action) -> Self {
        Self::to(resource.status.clone(), action)
    }

    fn to(status: MonitorStatus, action: Action) -> Self {
        Self {
            status,
            action,
            failure: reasons::MONITORED_POD_MISSING,
        }
    }

    fn failed(reason: String, failure: &'static str, action: Action) -> Self {
        Self {
            status: MonitorStatus::failed(reason),
            action,
            failure,
        }
    }
}

enum Child {
    Created,
    Existing(Pod),
}

pub struct Reconciler {
    ctx: Arc<Context>,
}

impl Reconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Run one reconciliation pass for a `namespace/name` key
    pub async fn sync(&self, key: &str) -> Result<Action, Error> {
        let key = ObjectKey::parse(key)?;

        let resource = match self.ctx.store.get_resource(&key).await {
            Ok(resource) => resource,
            Err(e) if e.is_not_found() => {
                debug!(resource = %key, "PodMonitor no longer exists, dropping key");
                return Ok(Action::AwaitChange);
            }
            Err(e) => return Err(e.into()),
        };

        let observed = resource.status.clone();
        let transition = match self.transition(&resource).await {
            Err(err @ Error::ChildNotOwned { .. }) => {
                // surface the conflict on the resource
                warn!(resource = %key, error = %err, "Monitor child name is taken");
                Transition::failed(
                    err.to_string(),
                    reasons::CHILD_NOT_OWNED,
                    Action::Requeue(self.ctx.reconcile.failed_requeue),
                )
            }
            other => other?,
        };

        if !status_changed(&observed, &transition.status) {
            return Ok(transition.action);
        }

        let mut update = resource.clone();
        update.status = transition.status;
        self.ctx.store.update_status(&update).await?;
        self.record_transition(&update, &observed, transition.failure)
            .await;

        Ok(transition.action)
    }

    async fn transition(&self, resource: &MonitorResource) -> Result<Transition, Error> {
        let config = &self.ctx.reconcile;

        match &resource.status.phase {
            MonitorPhase::None => Ok(Transition::to(
                MonitorStatus::new(MonitorPhase::Pending),
                Action::AwaitChange,
            )),

            MonitorPhase::Pending | MonitorPhase::Failed => {
                let target = resource.key();
                if self.ctx.cache.get_pod(&target).is_none() {
                    return Ok(Transition::failed(
                        format!("monitored pod {target} not found"),
                        reasons::MONITORED_POD_MISSING,
                        Action::Requeue(config.failed_requeue),
                    ));
                }

                self.ensure_child(resource).await?;
                Ok(Transition::to(
                    MonitorStatus::new(MonitorPhase::Running),
                    Action::Requeue(config.resync),
                ))
            }

            MonitorPhase::Running => match self.ensure_child(resource).await? {
                Child::Created => Ok(Transition::stay(resource, Action::Requeue(config.resync))),
                Child::Existing(pod) if pod.status.phase.is_terminal() => {
                    debug!(
                        resource = %resource.key(),
                        pod = %pod.key(),
                        pod_phase = ?pod.status.phase,
                        "Monitor child finished"
                    );
                    Ok(Transition::to(
                        MonitorStatus::new(MonitorPhase::Completed),
                        Action::AwaitChange,
                    ))
                }
                Child::Existing(_) => Ok(Transition::stay(resource, Action::Requeue(config.resync))),
            },

            MonitorPhase::Completed => Ok(Transition::stay(resource, Action::AwaitChange)),

            MonitorPhase::Unrecognized(phase) => {
                warn!(
                    resource = %resource.key(),
                    phase = %phase,
                    "Unrecognized PodMonitor phase, leaving untouched"
                );
                Ok(Transition::stay(
                    resource,
                    Action::Requeue(config.unrecognized_requeue),
                ))
            }
        }
    }

    /// Make sure the monitor child exists and belongs to `resource`
    async fn ensure_child(&self, resource: &MonitorResource) -> Result<Child, Error> {
        let key = child_key(resource);

        match self.ctx.store.get_child_pod(&key).await {
            Ok(pod) => return self.owned(resource, pod).map(Child::Existing),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let desired = build_child_pod(resource, &self.ctx.template);
        match self.ctx.store.create_child_pod(&desired).await {
            Ok(pod) => {
                self.ctx.metrics.inc_child_pods_created();
                self.ctx.logger.log_child_created(
                    &resource.key().to_string(),
                    &pod.key().to_string(),
                    resource.spec.effective_sample_interval(),
                );
                self.ctx
                    .recorder
                    .normal(
                        resource,
                        reasons::CHILD_CREATED,
                        format!("Created monitor pod {}", pod.metadata.name),
                    )
                    .await;
                Ok(Child::Created)
            }
            Err(e) if e.is_already_exists() => {
                // lost a race with another creator; adopt only our own child
                info!(resource = %resource.key(), pod = %key, "Monitor child already exists");
                let pod = self.ctx.store.get_child_pod(&key).await?;
                self.owned(resource, pod).map(Child::Existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn owned(&self, resource: &MonitorResource, pod: Pod) -> Result<Pod, Error> {
        if resource.controls(&pod.metadata) {
            Ok(pod)
        } else {
            Err(Error::ChildNotOwned {
                pod: pod.key().to_string(),
                owner: resource.key().to_string(),
            })
        }
    }

    async fn record_transition(
        &self,
        resource: &MonitorResource,
        observed: &MonitorStatus,
        failure: &'static str,
    ) {
        let from = observed.phase.label();
        let to = resource.status.phase.label();
        let key = resource.key().to_string();

        self.ctx.metrics.inc_phase_transition(from, to);
        self.ctx
            .logger
            .log_phase_transition(&key, from, to, &resource.status.reason);

        let recorder = &self.ctx.recorder;
        match resource.status.phase {
            MonitorPhase::Failed => {
                recorder
                    .warning(resource, failure, resource.status.reason.clone())
                    .await
            }
            MonitorPhase::Completed => {
                recorder
                    .normal(
                        resource,
                        reasons::MONITOR_COMPLETED,
                        "Monitor child finished".to_string(),
                    )
                    .await
            }
            _ => {
                recorder
                    .normal(
                        resource,
                        reasons::PHASE_CHANGED,
                        format!("Phase changed from {from} to {to}"),
                    )
                    .await
            }
        }
    }
}
