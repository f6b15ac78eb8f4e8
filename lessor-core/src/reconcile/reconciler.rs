use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DesiredStateSource, ReconciliationDelta, plan};
use crate::config::ReconcileConfig;
use crate::error::{LessorError, Result};
use crate::lifecycle::LifecycleController;
use crate::provisioning::ProvisioningClient;
use crate::types::{LifecycleAction, ResourceRef};

/// Counters for one reconciliation pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PassReport {
    pub checked: usize,
    /// Resources whose desired and actual state disagree, grace or not.
    pub drifted: usize,
    pub enqueued: usize,
}

/// Periodically compares desired and actual resource state and hands
/// persistent drift to the lifecycle controller.
pub struct DriftReconciler {
    config: ReconcileConfig,
    desired: Arc<dyn DesiredStateSource>,
    provisioner: Arc<dyn ProvisioningClient>,
    controller: Arc<LifecycleController>,
    // First time each drifting resource was seen needing its current action.
    // Held for the whole pass, so passes never overlap.
    first_seen: Mutex<HashMap<ResourceRef, (LifecycleAction, Instant)>>,
}

impl fmt::Debug for DriftReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked = self.first_seen.try_lock().map(|seen| seen.len()).ok();
        f.debug_struct("DriftReconciler")
            .field("config", &self.config)
            .field("tracked_drift", &tracked)
            .finish()
    }
}

impl DriftReconciler {
    pub fn new(
        config: ReconcileConfig,
        desired: Arc<dyn DesiredStateSource>,
        provisioner: Arc<dyn ProvisioningClient>,
        controller: Arc<LifecycleController>,
    ) -> Self {
        Self {
            config,
            desired,
            provisioner,
            controller,
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    /// One full comparison. A resource whose state cannot be read is skipped
    /// for this pass; failing to list desired state fails the pass.
    pub async fn pass(&self) -> Result<PassReport> {
        let mut first_seen = self.first_seen.lock().await;
        let resources = self.desired.desired_states().await?;
        let now = Instant::now();
        let mut report = PassReport::default();

        first_seen.retain(|resource, _| {
            resources
                .iter()
                .any(|entry| &entry.resource_ref == resource)
        });

        for entry in resources {
            report.checked += 1;
            let actual = tokio::time::timeout(
                self.config.call_timeout(),
                self.provisioner.get_state(&entry.resource_ref),
            )
            .await
            .unwrap_or_else(|_| Err(LessorError::timed_out("get_state")));
            let actual = match actual {
                Ok(actual) => actual,
                Err(err) => {
                    warn!(
                        target: "lessor::reconcile",
                        resource = %entry.resource_ref,
                        error = %err,
                        "could not read actual state"
                    );
                    continue;
                }
            };

            let Some(action) = plan(entry.desired, actual) else {
                first_seen.remove(&entry.resource_ref);
                continue;
            };
            report.drifted += 1;

            let since = match first_seen.get(&entry.resource_ref) {
                Some((seen_action, since)) if *seen_action == action => *since,
                _ => {
                    first_seen.insert(entry.resource_ref.clone(), (action, now));
                    now
                }
            };
            if now.duration_since(since) < self.config.grace_period() {
                debug!(
                    target: "lessor::reconcile",
                    resource = %entry.resource_ref,
                    desired = ?entry.desired,
                    actual = ?actual,
                    "drift within grace period"
                );
                continue;
            }

            let delta = ReconciliationDelta {
                reason: format!("desired {:?}, observed {:?}", entry.desired, actual),
                order_id: entry.order_id,
                resource_ref: entry.resource_ref,
                desired: entry.desired,
                actual,
                action,
            };
            match self.controller.enqueue_reconcile(&delta).await {
                Ok(Some(handle)) => {
                    info!(
                        target: "lessor::reconcile",
                        resource = %delta.resource_ref,
                        action = %delta.action,
                        command_id = %handle.command_id,
                        "drift correction queued"
                    );
                    report.enqueued += 1;
                    first_seen.remove(&delta.resource_ref);
                }
                Ok(None) => {}
                Err(err) => warn!(
                    target: "lessor::reconcile",
                    resource = %delta.resource_ref,
                    error = %err,
                    "drift correction not queued"
                ),
            }
        }
        Ok(report)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!(target: "lessor::reconcile", "drift reconciliation disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        if !self.config.run_on_startup {
            ticker.tick().await;
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.pass().await {
                    Ok(report) => debug!(target: "lessor::reconcile", ?report, "reconciliation pass finished"),
                    Err(err) => warn!(target: "lessor::reconcile", error = %err, "reconciliation pass failed"),
                },
            }
        }
    }
}
