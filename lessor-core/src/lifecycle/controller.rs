use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    BackendCallback, CommandHandle, CommandOrigin, CommandQueue, CommandState, EnqueueRequest,
    LifecycleCommand,
};
use crate::alerts::{AlertBus, OperatorAlert};
use crate::callback::{CallbackResult, CallbackSink};
use crate::chain::LifecycleRequest;
use crate::config::LifecycleConfig;
use crate::error::{ErrorClass, LessorError, Result};
use crate::provisioning::{ProvisioningClient, apply_action};
use crate::reconcile::ReconciliationDelta;
use crate::routing::ResourceDirectory;
use crate::types::{CommandId, LifecycleAction, ResourceRef, ResourceSpec};

/// Owns every lifecycle state transition.
///
/// Producers call the `submit_*`/`enqueue_*` methods, which only write to the
/// queue. Workers claim due commands, call the provisioning backend, and
/// record the outcome; a command that ends in `failed` is reported exactly
/// once through the callback sink and the alert bus.
pub struct LifecycleController {
    config: LifecycleConfig,
    queue: Arc<dyn CommandQueue>,
    provisioner: Arc<dyn ProvisioningClient>,
    directory: Arc<dyn ResourceDirectory>,
    sink: Arc<dyn CallbackSink>,
    alerts: AlertBus,
    wake: Notify,
    shutdown: CancellationToken,
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("config", &self.config)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl LifecycleController {
    pub fn new(
        config: LifecycleConfig,
        queue: Arc<dyn CommandQueue>,
        provisioner: Arc<dyn ProvisioningClient>,
        directory: Arc<dyn ResourceDirectory>,
        sink: Arc<dyn CallbackSink>,
        alerts: AlertBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            queue,
            provisioner,
            directory,
            sink,
            alerts,
            wake: Notify::new(),
            shutdown,
        }
    }

    pub fn queue(&self) -> Arc<dyn CommandQueue> {
        Arc::clone(&self.queue)
    }

    /// Enqueue a lifecycle request observed on chain. The order must have
    /// been routed to a resource; anything else is rejected.
    pub async fn submit_chain_request(
        &self,
        request: &LifecycleRequest,
        tx_hash: &str,
    ) -> Result<CommandHandle> {
        let resource = self
            .directory
            .resolve_order(&request.order_id)
            .await?
            .ok_or_else(|| {
                LessorError::NotFound(format!("order {} has no routed resource", request.order_id))
            })?;
        let spec = self.spec_if_provision(&resource, request.action).await?;
        self.enqueue(EnqueueRequest {
            resource_ref: resource,
            action: request.action,
            request_nonce: request.nonce.clone(),
            origin: CommandOrigin::Chain {
                tx_hash: tx_hash.to_string(),
            },
            order_id: Some(request.order_id.clone()),
            spec,
        })
        .await
    }

    /// Enqueue the follow-up for a backend notification about a resource
    /// this provider owns.
    pub async fn submit_callback(&self, callback: &BackendCallback) -> Result<CommandHandle> {
        let Some(spec) = self.directory.spec_for(&callback.resource_ref).await? else {
            return Err(LessorError::NotFound(format!(
                "resource {} is not managed here",
                callback.resource_ref
            )));
        };
        let action = callback.event.action();
        self.enqueue(EnqueueRequest {
            resource_ref: callback.resource_ref.clone(),
            action,
            request_nonce: callback.nonce.clone(),
            origin: CommandOrigin::Callback {
                event: callback.event,
            },
            order_id: Some(spec.order_id.clone()),
            spec: (action == LifecycleAction::Provision).then_some(spec),
        })
        .await
    }

    /// Enqueue a corrective action unless the resource already has queued or
    /// executing work. Returns `None` when skipped.
    pub async fn enqueue_reconcile(
        &self,
        delta: &ReconciliationDelta,
    ) -> Result<Option<CommandHandle>> {
        if let Some(pending) = self.queue.pending_for(&delta.resource_ref).await? {
            debug!(
                target: "lessor::lifecycle",
                resource = %delta.resource_ref,
                pending = %pending.command_id,
                "drift correction deferred to pending command"
            );
            return Ok(None);
        }
        let spec = self
            .spec_if_provision(&delta.resource_ref, delta.action)
            .await?;
        self.enqueue(EnqueueRequest {
            resource_ref: delta.resource_ref.clone(),
            action: delta.action,
            request_nonce: format!("reconcile-{}", Uuid::new_v4()),
            origin: CommandOrigin::Reconciler {
                reason: delta.reason.clone(),
            },
            order_id: Some(delta.order_id.clone()),
            spec,
        })
        .await
        .map(Some)
    }

    /// Operator requeue of a stale or failed command.
    pub async fn requeue(&self, command_id: CommandId) -> Result<LifecycleCommand> {
        let command = self.queue.requeue(command_id).await?;
        info!(target: "lessor::lifecycle", command_id = %command_id, "command requeued by operator");
        self.wake.notify_waiters();
        Ok(command)
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<CommandHandle> {
        let handle = self.queue.enqueue(request).await?;
        if handle.accepted {
            self.wake.notify_waiters();
        }
        Ok(handle)
    }

    async fn spec_if_provision(
        &self,
        resource: &ResourceRef,
        action: LifecycleAction,
    ) -> Result<Option<ResourceSpec>> {
        if action != LifecycleAction::Provision {
            return Ok(None);
        }
        match self.directory.spec_for(resource).await? {
            Some(spec) => Ok(Some(spec)),
            None => Err(LessorError::Validation(format!(
                "cannot re-provision {resource}: no spec on record"
            ))),
        }
    }

    /// Requeue commands a previous process left `executing`.
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self.queue.recover_interrupted().await?;
        if !recovered.is_empty() {
            warn!(
                target: "lessor::lifecycle",
                count = recovered.len(),
                "requeued commands interrupted by a restart"
            );
        }
        Ok(recovered.len())
    }

    /// Recover interrupted work if configured, then spawn the workers and
    /// the stale sweeper. All of them stop on the controller's shutdown
    /// token; a provisioning call in flight is allowed to finish.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        if self.config.recover_on_startup {
            self.recover().await?;
        }
        let mut handles: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|worker| {
                let controller = Arc::clone(self);
                tokio::spawn(async move { controller.worker_loop(worker).await })
            })
            .collect();
        let controller = Arc::clone(self);
        handles.push(tokio::spawn(async move { controller.sweep_loop().await }));
        Ok(handles)
    }

    async fn worker_loop(&self, worker: usize) {
        while !self.shutdown.is_cancelled() {
            match self.queue.claim_next(Utc::now()).await {
                Ok(Some(command)) => self.execute(command).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
                Err(err) => {
                    error!(target: "lessor::lifecycle", worker, error = %err, "queue claim failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
            }
        }
        debug!(target: "lessor::lifecycle", worker, "lifecycle worker stopped");
    }

    async fn execute(&self, command: LifecycleCommand) {
        debug!(
            target: "lessor::lifecycle",
            command_id = %command.command_id,
            resource = %command.resource_ref,
            action = %command.action,
            attempt = command.attempts,
            "executing command"
        );
        let outcome = tokio::time::timeout(
            self.config.call_timeout(),
            apply_action(
                self.provisioner.as_ref(),
                &command.resource_ref,
                command.action,
                command.spec.as_ref(),
            ),
        )
        .await
        .unwrap_or_else(|_| Err(LessorError::timed_out(command.action.as_str())));

        let recorded = match outcome {
            Ok(provisioned) => self.succeed(command, provisioned).await,
            Err(err) if err.class() == ErrorClass::Validation => self.give_up(command, err).await,
            Err(err) if command.attempts >= self.config.max_retries.max(1) => {
                self.give_up(command, err).await
            }
            Err(err) => self.back_off(command, err).await,
        };
        if let Err(err) = recorded {
            error!(target: "lessor::lifecycle", error = %err, "failed to record command outcome");
        }
    }

    async fn succeed(
        &self,
        command: LifecycleCommand,
        provisioned: Option<ResourceRef>,
    ) -> Result<()> {
        let done = self.queue.complete(command.command_id).await?;
        let resource = provisioned.unwrap_or_else(|| done.resource_ref.clone());
        info!(
            target: "lessor::lifecycle",
            command_id = %done.command_id,
            resource = %resource,
            action = %done.action,
            attempts = done.attempts,
            "command succeeded"
        );
        if done.action == LifecycleAction::Provision
            && let Some(order_id) = &done.order_id
            && let Err(err) = self.directory.rebind(order_id, &resource).await
        {
            warn!(target: "lessor::lifecycle", order_id = %order_id, error = %err, "rebind after re-provision failed");
        }
        self.deliver(CallbackResult::LifecycleConfirmed {
            command_id: done.command_id,
            resource_ref: resource,
            action: done.action,
            order_id: done.order_id.clone(),
            request_nonce: done.request_nonce.clone(),
        })
        .await;
        Ok(())
    }

    async fn back_off(&self, command: LifecycleCommand, err: LessorError) -> Result<()> {
        let backoff_ms = self.config.next_backoff_ms(command.backoff_ms);
        let until = after_ms(Utc::now(), backoff_ms);
        warn!(
            target: "lessor::lifecycle",
            command_id = %command.command_id,
            resource = %command.resource_ref,
            attempt = command.attempts,
            backoff_ms,
            error = %err,
            "command failed, will retry"
        );
        self.queue
            .retry(command.command_id, err.to_string(), backoff_ms, until)
            .await?;
        Ok(())
    }

    async fn give_up(&self, command: LifecycleCommand, err: LessorError) -> Result<()> {
        let failed = self.queue.fail(command.command_id, err.to_string()).await?;
        error!(
            target: "lessor::lifecycle",
            command_id = %failed.command_id,
            resource = %failed.resource_ref,
            action = %failed.action,
            attempts = failed.attempts,
            error = %err,
            "command failed"
        );
        self.alerts.publish(OperatorAlert::CommandFailed {
            command_id: failed.command_id,
            resource_ref: failed.resource_ref.clone(),
            action: failed.action,
            attempts: failed.attempts,
            error: err.to_string(),
        });
        self.deliver(CallbackResult::LifecycleFailed {
            command_id: failed.command_id,
            resource_ref: failed.resource_ref,
            action: failed.action,
            order_id: failed.order_id,
            request_nonce: failed.request_nonce,
            attempts: failed.attempts,
            error: err.to_string(),
        })
        .await;
        Ok(())
    }

    async fn deliver(&self, result: CallbackResult) {
        let attempts = self.config.callback_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.sink.submit(&result).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(
                        target: "lessor::lifecycle",
                        kind = result.label(),
                        attempt,
                        error = %err,
                        "callback submission failed"
                    );
                    last_error = Some(err.to_string());
                    if attempt < attempts {
                        tokio::time::sleep(self.config.callback_retry_delay()).await;
                    }
                }
            }
        }
        self.alerts.publish(OperatorAlert::CallbackUndelivered {
            kind: result.label().to_string(),
            error: last_error.unwrap_or_default(),
        });
    }

    /// Mark queued commands older than the staleness threshold and alert on
    /// each. Returns how many were marked.
    pub async fn sweep_stale(&self) -> Result<usize> {
        let threshold = chrono::Duration::from_std(self.config.stale_after())
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = threshold else {
            return Ok(0);
        };
        let stale = self.queue.mark_stale(cutoff).await?;
        for command in &stale {
            self.alerts.publish(OperatorAlert::CommandStale {
                command_id: command.command_id,
                resource_ref: command.resource_ref.clone(),
                action: command.action,
            });
        }
        Ok(stale.len())
    }

    async fn sweep_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.stale_sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_stale().await {
                        error!(target: "lessor::lifecycle", error = %err, "stale sweep failed");
                    }
                }
            }
        }
    }

    /// Current state of one command, for operator tooling.
    pub async fn command(&self, command_id: CommandId) -> Result<Option<LifecycleCommand>> {
        self.queue.get(command_id).await
    }

    pub async fn list(&self, state: Option<CommandState>) -> Result<Vec<LifecycleCommand>> {
        self.queue.list_by_state(state).await
    }
}

fn after_ms(now: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}
