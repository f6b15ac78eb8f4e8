use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ResourceDirectory, RoutingRecord, RoutingState, RoutingStore};
use crate::alerts::{AlertBus, OperatorAlert};
use crate::callback::{CallbackResult, CallbackSink};
use crate::config::RouterConfig;
use crate::error::{ErrorClass, LessorError, Result};
use crate::provisioning::ProvisioningClient;
use crate::types::{Order, OrderId, ResourceRef, ResourceSpec};

/// Result of handing an order to the router.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteOutcome {
    Queued,
    /// A record already exists; nothing was done.
    AlreadyKnown(RoutingState),
    /// The order cannot be translated into a provisioning request.
    DeadLettered,
}

#[derive(Debug)]
struct WorkItem {
    order_id: OrderId,
    spec: ResourceSpec,
    attempt: u32,
}

/// Worker pool that provisions matched orders.
pub struct OrderRouter {
    config: RouterConfig,
    provisioner: Arc<dyn ProvisioningClient>,
    store: Arc<dyn RoutingStore>,
    sink: Arc<dyn CallbackSink>,
    alerts: AlertBus,
    work_tx: mpsc::Sender<WorkItem>,
    work_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    // Serializes the check-then-insert in `route`.
    admission: Mutex<()>,
    shutdown: CancellationToken,
}

impl fmt::Debug for OrderRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderRouter")
            .field("config", &self.config)
            .field("queued", &(self.work_tx.max_capacity() - self.work_tx.capacity()))
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl OrderRouter {
    pub fn new(
        config: RouterConfig,
        provisioner: Arc<dyn ProvisioningClient>,
        store: Arc<dyn RoutingStore>,
        sink: Arc<dyn CallbackSink>,
        alerts: AlertBus,
        shutdown: CancellationToken,
    ) -> Self {
        let (work_tx, work_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            provisioner,
            store,
            sink,
            alerts,
            work_tx,
            work_rx: Arc::new(Mutex::new(work_rx)),
            admission: Mutex::new(()),
            shutdown,
        }
    }

    pub fn store(&self) -> Arc<dyn RoutingStore> {
        Arc::clone(&self.store)
    }

    /// Route a matched order. Returns without any backend call when the order
    /// already has a record, whatever its state.
    pub async fn route(&self, order: &Order) -> Result<RouteOutcome> {
        let _admission = self.admission.lock().await;
        if let Some(existing) = self.store.get(&order.order_id).await? {
            debug!(
                target: "lessor::routing",
                order_id = %order.order_id,
                state = ?existing.state,
                "order already routed"
            );
            return Ok(RouteOutcome::AlreadyKnown(existing.state));
        }

        let spec = match ResourceSpec::from_order(order) {
            Ok(spec) => spec,
            Err(err) => {
                let record = RoutingRecord::dead_lettered(order.order_id.clone(), err.to_string());
                self.store.upsert(&record).await?;
                self.surface_dead_letter(&order.order_id, &err.to_string(), 0)
                    .await;
                return Ok(RouteOutcome::DeadLettered);
            }
        };

        self.store.upsert(&RoutingRecord::pending(spec.clone())).await?;
        info!(target: "lessor::routing", order_id = %order.order_id, "order queued for provisioning");
        self.work_tx
            .send(WorkItem {
                order_id: order.order_id.clone(),
                spec,
                attempt: 1,
            })
            .await
            .map_err(|_| LessorError::Cancelled("routing queue closed".into()))?;
        Ok(RouteOutcome::Queued)
    }

    /// Re-schedule records left pending by a previous run, honouring their
    /// `next_attempt_at`. Returns how many were resumed.
    pub async fn resume(&self) -> Result<usize> {
        let mut resumed = 0;
        for record in self.store.list().await? {
            if record.state != RoutingState::Pending {
                continue;
            }
            let Some(spec) = record.spec.clone() else {
                warn!(target: "lessor::routing", order_id = %record.order_id, "pending record without spec");
                continue;
            };
            let delay = record
                .next_attempt_at
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .unwrap_or(Duration::ZERO);
            self.schedule(
                WorkItem {
                    order_id: record.order_id.clone(),
                    spec,
                    attempt: record.attempts + 1,
                },
                delay,
            );
            resumed += 1;
        }
        if resumed > 0 {
            info!(target: "lessor::routing", resumed, "resumed pending routing records");
        }
        Ok(resumed)
    }

    /// Spawn the worker pool. Workers stop when the router's shutdown token
    /// fires; an item in flight finishes its provisioning call first.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|worker| {
                let router = Arc::clone(self);
                tokio::spawn(async move { router.worker_loop(worker).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize) {
        loop {
            let item = {
                let mut rx = self.work_rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(item) = item else { break };
            if let Err(err) = self.execute(item).await {
                error!(target: "lessor::routing", worker, error = %err, "routing store write failed");
            }
        }
        debug!(target: "lessor::routing", worker, "routing worker stopped");
    }

    async fn execute(&self, item: WorkItem) -> Result<()> {
        let Some(mut record) = self.store.get(&item.order_id).await? else {
            return Ok(());
        };
        if record.state != RoutingState::Pending {
            return Ok(());
        }

        record.attempts = item.attempt;
        let outcome = tokio::time::timeout(
            self.config.provision_timeout(),
            self.provisioner.provision(&item.spec),
        )
        .await
        .unwrap_or_else(|_| Err(LessorError::timed_out("provision")));

        record.updated_at = Utc::now();
        match outcome {
            Ok(resource) => {
                info!(
                    target: "lessor::routing",
                    order_id = %item.order_id,
                    resource = %resource,
                    attempt = item.attempt,
                    "order routed"
                );
                record.state = RoutingState::Routed;
                record.external_resource_ref = Some(resource);
                record.last_error = None;
                record.next_attempt_at = None;
                self.store.upsert(&record).await?;
            }
            Err(err) if err.class() == ErrorClass::Validation => {
                record.state = RoutingState::DeadLettered;
                record.last_error = Some(err.to_string());
                record.next_attempt_at = None;
                self.store.upsert(&record).await?;
                self.surface_dead_letter(&item.order_id, &err.to_string(), item.attempt)
                    .await;
            }
            Err(err) if item.attempt >= self.config.max_retries.max(1) => {
                record.state = RoutingState::Failed;
                record.last_error = Some(err.to_string());
                record.next_attempt_at = None;
                self.store.upsert(&record).await?;
                error!(
                    target: "lessor::routing",
                    order_id = %item.order_id,
                    attempts = item.attempt,
                    error = %err,
                    "routing retries exhausted"
                );
                self.alerts.publish(OperatorAlert::RoutingFailure {
                    order_id: item.order_id.clone(),
                    attempts: item.attempt,
                    error: err.to_string(),
                });
                self.report(CallbackResult::RoutingFailed {
                    order_id: item.order_id.clone(),
                    attempts: item.attempt,
                    error: err.to_string(),
                })
                .await;
            }
            Err(err) => {
                let delay = self.config.backoff_for(item.attempt);
                warn!(
                    target: "lessor::routing",
                    order_id = %item.order_id,
                    attempt = item.attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "provisioning failed, will retry"
                );
                record.last_error = Some(err.to_string());
                record.next_attempt_at = chrono::Duration::from_std(delay)
                    .ok()
                    .map(|delay| Utc::now() + delay);
                self.store.upsert(&record).await?;
                self.schedule(
                    WorkItem {
                        attempt: item.attempt + 1,
                        ..item
                    },
                    delay,
                );
            }
        }
        Ok(())
    }

    /// Put an item back on the work queue after `delay`. If shutdown fires
    /// first the record simply stays pending for the next start.
    fn schedule(&self, item: WorkItem, delay: Duration) {
        let tx = self.work_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(mpsc::error::SendError(item)) = tx.send(item).await {
                        debug!(
                            target: "lessor::routing",
                            order_id = %item.order_id,
                            attempt = item.attempt,
                            "work queue closed, retry left pending"
                        );
                    }
                }
            }
        });
    }

    async fn surface_dead_letter(&self, order_id: &OrderId, error: &str, attempts: u32) {
        warn!(target: "lessor::routing", order_id = %order_id, error, "order dead-lettered");
        self.alerts.publish(OperatorAlert::RoutingDeadLettered {
            order_id: order_id.clone(),
            error: error.to_string(),
        });
        self.report(CallbackResult::RoutingFailed {
            order_id: order_id.clone(),
            attempts,
            error: error.to_string(),
        })
        .await;
    }

    async fn report(&self, result: CallbackResult) {
        let attempts = self.config.callback_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.sink.submit(&result).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(
                        target: "lessor::routing",
                        kind = result.label(),
                        attempt,
                        error = %err,
                        "routing failure report not delivered"
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
}

#[async_trait]
impl ResourceDirectory for OrderRouter {
    async fn resolve_order(&self, order_id: &OrderId) -> Result<Option<ResourceRef>> {
        Ok(self
            .store
            .get(order_id)
            .await?
            .filter(|record| record.state == RoutingState::Routed)
            .and_then(|record| record.external_resource_ref))
    }

    async fn spec_for(&self, resource: &ResourceRef) -> Result<Option<ResourceSpec>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .find(|record| record.external_resource_ref.as_ref() == Some(resource))
            .and_then(|record| record.spec))
    }

    async fn routed_resources(&self) -> Result<Vec<(OrderId, ResourceRef)>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|record| record.state == RoutingState::Routed)
            .filter_map(|record| record.external_resource_ref.map(|r| (record.order_id, r)))
            .collect())
    }

    async fn rebind(&self, order_id: &OrderId, resource: &ResourceRef) -> Result<()> {
        let _admission = self.admission.lock().await;
        let Some(mut record) = self.store.get(order_id).await? else {
            return Err(LessorError::NotFound(format!("no routing record for {order_id}")));
        };
        if record.external_resource_ref.as_ref() == Some(resource) {
            return Ok(());
        }
        info!(
            target: "lessor::routing",
            order_id = %order_id,
            resource = %resource,
            "order rebound to re-provisioned resource"
        );
        record.external_resource_ref = Some(resource.clone());
        record.state = RoutingState::Routed;
        record.updated_at = Utc::now();
        self.store.upsert(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::InMemoryRoutingStore;
    use crate::testing::{Outcome, RecordingSink, ScriptedProvisioner};
    use crate::types::{OrderState, ProviderAddress, ResourceRequirements};

    fn order(id: &str, cpu: u64) -> Order {
        Order {
            order_id: OrderId::new(id),
            owner: ProviderAddress("tenant".into()),
            requirements: ResourceRequirements {
                cpu_millis: cpu,
                memory_mb: 512,
                ..Default::default()
            },
            max_price: None,
            state: OrderState::Matched,
            manifest: serde_json::Value::Null,
        }
    }

    async fn settle(store: &InMemoryRoutingStore, id: &str) -> RoutingRecord {
        for _ in 0..1_000 {
            if let Some(record) = store.get(&OrderId::new(id)).await.expect("get")
                && record.state.is_terminal()
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("record {id} never settled");
    }

    fn router(
        provisioner: Arc<ScriptedProvisioner>,
        store: InMemoryRoutingStore,
        sink: Arc<RecordingSink>,
        alerts: AlertBus,
    ) -> Arc<OrderRouter> {
        let config = RouterConfig {
            workers: 2,
            max_retries: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 40,
            callback_retry_delay_ms: 10,
            ..Default::default()
        };
        Arc::new(OrderRouter::new(
            config,
            provisioner,
            Arc::new(store),
            sink,
            alerts,
            CancellationToken::new(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_order_is_dead_lettered_without_backend_call() {
        let provisioner = Arc::new(ScriptedProvisioner::new());
        let store = InMemoryRoutingStore::new();
        let sink = RecordingSink::new();
        let router = router(provisioner.clone(), store.clone(), sink.clone(), AlertBus::default());
        router.start();

        let outcome = router.route(&order("o-empty", 0)).await.expect("route");
        assert_eq!(outcome, RouteOutcome::DeadLettered);
        let record = settle(&store, "o-empty").await;
        assert_eq!(record.state, RoutingState::DeadLettered);
        assert!(provisioner.calls().await.is_empty());
        assert_eq!(sink.results().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_report_is_retried_until_the_sink_takes_it() {
        let provisioner = Arc::new(ScriptedProvisioner::new());
        let store = InMemoryRoutingStore::new();
        let sink = RecordingSink::new();
        sink.fail_next(1).await;
        let alerts = AlertBus::new(8);
        let mut alert_rx = alerts.subscribe();
        let router = router(provisioner, store, sink.clone(), alerts);

        let outcome = router.route(&order("o-empty", 0)).await.expect("route");
        assert_eq!(outcome, RouteOutcome::DeadLettered);

        let results = sink.results().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(
            &results[0],
            CallbackResult::RoutingFailed { order_id, .. } if order_id.as_str() == "o-empty"
        ));
        assert!(matches!(
            alert_rx.try_recv(),
            Ok(OperatorAlert::RoutingDeadLettered { .. })
        ));
        assert!(alert_rx.try_recv().is_err(), "no undelivered-callback alert");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_route() {
        let provisioner = Arc::new(ScriptedProvisioner::new());
        provisioner
            .script_provision(
                &OrderId::new("o-flaky"),
                [Outcome::Transient("busy".into()), Outcome::Transient("busy".into())],
            )
            .await;
        let store = InMemoryRoutingStore::new();
        let router = router(provisioner.clone(), store.clone(), RecordingSink::new(), AlertBus::default());
        router.start();

        router.route(&order("o-flaky", 1_000)).await.expect("route");
        let record = settle(&store, "o-flaky").await;
        assert_eq!(record.state, RoutingState::Routed);
        assert_eq!(record.attempts, 3);
        assert_eq!(
            router.resolve_order(&OrderId::new("o-flaky")).await.expect("resolve"),
            Some(ResourceRef::new("res-o-flaky"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_outliving_its_router_stays_pending_for_the_next_start() {
        let store = InMemoryRoutingStore::new();
        let spec = ResourceSpec::from_order(&order("o-late", 1_000)).expect("spec");
        let mut left = RoutingRecord::pending(spec);
        left.attempts = 1;
        left.next_attempt_at = Some(Utc::now() + chrono::Duration::milliseconds(50));
        store.upsert(&left).await.expect("seed");

        let first = router(
            Arc::new(ScriptedProvisioner::new()),
            store.clone(),
            RecordingSink::new(),
            AlertBus::default(),
        );
        assert_eq!(first.resume().await.expect("resume"), 1);
        drop(first);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let record = store
            .get(&OrderId::new("o-late"))
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.state, RoutingState::Pending);

        let provisioner = Arc::new(ScriptedProvisioner::new());
        let second = router(provisioner.clone(), store.clone(), RecordingSink::new(), AlertBus::default());
        second.start();
        assert_eq!(second.resume().await.expect("resume"), 1);
        assert_eq!(settle(&store, "o-late").await.state, RoutingState::Routed);
        assert_eq!(provisioner.calls().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_picks_up_pending_records() {
        let provisioner = Arc::new(ScriptedProvisioner::new());
        let store = InMemoryRoutingStore::new();
        let spec = ResourceSpec::from_order(&order("o-left", 1_000)).expect("spec");
        let mut left = RoutingRecord::pending(spec);
        left.attempts = 1;
        left.next_attempt_at = Some(Utc::now() + chrono::Duration::milliseconds(20));
        store.upsert(&left).await.expect("seed");

        let router = router(provisioner.clone(), store.clone(), RecordingSink::new(), AlertBus::default());
        router.start();
        assert_eq!(router.resume().await.expect("resume"), 1);

        let record = settle(&store, "o-left").await;
        assert_eq!(record.state, RoutingState::Routed);
        assert_eq!(record.attempts, 2);
    }
}
