mod support;

use std::sync::Arc;

use lessor_core::alerts::{AlertBus, OperatorAlert};
use lessor_core::callback::CallbackResult;
use lessor_core::config::RouterConfig;
use lessor_core::routing::{InMemoryRoutingStore, OrderRouter, RouteOutcome, RoutingState, RoutingStore};
use lessor_core::testing::{Outcome, RecordingSink, ScriptedProvisioner};
use lessor_core::types::{LifecycleAction, OrderId, OrderState};
use tokio_util::sync::CancellationToken;

use support::{eventually, order};

struct Harness {
    router: Arc<OrderRouter>,
    store: InMemoryRoutingStore,
    provisioner: Arc<ScriptedProvisioner>,
    sink: Arc<RecordingSink>,
    alerts: AlertBus,
    shutdown: CancellationToken,
}

fn harness() -> Harness {
    let store = InMemoryRoutingStore::new();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let sink = RecordingSink::new();
    let alerts = AlertBus::new(16);
    let shutdown = CancellationToken::new();
    let router = Arc::new(OrderRouter::new(
        RouterConfig {
            workers: 2,
            max_retries: 3,
            backoff_base_ms: 5,
            backoff_max_ms: 20,
            ..Default::default()
        },
        provisioner.clone(),
        Arc::new(store.clone()),
        sink.clone(),
        alerts.clone(),
        shutdown.clone(),
    ));
    Harness {
        router,
        store,
        provisioner,
        sink,
        alerts,
        shutdown,
    }
}

async fn settled(store: &InMemoryRoutingStore, id: &str) {
    let store = store.clone();
    let id = OrderId::new(id);
    eventually("terminal routing state", || {
        let store = store.clone();
        let id = id.clone();
        async move {
            store
                .get(&id)
                .await
                .expect("get")
                .is_some_and(|record| record.state.is_terminal())
        }
    })
    .await;
}

#[tokio::test]
async fn matched_order_is_routed_with_a_single_provision_call() {
    let h = harness();
    let _workers = h.router.start();

    let matched = order("O1", OrderState::Matched);
    assert_eq!(h.router.route(&matched).await.expect("route"), RouteOutcome::Queued);
    settled(&h.store, "O1").await;
    assert_eq!(
        h.router.route(&matched).await.expect("route again"),
        RouteOutcome::AlreadyKnown(RoutingState::Routed)
    );

    let record = h
        .store
        .get(&OrderId::new("O1"))
        .await
        .expect("get")
        .expect("record");
    assert_eq!(record.state, RoutingState::Routed);
    assert_eq!(record.attempts, 1);
    assert_eq!(h.provisioner.count(LifecycleAction::Provision).await, 1);
    assert!(h.sink.results().await.is_empty());
    h.shutdown.cancel();
}

#[tokio::test]
async fn persistent_backend_failure_fails_after_three_attempts_with_one_alert() {
    let h = harness();
    let mut alerts = h.alerts.subscribe();
    h.provisioner
        .script_provision(
            &OrderId::new("O2"),
            [
                Outcome::Transient("503".into()),
                Outcome::Transient("503".into()),
                Outcome::Transient("503".into()),
                Outcome::Transient("503".into()),
            ],
        )
        .await;
    let _workers = h.router.start();

    h.router
        .route(&order("O2", OrderState::Matched))
        .await
        .expect("route");
    settled(&h.store, "O2").await;

    let record = h
        .store
        .get(&OrderId::new("O2"))
        .await
        .expect("get")
        .expect("record");
    assert_eq!(record.state, RoutingState::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(h.provisioner.count(LifecycleAction::Provision).await, 3);

    assert!(matches!(
        alerts.recv().await.expect("alert"),
        OperatorAlert::RoutingFailure { attempts: 3, .. }
    ));
    let sink = h.sink.clone();
    eventually("failure callback", || {
        let sink = sink.clone();
        async move { !sink.results().await.is_empty() }
    })
    .await;
    let failures = h.sink.results().await;
    assert!(matches!(
        failures.as_slice(),
        [CallbackResult::RoutingFailed { attempts: 3, .. }]
    ));
    assert!(alerts.try_recv().is_err());
    h.shutdown.cancel();
}
