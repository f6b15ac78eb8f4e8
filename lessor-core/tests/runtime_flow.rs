//! End-to-end runs of the composed runtime against in-process fakes.

mod support;

use std::sync::Arc;
use std::time::Duration;

use lessor_core::bidding::FileProfileSource;
use lessor_core::callback::CallbackResult;
use lessor_core::chain::{ChainEventKind, Ed25519KeyManager, TxSigner};
use lessor_core::checkpoint::{CheckpointStore, EventPosition, InMemoryCheckpointStore};
use lessor_core::config::{
    BidConfig, EventSourceConfig, LifecycleConfig, OrchestratorConfig, RouterConfig,
};
use lessor_core::events::ChainEventSource;
use lessor_core::lifecycle::{LifecycleController, RedbCommandQueue};
use lessor_core::routing::{InMemoryRoutingStore, OrderRouter, RoutingState, RoutingStore};
use lessor_core::runtime::ChainEventRouter;
use lessor_core::testing::{RecordingSink, ScriptedChain, ScriptedProvisioner};
use lessor_core::types::{
    BidId, LifecycleAction, Order, OrderId, OrderState, ProviderAddress, SubscriberId,
};
use lessor_core::{AlertBus, ProviderRuntime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use support::{event, eventually, order};

struct Fixture {
    runtime: ProviderRuntime,
    chain: Arc<ScriptedChain>,
    provisioner: Arc<ScriptedProvisioner>,
    checkpoints: Arc<InMemoryCheckpointStore>,
    routing: InMemoryRoutingStore,
    sink: Arc<RecordingSink>,
    _dir: tempfile::TempDir,
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        events: EventSourceConfig {
            batch_size: 8,
            batch_linger_ms: 20,
            ..Default::default()
        },
        bidding: BidConfig {
            max_bids_per_minute: 3,
            max_bids_per_hour: 100,
            retry_delay_ms: 5,
            ..Default::default()
        },
        routing: RouterConfig {
            workers: 2,
            backoff_base_ms: 5,
            backoff_max_ms: 20,
            ..Default::default()
        },
        shutdown_drain_ms: 2_000,
        ..Default::default()
    }
}

async fn fixture(chain: Arc<ScriptedChain>) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let profile = dir.path().join("profile.toml");
    std::fs::write(
        &profile,
        "[capacity]\ncpu_millis = 8000\nmemory_mb = 16384\n\n[pricing]\ncpu_price = 1\nmemory_price = 1\n",
    )
    .expect("profile");

    let provisioner = Arc::new(ScriptedProvisioner::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let routing = InMemoryRoutingStore::new();
    let sink = RecordingSink::new();
    let signer = Arc::new(TxSigner::new(
        Arc::new(Ed25519KeyManager::from_seed([9u8; 32])),
        chain.clone(),
        "lessor-test",
        Duration::from_secs(1),
    ));

    let runtime = ProviderRuntime::builder(config())
        .with_chain(chain.clone())
        .with_signer(signer)
        .with_provisioner(provisioner.clone())
        .with_checkpoints(checkpoints.clone())
        .with_routing_store(Arc::new(routing.clone()))
        .with_queue(Arc::new(RedbCommandQueue::in_memory().expect("queue")))
        .with_sink(sink.clone())
        .with_profiles(Arc::new(FileProfileSource::new(&profile)))
        .build()
        .await
        .expect("runtime");

    Fixture {
        runtime,
        chain,
        provisioner,
        checkpoints,
        routing,
        sink,
        _dir: dir,
    }
}

#[tokio::test]
async fn bids_stop_at_the_minute_window() {
    let chain = Arc::new(ScriptedChain::new());
    for n in 0..10 {
        chain
            .push_event(event(
                10,
                n,
                ChainEventKind::OrderCreated(order(&format!("o-{n}"), OrderState::Open)),
            ))
            .await;
    }
    let f = fixture(chain).await;
    f.runtime.start().await.expect("start");

    let sink = f.sink.clone();
    eventually("three bid outcomes", || {
        let sink = sink.clone();
        async move { sink.results().await.len() >= 3 }
    })
    .await;
    let checkpoints = f.checkpoints.clone();
    eventually("checkpoint at the last event", || {
        let checkpoints = checkpoints.clone();
        async move {
            checkpoints
                .load(&SubscriberId::new("lessor-provider"))
                .await
                .expect("load")
                .is_some_and(|cp| cp.position() == EventPosition::new(10, 9))
        }
    })
    .await;

    assert_eq!(f.chain.broadcasts().await.len(), 3);
    f.runtime.shutdown().await.expect("shutdown");
    let outcomes = f.sink.results().await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes
        .iter()
        .all(|result| matches!(result, CallbackResult::BidOutcome { .. })));
}

#[tokio::test]
async fn matched_order_is_provisioned_once_despite_redelivery() {
    let chain = Arc::new(ScriptedChain::new());
    let f = fixture(chain.clone()).await;
    let provider = f.runtime.provider().clone();
    let matched = || ChainEventKind::OrderMatched {
        order: order("o-1", OrderState::Matched),
        bid_id: BidId::derive(&OrderId::new("o-1"), &provider),
        provider: provider.clone(),
    };
    // The same match observed in two transactions.
    chain.push_event(event(20, 0, matched())).await;
    chain.push_event(event(21, 0, matched())).await;

    f.runtime.start().await.expect("start");

    let routing = f.routing.clone();
    eventually("routed record", || {
        let routing = routing.clone();
        async move {
            routing
                .get(&OrderId::new("o-1"))
                .await
                .expect("get")
                .is_some_and(|record| record.state == RoutingState::Routed)
        }
    })
    .await;
    f.runtime.shutdown().await.expect("shutdown");

    assert_eq!(f.provisioner.count(LifecycleAction::Provision).await, 1);
    let record = f
        .routing
        .get(&OrderId::new("o-1"))
        .await
        .expect("get")
        .expect("record");
    assert_eq!(
        record.external_resource_ref.map(|r| r.0),
        Some("res-o-1".to_string())
    );
}

#[tokio::test]
async fn orders_matched_to_other_providers_are_ignored() {
    let chain = Arc::new(ScriptedChain::new());
    chain
        .push_event(event(
            30,
            0,
            ChainEventKind::OrderMatched {
                order: order("o-x", OrderState::Matched),
                bid_id: BidId("o-x/lsr1other".into()),
                provider: lessor_core::types::ProviderAddress("lsr1other".into()),
            },
        ))
        .await;
    let f = fixture(chain).await;
    f.runtime.start().await.expect("start");

    let checkpoints = f.checkpoints.clone();
    eventually("checkpoint past the foreign match", || {
        let checkpoints = checkpoints.clone();
        async move {
            checkpoints
                .load(&SubscriberId::new("lessor-provider"))
                .await
                .expect("load")
                .is_some()
        }
    })
    .await;
    f.runtime.shutdown().await.expect("shutdown");

    assert!(f.routing.list().await.expect("list").is_empty());
    assert!(f.provisioner.calls().await.is_empty());
}

/// Intake, router, controller and source for one process lifetime, sharing
/// durable state with the runs before and after it.
struct Run {
    source: ChainEventSource,
    dispatcher: Arc<ChainEventRouter>,
    shutdown: CancellationToken,
    _workers: Vec<JoinHandle<()>>,
}

async fn run_over(
    chain: Arc<ScriptedChain>,
    provisioner: Arc<ScriptedProvisioner>,
    checkpoints: Arc<InMemoryCheckpointStore>,
    routing: InMemoryRoutingStore,
    orders: mpsc::Sender<Order>,
) -> Run {
    let shutdown = CancellationToken::new();
    let sink = RecordingSink::new();
    let router = Arc::new(OrderRouter::new(
        config().routing,
        provisioner.clone(),
        Arc::new(routing),
        sink.clone(),
        AlertBus::default(),
        shutdown.child_token(),
    ));
    router.resume().await.expect("resume");
    let workers = router.start();
    let controller = Arc::new(LifecycleController::new(
        LifecycleConfig {
            queue_path: None,
            ..Default::default()
        },
        Arc::new(RedbCommandQueue::in_memory().expect("queue")),
        provisioner,
        router.clone(),
        sink,
        AlertBus::default(),
        shutdown.child_token(),
    ));
    let dispatcher = Arc::new(ChainEventRouter::new(
        ProviderAddress("lsr1me".into()),
        orders,
        router,
        controller,
        64,
    ));
    let source = ChainEventSource::new(config().events, chain, checkpoints, AlertBus::default());
    Run {
        source,
        dispatcher,
        shutdown,
        _workers: workers,
    }
}

async fn routed(routing: &InMemoryRoutingStore, id: &str) {
    let routing = routing.clone();
    let id = OrderId::new(id);
    eventually("routed record", || {
        let routing = routing.clone();
        let id = id.clone();
        async move {
            routing
                .get(&id)
                .await
                .expect("get")
                .is_some_and(|record| record.state == RoutingState::Routed)
        }
    })
    .await;
}

#[tokio::test]
async fn batch_cut_short_by_a_closed_intake_is_redelivered_after_restart() {
    let me = ProviderAddress("lsr1me".into());
    let matched = |id: &str| ChainEventKind::OrderMatched {
        order: order(id, OrderState::Matched),
        bid_id: BidId::derive(&OrderId::new(id), &me),
        provider: me.clone(),
    };
    let chain = Arc::new(ScriptedChain::new());
    chain.push_event(event(60, 0, matched("o-1"))).await;
    chain
        .push_event(event(60, 1, ChainEventKind::OrderCreated(order("o-2", OrderState::Open))))
        .await;
    chain.push_event(event(60, 2, matched("o-3"))).await;

    let provisioner = Arc::new(ScriptedProvisioner::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let routing = InMemoryRoutingStore::new();
    let subscriber = SubscriberId::new("lessor-provider");

    // The bid scheduler is already gone: its intake is closed.
    let (closed_tx, closed_rx) = mpsc::channel(8);
    drop(closed_rx);
    let first = run_over(
        chain.clone(),
        provisioner.clone(),
        checkpoints.clone(),
        routing.clone(),
        closed_tx,
    )
    .await;
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        first.source.run(first.dispatcher.clone(), first.shutdown.child_token()),
    )
    .await
    .expect("source stops");
    assert!(outcome.is_err(), "closed intake halts the source");
    assert!(checkpoints.load(&subscriber).await.expect("load").is_none());
    assert!(routing.get(&OrderId::new("o-3")).await.expect("get").is_none());
    routed(&routing, "o-1").await;
    first.shutdown.cancel();

    let (orders_tx, mut orders_rx) = mpsc::channel(8);
    let second = run_over(
        chain.clone(),
        provisioner.clone(),
        checkpoints.clone(),
        routing.clone(),
        orders_tx,
    )
    .await;
    let source_task = {
        let source = second.source;
        let handler = second.dispatcher.clone();
        let token = second.shutdown.child_token();
        tokio::spawn(async move { source.run(handler, token).await })
    };

    let redelivered = tokio::time::timeout(Duration::from_secs(5), orders_rx.recv())
        .await
        .expect("intake receives the open order")
        .expect("order");
    assert_eq!(redelivered.order_id, OrderId::new("o-2"));
    routed(&routing, "o-3").await;
    let saved = checkpoints.clone();
    eventually("checkpoint at the end of the batch", || {
        let saved = saved.clone();
        let subscriber = subscriber.clone();
        async move {
            saved
                .load(&subscriber)
                .await
                .expect("load")
                .is_some_and(|cp| cp.position() == EventPosition::new(60, 2))
        }
    })
    .await;

    second.shutdown.cancel();
    source_task.await.expect("join").expect("clean stop");
    // o-1 was already routed by the first run and is not provisioned again.
    assert_eq!(provisioner.count(LifecycleAction::Provision).await, 2);
}
