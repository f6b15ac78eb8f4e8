mod support;

use std::sync::Arc;
use std::time::Duration;

use lessor_core::alerts::AlertBus;
use lessor_core::chain::{LeaseStatus, LifecycleRequest};
use lessor_core::config::{LifecycleConfig, ReconcileConfig};
use lessor_core::lifecycle::{
    CommandOrigin, CommandQueue, CommandState, EnqueueRequest, LifecycleController,
    RedbCommandQueue,
};
use lessor_core::reconcile::{ChainDesiredStates, DriftReconciler};
use lessor_core::testing::{RecordingSink, ScriptedChain, ScriptedProvisioner, StaticDirectory};
use lessor_core::types::{
    ActualState, DesiredState, LifecycleAction, OrderId, ProviderAddress, ResourceRef,
};
use tokio_util::sync::CancellationToken;

use support::{eventually, spec};

struct Harness {
    controller: Arc<LifecycleController>,
    queue: Arc<dyn CommandQueue>,
    provisioner: Arc<ScriptedProvisioner>,
    directory: Arc<StaticDirectory>,
    shutdown: CancellationToken,
}

fn config() -> LifecycleConfig {
    LifecycleConfig {
        queue_path: None,
        workers: 4,
        poll_interval_ms: 5,
        max_retries: 3,
        backoff_base_ms: 5,
        backoff_max_ms: 20,
        callback_retry_delay_ms: 1,
        ..Default::default()
    }
}

async fn harness(queue: Arc<dyn CommandQueue>, provisioner: ScriptedProvisioner) -> Harness {
    let provisioner = Arc::new(provisioner);
    let directory = StaticDirectory::new();
    directory.bind(ResourceRef::new("res-a"), spec("o-a")).await;
    directory.bind(ResourceRef::new("res-b"), spec("o-b")).await;
    let shutdown = CancellationToken::new();
    let controller = Arc::new(LifecycleController::new(
        config(),
        queue.clone(),
        provisioner.clone(),
        directory.clone(),
        RecordingSink::new(),
        AlertBus::default(),
        shutdown.clone(),
    ));
    Harness {
        controller,
        queue,
        provisioner,
        directory,
        shutdown,
    }
}

async fn all_settled(queue: &Arc<dyn CommandQueue>, expected: usize) {
    let queue = queue.clone();
    eventually("all commands settled", || {
        let queue = queue.clone();
        async move {
            let all = queue.list_by_state(None).await.expect("list");
            all.len() == expected && all.iter().all(|command| command.state.is_terminal())
        }
    })
    .await;
}

fn request(order: &str, action: LifecycleAction, nonce: &str) -> LifecycleRequest {
    LifecycleRequest {
        order_id: OrderId::new(order),
        action,
        nonce: nonce.into(),
        requester: ProviderAddress("lsr1tenant".into()),
    }
}

#[tokio::test]
async fn one_resource_never_runs_two_commands_at_once() {
    let queue: Arc<dyn CommandQueue> = Arc::new(RedbCommandQueue::in_memory().expect("queue"));
    let h = harness(queue, ScriptedProvisioner::with_delay(Duration::from_millis(15))).await;
    let _workers = h.controller.start().await.expect("start");

    let mut producers = Vec::new();
    for n in 0..6 {
        let controller = h.controller.clone();
        let (order, action) = match n % 3 {
            0 => ("o-a", LifecycleAction::Suspend),
            1 => ("o-a", LifecycleAction::Resume),
            _ => ("o-b", LifecycleAction::Suspend),
        };
        producers.push(tokio::spawn(async move {
            controller
                .submit_chain_request(&request(order, action, &format!("n-{n}")), "tx")
                .await
                .expect("submit")
        }));
    }
    for producer in producers {
        assert!(producer.await.expect("join").accepted);
    }

    all_settled(&h.queue, 6).await;
    assert_eq!(h.provisioner.calls().await.len(), 6);
    assert_eq!(h.provisioner.max_concurrency().await, 1);
    h.shutdown.cancel();
}

#[tokio::test]
async fn redelivered_requests_collapse_into_one_backend_call() {
    let queue: Arc<dyn CommandQueue> = Arc::new(RedbCommandQueue::in_memory().expect("queue"));
    let h = harness(queue, ScriptedProvisioner::new()).await;

    let submissions = (0..4).map(|_| {
        let controller = h.controller.clone();
        async move {
            controller
                .submit_chain_request(&request("o-a", LifecycleAction::Terminate, "n-1"), "tx-1")
                .await
                .expect("submit")
        }
    });
    let handles = futures::future::join_all(submissions).await;
    assert_eq!(handles.iter().filter(|handle| handle.accepted).count(), 1);
    let original = handles
        .iter()
        .find(|handle| handle.accepted)
        .expect("one accepted")
        .command_id;
    assert!(handles
        .iter()
        .filter(|handle| !handle.accepted)
        .all(|handle| handle.merged_into == Some(original)));

    let _workers = h.controller.start().await.expect("start");
    all_settled(&h.queue, 1).await;
    assert_eq!(h.provisioner.count(LifecycleAction::Terminate).await, 1);
    h.shutdown.cancel();
}

#[tokio::test]
async fn command_interrupted_by_a_crash_runs_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("lifecycle.redb");

    let interrupted = {
        let queue = RedbCommandQueue::open(&path).await.expect("open");
        queue
            .enqueue(EnqueueRequest {
                resource_ref: ResourceRef::new("res-a"),
                action: LifecycleAction::Suspend,
                request_nonce: "n-1".into(),
                origin: CommandOrigin::Chain {
                    tx_hash: "tx-1".into(),
                },
                order_id: Some(OrderId::new("o-a")),
                spec: None,
            })
            .await
            .expect("enqueue");
        let claimed = queue
            .claim_next(chrono::Utc::now())
            .await
            .expect("claim")
            .expect("claimed");
        claimed.command_id
    };

    let queue: Arc<dyn CommandQueue> = Arc::new(RedbCommandQueue::open(&path).await.expect("reopen"));
    let h = harness(queue, ScriptedProvisioner::new()).await;
    let _workers = h.controller.start().await.expect("start");
    all_settled(&h.queue, 1).await;

    let done = h.queue.get(interrupted).await.expect("get").expect("command");
    assert_eq!(done.state, CommandState::Succeeded);
    assert_eq!(done.attempts, 2);
    assert_eq!(h.provisioner.count(LifecycleAction::Suspend).await, 1);
    h.shutdown.cancel();
}

#[tokio::test]
async fn drift_yields_exactly_one_suspend() {
    let queue: Arc<dyn CommandQueue> = Arc::new(RedbCommandQueue::in_memory().expect("queue"));
    let h = harness(queue, ScriptedProvisioner::with_delay(Duration::from_millis(20))).await;
    h.provisioner
        .set_state(&ResourceRef::new("res-a"), ActualState::Active)
        .await;
    h.provisioner
        .set_state(&ResourceRef::new("res-b"), ActualState::Active)
        .await;

    let chain = Arc::new(ScriptedChain::new());
    chain
        .set_leases(vec![
            LeaseStatus {
                order_id: OrderId::new("o-a"),
                state: DesiredState::Suspended,
            },
            LeaseStatus {
                order_id: OrderId::new("o-b"),
                state: DesiredState::Active,
            },
        ])
        .await;
    let reconciler = DriftReconciler::new(
        ReconcileConfig {
            grace_period_ms: 0,
            ..Default::default()
        },
        Arc::new(ChainDesiredStates::new(
            chain,
            h.directory.clone(),
            ProviderAddress("lsr1provider".into()),
            Duration::from_secs(1),
        )),
        h.provisioner.clone(),
        h.controller.clone(),
    );
    let _workers = h.controller.start().await.expect("start");

    // Passes racing the correction must not add a second command.
    for _ in 0..3 {
        reconciler.pass().await.expect("pass");
    }
    all_settled(&h.queue, 1).await;
    let report = reconciler.pass().await.expect("pass");
    assert_eq!(report.drifted, 0);

    assert_eq!(h.provisioner.count(LifecycleAction::Suspend).await, 1);
    assert_eq!(h.provisioner.calls().await.len(), 1);
    let commands = h.queue.list_by_state(None).await.expect("list");
    assert!(matches!(
        commands[0].origin,
        CommandOrigin::Reconciler { .. }
    ));
    h.shutdown.cancel();
}
