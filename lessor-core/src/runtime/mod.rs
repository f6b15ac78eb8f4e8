//! Composition root.
//!
//! [`ProviderRuntimeBuilder`] takes the concrete adapters, wires every
//! component with them, and [`ProviderRuntime`] owns the resulting tasks and
//! the single cancellation token they all derive from.

mod dispatch;

pub use dispatch::ChainEventRouter;

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::AlertBus;
use crate::bidding::{BidReporter, BidScheduler, ProfileSource, ProfileWatcher};
use crate::callback::CallbackSink;
use crate::chain::{ChainClient, TxSigner};
use crate::checkpoint::CheckpointStore;
use crate::config::OrchestratorConfig;
use crate::error::{LessorError, Result};
use crate::events::{ChainEventSource, SourceState};
use crate::lifecycle::{CommandQueue, LifecycleController};
use crate::provisioning::ProvisioningClient;
use crate::reconcile::{ChainDesiredStates, DriftReconciler};
use crate::routing::{OrderRouter, RoutingStore};
use crate::types::{Bid, Order, ProviderAddress};

/// Pieces that are moved into their tasks on start.
struct Unstarted {
    watcher: ProfileWatcher,
    scheduler: Arc<BidScheduler>,
    orders: mpsc::Receiver<Order>,
    bids: mpsc::Receiver<Bid>,
    reporter: BidReporter,
}

pub struct ProviderRuntime {
    config: OrchestratorConfig,
    provider: ProviderAddress,
    shutdown: CancellationToken,
    alerts: AlertBus,
    source: Arc<ChainEventSource>,
    dispatcher: Arc<ChainEventRouter>,
    router: Arc<OrderRouter>,
    controller: Arc<LifecycleController>,
    reconciler: Arc<DriftReconciler>,
    unstarted: Mutex<Option<Unstarted>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ProviderRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tasks = self.handles.try_lock().map(|handles| handles.len()).ok();
        f.debug_struct("ProviderRuntime")
            .field("provider", &self.provider)
            .field("source", &self.source)
            .field("tasks", &tasks)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ProviderRuntime {
    pub fn builder(config: OrchestratorConfig) -> ProviderRuntimeBuilder {
        ProviderRuntimeBuilder::new(config)
    }

    pub fn provider(&self) -> &ProviderAddress {
        &self.provider
    }

    pub fn alerts(&self) -> AlertBus {
        self.alerts.clone()
    }

    pub fn controller(&self) -> Arc<LifecycleController> {
        Arc::clone(&self.controller)
    }

    pub fn router(&self) -> Arc<OrderRouter> {
        Arc::clone(&self.router)
    }

    pub fn reconciler(&self) -> Arc<DriftReconciler> {
        Arc::clone(&self.reconciler)
    }

    pub fn source_state(&self) -> watch::Receiver<SourceState> {
        self.source.state()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Resume persisted work and spawn every component task. Can only be
    /// called once.
    pub async fn start(&self) -> Result<()> {
        let Some(unstarted) = self.unstarted.lock().await.take() else {
            return Err(LessorError::Conflict("runtime already started".into()));
        };

        self.router.resume().await?;
        let mut handles = self.router.start();
        handles.extend(self.controller.start().await?);

        let source = Arc::clone(&self.source);
        let handler = Arc::clone(&self.dispatcher);
        let token = self.shutdown.child_token();
        handles.push(tokio::spawn(async move {
            // A fatal error is already surfaced as an operator alert.
            if let Err(err) = source.run(handler, token).await {
                debug!(target: "lessor::events", error = %err, "event source stopped");
            }
        }));

        let Unstarted {
            watcher,
            scheduler,
            orders,
            bids,
            reporter,
        } = unstarted;
        handles.push(tokio::spawn(
            scheduler.run(orders, self.shutdown.child_token()),
        ));
        // Ends once the scheduler task, which owns the result sender, is done.
        handles.push(tokio::spawn(reporter.run(bids)));
        handles.push(tokio::spawn(watcher.run(self.shutdown.child_token())));
        handles.push(tokio::spawn(
            Arc::clone(&self.reconciler).run(self.shutdown.child_token()),
        ));

        let count = handles.len();
        self.handles.lock().await.extend(handles);
        info!(target: "lessor::runtime", provider = %self.provider, tasks = count, "provider runtime started");
        Ok(())
    }

    /// Cancel every task and wait for them to wind down. Tasks still running
    /// when the drain period ends are aborted.
    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "lessor::runtime", "initiating graceful shutdown");
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        let deadline = tokio::time::Instant::now() + self.config.shutdown_drain();
        let mut aborted = 0usize;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(target: "lessor::runtime", error = %err, "task ended abnormally"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            warn!(target: "lessor::runtime", aborted, "tasks aborted after drain period");
        }
        info!(target: "lessor::runtime", "provider runtime stopped");
        Ok(())
    }
}

/// Collects the adapters the runtime is built from.
#[derive(Default)]
pub struct ProviderRuntimeBuilder {
    config: OrchestratorConfig,
    chain: Option<Arc<dyn ChainClient>>,
    signer: Option<Arc<TxSigner>>,
    provisioner: Option<Arc<dyn ProvisioningClient>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    routing_store: Option<Arc<dyn RoutingStore>>,
    queue: Option<Arc<dyn CommandQueue>>,
    sink: Option<Arc<dyn CallbackSink>>,
    profiles: Option<Arc<dyn ProfileSource>>,
    alerts: Option<AlertBus>,
}

impl fmt::Debug for ProviderRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRuntimeBuilder")
            .field("config", &self.config)
            .field("has_chain", &self.chain.is_some())
            .field("has_signer", &self.signer.is_some())
            .field("has_provisioner", &self.provisioner.is_some())
            .field("has_queue", &self.queue.is_some())
            .finish_non_exhaustive()
    }
}

fn missing(what: &str) -> LessorError {
    LessorError::Validation(format!("runtime requires a {what}"))
}

impl ProviderRuntimeBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_chain(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_signer(mut self, signer: Arc<TxSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn ProvisioningClient>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_routing_store(mut self, store: Arc<dyn RoutingStore>) -> Self {
        self.routing_store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn CommandQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn CallbackSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileSource>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn with_alerts(mut self, alerts: AlertBus) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Wire every component. Loads the provider profile, so this fails when
    /// no profile can be read.
    pub async fn build(self) -> Result<ProviderRuntime> {
        let config = self.config;
        let chain = self.chain.ok_or_else(|| missing("chain client"))?;
        let signer = self.signer.ok_or_else(|| missing("transaction signer"))?;
        let provisioner = self
            .provisioner
            .ok_or_else(|| missing("provisioning client"))?;
        let checkpoints = self
            .checkpoints
            .ok_or_else(|| missing("checkpoint store"))?;
        let routing_store = self.routing_store.ok_or_else(|| missing("routing store"))?;
        let queue = self.queue.ok_or_else(|| missing("lifecycle queue"))?;
        let sink = self.sink.ok_or_else(|| missing("callback sink"))?;
        let profiles = self.profiles.ok_or_else(|| missing("profile source"))?;
        let alerts = self.alerts.unwrap_or_default();

        let shutdown = CancellationToken::new();
        let provider = signer.address();

        let router = Arc::new(OrderRouter::new(
            config.routing.clone(),
            Arc::clone(&provisioner),
            routing_store,
            Arc::clone(&sink),
            alerts.clone(),
            shutdown.child_token(),
        ));
        let controller = Arc::new(LifecycleController::new(
            config.lifecycle.clone(),
            queue,
            Arc::clone(&provisioner),
            router.clone(),
            Arc::clone(&sink),
            alerts.clone(),
            shutdown.child_token(),
        ));
        let source = Arc::new(ChainEventSource::new(
            config.events.clone(),
            Arc::clone(&chain),
            checkpoints,
            alerts.clone(),
        ));

        let watcher =
            ProfileWatcher::start(profiles, config.bidding.profile_reload_interval()).await?;
        let (scheduler, bids) = BidScheduler::new(
            config.bidding.clone(),
            Arc::clone(&chain),
            Arc::clone(&signer),
            watcher.subscribe(),
        );
        let reporter = BidReporter::new(
            sink,
            alerts.clone(),
            config.lifecycle.callback_retries,
            config.lifecycle.callback_retry_delay(),
        );

        let desired = Arc::new(ChainDesiredStates::new(
            chain,
            router.clone(),
            provider.clone(),
            config.reconcile.call_timeout(),
        ));
        let reconciler = Arc::new(DriftReconciler::new(
            config.reconcile.clone(),
            desired,
            provisioner,
            Arc::clone(&controller),
        ));

        let (orders_tx, orders) = mpsc::channel(config.bidding.channel_capacity.max(1));
        let dispatcher = Arc::new(ChainEventRouter::new(
            provider.clone(),
            orders_tx,
            Arc::clone(&router),
            Arc::clone(&controller),
            config.events.dedupe_window,
        ));

        Ok(ProviderRuntime {
            config,
            provider,
            shutdown,
            alerts,
            source,
            dispatcher,
            router,
            controller,
            reconciler,
            unstarted: Mutex::new(Some(Unstarted {
                watcher,
                scheduler: Arc::new(scheduler),
                orders,
                bids,
                reporter,
            })),
            handles: Mutex::new(Vec::new()),
        })
    }
}
