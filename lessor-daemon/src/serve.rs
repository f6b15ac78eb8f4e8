use std::sync::Arc;

use anyhow::Context;
use lessor_config::{CallbackMode, DaemonConfig, validation};
use lessor_core::bidding::FileProfileSource;
use lessor_core::callback::{CallbackSink, ChainCallbackSink, FileCallbackSink};
use lessor_core::chain::{ChainClient, Ed25519KeyManager, HttpChainClient, TxSigner};
use lessor_core::checkpoint::FileCheckpointStore;
use lessor_core::lifecycle::{CommandQueue, RedbCommandQueue};
use lessor_core::provisioning::HttpProvisioningClient;
use lessor_core::routing::FileRoutingStore;
use lessor_core::webhook::{self, WebhookState};
use lessor_core::ProviderRuntime;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let rpc_url = validation::endpoint("chain.rpc_url", &config.chain.rpc_url)?;
    let provisioning_url = validation::endpoint("provisioning.url", &config.provisioning.url)?;

    let chain: Arc<dyn ChainClient> = Arc::new(
        HttpChainClient::new(rpc_url, config.chain.connect_timeout())
            .context("failed to build chain client")?,
    );
    let keys = Ed25519KeyManager::from_seed_file(&config.chain.key_path)
        .await
        .with_context(|| {
            format!(
                "failed to load signing key from {}",
                config.chain.key_path.display()
            )
        })?;
    let signer = Arc::new(TxSigner::new(
        Arc::new(keys),
        Arc::clone(&chain),
        config.chain.chain_id.clone(),
        config.orchestrator.bidding.call_timeout(),
    ));
    let provisioner = Arc::new(
        HttpProvisioningClient::new(provisioning_url, config.provisioning.connect_timeout())
            .context("failed to build provisioning client")?,
    );

    let lifecycle = &config.orchestrator.lifecycle;
    let queue: Arc<dyn CommandQueue> = match &lifecycle.queue_path {
        Some(path) => Arc::new(
            RedbCommandQueue::open(path)
                .await
                .with_context(|| format!("failed to open lifecycle queue {}", path.display()))?,
        ),
        None => Arc::new(RedbCommandQueue::in_memory().context("failed to create in-memory queue")?),
    };
    let routing_path = &config.orchestrator.routing.state_path;
    let routing_store = Arc::new(
        FileRoutingStore::open(routing_path)
            .await
            .with_context(|| format!("failed to open routing state {}", routing_path.display()))?,
    );
    let sink: Arc<dyn CallbackSink> = match config.callback.mode {
        CallbackMode::Chain => Arc::new(ChainCallbackSink::new(Arc::clone(&signer))),
        CallbackMode::File => Arc::new(FileCallbackSink::new(&config.callback.path)),
    };

    let runtime = ProviderRuntime::builder(config.orchestrator.clone())
        .with_chain(chain)
        .with_signer(signer)
        .with_provisioner(provisioner)
        .with_checkpoints(Arc::new(FileCheckpointStore::new(
            &config.orchestrator.events.checkpoint_dir,
        )))
        .with_routing_store(routing_store)
        .with_queue(queue)
        .with_sink(sink)
        .with_profiles(Arc::new(FileProfileSource::new(&config.profile_path)))
        .build()
        .await
        .context("failed to assemble provider runtime")?;
    runtime
        .start()
        .await
        .context("failed to start provider runtime")?;
    info!(provider = %runtime.provider(), "provider online");

    let webhook = if config.webhook.enabled {
        let secret = config.webhook.secret.as_deref().unwrap_or_default();
        let state = WebhookState::new(
            runtime.controller(),
            secret.as_bytes(),
            runtime.source_state(),
        )
        .context("invalid webhook configuration")?;
        let listener = TcpListener::bind(config.webhook.bind)
            .await
            .with_context(|| format!("failed to bind webhook on {}", config.webhook.bind))?;
        info!(addr = %config.webhook.bind, "callback webhook listening");
        let token = runtime.shutdown_token();
        Some(tokio::spawn(async move {
            let served = axum::serve(listener, webhook::router(state))
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = served {
                error!(error = %err, "callback webhook stopped");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    runtime.shutdown().await.context("shutdown failed")?;
    if let Some(webhook) = webhook
        && let Err(err) = webhook.await
    {
        warn!(error = %err, "webhook task ended abnormally");
    }
    Ok(())
}
