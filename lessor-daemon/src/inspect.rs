//! Offline views over the daemon's persisted state. The lifecycle queue file
//! is locked while the daemon runs, so these are meant for a stopped daemon.

use std::time::Duration;

use anyhow::{Context, bail};
use chrono::Utc;
use lessor_config::DaemonConfig;
use lessor_core::checkpoint::{CheckpointStore, FileCheckpointStore};
use lessor_core::lifecycle::{CommandQueue, CommandState, RedbCommandQueue};
use lessor_core::routing::{FileRoutingStore, RoutingStore};
use lessor_core::types::{CommandId, SubscriberId};
use uuid::Uuid;

async fn open_queue(config: &DaemonConfig) -> anyhow::Result<RedbCommandQueue> {
    let Some(path) = &config.orchestrator.lifecycle.queue_path else {
        bail!("lifecycle queue runs in memory; there is nothing persisted to inspect");
    };
    RedbCommandQueue::open(path).await.with_context(|| {
        format!(
            "failed to open lifecycle queue {} (is the daemon still running?)",
            path.display()
        )
    })
}

pub async fn list_queue(config: &DaemonConfig, state: Option<CommandState>) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let commands = queue.list_by_state(state).await?;
    for command in &commands {
        println!(
            "{}  {:<10} {:<10} {:<24} attempts={} {}",
            command.command_id,
            command.state.as_str(),
            command.action.as_str(),
            command.resource_ref.to_string(),
            command.attempts,
            command.last_error.as_deref().unwrap_or(""),
        );
    }
    println!("{} command(s)", commands.len());
    Ok(())
}

pub async fn requeue(config: &DaemonConfig, command_id: Uuid) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let command = queue
        .requeue(CommandId(command_id))
        .await
        .with_context(|| format!("cannot requeue {command_id}"))?;
    println!(
        "{} {} on {} is {} again",
        command.command_id,
        command.action.as_str(),
        command.resource_ref,
        command.state.as_str()
    );
    Ok(())
}

pub async fn show_checkpoint(config: &DaemonConfig) -> anyhow::Result<()> {
    let events = &config.orchestrator.events;
    let store = FileCheckpointStore::new(&events.checkpoint_dir);
    let subscriber = SubscriberId::new(events.subscriber_id.clone());
    match store.load(&subscriber).await? {
        Some(checkpoint) => {
            let age = (Utc::now() - checkpoint.updated_at)
                .to_std()
                .unwrap_or_default();
            println!(
                "{subscriber}: height {} seq {} (updated {}, {} ago)",
                checkpoint.last_height,
                checkpoint.last_event_seq,
                checkpoint.updated_at.to_rfc3339(),
                humantime::format_duration(Duration::from_secs(age.as_secs())),
            );
        }
        None => println!("{subscriber}: no checkpoint yet; the next start subscribes without a resume position"),
    }
    Ok(())
}

pub async fn list_routing(config: &DaemonConfig) -> anyhow::Result<()> {
    let path = &config.orchestrator.routing.state_path;
    let store = FileRoutingStore::open(path)
        .await
        .with_context(|| format!("failed to read routing state {}", path.display()))?;
    let records = store.list().await?;
    for record in &records {
        println!(
            "{:<20} {:<13} attempts={} resource={} {}",
            record.order_id.to_string(),
            format!("{:?}", record.state),
            record.attempts,
            record
                .external_resource_ref
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".into()),
            record.last_error.as_deref().unwrap_or(""),
        );
    }
    println!("{} record(s)", records.len());
    Ok(())
}
