use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::chain::{ChainEvent, ChainEventKind};
use crate::error::{ErrorClass, LessorError, Result};
use crate::events::{DedupeWindow, EventHandler};
use crate::lifecycle::LifecycleController;
use crate::routing::OrderRouter;
use crate::types::{Order, ProviderAddress};

/// Fans chain events out to the component that owns them.
///
/// Events are handled one by one and remembered only after they were
/// handled, so when a transient failure makes the source redeliver a batch
/// the events before the failure are not acted on twice.
pub struct ChainEventRouter {
    provider: ProviderAddress,
    orders: mpsc::Sender<Order>,
    router: Arc<OrderRouter>,
    controller: Arc<LifecycleController>,
    seen: Mutex<DedupeWindow>,
}

impl fmt::Debug for ChainEventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seen = self.seen.try_lock().map(|seen| seen.len()).ok();
        f.debug_struct("ChainEventRouter")
            .field("provider", &self.provider)
            .field("seen", &seen)
            .finish()
    }
}

impl ChainEventRouter {
    pub fn new(
        provider: ProviderAddress,
        orders: mpsc::Sender<Order>,
        router: Arc<OrderRouter>,
        controller: Arc<LifecycleController>,
        dedupe_window: usize,
    ) -> Self {
        Self {
            provider,
            orders,
            router,
            controller,
            seen: Mutex::new(DedupeWindow::new(dedupe_window)),
        }
    }

    async fn dispatch(&self, event: &ChainEvent) -> Result<()> {
        match &event.kind {
            ChainEventKind::OrderCreated(order) => {
                self.orders
                    .send(order.clone())
                    .await
                    .map_err(|_| LessorError::Cancelled("bid intake closed".into()))?;
            }
            ChainEventKind::OrderMatched {
                order, provider, ..
            } => {
                if *provider != self.provider {
                    debug!(target: "lessor::events", order_id = %order.order_id, winner = %provider, "order matched to another provider");
                    return Ok(());
                }
                let outcome = self.router.route(order).await?;
                debug!(target: "lessor::events", order_id = %order.order_id, ?outcome, "matched order handed to router");
            }
            ChainEventKind::LifecycleRequested(request) => {
                match self
                    .controller
                    .submit_chain_request(request, &event.tx_hash)
                    .await
                {
                    Ok(handle) => debug!(
                        target: "lessor::events",
                        order_id = %request.order_id,
                        command_id = %handle.command_id,
                        merged = !handle.accepted,
                        "lifecycle request queued"
                    ),
                    // Requests for orders this provider does not serve are
                    // not ours to act on.
                    Err(err) if err.class() == ErrorClass::Validation => warn!(
                        target: "lessor::events",
                        order_id = %request.order_id,
                        error = %err,
                        "lifecycle request ignored"
                    ),
                    Err(err) => return Err(err),
                }
            }
            ChainEventKind::BidRejected {
                bid_id, reason, ..
            } => {
                info!(target: "lessor::events", bid_id = %bid_id, reason, "bid rejected on chain");
            }
            ChainEventKind::OrderClosed { order_id } => {
                debug!(target: "lessor::events", order_id = %order_id, "order closed");
            }
            ChainEventKind::Unrecognized => {}
        }
        Ok(())
    }
}

fn event_key(event: &ChainEvent) -> String {
    format!(
        "{}@{}.{}",
        event.tx_hash, event.position.height, event.position.seq
    )
}

#[async_trait]
impl EventHandler for ChainEventRouter {
    async fn handle_batch(&self, events: &[ChainEvent]) -> Result<()> {
        for event in events {
            let key = event_key(event);
            if self.seen.lock().await.contains(&key) {
                continue;
            }
            self.dispatch(event).await?;
            self.seen.lock().await.insert(&key);
        }
        Ok(())
    }
}
