use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::profile::ProviderProfile;
use super::rate_limit::{DualWindowLimiter, Window};
use crate::chain::{BroadcastReceipt, ChainClient, TxMessage, TxSigner};
use crate::config::BidConfig;
use crate::error::{LessorError, Result};
use crate::types::{Bid, BidId, BidResult, Order, OrderId, ProviderAddress};

pub const MSG_CREATE_BID: &str = "/lessor.market.v1.MsgCreateBid";

#[derive(Serialize)]
struct CreateBid<'a> {
    bid_id: &'a BidId,
    order_id: &'a OrderId,
    provider: &'a ProviderAddress,
    price: u64,
}

/// Why an order did not get a bid.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SkipReason {
    NotOpen,
    /// Already bid on in this process, or the chain holds our bid.
    AlreadyBid,
    Incompatible(String),
    RateLimited(Window),
    /// The duplicate check against the chain failed; the order will be seen
    /// again on the next poll or event.
    ChainUnavailable(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Admission {
    Admitted { price: u64 },
    Skipped(SkipReason),
}

/// Decides which open orders to bid on and submits those bids.
///
/// Admission runs order by order on the intake loop (compatibility, duplicate
/// checks, rate limit); signing and broadcast run concurrently, bounded by
/// the in-flight permit count. Every submitted bid ends up on the result
/// channel exactly once.
pub struct BidScheduler {
    config: BidConfig,
    chain: Arc<dyn ChainClient>,
    signer: Arc<TxSigner>,
    profile: watch::Receiver<ProviderProfile>,
    limiter: Mutex<DualWindowLimiter>,
    permits: Arc<Semaphore>,
    ledger: Mutex<HashMap<OrderId, BidResult>>,
    results: mpsc::Sender<Bid>,
}

impl fmt::Debug for BidScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self
            .ledger
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("BidScheduler")
            .field("config", &self.config)
            .field("available_permits", &self.permits.available_permits())
            .field("ledger_entries", &ledger)
            .finish()
    }
}

impl BidScheduler {
    pub fn new(
        config: BidConfig,
        chain: Arc<dyn ChainClient>,
        signer: Arc<TxSigner>,
        profile: watch::Receiver<ProviderProfile>,
    ) -> (Self, mpsc::Receiver<Bid>) {
        let (results, rx) = mpsc::channel(config.channel_capacity.max(1));
        let scheduler = Self {
            limiter: Mutex::new(DualWindowLimiter::new(
                config.max_bids_per_minute,
                config.max_bids_per_hour,
            )),
            permits: Arc::new(Semaphore::new(config.max_concurrent_bids.max(1))),
            ledger: Mutex::new(HashMap::new()),
            config,
            chain,
            signer,
            profile,
            results,
        };
        (scheduler, rx)
    }

    pub fn provider(&self) -> ProviderAddress {
        self.signer.address()
    }

    pub async fn bid_state(&self, order_id: &OrderId) -> Option<BidResult> {
        self.ledger.lock().await.get(order_id).copied()
    }

    /// Run every admission check for `order`. An admitted order is recorded
    /// as pending in the ledger, so a concurrent duplicate is skipped.
    pub async fn admit(&self, order: &Order) -> Admission {
        if !order.is_open() {
            return Admission::Skipped(SkipReason::NotOpen);
        }
        if self.ledger.lock().await.contains_key(&order.order_id) {
            return Admission::Skipped(SkipReason::AlreadyBid);
        }

        let quote = self.profile.borrow().quote(order);
        let price = match quote {
            Ok(price) => price,
            Err(err) => return Admission::Skipped(SkipReason::Incompatible(err.to_string())),
        };

        let provider = self.signer.address();
        let lookup = tokio::time::timeout(
            self.config.call_timeout(),
            self.chain.query_provider_bid(&order.order_id, &provider),
        )
        .await
        .unwrap_or_else(|_| Err(LessorError::timed_out("bid lookup")));
        match lookup {
            Ok(Some(_)) => {
                self.ledger
                    .lock()
                    .await
                    .insert(order.order_id.clone(), BidResult::Accepted);
                return Admission::Skipped(SkipReason::AlreadyBid);
            }
            Ok(None) => {}
            Err(err) => return Admission::Skipped(SkipReason::ChainUnavailable(err.to_string())),
        }

        let mut ledger = self.ledger.lock().await;
        if ledger.contains_key(&order.order_id) {
            return Admission::Skipped(SkipReason::AlreadyBid);
        }
        if let Err(window) = self.limiter.lock().await.try_acquire(Instant::now()) {
            return Admission::Skipped(SkipReason::RateLimited(window));
        }
        ledger.insert(order.order_id.clone(), BidResult::Pending);
        Admission::Admitted { price }
    }

    /// Sign and broadcast a bid for an admitted order, then publish the
    /// outcome. Transport failures are retried with a fixed delay.
    pub async fn submit(&self, order: &Order, price: u64) -> Bid {
        let bid = Bid::pending(order.order_id.clone(), self.signer.address(), price);
        let attempts = self.config.broadcast_retries + 1;
        let mut last_error = String::new();

        let mut resolved = None;
        for attempt in 1..=attempts {
            match self.broadcast_once(&bid).await {
                Ok(receipt) if receipt.is_ok() => {
                    resolved = Some(bid.clone().resolve(
                        BidResult::Accepted,
                        Some(receipt.tx_hash),
                        None,
                    ));
                    break;
                }
                Ok(receipt) => {
                    resolved = Some(bid.clone().resolve(
                        BidResult::Rejected,
                        Some(receipt.tx_hash),
                        Some(format!("code {}: {}", receipt.code, receipt.log)),
                    ));
                    break;
                }
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(
                        target: "lessor::bidding",
                        order_id = %bid.order_id,
                        attempt,
                        error = %err,
                        "bid broadcast failed, retrying"
                    );
                    last_error = err.to_string();
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(err) => {
                    last_error = err.to_string();
                    break;
                }
            }
        }

        let bid = resolved
            .unwrap_or_else(|| bid.resolve(BidResult::Error, None, Some(last_error)));
        self.record(&bid).await;
        bid
    }

    async fn broadcast_once(&self, bid: &Bid) -> Result<BroadcastReceipt> {
        let message = TxMessage::new(
            MSG_CREATE_BID,
            &CreateBid {
                bid_id: &bid.bid_id,
                order_id: &bid.order_id,
                provider: &bid.provider_address,
                price: bid.price,
            },
        )?;
        self.signer.sign_and_broadcast(vec![message], "bid").await
    }

    async fn record(&self, bid: &Bid) {
        {
            let mut ledger = self.ledger.lock().await;
            if bid.result == BidResult::Error {
                // Never reached the chain; allow a later observation to retry.
                ledger.remove(&bid.order_id);
            } else {
                ledger.insert(bid.order_id.clone(), bid.result);
            }
        }
        info!(
            target: "lessor::bidding",
            order_id = %bid.order_id,
            bid_id = %bid.bid_id,
            price = bid.price,
            result = ?bid.result,
            "bid resolved"
        );
        if self.results.send(bid.clone()).await.is_err() {
            warn!(target: "lessor::bidding", order_id = %bid.order_id, "bid result channel closed");
        }
    }

    async fn intake(
        self: &Arc<Self>,
        order: Order,
        inflight: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) {
        let price = match self.admit(&order).await {
            Admission::Admitted { price } => price,
            Admission::Skipped(reason) => {
                debug!(target: "lessor::bidding", order_id = %order.order_id, ?reason, "order skipped");
                return;
            }
        };
        // Every permit may be held by a slow broadcast.
        let permit = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(target: "lessor::bidding", order_id = %order.order_id, "shutdown while waiting for a bid slot");
                return;
            }
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        let scheduler = Arc::clone(self);
        inflight.spawn(async move {
            let _permit = permit;
            scheduler.submit(&order, price).await;
        });
    }

    /// Consume orders until shutdown, optionally polling the chain for open
    /// orders as well. In-flight submissions are awaited before returning.
    pub async fn run(self: Arc<Self>, mut orders: mpsc::Receiver<Order>, shutdown: CancellationToken) {
        let mut poll = self.config.order_poll_interval().map(tokio::time::interval);
        let mut inflight = JoinSet::new();

        loop {
            let tick = async {
                match poll.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                order = orders.recv() => match order {
                    Some(order) => self.intake(order, &mut inflight, &shutdown).await,
                    None => break,
                },
                _ = tick => {
                    let fetched = tokio::time::timeout(self.config.call_timeout(), self.chain.open_orders())
                        .await
                        .unwrap_or_else(|_| Err(LessorError::timed_out("open orders")));
                    match fetched {
                        Ok(open) => {
                            for order in open {
                                if shutdown.is_cancelled() {
                                    break;
                                }
                                self.intake(order, &mut inflight, &shutdown).await;
                            }
                        }
                        Err(err) => warn!(target: "lessor::bidding", error = %err, "open order poll failed"),
                    }
                }
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            }
        }

        while inflight.join_next().await.is_some() {}
        info!(target: "lessor::bidding", "bid scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bidding::profile::{Capacity, Pricing};
    use crate::chain::Ed25519KeyManager;
    use crate::testing::{BroadcastScript, ScriptedChain};
    use crate::types::{OrderState, ResourceRequirements};
    use serde_json::Value;
    use std::time::Duration;

    fn open_order(id: &str) -> Order {
        Order {
            order_id: OrderId::new(id),
            owner: ProviderAddress("tenant".into()),
            requirements: ResourceRequirements {
                cpu_millis: 1_000,
                memory_mb: 1_024,
                ..Default::default()
            },
            max_price: None,
            state: OrderState::Open,
            manifest: Value::Null,
        }
    }

    fn scheduler(
        chain: Arc<ScriptedChain>,
        config: BidConfig,
    ) -> (Arc<BidScheduler>, mpsc::Receiver<Bid>) {
        let signer = Arc::new(TxSigner::new(
            Arc::new(Ed25519KeyManager::from_seed([7u8; 32])),
            chain.clone(),
            "lessor-test",
            Duration::from_secs(1),
        ));
        let profile = ProviderProfile {
            capacity: Capacity {
                cpu_millis: 4_000,
                memory_mb: 8_192,
                storage_gb: 10,
                gpus: 0,
            },
            pricing: Pricing {
                cpu_price: 1,
                memory_price: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(profile);
        let (scheduler, results) = BidScheduler::new(config, chain, signer, rx);
        (Arc::new(scheduler), results)
    }

    #[tokio::test]
    async fn second_admission_for_same_order_is_skipped() {
        let chain = Arc::new(ScriptedChain::new());
        let (scheduler, _results) = scheduler(chain.clone(), BidConfig::default());

        let order = open_order("o-1");
        assert_eq!(scheduler.admit(&order).await, Admission::Admitted { price: 2_024 });
        assert_eq!(
            scheduler.admit(&order).await,
            Admission::Skipped(SkipReason::AlreadyBid)
        );

        chain
            .record_existing_bid(OrderId::new("o-2"), scheduler.provider())
            .await;
        assert_eq!(
            scheduler.admit(&open_order("o-2")).await,
            Admission::Skipped(SkipReason::AlreadyBid)
        );
    }

    #[tokio::test]
    async fn admissions_never_exceed_the_minute_window() {
        let chain = Arc::new(ScriptedChain::new());
        let config = BidConfig {
            max_bids_per_minute: 3,
            max_bids_per_hour: 100,
            ..Default::default()
        };
        let (scheduler, _results) = scheduler(chain, config);

        let mut admitted = 0;
        for n in 0..10 {
            if let Admission::Admitted { .. } = scheduler.admit(&open_order(&format!("o-{n}"))).await {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(
            scheduler.admit(&open_order("o-late")).await,
            Admission::Skipped(SkipReason::RateLimited(Window::Minute))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried_then_reported_as_error() {
        let chain = Arc::new(ScriptedChain::new());
        let config = BidConfig {
            broadcast_retries: 2,
            retry_delay_ms: 10,
            ..Default::default()
        };
        let (scheduler, mut results) = scheduler(chain.clone(), config);

        chain
            .script_broadcasts([BroadcastScript::Transport, BroadcastScript::Transport])
            .await;
        let order = open_order("o-retry");
        let Admission::Admitted { price } = scheduler.admit(&order).await else {
            panic!("order should be admitted");
        };
        let bid = scheduler.submit(&order, price).await;
        assert_eq!(bid.result, BidResult::Accepted);
        assert_eq!(chain.broadcasts().await.len(), 1);
        assert_eq!(results.recv().await.expect("published").bid_id, bid.bid_id);

        chain
            .script_broadcasts([
                BroadcastScript::Transport,
                BroadcastScript::Transport,
                BroadcastScript::Transport,
            ])
            .await;
        let order = open_order("o-down");
        let Admission::Admitted { price } = scheduler.admit(&order).await else {
            panic!("order should be admitted");
        };
        let bid = scheduler.submit(&order, price).await;
        assert_eq!(bid.result, BidResult::Error);
        assert_eq!(results.recv().await.expect("published").result, BidResult::Error);
        assert_eq!(scheduler.bid_state(&order.order_id).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_noticed_while_every_bid_slot_is_taken() {
        let chain = Arc::new(ScriptedChain::new());
        let config = BidConfig {
            max_concurrent_bids: 1,
            ..Default::default()
        };
        let (scheduler, _results) = scheduler(chain.clone(), config);
        let _slot = Arc::clone(&scheduler.permits)
            .acquire_owned()
            .await
            .expect("permit");
        let (orders_tx, orders_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.clone().run(orders_rx, shutdown.clone()));

        orders_tx.send(open_order("o-wait")).await.expect("send");
        let waiting = OrderId::new("o-wait");
        for _ in 0..100 {
            if scheduler.bid_state(&waiting).await == Some(BidResult::Pending) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(scheduler.bid_state(&waiting).await, Some(BidResult::Pending));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stops without a free slot")
            .expect("join");
        assert!(chain.broadcasts().await.is_empty());
    }

    #[tokio::test]
    async fn run_loop_bids_on_incoming_orders() {
        let chain = Arc::new(ScriptedChain::new());
        let (scheduler, mut results) = scheduler(chain.clone(), BidConfig::default());
        let (orders_tx, orders_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.clone().run(orders_rx, shutdown.clone()));

        orders_tx.send(open_order("o-a")).await.expect("send");
        orders_tx.send(open_order("o-a")).await.expect("send");
        let mut too_big = open_order("o-big");
        too_big.requirements.cpu_millis = 64_000;
        orders_tx.send(too_big).await.expect("send");
        orders_tx.send(open_order("o-b")).await.expect("send");

        let first = results.recv().await.expect("bid");
        let second = results.recv().await.expect("bid");
        let mut ids = vec![first.order_id.0, second.order_id.0];
        ids.sort();
        assert_eq!(ids, vec!["o-a".to_string(), "o-b".to_string()]);

        shutdown.cancel();
        task.await.expect("join");
        assert_eq!(chain.broadcasts().await.len(), 2);
        assert!(results.try_recv().is_err());
    }
}
