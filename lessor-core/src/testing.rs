//! In-process fakes for the consumed interfaces.
//!
//! Used by the unit tests here, the scenario tests under `tests/`, and the
//! daemon's dry-run wiring. They keep everything in memory and record every
//! call so tests can assert on exact interaction counts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::callback::{CallbackResult, CallbackSink};
use crate::chain::{
    BroadcastReceipt, CODE_OK, ChainClient, ChainEvent, EventQuery, EventStream, LeaseStatus,
    SignedTx,
};
use crate::checkpoint::EventPosition;
use crate::error::{LessorError, Result};
use crate::provisioning::ProvisioningClient;
use crate::routing::ResourceDirectory;
use crate::types::{
    ActualState, BidId, LifecycleAction, Order, OrderId, ProviderAddress, ResourceRef,
    ResourceSpec,
};

/// Scripted outcome for a fake call.
#[derive(Clone, Debug)]
pub enum Outcome {
    Ok,
    Transient(String),
    Validation(String),
}

impl Outcome {
    fn into_result(self) -> Result<()> {
        match self {
            Outcome::Ok => Ok(()),
            Outcome::Transient(msg) => Err(LessorError::Transient(msg)),
            Outcome::Validation(msg) => Err(LessorError::Validation(msg)),
        }
    }
}

/// Scripted broadcast result. `Transport` simulates a connection failure.
#[derive(Clone, Debug)]
pub enum BroadcastScript {
    Code(u32, String),
    Transport,
}

#[derive(Debug, Default)]
struct ChainState {
    sequence: u64,
    sequence_queries: u32,
    open_orders: Vec<Order>,
    orders: HashMap<OrderId, Order>,
    provider_bids: HashSet<(OrderId, ProviderAddress)>,
    leases: Vec<LeaseStatus>,
    broadcasts: Vec<SignedTx>,
    broadcast_script: VecDeque<BroadcastScript>,
    events: Vec<ChainEvent>,
    subscribe_failures: u32,
    close_subscriptions: bool,
    subscribe_calls: u32,
    poll_calls: u32,
}

/// In-memory chain. Events appended with [`ScriptedChain::push_event`] are
/// served by both the subscription and the polling feed.
#[derive(Debug, Default)]
pub struct ScriptedChain {
    state: Mutex<ChainState>,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_sequence(&self, sequence: u64) {
        self.state.lock().await.sequence = sequence;
    }

    pub async fn sequence_queries(&self) -> u32 {
        self.state.lock().await.sequence_queries
    }

    pub async fn add_open_order(&self, order: Order) {
        let mut state = self.state.lock().await;
        state.orders.insert(order.order_id.clone(), order.clone());
        state.open_orders.push(order);
    }

    pub async fn record_existing_bid(&self, order_id: OrderId, provider: ProviderAddress) {
        self.state.lock().await.provider_bids.insert((order_id, provider));
    }

    pub async fn set_leases(&self, leases: Vec<LeaseStatus>) {
        self.state.lock().await.leases = leases;
    }

    pub async fn script_broadcasts(&self, script: impl IntoIterator<Item = BroadcastScript>) {
        self.state.lock().await.broadcast_script.extend(script);
    }

    pub async fn broadcasts(&self) -> Vec<SignedTx> {
        self.state.lock().await.broadcasts.clone()
    }

    pub async fn push_event(&self, event: ChainEvent) {
        self.state.lock().await.events.push(event);
    }

    /// The next `count` subscribe calls fail with a transient error.
    pub async fn fail_subscriptions(&self, count: u32) {
        self.state.lock().await.subscribe_failures = count;
    }

    /// Accepted subscriptions end right after the backlog instead of
    /// staying open.
    pub async fn close_subscriptions(&self, close: bool) {
        self.state.lock().await.close_subscriptions = close;
    }

    pub async fn subscribe_calls(&self) -> u32 {
        self.state.lock().await.subscribe_calls
    }

    pub async fn poll_calls(&self) -> u32 {
        self.state.lock().await.poll_calls
    }

    fn after(events: &[ChainEvent], after: Option<EventPosition>) -> Vec<ChainEvent> {
        events
            .iter()
            .filter(|event| after.is_none_or(|after| event.position > after))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn open_orders(&self) -> Result<Vec<Order>> {
        Ok(self.state.lock().await.open_orders.clone())
    }

    async fn query_order(&self, order_id: &OrderId) -> Result<Option<Order>> {
        Ok(self.state.lock().await.orders.get(order_id).cloned())
    }

    async fn query_provider_bid(
        &self,
        order_id: &OrderId,
        provider: &ProviderAddress,
    ) -> Result<Option<BidId>> {
        let state = self.state.lock().await;
        let key = (order_id.clone(), provider.clone());
        Ok(state
            .provider_bids
            .contains(&key)
            .then(|| BidId::derive(order_id, provider)))
    }

    async fn lease_states(&self, _provider: &ProviderAddress) -> Result<Vec<LeaseStatus>> {
        Ok(self.state.lock().await.leases.clone())
    }

    async fn account_sequence(&self, _address: &ProviderAddress) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.sequence_queries += 1;
        Ok(state.sequence)
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<BroadcastReceipt> {
        let mut state = self.state.lock().await;
        let script = state
            .broadcast_script
            .pop_front()
            .unwrap_or(BroadcastScript::Code(CODE_OK, String::new()));
        match script {
            BroadcastScript::Transport => Err(LessorError::Transient("connection reset".into())),
            BroadcastScript::Code(code, log) => {
                state.broadcasts.push(tx.clone());
                if code == CODE_OK {
                    state.sequence = tx.body.sequence + 1;
                    for message in &tx.body.messages {
                        if let Some(order) = message.value.get("order_id").and_then(|v| v.as_str())
                        {
                            state
                                .provider_bids
                                .insert((OrderId::new(order), tx.body.signer.clone()));
                        }
                    }
                }
                Ok(BroadcastReceipt {
                    tx_hash: format!("TX{:04}", state.broadcasts.len()),
                    code,
                    log,
                })
            }
        }
    }

    async fn subscribe(
        &self,
        _query: &EventQuery,
        after: Option<EventPosition>,
    ) -> Result<EventStream> {
        let mut state = self.state.lock().await;
        state.subscribe_calls += 1;
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(LessorError::Transient("subscription refused".into()));
        }
        let backlog =
            futures::stream::iter(Self::after(&state.events, after).into_iter().map(Ok));
        if state.close_subscriptions {
            return Ok(backlog.boxed());
        }
        // Deliver the backlog, then stay open like a quiet live stream.
        Ok(backlog.chain(futures::stream::pending()).boxed())
    }

    async fn poll_events(
        &self,
        _query: &EventQuery,
        after: Option<EventPosition>,
        limit: usize,
    ) -> Result<Vec<ChainEvent>> {
        let mut state = self.state.lock().await;
        state.poll_calls += 1;
        let mut events = Self::after(&state.events, after);
        events.truncate(limit);
        Ok(events)
    }
}

#[derive(Debug, Default)]
struct ProvisionerState {
    provision_script: HashMap<OrderId, VecDeque<Outcome>>,
    action_script: VecDeque<Outcome>,
    states: HashMap<ResourceRef, ActualState>,
    calls: Vec<(LifecycleAction, String)>,
    in_flight: HashMap<ResourceRef, u32>,
    max_in_flight: HashMap<ResourceRef, u32>,
}

/// Provisioning backend that records every mutating call and can be scripted
/// to fail. Successful provisions return `res-<order_id>`.
#[derive(Debug, Default)]
pub struct ScriptedProvisioner {
    state: Mutex<ProvisionerState>,
    delay: Duration,
}

impl ScriptedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mutating call sleeps this long, so overlapping executions on the
    /// same resource become observable.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub async fn script_provision(
        &self,
        order_id: &OrderId,
        outcomes: impl IntoIterator<Item = Outcome>,
    ) {
        self.state
            .lock()
            .await
            .provision_script
            .entry(order_id.clone())
            .or_default()
            .extend(outcomes);
    }

    /// Outcomes consumed in order by suspend/resume/terminate calls.
    pub async fn script_actions(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state.lock().await.action_script.extend(outcomes);
    }

    pub async fn set_state(&self, resource: &ResourceRef, state: ActualState) {
        self.state.lock().await.states.insert(resource.clone(), state);
    }

    pub async fn calls(&self) -> Vec<(LifecycleAction, String)> {
        self.state.lock().await.calls.clone()
    }

    pub async fn count(&self, action: LifecycleAction) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|(a, _)| *a == action)
            .count()
    }

    /// Highest number of overlapping calls observed for any one resource.
    pub async fn max_concurrency(&self) -> u32 {
        self.state
            .lock()
            .await
            .max_in_flight
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    async fn enter(&self, resource: &ResourceRef, action: LifecycleAction, target: String) {
        let mut state = self.state.lock().await;
        state.calls.push((action, target));
        let current = {
            let entry = state.in_flight.entry(resource.clone()).or_default();
            *entry += 1;
            *entry
        };
        let max = state.max_in_flight.entry(resource.clone()).or_default();
        *max = (*max).max(current);
    }

    async fn leave(&self, resource: &ResourceRef) {
        let mut state = self.state.lock().await;
        if let Some(count) = state.in_flight.get_mut(resource) {
            *count = count.saturating_sub(1);
        }
    }

    async fn transition(
        &self,
        resource: &ResourceRef,
        action: LifecycleAction,
        next: ActualState,
    ) -> Result<()> {
        self.enter(resource, action, resource.0.clone()).await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut state = self.state.lock().await;
        let outcome = state.action_script.pop_front().unwrap_or(Outcome::Ok);
        let result = outcome.into_result();
        if result.is_ok() {
            state.states.insert(resource.clone(), next);
        }
        drop(state);
        self.leave(resource).await;
        result
    }
}

#[async_trait]
impl ProvisioningClient for ScriptedProvisioner {
    async fn provision(&self, spec: &ResourceSpec) -> Result<ResourceRef> {
        let resource = ResourceRef::new(format!("res-{}", spec.order_id));
        self.enter(&resource, LifecycleAction::Provision, spec.order_id.0.clone())
            .await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut state = self.state.lock().await;
        let outcome = state
            .provision_script
            .get_mut(&spec.order_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Outcome::Ok);
        let result = outcome.into_result();
        if result.is_ok() {
            state.states.insert(resource.clone(), ActualState::Active);
        }
        drop(state);
        self.leave(&resource).await;
        result.map(|_| resource)
    }

    async fn suspend(&self, resource: &ResourceRef) -> Result<()> {
        self.transition(resource, LifecycleAction::Suspend, ActualState::Suspended)
            .await
    }

    async fn resume(&self, resource: &ResourceRef) -> Result<()> {
        self.transition(resource, LifecycleAction::Resume, ActualState::Active)
            .await
    }

    async fn terminate(&self, resource: &ResourceRef) -> Result<()> {
        self.transition(resource, LifecycleAction::Terminate, ActualState::Terminated)
            .await
    }

    async fn get_state(&self, resource: &ResourceRef) -> Result<ActualState> {
        Ok(self
            .state
            .lock()
            .await
            .states
            .get(resource)
            .copied()
            .unwrap_or(ActualState::Missing))
    }
}

/// Callback sink that keeps every submitted result. The first `failures`
/// submissions are rejected with a transient error.
#[derive(Debug, Default)]
pub struct RecordingSink {
    results: Mutex<Vec<CallbackResult>>,
    failures: Mutex<u32>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn fail_next(&self, count: u32) {
        *self.failures.lock().await = count;
    }

    pub async fn results(&self) -> Vec<CallbackResult> {
        self.results.lock().await.clone()
    }
}

#[async_trait]
impl CallbackSink for RecordingSink {
    async fn submit(&self, result: &CallbackResult) -> Result<()> {
        let mut failures = self.failures.lock().await;
        if *failures > 0 {
            *failures -= 1;
            return Err(LessorError::Transient("sink unavailable".into()));
        }
        drop(failures);
        self.results.lock().await.push(result.clone());
        Ok(())
    }
}

/// Fixed order/resource bindings standing in for the order router.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    bindings: Mutex<Vec<(OrderId, ResourceRef, ResourceSpec)>>,
}

impl StaticDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn bind(&self, resource: ResourceRef, spec: ResourceSpec) {
        self.bindings
            .lock()
            .await
            .push((spec.order_id.clone(), resource, spec));
    }

    pub async fn resource_of(&self, order_id: &OrderId) -> Option<ResourceRef> {
        self.resolve_order(order_id).await.ok().flatten()
    }
}

#[async_trait]
impl ResourceDirectory for StaticDirectory {
    async fn resolve_order(&self, order_id: &OrderId) -> Result<Option<ResourceRef>> {
        Ok(self
            .bindings
            .lock()
            .await
            .iter()
            .find(|(order, _, _)| order == order_id)
            .map(|(_, resource, _)| resource.clone()))
    }

    async fn spec_for(&self, resource: &ResourceRef) -> Result<Option<ResourceSpec>> {
        Ok(self
            .bindings
            .lock()
            .await
            .iter()
            .find(|(_, bound, _)| bound == resource)
            .map(|(_, _, spec)| spec.clone()))
    }

    async fn routed_resources(&self) -> Result<Vec<(OrderId, ResourceRef)>> {
        Ok(self
            .bindings
            .lock()
            .await
            .iter()
            .map(|(order, resource, _)| (order.clone(), resource.clone()))
            .collect())
    }

    async fn rebind(&self, order_id: &OrderId, resource: &ResourceRef) -> Result<()> {
        let mut bindings = self.bindings.lock().await;
        let Some(binding) = bindings.iter_mut().find(|(order, _, _)| order == order_id) else {
            return Err(LessorError::NotFound(format!("no binding for {order_id}")));
        };
        binding.1 = resource.clone();
        Ok(())
    }
}
