//! Contract for the remote ledger and the types exchanged with it.
//!
//! The chain is consumed through [`ChainClient`] only: queries for orders,
//! bids, leases and account sequences, transaction broadcast, and an event
//! subscription resumable from an [`EventPosition`].

pub mod http;
pub mod signer;

pub use http::HttpChainClient;
pub use signer::{Ed25519KeyManager, KeyManager, TxSigner};

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::checkpoint::EventPosition;
use crate::error::Result;
use crate::types::{
    BidId, DesiredState, LifecycleAction, Order, OrderId, ProviderAddress,
};

/// Broadcast result code for an accepted transaction.
pub const CODE_OK: u32 = 0;
/// Broadcast result code signalling a stale account sequence.
pub const CODE_SEQUENCE_MISMATCH: u32 = 32;

/// Filter expression forwarded verbatim to the chain's event index.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventQuery(pub String);

impl fmt::Display for EventQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lease lifecycle request signed by the tenant and recorded on chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRequest {
    pub order_id: OrderId,
    pub action: LifecycleAction,
    /// Tenant-chosen nonce; part of the enqueue idempotency key.
    pub nonce: String,
    pub requester: ProviderAddress,
}

/// Marketplace events the orchestrator reacts to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChainEventKind {
    OrderCreated(Order),
    OrderMatched {
        order: Order,
        bid_id: BidId,
        provider: ProviderAddress,
    },
    BidRejected {
        bid_id: BidId,
        order_id: OrderId,
        reason: String,
    },
    OrderClosed {
        order_id: OrderId,
    },
    LifecycleRequested(LifecycleRequest),
    /// Event types this provider does not act on.
    Unrecognized,
}

/// Decode an event kind, mapping unknown or malformed kinds to
/// [`ChainEventKind::Unrecognized`] so a single odd event cannot wedge the feed.
fn lenient_kind<'de, D>(deserializer: D) -> std::result::Result<ChainEventKind, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(raw).unwrap_or(ChainEventKind::Unrecognized))
}

/// One event delivered by the subscription or the polling feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub position: EventPosition,
    /// Hash of the transaction that emitted the event; the dedupe key for
    /// redelivered events.
    pub tx_hash: String,
    #[serde(deserialize_with = "lenient_kind")]
    pub kind: ChainEventKind,
}

/// Lease status for one order served by this provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaseStatus {
    pub order_id: OrderId,
    pub state: DesiredState,
}

/// Message envelope; `value` carries the message-specific payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxMessage {
    pub type_url: String,
    pub value: Value,
}

impl TxMessage {
    pub fn new<T: Serialize>(type_url: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self {
            type_url: type_url.into(),
            value: serde_json::to_value(value)?,
        })
    }
}

/// Unsigned transaction body. The signature covers its JSON encoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxBody {
    pub chain_id: String,
    pub signer: ProviderAddress,
    pub sequence: u64,
    pub messages: Vec<TxMessage>,
    #[serde(default)]
    pub memo: String,
}

impl TxBody {
    pub fn sign_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedTx {
    pub body: TxBody,
    /// Base64 public key of the signer.
    pub public_key: String,
    /// Base64 signature over [`TxBody::sign_bytes`].
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastReceipt {
    pub tx_hash: String,
    pub code: u32,
    #[serde(default)]
    pub log: String,
}

impl BroadcastReceipt {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Stream of subscription events; ends or yields an error on disconnect.
pub type EventStream = BoxStream<'static, Result<ChainEvent>>;

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn open_orders(&self) -> Result<Vec<Order>>;

    async fn query_order(&self, order_id: &OrderId) -> Result<Option<Order>>;

    /// Bid this provider already holds on the order, if any.
    async fn query_provider_bid(
        &self,
        order_id: &OrderId,
        provider: &ProviderAddress,
    ) -> Result<Option<BidId>>;

    async fn lease_states(&self, provider: &ProviderAddress) -> Result<Vec<LeaseStatus>>;

    async fn account_sequence(&self, address: &ProviderAddress) -> Result<u64>;

    async fn broadcast(&self, tx: &SignedTx) -> Result<BroadcastReceipt>;

    /// Open a live subscription delivering events strictly after `after`.
    async fn subscribe(
        &self,
        query: &EventQuery,
        after: Option<EventPosition>,
    ) -> Result<EventStream>;

    /// Fetch up to `limit` indexed events strictly after `after`, in chain order.
    async fn poll_events(
        &self,
        query: &EventQuery,
        after: Option<EventPosition>,
        limit: usize,
    ) -> Result<Vec<ChainEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_types_decode_as_unrecognized() {
        let raw = r#"{
            "position": {"height": 7, "seq": 1},
            "tx_hash": "AB12",
            "kind": {"type": "validator_slashed", "data": {"who": "x"}}
        }"#;
        let event: ChainEvent = serde_json::from_str(raw).expect("decode");
        assert_eq!(event.kind, ChainEventKind::Unrecognized);
        assert_eq!(event.position, EventPosition::new(7, 1));
    }
}
