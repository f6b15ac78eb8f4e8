use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BidId, OrderId, ProviderAddress};

/// Outcome of a bid broadcast.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidResult {
    /// Signed but not yet acknowledged by the chain.
    Pending,
    Accepted,
    /// The chain refused the transaction (non-zero result code).
    Rejected,
    /// Broadcast never succeeded within the retry budget.
    Error,
}

/// A bid this provider placed. Only `result` (and the fields describing it)
/// change after submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub bid_id: BidId,
    pub order_id: OrderId,
    pub price: u64,
    pub provider_address: ProviderAddress,
    pub submitted_at: DateTime<Utc>,
    pub result: BidResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Chain log or transport error explaining a non-accepted result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Bid {
    pub fn pending(order_id: OrderId, provider_address: ProviderAddress, price: u64) -> Self {
        Self {
            bid_id: BidId::derive(&order_id, &provider_address),
            order_id,
            price,
            provider_address,
            submitted_at: Utc::now(),
            result: BidResult::Pending,
            tx_hash: None,
            detail: None,
        }
    }

    pub fn resolve(mut self, result: BidResult, tx_hash: Option<String>, detail: Option<String>) -> Self {
        self.result = result;
        self.tx_hash = tx_hash;
        self.detail = detail;
        self
    }
}
