//! Outcome reporting.
//!
//! Sinks are stateless: a failed `submit` is simply returned, and the caller
//! owns retrying it.

mod chain;
mod file;

pub use chain::ChainCallbackSink;
pub use file::FileCallbackSink;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Bid, CommandId, LifecycleAction, OrderId, ResourceRef};

/// Everything the orchestrator reports about work it performed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallbackResult {
    BidOutcome {
        bid: Bid,
    },
    LifecycleConfirmed {
        command_id: CommandId,
        resource_ref: ResourceRef,
        action: LifecycleAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_id: Option<OrderId>,
        request_nonce: String,
    },
    LifecycleFailed {
        command_id: CommandId,
        resource_ref: ResourceRef,
        action: LifecycleAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_id: Option<OrderId>,
        request_nonce: String,
        attempts: u32,
        error: String,
    },
    RoutingFailed {
        order_id: OrderId,
        attempts: u32,
        error: String,
    },
}

impl CallbackResult {
    pub fn label(&self) -> &'static str {
        match self {
            CallbackResult::BidOutcome { .. } => "bid_outcome",
            CallbackResult::LifecycleConfirmed { .. } => "lifecycle_confirmed",
            CallbackResult::LifecycleFailed { .. } => "lifecycle_failed",
            CallbackResult::RoutingFailed { .. } => "routing_failed",
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn submit(&self, result: &CallbackResult) -> Result<()>;
}
