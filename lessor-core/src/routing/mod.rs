//! Matched-order provisioning.
//!
//! [`OrderRouter`] owns every [`RoutingRecord`]: it turns a matched order into
//! a provisioning request, retries it with exponential backoff and persists
//! each transition. Other components read the result through
//! [`ResourceDirectory`].

mod router;
mod store;

pub use router::{OrderRouter, RouteOutcome};
pub use store::{FileRoutingStore, InMemoryRoutingStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{OrderId, ResourceRef, ResourceSpec};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingState {
    /// Queued, in flight, or waiting out a backoff.
    Pending,
    Routed,
    /// Retry budget used up.
    Failed,
    /// Rejected as invalid; never retried.
    DeadLettered,
}

impl RoutingState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RoutingState::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub order_id: OrderId,
    #[serde(default)]
    pub external_resource_ref: Option<ResourceRef>,
    pub state: RoutingState,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Kept so a pending record can be resumed after restart.
    #[serde(default)]
    pub spec: Option<ResourceSpec>,
    pub updated_at: DateTime<Utc>,
}

impl RoutingRecord {
    pub fn pending(spec: ResourceSpec) -> Self {
        Self {
            order_id: spec.order_id.clone(),
            external_resource_ref: None,
            state: RoutingState::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            spec: Some(spec),
            updated_at: Utc::now(),
        }
    }

    pub fn dead_lettered(order_id: OrderId, error: String) -> Self {
        Self {
            order_id,
            external_resource_ref: None,
            state: RoutingState::DeadLettered,
            attempts: 0,
            last_error: Some(error),
            next_attempt_at: None,
            spec: None,
            updated_at: Utc::now(),
        }
    }
}

/// Persistence for routing records. Writes replace the record for its order.
#[async_trait]
pub trait RoutingStore: Send + Sync {
    async fn get(&self, order_id: &OrderId) -> Result<Option<RoutingRecord>>;

    async fn upsert(&self, record: &RoutingRecord) -> Result<()>;

    async fn list(&self) -> Result<Vec<RoutingRecord>>;
}

/// Read view over routed resources for the lifecycle controller and the
/// reconciler.
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn resolve_order(&self, order_id: &OrderId) -> Result<Option<ResourceRef>>;

    /// Order and provisioning spec a resource was created from.
    async fn spec_for(&self, resource: &ResourceRef) -> Result<Option<ResourceSpec>>;

    async fn routed_resources(&self) -> Result<Vec<(OrderId, ResourceRef)>>;

    /// Point the order at a new resource after a lifecycle re-provision.
    async fn rebind(&self, order_id: &OrderId, resource: &ResourceRef) -> Result<()>;
}
