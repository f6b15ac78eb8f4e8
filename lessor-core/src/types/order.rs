use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{OrderId, ProviderAddress};

/// Order state as projected from the marketplace module.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Open,
    Matched,
    Closed,
}

/// Compute requirements attached to an order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub storage_gb: u64,
    pub gpus: u32,
    /// Placement attributes the provider must advertise (e.g. `region=eu`).
    pub attributes: BTreeMap<String, String>,
}

/// Read-only projection of an on-chain order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub owner: ProviderAddress,
    pub requirements: ResourceRequirements,
    /// Highest price per block the tenant accepts; `None` means unbounded.
    #[serde(default)]
    pub max_price: Option<u64>,
    pub state: OrderState,
    /// Opaque deployment manifest forwarded verbatim to the provisioning backend.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub manifest: Value,
}

impl Order {
    pub fn is_open(&self) -> bool {
        self.state == OrderState::Open
    }
}
