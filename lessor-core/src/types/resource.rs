use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{OrderId, ProviderAddress};
use super::order::{Order, ResourceRequirements};
use crate::error::{LessorError, Result};

/// Backend-agnostic provisioning request derived from a matched order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Doubles as the backend-side idempotency key.
    pub order_id: OrderId,
    pub tenant: ProviderAddress,
    pub requirements: ResourceRequirements,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub manifest: Value,
}

impl ResourceSpec {
    /// Translate an order into a provisioning request. Orders without a
    /// usable compute shape are rejected up front.
    pub fn from_order(order: &Order) -> Result<Self> {
        let req = &order.requirements;
        if req.cpu_millis == 0 || req.memory_mb == 0 {
            return Err(LessorError::Validation(format!(
                "order {} has no cpu/memory requirements",
                order.order_id
            )));
        }
        Ok(Self {
            order_id: order.order_id.clone(),
            tenant: order.owner.clone(),
            requirements: req.clone(),
            manifest: order.manifest.clone(),
        })
    }
}

/// Resource state as reported by the provisioning backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActualState {
    Active,
    Suspended,
    Terminated,
    /// The backend has no record of the resource.
    Missing,
    /// A transition is underway on the backend side.
    Pending,
    Unknown,
}

/// Resource state declared by the chain (lease state).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Active,
    Suspended,
    Terminated,
}

/// Actions the lifecycle controller can drive against the backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Provision,
    Suspend,
    Resume,
    Terminate,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Provision => "provision",
            LifecycleAction::Suspend => "suspend",
            LifecycleAction::Resume => "resume",
            LifecycleAction::Terminate => "terminate",
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
