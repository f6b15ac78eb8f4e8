//! Drift reconciliation between the chain's desired state and what the
//! provisioning backend reports.
//!
//! The reconciler only reads from the backend. Corrections go through the
//! lifecycle controller like any other command.

mod reconciler;

pub use reconciler::{DriftReconciler, PassReport};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chain::ChainClient;
use crate::error::{LessorError, Result};
use crate::routing::ResourceDirectory;
use crate::types::{ActualState, DesiredState, LifecycleAction, OrderId, ProviderAddress, ResourceRef};

/// A resource together with the state the chain says it should be in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredResource {
    pub order_id: OrderId,
    pub resource_ref: ResourceRef,
    pub desired: DesiredState,
}

/// Persistent disagreement between desired and actual state, with the action
/// that resolves it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationDelta {
    pub order_id: OrderId,
    pub resource_ref: ResourceRef,
    pub desired: DesiredState,
    pub actual: ActualState,
    pub action: LifecycleAction,
    pub reason: String,
}

#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn desired_states(&self) -> Result<Vec<DesiredResource>>;
}

/// Action that moves `actual` towards `desired`, if any.
///
/// `pending` and `unknown` never produce an action: the backend is either
/// mid-transition or cannot tell, and the next pass will look again.
pub fn plan(desired: DesiredState, actual: ActualState) -> Option<LifecycleAction> {
    use ActualState as A;
    use DesiredState as D;

    match (desired, actual) {
        (_, A::Pending | A::Unknown) => None,
        (D::Active, A::Suspended) => Some(LifecycleAction::Resume),
        (D::Active, A::Terminated | A::Missing) => Some(LifecycleAction::Provision),
        (D::Suspended, A::Active) => Some(LifecycleAction::Suspend),
        (D::Terminated, A::Active | A::Suspended) => Some(LifecycleAction::Terminate),
        _ => None,
    }
}

/// Desired states taken from this provider's leases on chain, mapped to
/// resources through the routing directory. Leases for orders that were
/// never routed here are ignored.
pub struct ChainDesiredStates {
    chain: Arc<dyn ChainClient>,
    directory: Arc<dyn ResourceDirectory>,
    provider: ProviderAddress,
    timeout: Duration,
}

impl fmt::Debug for ChainDesiredStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainDesiredStates")
            .field("provider", &self.provider)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ChainDesiredStates {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        directory: Arc<dyn ResourceDirectory>,
        provider: ProviderAddress,
        timeout: Duration,
    ) -> Self {
        Self {
            chain,
            directory,
            provider,
            timeout,
        }
    }
}

#[async_trait]
impl DesiredStateSource for ChainDesiredStates {
    async fn desired_states(&self) -> Result<Vec<DesiredResource>> {
        let leases = tokio::time::timeout(self.timeout, self.chain.lease_states(&self.provider))
            .await
            .map_err(|_| LessorError::timed_out("lease query"))??;

        let mut out = Vec::with_capacity(leases.len());
        for lease in leases {
            if let Some(resource_ref) = self.directory.resolve_order(&lease.order_id).await? {
                out.push(DesiredResource {
                    order_id: lease.order_id,
                    resource_ref,
                    desired: lease.state,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_follows_the_drift_table() {
        use ActualState as A;
        use DesiredState as D;

        let cases = [
            (D::Active, A::Active, None),
            (D::Active, A::Suspended, Some(LifecycleAction::Resume)),
            (D::Active, A::Terminated, Some(LifecycleAction::Provision)),
            (D::Active, A::Missing, Some(LifecycleAction::Provision)),
            (D::Active, A::Pending, None),
            (D::Suspended, A::Active, Some(LifecycleAction::Suspend)),
            (D::Suspended, A::Suspended, None),
            (D::Suspended, A::Missing, None),
            (D::Terminated, A::Active, Some(LifecycleAction::Terminate)),
            (D::Terminated, A::Suspended, Some(LifecycleAction::Terminate)),
            (D::Terminated, A::Missing, None),
            (D::Terminated, A::Unknown, None),
        ];
        for (desired, actual, expected) in cases {
            assert_eq!(plan(desired, actual), expected, "{desired:?} / {actual:?}");
        }
    }
}
