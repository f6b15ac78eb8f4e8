//! Capability contract for the infrastructure backend.
//!
//! The orchestrator drives every backend (containers, VMs, bare metal)
//! through [`ProvisioningClient`] alone and never branches on which one it
//! talks to. Backends are expected to treat `provision` as idempotent on the
//! spec's order id.

mod http;

pub use http::HttpProvisioningClient;

use async_trait::async_trait;

use crate::error::{LessorError, Result};
use crate::types::{ActualState, LifecycleAction, ResourceRef, ResourceSpec};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn provision(&self, spec: &ResourceSpec) -> Result<ResourceRef>;

    async fn suspend(&self, resource: &ResourceRef) -> Result<()>;

    async fn resume(&self, resource: &ResourceRef) -> Result<()>;

    async fn terminate(&self, resource: &ResourceRef) -> Result<()>;

    /// Read-only state probe. `ActualState::Missing` when the backend has no
    /// record of the resource.
    async fn get_state(&self, resource: &ResourceRef) -> Result<ActualState>;
}

/// Drive one lifecycle action against `client`. Only `Provision` yields a
/// resource ref, and it requires the spec the resource was created from.
pub async fn apply_action(
    client: &dyn ProvisioningClient,
    resource: &ResourceRef,
    action: LifecycleAction,
    spec: Option<&ResourceSpec>,
) -> Result<Option<ResourceRef>> {
    match action {
        LifecycleAction::Provision => match spec {
            Some(spec) => client.provision(spec).await.map(Some),
            None => Err(LessorError::Validation(format!(
                "provision for {resource} has no resource spec"
            ))),
        },
        LifecycleAction::Suspend => client.suspend(resource).await.map(|_| None),
        LifecycleAction::Resume => client.resume(resource).await.map(|_| None),
        LifecycleAction::Terminate => client.terminate(resource).await.map(|_| None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn actions_dispatch_to_matching_backend_call() {
        let mut client = MockProvisioningClient::new();
        client.expect_suspend().times(1).returning(|_| Ok(()));
        client.expect_provision().never();

        let resource = ResourceRef::new("res-1");
        let out = apply_action(&client, &resource, LifecycleAction::Suspend, None)
            .await
            .expect("suspend");
        assert!(out.is_none());

        let err = apply_action(&client, &resource, LifecycleAction::Provision, None)
            .await
            .expect_err("no spec");
        assert!(matches!(err, LessorError::Validation(_)));
    }
}
