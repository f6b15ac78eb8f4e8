use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::ProvisioningClient;
use crate::error::{LessorError, Result};
use crate::transport::ensure_success;
use crate::types::{ActualState, ResourceRef, ResourceSpec};

/// Generic REST adapter for backends exposing the `v1/resources` surface.
#[derive(Clone, Debug)]
pub struct HttpProvisioningClient {
    http: reqwest::Client,
    base: Url,
}

#[derive(Deserialize)]
struct ProvisionedView {
    resource_ref: ResourceRef,
}

#[derive(Deserialize)]
struct StateView {
    state: ActualState,
}

impl HttpProvisioningClient {
    pub fn new(mut base: Url, connect_timeout: Duration) -> Result<Self> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("lessor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, base })
    }

    fn resource_url(&self, resource: &ResourceRef, suffix: &str) -> Result<Url> {
        let path = if suffix.is_empty() {
            format!("v1/resources/{}", resource.as_str())
        } else {
            format!("v1/resources/{}/{suffix}", resource.as_str())
        };
        self.base.join(&path).map_err(|err| {
            LessorError::Validation(format!("bad provisioning endpoint {path}: {err}"))
        })
    }

    async fn transition(&self, resource: &ResourceRef, verb: &str) -> Result<()> {
        let url = self.resource_url(resource, verb)?;
        let response = self.http.post(url).send().await?;
        ensure_success(response).await?;
        debug!(target: "lessor::provisioning", resource = %resource, verb, "transition accepted");
        Ok(())
    }
}

#[async_trait]
impl ProvisioningClient for HttpProvisioningClient {
    async fn provision(&self, spec: &ResourceSpec) -> Result<ResourceRef> {
        let url = self.base.join("v1/resources").map_err(|err| {
            LessorError::Validation(format!("bad provisioning endpoint: {err}"))
        })?;
        let response = self
            .http
            .post(url)
            .header("idempotency-key", spec.order_id.as_str())
            .json(spec)
            .send()
            .await?;
        let view: ProvisionedView = ensure_success(response).await?.json().await?;
        Ok(view.resource_ref)
    }

    async fn suspend(&self, resource: &ResourceRef) -> Result<()> {
        self.transition(resource, "suspend").await
    }

    async fn resume(&self, resource: &ResourceRef) -> Result<()> {
        self.transition(resource, "resume").await
    }

    async fn terminate(&self, resource: &ResourceRef) -> Result<()> {
        match self.transition(resource, "terminate").await {
            Err(LessorError::NotFound(detail)) => {
                debug!(target: "lessor::provisioning", resource = %resource, detail, "resource already gone");
                Ok(())
            }
            outcome => outcome,
        }
    }

    async fn get_state(&self, resource: &ResourceRef) -> Result<ActualState> {
        let url = self.resource_url(resource, "")?;
        let response = self.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(ActualState::Missing);
        }
        let view: StateView = ensure_success(response).await?.json().await?;
        Ok(view.state)
    }
}
