use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{LessorError, Result};
use crate::types::{Order, ResourceRequirements};

/// Largest order shape this provider accepts.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capacity {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub storage_gb: u64,
    pub gpus: u32,
}

/// Per-unit prices. The bid price is the sum over the order's requirements,
/// never below `min_price`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub cpu_price: u64,
    pub memory_price: u64,
    pub storage_price: u64,
    pub gpu_price: u64,
    pub min_price: u64,
}

impl Pricing {
    pub fn quote(&self, req: &ResourceRequirements) -> u64 {
        req.cpu_millis
            .saturating_mul(self.cpu_price)
            .saturating_add(req.memory_mb.saturating_mul(self.memory_price))
            .saturating_add(req.storage_gb.saturating_mul(self.storage_price))
            .saturating_add(u64::from(req.gpus).saturating_mul(self.gpu_price))
            .max(self.min_price)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderProfile {
    pub capacity: Capacity,
    pub pricing: Pricing,
    /// Advertised placement attributes, matched against order attributes.
    pub attributes: BTreeMap<String, String>,
}

impl ProviderProfile {
    /// Price this provider would bid on `order`, or a validation error when
    /// the order does not fit.
    pub fn quote(&self, order: &Order) -> Result<u64> {
        let req = &order.requirements;
        let cap = &self.capacity;
        let over = [
            ("cpu_millis", req.cpu_millis > cap.cpu_millis),
            ("memory_mb", req.memory_mb > cap.memory_mb),
            ("storage_gb", req.storage_gb > cap.storage_gb),
            ("gpus", req.gpus > cap.gpus),
        ];
        if let Some((field, _)) = over.iter().find(|(_, exceeded)| *exceeded) {
            return Err(LessorError::Validation(format!(
                "order {} exceeds capacity on {field}",
                order.order_id
            )));
        }

        for (key, wanted) in &req.attributes {
            if self.attributes.get(key) != Some(wanted) {
                return Err(LessorError::Validation(format!(
                    "order {} requires {key}={wanted}",
                    order.order_id
                )));
            }
        }

        let price = self.pricing.quote(req);
        if let Some(max) = order.max_price
            && price > max
        {
            return Err(LessorError::Validation(format!(
                "order {} caps price at {max}, quote is {price}",
                order.order_id
            )));
        }
        Ok(price)
    }
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn load(&self) -> Result<ProviderProfile>;
}

/// Profile read from a TOML or JSON file, chosen by extension.
#[derive(Clone, Debug)]
pub struct FileProfileSource {
    path: PathBuf,
}

impl FileProfileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProfileSource for FileProfileSource {
    async fn load(&self) -> Result<ProviderProfile> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let is_json = self
            .path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&raw)?)
        } else {
            toml::from_str(&raw).map_err(|err| {
                LessorError::Validation(format!("profile {}: {err}", self.path.display()))
            })
        }
    }
}

/// Periodically re-reads the profile and publishes it only when it changed.
pub struct ProfileWatcher {
    source: Arc<dyn ProfileSource>,
    interval: Duration,
    tx: watch::Sender<ProviderProfile>,
}

impl fmt::Debug for ProfileWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileWatcher")
            .field("interval", &self.interval)
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

impl ProfileWatcher {
    /// Loads the initial profile; a provider without one cannot bid at all.
    pub async fn start(source: Arc<dyn ProfileSource>, interval: Duration) -> Result<Self> {
        let initial = source.load().await?;
        let (tx, _) = watch::channel(initial);
        Ok(Self {
            source,
            interval,
            tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ProviderProfile> {
        self.tx.subscribe()
    }

    /// Re-read once. Returns whether a changed profile was published.
    pub async fn reload(&self) -> Result<bool> {
        let next = self.source.load().await?;
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(target: "lessor::bidding", "provider profile updated");
        }
        Ok(changed)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.reload().await {
                        // Keep bidding on the last good profile.
                        warn!(target: "lessor::bidding", error = %err, "profile reload failed");
                    }
                }
            }
        }
    }
}
