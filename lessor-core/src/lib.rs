//! # Lessor Core
//!
//! Off-chain orchestration for a compute-marketplace provider: watches the
//! chain for orders, bids on the ones the provider can serve, provisions the
//! orders it wins, drives lease lifecycle changes through a durable queue,
//! and reconciles what the backend runs against what the chain says should
//! run.
//!
//! ## Architecture
//!
//! - [`checkpoint`]: durable cursor of the chain event feed
//! - [`events`]: subscription/polling intake, batching and checkpointing
//! - [`bidding`]: profile watcher, rate-limited bid scheduler, bid reporter
//! - [`routing`]: matched order to provisioned resource, with retries
//! - [`lifecycle`]: redb-backed command queue and its controller
//! - [`reconcile`]: desired vs. actual drift detection
//! - [`callback`]: outcome reporting back to the chain or a local file
//! - [`runtime`]: composition root owning every task
//!
//! Consumed interfaces ([`chain::ChainClient`], [`chain::KeyManager`],
//! [`provisioning::ProvisioningClient`]) are traits with HTTP
//! implementations alongside; [`testing`] carries in-process fakes.

pub mod alerts;
pub mod bidding;
pub mod callback;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod persist;
pub mod provisioning;
pub mod reconcile;
pub mod routing;
pub mod runtime;
pub mod testing;
pub mod types;
pub mod webhook;

mod transport;

pub use alerts::{AlertBus, OperatorAlert};
pub use config::OrchestratorConfig;
pub use error::{ErrorClass, LessorError, Result};
pub use runtime::{ProviderRuntime, ProviderRuntimeBuilder};
