//! Configuration for the Lessor provider daemon.
//!
//! The daemon reads one [`DaemonConfig`]: the orchestrator knobs from
//! `lessor-core` plus the endpoints, key material and surfaces that only the
//! binary cares about. [`ConfigLoader`] resolves where it comes from and runs
//! the guard rails in [`validation`] before anything is started.

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions, ConfigSource};
pub use models::{
    CallbackMode, CallbackSettings, ChainSettings, DaemonConfig, ProvisioningSettings,
    WebhookSettings,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
