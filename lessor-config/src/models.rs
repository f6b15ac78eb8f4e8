use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use lessor_core::OrchestratorConfig;
use serde::{Deserialize, Serialize};

/// Everything the daemon needs to assemble a provider runtime.
///
/// The orchestrator sections (`[events]`, `[bidding]`, `[routing]`,
/// `[lifecycle]`, `[reconcile]`) sit at the top level of the file next to the
/// daemon-only sections.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
    pub chain: ChainSettings,
    pub provisioning: ProvisioningSettings,
    pub webhook: WebhookSettings,
    pub callback: CallbackSettings,
    /// Provider capacity, pricing and attributes; re-read while running.
    pub profile_path: PathBuf,
    /// Used when `RUST_LOG` is not set.
    pub log_filter: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    pub rpc_url: String,
    pub chain_id: String,
    /// File holding the hex-encoded 32 byte signing seed.
    pub key_path: PathBuf,
    pub connect_timeout_ms: u64,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:26657".into(),
            chain_id: "lessor-1".into(),
            key_path: PathBuf::from("keys/provider.key"),
            connect_timeout_ms: 5_000,
        }
    }
}

impl ChainSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    pub url: String,
    pub connect_timeout_ms: u64,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".into(),
            connect_timeout_ms: 5_000,
        }
    }
}

impl ProvisioningSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Inbound callback endpoint for backend-initiated state changes.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub enabled: bool,
    pub bind: SocketAddr,
    /// HMAC key shared with the provisioning backend. Prefer
    /// `LESSOR_WEBHOOK_SECRET` over writing it into the file.
    pub secret: Option<String>,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([127, 0, 0, 1], 8787)),
            secret: None,
        }
    }
}

impl fmt::Debug for WebhookSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSettings")
            .field("enabled", &self.enabled)
            .field("bind", &self.bind)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackMode {
    /// Results are written back to the marketplace as transactions.
    #[default]
    Chain,
    /// Results are appended to a local JSON lines file.
    File,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackSettings {
    pub mode: CallbackMode,
    /// Only read in `file` mode.
    pub path: PathBuf,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            mode: CallbackMode::Chain,
            path: PathBuf::from("state/callbacks.jsonl"),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            chain: ChainSettings::default(),
            provisioning: ProvisioningSettings::default(),
            webhook: WebhookSettings::default(),
            callback: CallbackSettings::default(),
            profile_path: PathBuf::from("provider.toml"),
            log_filter: "info".into(),
        }
    }
}
