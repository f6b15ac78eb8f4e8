use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::models::DaemonConfig;
use crate::validation::{self, ConfigGuardRailError, ConfigWarnings};

pub const CONFIG_PATH_VAR: &str = "LESSOR_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "LESSOR_CONFIG_JSON";
pub const WEBHOOK_SECRET_VAR: &str = "LESSOR_WEBHOOK_SECRET";
pub const CHAIN_RPC_URL_VAR: &str = "LESSOR_CHAIN_RPC_URL";
pub const PROVISIONING_URL_VAR: &str = "LESSOR_PROVISIONING_URL";

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["lessor.toml", "config/lessor.toml", "lessor.json"];

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
    Default,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    /// Takes precedence over `$LESSOR_CONFIG_PATH`.
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Directory the default candidates are resolved against; the working
    /// directory when unset.
    pub search_dir: Option<PathBuf>,
}

/// Environment values the loader consults, gathered once so loading is a pure
/// function of its inputs.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,
    pub webhook_secret: Option<String>,
    pub chain_rpc_url: Option<String>,
    pub provisioning_url: Option<String>,
}

impl EnvOverrides {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty_var(CONFIG_PATH_VAR).map(PathBuf::from),
            config_json: non_empty_var(CONFIG_JSON_VAR),
            webhook_secret: non_empty_var(WEBHOOK_SECRET_VAR),
            chain_rpc_url: non_empty_var(CHAIN_RPC_URL_VAR),
            provisioning_url: non_empty_var(PROVISIONING_URL_VAR),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: DaemonConfig,
    pub source: ConfigSource,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("config file {} does not exist", path.display())]
    MissingConfig { path: PathBuf },
    #[error("failed to read config file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {origin}: {reason}")]
    Parse { origin: String, reason: String },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Reads `.env` (a missing file is fine), then resolves the config.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };
        debug!(target: "lessor::config", env_file_loaded, "environment prepared");
        self.load_with(EnvOverrides::gather())
    }

    /// Resolution order: explicit path, `$LESSOR_CONFIG_PATH`,
    /// `$LESSOR_CONFIG_JSON`, the first default candidate that exists, then
    /// built-in defaults. Single-value environment overrides apply last.
    pub fn load_with(&self, env: EnvOverrides) -> Result<ConfigLoad, ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        let (mut config, source) = if let Some(path) = &self.options.config_path {
            (
                load_required(path)?,
                ConfigSource::Explicit(path.clone()),
            )
        } else if let Some(path) = &env.config_path {
            (load_required(path)?, ConfigSource::EnvPath(path.clone()))
        } else if let Some(raw) = &env.config_json {
            let config = serde_json::from_str(raw).map_err(|err| ConfigLoadError::Parse {
                origin: CONFIG_JSON_VAR.to_string(),
                reason: err.to_string(),
            })?;
            (config, ConfigSource::EnvInline)
        } else if let Some(path) = self.find_default_file() {
            (load_required(&path)?, ConfigSource::File(path))
        } else {
            warnings.push_with_hint(
                "no lessor.toml found; running on built-in defaults",
                format!("Point {CONFIG_PATH_VAR} at a config file or create lessor.toml"),
            );
            (DaemonConfig::default(), ConfigSource::Default)
        };

        if let Some(secret) = env.webhook_secret {
            config.webhook.secret = Some(secret);
        } else if config.webhook.secret.is_some() {
            warnings.push_with_hint(
                "webhook secret read from the config file",
                format!("Move it to {WEBHOOK_SECRET_VAR}"),
            );
        }
        if let Some(url) = env.chain_rpc_url {
            config.chain.rpc_url = url;
        }
        if let Some(url) = env.provisioning_url {
            config.provisioning.url = url;
        }

        warnings.extend(validation::apply_guard_rails(&config)?);
        debug!(target: "lessor::config", ?source, "configuration loaded");
        Ok(ConfigLoad {
            config,
            source,
            warnings,
        })
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        let base = self.options.search_dir.clone().unwrap_or_default();
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| base.join(candidate))
            .find(|candidate| candidate.is_file())
    }
}

fn load_required(path: &Path) -> Result<DaemonConfig, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::MissingConfig {
            path: path.to_path_buf(),
        });
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&contents, path)
}

fn parse(contents: &str, path: &Path) -> Result<DaemonConfig, ConfigLoadError> {
    let origin = path.display().to_string();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(contents).map_err(|err| ConfigLoadError::Parse {
            origin,
            reason: err.to_string(),
        }),
        Some("toml") => toml::from_str(contents).map_err(|err| ConfigLoadError::Parse {
            origin,
            reason: err.to_string(),
        }),
        // Unknown extension: try TOML, then JSON.
        _ => toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| ConfigLoadError::Parse {
                origin,
                reason: format!("toml error: {toml_err}; json error: {json_err}"),
            })
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallbackMode;

    const SAMPLE: &str = r#"
profile_path = "etc/provider.toml"
log_filter = "debug,lessor=trace"

[chain]
rpc_url = "https://rpc.example.net"
chain_id = "market-7"
key_path = "/var/lib/lessor/key"

[callback]
mode = "file"
path = "/tmp/results.jsonl"

[events]
query = "tm.event='Tx'"
batch_size = 16

[lifecycle]
workers = 8
max_retries = 7
"#;

    fn loader_in(dir: &Path) -> ConfigLoader {
        ConfigLoader::with_options(ConfigLoaderOptions {
            search_dir: Some(dir.to_path_buf()),
            ..Default::default()
        })
    }

    #[test]
    fn partial_toml_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("lessor.toml"), SAMPLE).expect("write");

        let load = loader_in(dir.path())
            .load_with(EnvOverrides::default())
            .expect("load");
        assert_eq!(load.source, ConfigSource::File(dir.path().join("lessor.toml")));
        let config = load.config;
        assert_eq!(config.chain.chain_id, "market-7");
        assert_eq!(config.callback.mode, CallbackMode::File);
        assert_eq!(config.orchestrator.events.batch_size, 16);
        assert_eq!(config.orchestrator.lifecycle.workers, 8);
        assert_eq!(config.orchestrator.lifecycle.max_retries, 7);
        assert_eq!(config.orchestrator.routing.max_retries, 5);
        assert_eq!(config.orchestrator.events.subscriber_id, "lessor-provider");
        assert_eq!(config.provisioning.url, "http://127.0.0.1:8080");
    }

    #[test]
    fn env_path_wins_over_inline_json_and_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, SAMPLE).expect("write");
        std::fs::write(dir.path().join("lessor.toml"), "log_filter = \"warn\"").expect("write");

        let load = loader_in(dir.path())
            .load_with(EnvOverrides {
                config_path: Some(path.clone()),
                config_json: Some(r#"{"log_filter":"error"}"#.into()),
                ..Default::default()
            })
            .expect("load");
        assert_eq!(load.source, ConfigSource::EnvPath(path));
        assert_eq!(load.config.log_filter, "debug,lessor=trace");
    }

    #[test]
    fn inline_json_is_used_when_no_path_is_given() {
        let dir = tempfile::tempdir().expect("tempdir");
        let load = loader_in(dir.path())
            .load_with(EnvOverrides {
                config_json: Some(r#"{"chain":{"chain_id":"inline-1"},"reconcile":{"enabled":false}}"#.into()),
                ..Default::default()
            })
            .expect("load");
        assert_eq!(load.source, ConfigSource::EnvInline);
        assert_eq!(load.config.chain.chain_id, "inline-1");
        assert!(!load.config.orchestrator.reconcile.enabled);
    }

    #[test]
    fn missing_everything_falls_back_to_defaults_with_a_warning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let load = loader_in(dir.path())
            .load_with(EnvOverrides::default())
            .expect("load");
        assert_eq!(load.source, ConfigSource::Default);
        assert!(
            load.warnings
                .items
                .iter()
                .any(|w| w.message.starts_with("no lessor.toml"))
        );
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = loader_in(dir.path())
            .with_config_path(dir.path().join("absent.toml"))
            .load_with(EnvOverrides::default())
            .expect_err("missing");
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }

    #[test]
    fn env_secret_enables_the_webhook_guard_rail_to_pass() {
        let dir = tempfile::tempdir().expect("tempdir");
        let json = r#"{"webhook":{"enabled":true,"bind":"127.0.0.1:9000"}}"#;

        let err = loader_in(dir.path())
            .load_with(EnvOverrides {
                config_json: Some(json.into()),
                ..Default::default()
            })
            .expect_err("no secret");
        assert!(matches!(
            err,
            ConfigLoadError::GuardRail(ConfigGuardRailError::WeakSecret { .. })
        ));

        let load = loader_in(dir.path())
            .load_with(EnvOverrides {
                config_json: Some(json.into()),
                webhook_secret: Some("s".repeat(40)),
                chain_rpc_url: Some("http://node:26657".into()),
                ..Default::default()
            })
            .expect("load");
        assert!(load.config.webhook.enabled);
        assert_eq!(load.config.chain.rpc_url, "http://node:26657");
    }

    #[test]
    fn malformed_file_reports_its_origin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").expect("write");
        let err = loader_in(dir.path())
            .with_config_path(&path)
            .load_with(EnvOverrides::default())
            .expect_err("broken");
        assert!(err.to_string().contains("broken.json"));
    }
}
