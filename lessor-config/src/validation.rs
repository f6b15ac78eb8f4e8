use thiserror::Error;
use url::Url;

use crate::models::{CallbackMode, DaemonConfig};

const MIN_WEBHOOK_SECRET_LENGTH: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("{field} is not a usable endpoint: {reason}")]
    InvalidEndpoint { field: &'static str, reason: String },
    #[error("{field} must be set")]
    MissingValue { field: &'static str },
    #[error("{field} {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("webhook secret {reason}")]
    WeakSecret { reason: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Parse an HTTP(S) endpoint setting.
pub fn endpoint(field: &'static str, raw: &str) -> Result<Url, ConfigGuardRailError> {
    let url = Url::parse(raw.trim()).map_err(|err| ConfigGuardRailError::InvalidEndpoint {
        field,
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigGuardRailError::InvalidEndpoint {
            field,
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

/// Hard errors stop the daemon before it touches the chain; warnings are
/// logged and startup continues.
pub fn apply_guard_rails(config: &DaemonConfig) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    endpoint("chain.rpc_url", &config.chain.rpc_url)?;
    endpoint("provisioning.url", &config.provisioning.url)?;
    if config.chain.chain_id.trim().is_empty() {
        return Err(ConfigGuardRailError::MissingValue {
            field: "chain.chain_id",
        });
    }
    if config.chain.key_path.as_os_str().is_empty() {
        return Err(ConfigGuardRailError::MissingValue {
            field: "chain.key_path",
        });
    }
    if config.profile_path.as_os_str().is_empty() {
        return Err(ConfigGuardRailError::MissingValue {
            field: "profile_path",
        });
    }

    let orchestrator = &config.orchestrator;
    if orchestrator.events.subscriber_id.trim().is_empty() {
        return Err(ConfigGuardRailError::MissingValue {
            field: "events.subscriber_id",
        });
    }
    if orchestrator.events.batch_size == 0 {
        return Err(ConfigGuardRailError::InvalidValue {
            field: "events.batch_size",
            reason: "must be at least 1".into(),
        });
    }
    if orchestrator.events.idle_timeout_ms == 0 {
        return Err(ConfigGuardRailError::InvalidValue {
            field: "events.idle_timeout_ms",
            reason: "must be at least 1".into(),
        });
    }
    if orchestrator.routing.workers == 0 {
        return Err(ConfigGuardRailError::InvalidValue {
            field: "routing.workers",
            reason: "must be at least 1".into(),
        });
    }
    if orchestrator.lifecycle.workers == 0 {
        return Err(ConfigGuardRailError::InvalidValue {
            field: "lifecycle.workers",
            reason: "must be at least 1".into(),
        });
    }
    for (field, base, max) in [
        (
            "routing.backoff_base_ms",
            orchestrator.routing.backoff_base_ms,
            orchestrator.routing.backoff_max_ms,
        ),
        (
            "lifecycle.backoff_base_ms",
            orchestrator.lifecycle.backoff_base_ms,
            orchestrator.lifecycle.backoff_max_ms,
        ),
    ] {
        if base > max {
            return Err(ConfigGuardRailError::InvalidValue {
                field,
                reason: format!("({base}) exceeds the backoff ceiling ({max})"),
            });
        }
    }
    if orchestrator.bidding.max_bids_per_hour < orchestrator.bidding.max_bids_per_minute {
        return Err(ConfigGuardRailError::InvalidValue {
            field: "bidding.max_bids_per_hour",
            reason: "is lower than bidding.max_bids_per_minute".into(),
        });
    }

    if config.webhook.enabled {
        match config.webhook.secret.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(ConfigGuardRailError::WeakSecret {
                    reason: "is required when the webhook is enabled".into(),
                });
            }
            Some(secret) if secret.len() < MIN_WEBHOOK_SECRET_LENGTH => {
                return Err(ConfigGuardRailError::WeakSecret {
                    reason: format!("must be at least {MIN_WEBHOOK_SECRET_LENGTH} characters"),
                });
            }
            Some(_) => {}
        }
        if !config.webhook.bind.ip().is_loopback() {
            warnings.push_with_hint(
                format!("webhook listens on {}", config.webhook.bind),
                "Terminate TLS in front of the daemon when the webhook is reachable off-host",
            );
        }
    } else {
        warnings.push(
            "webhook disabled; backend state changes are only picked up by drift reconciliation",
        );
    }

    if config.callback.mode == CallbackMode::File {
        if config.callback.path.as_os_str().is_empty() {
            return Err(ConfigGuardRailError::MissingValue {
                field: "callback.path",
            });
        }
        warnings.push_with_hint(
            "callback results are written to a local file and never reach the marketplace",
            "Set callback.mode = \"chain\" outside of test deployments",
        );
    }

    if orchestrator.lifecycle.queue_path.is_none() {
        warnings.push_with_hint(
            "lifecycle queue runs in memory; queued commands are lost on restart",
            "Set lifecycle.queue_path to a writable location",
        );
    }
    if orchestrator.bidding.max_bids_per_minute == 0 {
        warnings.push("bidding.max_bids_per_minute is 0; no bids will be placed");
    }
    if !orchestrator.reconcile.enabled {
        warnings.push("drift reconciliation disabled");
    } else if orchestrator.reconcile.grace_period_ms == 0 {
        warnings.push_with_hint(
            "reconcile.grace_period_ms is 0; drift is corrected on first sight",
            "Transitions still in flight on the backend may be reported as drift",
        );
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Option<String> {
        Some("0123456789abcdef0123456789abcdef".into())
    }

    #[test]
    fn defaults_pass_with_warnings() {
        let warnings = apply_guard_rails(&DaemonConfig::default()).expect("defaults are valid");
        assert!(
            warnings
                .items
                .iter()
                .any(|warning| warning.message.starts_with("webhook disabled"))
        );
    }

    #[test]
    fn enabled_webhook_requires_a_strong_secret() {
        let mut config = DaemonConfig::default();
        config.webhook.enabled = true;
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::WeakSecret { .. })
        ));

        config.webhook.secret = Some("short".into());
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::WeakSecret { .. })
        ));

        config.webhook.secret = secret();
        let warnings = apply_guard_rails(&config).expect("valid");
        assert!(warnings.items.iter().all(|w| !w.message.contains("webhook")));
    }

    #[test]
    fn endpoints_must_be_http() {
        let mut config = DaemonConfig::default();
        config.chain.rpc_url = "ftp://node:21".into();
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::InvalidEndpoint {
                field: "chain.rpc_url",
                ..
            })
        ));

        config.chain.rpc_url = "not a url".into();
        assert!(apply_guard_rails(&config).is_err());
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let mut config = DaemonConfig::default();
        config.orchestrator.lifecycle.backoff_base_ms = 10_000;
        config.orchestrator.lifecycle.backoff_max_ms = 1_000;
        let err = apply_guard_rails(&config).expect_err("inverted");
        assert!(err.to_string().starts_with("lifecycle.backoff_base_ms"));
    }

    #[test]
    fn in_memory_queue_is_allowed_but_flagged() {
        let mut config = DaemonConfig::default();
        config.orchestrator.lifecycle.queue_path = None;
        let warnings = apply_guard_rails(&config).expect("valid");
        assert!(
            warnings
                .items
                .iter()
                .any(|w| w.message.contains("in memory") && w.hint.is_some())
        );
    }
}
