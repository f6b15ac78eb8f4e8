use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so deployments can supply a partial payload and
/// adopt new settings progressively.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Event subscription, batching and checkpoint placement.
    pub events: EventSourceConfig,
    /// Bid admission, rate limits and broadcast retry policy.
    pub bidding: BidConfig,
    /// Order router worker pool and retry policy.
    pub routing: RouterConfig,
    /// Lifecycle queue storage, workers, retry and staleness policy.
    pub lifecycle: LifecycleConfig,
    /// Drift reconciliation cadence and grace period.
    pub reconcile: ReconcileConfig,
    /// Grace period granted to in-flight work after shutdown is requested (ms).
    pub shutdown_drain_ms: u64,
}

impl OrchestratorConfig {
    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(if self.shutdown_drain_ms == 0 {
            15_000
        } else {
            self.shutdown_drain_ms
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSourceConfig {
    /// Identity under which the checkpoint is stored.
    pub subscriber_id: String,
    /// Event filter forwarded to the chain subscription, e.g.
    /// `tm.event='Tx' AND market.provider EXISTS`.
    pub query: String,
    /// Directory holding one checkpoint file per subscriber.
    pub checkpoint_dir: PathBuf,
    /// Maximum events handed to the handler in one batch.
    pub batch_size: usize,
    /// How long a partial batch may wait for more events (ms).
    pub batch_linger_ms: u64,
    /// Subscription attempts before falling back to polling.
    pub connect_max_attempts: u32,
    /// Fixed delay between subscription attempts (ms).
    pub connect_backoff_ms: u64,
    /// Polling cadence while the stream is unavailable (ms).
    pub poll_interval_ms: u64,
    /// Page size used by the polling feed.
    pub poll_limit: usize,
    /// How often the polling feed retries the subscription (ms).
    pub resubscribe_interval_ms: u64,
    /// Deadline for every chain RPC issued by the source (ms).
    pub rpc_timeout_ms: u64,
    /// A live subscription silent for this long is treated as dead (ms).
    pub idle_timeout_ms: u64,
    /// Delay before a batch rejected with a transient error is retried (ms).
    pub handler_retry_ms: u64,
    /// Number of recently processed tx hashes kept for redelivery dedupe.
    pub dedupe_window: usize,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            subscriber_id: "lessor-provider".into(),
            query: "tm.event='Tx' AND message.module='market'".into(),
            checkpoint_dir: PathBuf::from("state/checkpoints"),
            batch_size: 64,
            batch_linger_ms: 250,
            connect_max_attempts: 5,
            connect_backoff_ms: 2_000,
            poll_interval_ms: 6_000,
            poll_limit: 200,
            resubscribe_interval_ms: 60_000,
            rpc_timeout_ms: 10_000,
            idle_timeout_ms: 120_000,
            handler_retry_ms: 1_000,
            dedupe_window: 4_096,
        }
    }
}

impl EventSourceConfig {
    pub fn batch_linger(&self) -> Duration {
        Duration::from_millis(self.batch_linger_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn resubscribe_interval(&self) -> Duration {
        Duration::from_millis(self.resubscribe_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn handler_retry(&self) -> Duration {
        Duration::from_millis(self.handler_retry_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BidConfig {
    /// Rolling one-minute admission cap.
    pub max_bids_per_minute: u32,
    /// Rolling one-hour admission cap.
    pub max_bids_per_hour: u32,
    /// Upper bound on concurrently signing/broadcasting bids.
    pub max_concurrent_bids: usize,
    /// Broadcast attempts after the first one fails with a transport error.
    pub broadcast_retries: u32,
    /// Fixed delay between broadcast retries (ms).
    pub retry_delay_ms: u64,
    /// Deadline for signing and for each broadcast (ms).
    pub call_timeout_ms: u64,
    /// Optional cadence for polling open orders in addition to events (ms).
    #[serde(default)]
    pub order_poll_interval_ms: Option<u64>,
    /// Cadence of the provider profile re-read (ms).
    pub profile_reload_interval_ms: u64,
    /// Capacity of the order intake and bid result channels.
    pub channel_capacity: usize,
}

impl Default for BidConfig {
    fn default() -> Self {
        Self {
            max_bids_per_minute: 30,
            max_bids_per_hour: 600,
            max_concurrent_bids: 4,
            broadcast_retries: 3,
            retry_delay_ms: 1_500,
            call_timeout_ms: 10_000,
            order_poll_interval_ms: None,
            profile_reload_interval_ms: 30_000,
            channel_capacity: 256,
        }
    }
}

impl BidConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn order_poll_interval(&self) -> Option<Duration> {
        self.order_poll_interval_ms.map(Duration::from_millis)
    }

    pub fn profile_reload_interval(&self) -> Duration {
        Duration::from_millis(self.profile_reload_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Provisioning worker pool size.
    pub workers: usize,
    /// Provisioning attempts per order before the record is marked failed.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Deadline for each provisioning call (ms).
    pub provision_timeout_ms: u64,
    /// JSON file holding every routing record.
    pub state_path: PathBuf,
    /// Capacity of the internal work queue.
    pub queue_capacity: usize,
    /// Submission attempts for a routing failure report.
    pub callback_retries: u32,
    pub callback_retry_delay_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            provision_timeout_ms: 60_000,
            state_path: PathBuf::from("state/routing.json"),
            queue_capacity: 1_024,
            callback_retries: 3,
            callback_retry_delay_ms: 2_000,
        }
    }
}

impl RouterConfig {
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }

    pub fn callback_retry_delay(&self) -> Duration {
        Duration::from_millis(self.callback_retry_delay_ms)
    }

    /// Exponential backoff for the given (1-based) attempt, capped at the max.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(31);
        let scaled = (self.backoff_base_ms as f64) * 2f64.powi(exp as i32);
        Duration::from_millis(scaled.min(self.backoff_max_ms as f64).max(0.0) as u64)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// redb file backing the command queue. `None` selects the in-memory
    /// backend, which does not survive restarts.
    pub queue_path: Option<PathBuf>,
    pub workers: usize,
    /// Idle poll cadence for queue workers (ms).
    pub poll_interval_ms: u64,
    /// Execution attempts per command before it is marked failed.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Queued commands waiting longer than this are marked stale (ms).
    pub stale_after_ms: u64,
    pub stale_sweep_interval_ms: u64,
    /// Requeue commands left `executing` by a crash before workers start.
    pub recover_on_startup: bool,
    /// Deadline for each provisioning call (ms).
    pub call_timeout_ms: u64,
    /// Callback sink submission attempts per outcome.
    pub callback_retries: u32,
    pub callback_retry_delay_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            queue_path: Some(PathBuf::from("state/lifecycle.redb")),
            workers: 4,
            poll_interval_ms: 500,
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            stale_after_ms: 15 * 60 * 1_000,
            stale_sweep_interval_ms: 30_000,
            recover_on_startup: true,
            call_timeout_ms: 30_000,
            callback_retries: 3,
            callback_retry_delay_ms: 2_000,
        }
    }
}

impl LifecycleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.stale_sweep_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn callback_retry_delay(&self) -> Duration {
        Duration::from_millis(self.callback_retry_delay_ms)
    }

    /// Next backoff step: the base on the first failure, doubling afterwards
    /// and capped at the configured maximum.
    pub fn next_backoff_ms(&self, previous_ms: u64) -> u64 {
        if previous_ms == 0 {
            self.backoff_base_ms.min(self.backoff_max_ms)
        } else {
            previous_ms.saturating_mul(2).min(self.backoff_max_ms)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Disagreement must persist this long before a delta is emitted (ms).
    pub grace_period_ms: u64,
    /// Run one pass right after startup.
    pub run_on_startup: bool,
    /// Deadline for each `get_state` call (ms).
    pub call_timeout_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            grace_period_ms: 120_000,
            run_on_startup: true,
            call_timeout_ms: 10_000,
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_backoff_doubles_and_caps() {
        let cfg = RouterConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 350,
            ..Default::default()
        };
        assert_eq!(cfg.backoff_for(0), Duration::ZERO);
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff_for(3), Duration::from_millis(350));
        assert_eq!(cfg.backoff_for(40), Duration::from_millis(350));
    }

    #[test]
    fn lifecycle_backoff_steps_from_base() {
        let cfg = LifecycleConfig {
            backoff_base_ms: 500,
            backoff_max_ms: 1_500,
            ..Default::default()
        };
        assert_eq!(cfg.next_backoff_ms(0), 500);
        assert_eq!(cfg.next_backoff_ms(500), 1_000);
        assert_eq!(cfg.next_backoff_ms(1_000), 1_500);
    }

    #[test]
    fn partial_payload_falls_back_to_defaults() {
        let cfg: OrchestratorConfig =
            serde_json::from_str(r#"{"routing":{"workers":9}}"#).expect("parse");
        assert_eq!(cfg.routing.workers, 9);
        assert_eq!(cfg.routing.max_retries, RouterConfig::default().max_retries);
        assert_eq!(cfg.bidding.max_bids_per_minute, 30);
    }
}
