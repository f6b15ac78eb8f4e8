//! Operator alert channel.
//!
//! Exhausted and fatal failures leave their component through here, always
//! carrying the identifier an operator needs to remediate by hand.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::types::{CommandId, LifecycleAction, OrderId, ResourceRef};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum OperatorAlert {
    /// Provisioning retries for a matched order were used up.
    RoutingFailure {
        order_id: OrderId,
        attempts: u32,
        error: String,
    },
    /// The backend rejected the order outright; it will not be retried.
    RoutingDeadLettered { order_id: OrderId, error: String },
    CommandFailed {
        command_id: CommandId,
        resource_ref: ResourceRef,
        action: LifecycleAction,
        attempts: u32,
        error: String,
    },
    CommandStale {
        command_id: CommandId,
        resource_ref: ResourceRef,
        action: LifecycleAction,
    },
    /// An outcome could not be delivered through the callback sink.
    CallbackUndelivered { kind: String, error: String },
    /// A component stopped because of a fatal error.
    ComponentHalted { component: String, error: String },
}

impl OperatorAlert {
    pub fn is_fatal(&self) -> bool {
        matches!(self, OperatorAlert::ComponentHalted { .. })
    }
}

/// In-process fan-out of operator alerts. Every alert is also logged, so a
/// deployment without subscribers still surfaces it.
#[derive(Clone)]
pub struct AlertBus {
    sender: broadcast::Sender<OperatorAlert>,
    capacity: usize,
}

impl fmt::Debug for AlertBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl AlertBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperatorAlert> {
        self.sender.subscribe()
    }

    pub fn publish(&self, alert: OperatorAlert) {
        if alert.is_fatal() {
            error!(target: "lessor::alerts", ?alert, "operator alert");
        } else {
            warn!(target: "lessor::alerts", ?alert, "operator alert");
        }
        let _ = self.sender.send(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_alerts() {
        let bus = AlertBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(OperatorAlert::RoutingDeadLettered {
            order_id: OrderId::new("o-9"),
            error: "no cpu".into(),
        });
        let alert = rx.recv().await.expect("alert");
        assert!(matches!(alert, OperatorAlert::RoutingDeadLettered { .. }));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        AlertBus::default().publish(OperatorAlert::ComponentHalted {
            component: "events".into(),
            error: "corrupt checkpoint".into(),
        });
    }
}
