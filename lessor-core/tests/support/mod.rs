#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use lessor_core::chain::{ChainEvent, ChainEventKind};
use lessor_core::checkpoint::EventPosition;
use lessor_core::types::{
    Order, OrderId, OrderState, ProviderAddress, ResourceRequirements, ResourceSpec,
};

pub fn order(id: &str, state: OrderState) -> Order {
    Order {
        order_id: OrderId::new(id),
        owner: ProviderAddress("lsr1tenant".into()),
        requirements: ResourceRequirements {
            cpu_millis: 1_000,
            memory_mb: 1_024,
            ..Default::default()
        },
        max_price: None,
        state,
        manifest: serde_json::json!({ "image": "nginx:1.27" }),
    }
}

pub fn spec(order_id: &str) -> ResourceSpec {
    ResourceSpec::from_order(&order(order_id, OrderState::Matched)).expect("valid order")
}

pub fn event(height: u64, seq: u64, kind: ChainEventKind) -> ChainEvent {
    ChainEvent {
        position: EventPosition::new(height, seq),
        tx_hash: format!("TX-{height}-{seq}"),
        kind,
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
