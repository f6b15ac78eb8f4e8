use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::alerts::{AlertBus, OperatorAlert};
use crate::callback::{CallbackResult, CallbackSink};
use crate::types::{Bid, BidResult};

/// Drains the bid result stream into the callback sink.
pub struct BidReporter {
    sink: Arc<dyn CallbackSink>,
    alerts: AlertBus,
    attempts: u32,
    retry_delay: Duration,
}

impl fmt::Debug for BidReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BidReporter")
            .field("attempts", &self.attempts)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

impl BidReporter {
    pub fn new(
        sink: Arc<dyn CallbackSink>,
        alerts: AlertBus,
        attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            sink,
            alerts,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    pub async fn report(&self, bid: Bid) {
        match bid.result {
            BidResult::Accepted => {
                info!(target: "lessor::bidding", order_id = %bid.order_id, price = bid.price, "bid accepted")
            }
            BidResult::Rejected | BidResult::Error => warn!(
                target: "lessor::bidding",
                order_id = %bid.order_id,
                result = ?bid.result,
                detail = bid.detail.as_deref().unwrap_or_default(),
                "bid not accepted"
            ),
            BidResult::Pending => {}
        }

        let result = CallbackResult::BidOutcome { bid };
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.sink.submit(&result).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(target: "lessor::bidding", attempt, error = %err, "bid outcome submission failed");
                    last_error = Some(err.to_string());
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        self.alerts.publish(OperatorAlert::CallbackUndelivered {
            kind: result.label().to_string(),
            error: last_error.unwrap_or_default(),
        });
    }

    /// Runs until every scheduler handle is dropped and the channel drains,
    /// so no published result is lost on shutdown.
    pub async fn run(self, mut results: mpsc::Receiver<Bid>) {
        while let Some(bid) = results.recv().await {
            self.report(bid).await;
        }
    }
}
