//! Chain event intake.
//!
//! [`ChainEventSource`] turns the chain's subscription (or, when that cannot
//! be established, its indexed search endpoint) into ordered batches for an
//! [`EventHandler`], checkpointing after every batch the handler accepts.

mod dedupe;
mod source;

pub use dedupe::DedupeWindow;
pub use source::ChainEventSource;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::chain::ChainEvent;
use crate::error::Result;

/// Connection state of the event source.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Disconnected,
    Connecting,
    Subscribed,
    /// The stream could not be established; events come from polling.
    Polling,
    /// Stopped on a fatal error.
    Halted,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceState::Disconnected => "disconnected",
            SourceState::Connecting => "connecting",
            SourceState::Subscribed => "subscribed",
            SourceState::Polling => "polling",
            SourceState::Halted => "halted",
        };
        f.write_str(label)
    }
}

/// Downstream consumer of event batches.
///
/// Returning a transient error leaves the checkpoint where it was and the
/// same batch is delivered again; a fatal error stops the source. Validation
/// and conflict errors are logged and the batch counts as consumed. An
/// exhausted or cancelled error never consumes the batch: it is left for the
/// next start, and outside of shutdown the source halts.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_batch(&self, events: &[ChainEvent]) -> Result<()>;
}
