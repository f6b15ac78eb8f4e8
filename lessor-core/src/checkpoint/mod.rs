//! Durable event-stream cursors.
//!
//! A checkpoint records the last position a subscriber fully processed. It is
//! written after each batch is acted on downstream and read once at startup,
//! so on restart the subscriber may see the last unflushed batch again and
//! every consumer has to treat processing as idempotent.

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LessorError, Result};
use crate::types::ids::SubscriberId;

/// Total order over stream positions: block height first, then the event's
/// sequence number within that block.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EventPosition {
    pub height: u64,
    pub seq: u64,
}

impl EventPosition {
    pub fn new(height: u64, seq: u64) -> Self {
        Self { height, seq }
    }
}

/// Persistent cursor, one per subscriber.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub subscriber_id: SubscriberId,
    pub last_height: u64,
    pub last_event_seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(subscriber_id: SubscriberId, position: EventPosition) -> Self {
        Self {
            subscriber_id,
            last_height: position.height,
            last_event_seq: position.seq,
            updated_at: Utc::now(),
        }
    }

    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.last_height, self.last_event_seq)
    }
}

/// Repository contract for checkpoint persistence.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the cursor for a subscriber, `None` when it never saved one.
    async fn load(&self, subscriber_id: &SubscriberId) -> Result<Option<Checkpoint>>;

    /// Persist a cursor. Saving a position lower than the stored one is a
    /// conflict; saving the same position again is accepted.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// Shared monotonicity guard used by every store implementation.
pub(crate) fn ensure_monotonic(current: Option<&Checkpoint>, next: &Checkpoint) -> Result<()> {
    match current {
        Some(current) if next.position() < current.position() => Err(LessorError::Conflict(
            format!(
                "checkpoint for {} would regress from {}:{} to {}:{}",
                next.subscriber_id,
                current.last_height,
                current.last_event_seq,
                next.last_height,
                next.last_event_seq
            ),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_order_by_height_then_seq() {
        assert!(EventPosition::new(10, 5) < EventPosition::new(11, 0));
        assert!(EventPosition::new(10, 1) < EventPosition::new(10, 2));
    }

    #[test]
    fn regression_is_a_conflict_but_replay_is_not() {
        let id = SubscriberId::new("s");
        let stored = Checkpoint::new(id.clone(), EventPosition::new(10, 3));
        let same = Checkpoint::new(id.clone(), EventPosition::new(10, 3));
        let lower = Checkpoint::new(id, EventPosition::new(9, 99));
        assert!(ensure_monotonic(Some(&stored), &same).is_ok());
        assert!(matches!(
            ensure_monotonic(Some(&stored), &lower),
            Err(LessorError::Conflict(_))
        ));
    }
}
