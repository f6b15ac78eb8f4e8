//! Lifecycle state machine and its durable command queue.
//!
//! Commands move `queued → executing → succeeded | failed`, fall back from
//! `executing` to `queued` on a transient failure, and go `stale` when they
//! wait in the queue too long. Only the [`LifecycleController`] changes a
//! command's state; producers (chain requests, backend callbacks, the drift
//! reconciler) only enqueue.

mod controller;
mod redb_queue;

pub use controller::LifecycleController;
pub use redb_queue::RedbCommandQueue;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LessorError, Result};
use crate::types::{CommandId, LifecycleAction, OrderId, ResourceRef, ResourceSpec};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Queued,
    Executing,
    Succeeded,
    Failed,
    Stale,
}

impl CommandState {
    pub const ALL: [CommandState; 5] = [
        CommandState::Queued,
        CommandState::Executing,
        CommandState::Succeeded,
        CommandState::Failed,
        CommandState::Stale,
    ];

    /// Stable discriminant used as the first component of the state index key.
    pub fn as_u8(&self) -> u8 {
        match self {
            CommandState::Queued => 0,
            CommandState::Executing => 1,
            CommandState::Succeeded => 2,
            CommandState::Failed => 3,
            CommandState::Stale => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Queued => "queued",
            CommandState::Executing => "executing",
            CommandState::Succeeded => "succeeded",
            CommandState::Failed => "failed",
            CommandState::Stale => "stale",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Succeeded | CommandState::Failed)
    }

    /// Work that is still owed for the resource.
    pub fn is_pending(&self) -> bool {
        matches!(self, CommandState::Queued | CommandState::Executing)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandState {
    type Err = LessorError;

    fn from_str(raw: &str) -> Result<Self> {
        CommandState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| LessorError::Validation(format!("unknown command state `{raw}`")))
    }
}

/// Where a command came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CommandOrigin {
    /// Signed lifecycle request recorded on chain.
    Chain { tx_hash: String },
    /// Notification pushed by the provisioning backend.
    Callback { event: BackendEvent },
    Reconciler { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LifecycleCommand {
    pub command_id: CommandId,
    pub resource_ref: ResourceRef,
    pub action: LifecycleAction,
    pub state: CommandState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub backoff_until: Option<DateTime<Utc>>,
    /// Current backoff step; the next failure doubles it.
    #[serde(default)]
    pub backoff_ms: u64,
    pub request_nonce: String,
    pub origin: CommandOrigin,
    #[serde(default)]
    pub order_id: Option<OrderId>,
    /// Required for `provision`.
    #[serde(default)]
    pub spec: Option<ResourceSpec>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl LifecycleCommand {
    pub fn from_request(request: EnqueueRequest, now: DateTime<Utc>) -> Self {
        Self {
            command_id: CommandId::new(),
            resource_ref: request.resource_ref,
            action: request.action,
            state: CommandState::Queued,
            attempts: 0,
            created_at: now,
            last_attempt_at: None,
            backoff_until: None,
            backoff_ms: 0,
            request_nonce: request.request_nonce,
            origin: request.origin,
            order_id: request.order_id,
            spec: request.spec,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn idempotency_key(&self) -> String {
        idempotency_key(&self.resource_ref, self.action, &self.request_nonce)
    }

    /// Whether a worker may pick this command up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == CommandState::Queued && self.backoff_until.is_none_or(|until| until <= now)
    }
}

/// Dedupe key for a request. The resource ref is length-prefixed and the
/// action spelling never contains `|`, so distinct triples never share a key
/// whatever characters the ref or nonce carry.
pub fn idempotency_key(resource: &ResourceRef, action: LifecycleAction, nonce: &str) -> String {
    let resource = resource.as_str();
    format!("{}:{}|{}|{}", resource.len(), resource, action.as_str(), nonce)
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnqueueRequest {
    pub resource_ref: ResourceRef,
    pub action: LifecycleAction,
    pub request_nonce: String,
    pub origin: CommandOrigin,
    pub order_id: Option<OrderId>,
    pub spec: Option<ResourceSpec>,
}

/// Enqueue receipt. A duplicate request is merged into the command that
/// already carries its idempotency key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandHandle {
    pub command_id: CommandId,
    pub accepted: bool,
    pub merged_into: Option<CommandId>,
}

impl CommandHandle {
    pub fn accepted(command_id: CommandId) -> Self {
        Self {
            command_id,
            accepted: true,
            merged_into: None,
        }
    }

    pub fn merged(existing: CommandId) -> Self {
        Self {
            command_id: existing,
            accepted: false,
            merged_into: Some(existing),
        }
    }
}

/// What the provisioning backend reported about a resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendEvent {
    Terminated,
    Suspended,
    Resumed,
    /// The backend lost the resource and it must be provisioned again.
    Lost,
}

impl BackendEvent {
    pub fn action(&self) -> LifecycleAction {
        match self {
            BackendEvent::Terminated => LifecycleAction::Terminate,
            BackendEvent::Suspended => LifecycleAction::Suspend,
            BackendEvent::Resumed => LifecycleAction::Resume,
            BackendEvent::Lost => LifecycleAction::Provision,
        }
    }
}

/// Inbound backend notification, as received by the webhook.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendCallback {
    pub resource_ref: ResourceRef,
    pub event: BackendEvent,
    /// Backend-chosen delivery id; part of the idempotency key.
    pub nonce: String,
}

/// Durable command storage. Every operation is atomic on its own.
#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Insert a queued command, or merge into the existing one with the same
    /// `(resource, action, nonce)`.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<CommandHandle>;

    /// Claim the oldest due command whose resource has nothing executing,
    /// moving it to `executing` and counting the attempt.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<LifecycleCommand>>;

    async fn complete(&self, command_id: CommandId) -> Result<LifecycleCommand>;

    /// Return an executing command to `queued` until `backoff_until`.
    async fn retry(
        &self,
        command_id: CommandId,
        error: String,
        backoff_ms: u64,
        backoff_until: DateTime<Utc>,
    ) -> Result<LifecycleCommand>;

    async fn fail(&self, command_id: CommandId, error: String) -> Result<LifecycleCommand>;

    /// Mark queued commands untouched since `cutoff` as stale.
    async fn mark_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<LifecycleCommand>>;

    /// Return every `executing` command to `queued`. Run before workers start.
    async fn recover_interrupted(&self) -> Result<Vec<CommandId>>;

    /// Operator action: put a stale or failed command back in the queue with
    /// a fresh retry budget.
    async fn requeue(&self, command_id: CommandId) -> Result<LifecycleCommand>;

    async fn get(&self, command_id: CommandId) -> Result<Option<LifecycleCommand>>;

    /// Commands in `state` (all commands when `None`), oldest first.
    async fn list_by_state(&self, state: Option<CommandState>) -> Result<Vec<LifecycleCommand>>;

    /// A queued or executing command for `resource`, if any.
    async fn pending_for(&self, resource: &ResourceRef) -> Result<Option<LifecycleCommand>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_events_map_to_actions() {
        assert_eq!(BackendEvent::Lost.action(), LifecycleAction::Provision);
        assert_eq!(BackendEvent::Suspended.action(), LifecycleAction::Suspend);
    }

    #[test]
    fn idempotency_keys_do_not_collide_on_separators() {
        let split_in_ref = idempotency_key(
            &ResourceRef::new("res|suspend"),
            LifecycleAction::Suspend,
            "n",
        );
        let split_in_nonce = idempotency_key(
            &ResourceRef::new("res"),
            LifecycleAction::Suspend,
            "suspend|n",
        );
        assert_ne!(split_in_ref, split_in_nonce);
        assert_eq!(
            idempotency_key(&ResourceRef::new("res"), LifecycleAction::Suspend, "n"),
            idempotency_key(&ResourceRef::new("res"), LifecycleAction::Suspend, "n")
        );
    }

    #[test]
    fn states_parse_from_cli_spelling() {
        assert_eq!("Stale".parse::<CommandState>().expect("parse"), CommandState::Stale);
        assert!("paused".parse::<CommandState>().is_err());
    }
}
