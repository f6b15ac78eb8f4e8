use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::backends::InMemoryBackend;
use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, Table, TableDefinition,
    WriteTransaction,
};
use tracing::{debug, info};

use super::{
    CommandHandle, CommandQueue, CommandState, EnqueueRequest, LifecycleCommand, idempotency_key,
};
use crate::error::{LessorError, Result, storage};
use crate::types::{CommandId, ResourceRef};

/// Command records, JSON encoded, keyed by `CommandId::as_u128`.
const COMMANDS: TableDefinition<u128, &[u8]> = TableDefinition::new("lifecycle_commands");
/// `(state, command id)` index; ids are UUIDv7 so each state range is oldest first.
const BY_STATE: TableDefinition<(u8, u128), ()> = TableDefinition::new("lifecycle_by_state");
/// `resource|action|nonce` to the command that owns it.
const IDEMPOTENCY: TableDefinition<&str, u128> = TableDefinition::new("lifecycle_idempotency");
/// Resource to the command currently executing against it.
const EXECUTING: TableDefinition<&str, u128> = TableDefinition::new("lifecycle_executing");

/// Durable lifecycle queue on an embedded redb database.
///
/// Every operation runs as one write transaction on the blocking pool, so a
/// state change and its index updates land together or not at all. redb
/// admits a single writer at a time, which is what makes `claim_next`'s
/// per-resource exclusion race free.
#[derive(Clone)]
pub struct RedbCommandQueue {
    db: Arc<Database>,
    location: Option<PathBuf>,
}

impl fmt::Debug for RedbCommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbCommandQueue")
            .field("location", &self.location)
            .finish()
    }
}

struct WriteTables<'txn> {
    commands: Table<'txn, u128, &'static [u8]>,
    by_state: Table<'txn, (u8, u128), ()>,
    idempotency: Table<'txn, &'static str, u128>,
    executing: Table<'txn, &'static str, u128>,
}

impl<'txn> WriteTables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> Result<Self> {
        Ok(Self {
            commands: txn.open_table(COMMANDS).map_err(storage)?,
            by_state: txn.open_table(BY_STATE).map_err(storage)?,
            idempotency: txn.open_table(IDEMPOTENCY).map_err(storage)?,
            executing: txn.open_table(EXECUTING).map_err(storage)?,
        })
    }

    fn require(&self, command_id: CommandId) -> Result<LifecycleCommand> {
        load(&self.commands, command_id.as_u128())?
            .ok_or_else(|| LessorError::NotFound(format!("command {command_id}")))
    }

    fn store(&mut self, command: &LifecycleCommand, previous: Option<CommandState>) -> Result<()> {
        let id = command.command_id.as_u128();
        if let Some(previous) = previous
            && previous != command.state
        {
            self.by_state
                .remove((previous.as_u8(), id))
                .map_err(storage)?;
        }
        self.by_state
            .insert((command.state.as_u8(), id), ())
            .map_err(storage)?;
        let encoded = serde_json::to_vec(command)?;
        self.commands
            .insert(id, encoded.as_slice())
            .map_err(storage)?;
        Ok(())
    }

    fn is_locked(&self, resource: &ResourceRef) -> Result<bool> {
        Ok(self
            .executing
            .get(resource.as_str())
            .map_err(storage)?
            .is_some())
    }

    fn release(&mut self, command: &LifecycleCommand) -> Result<()> {
        let holder = self
            .executing
            .get(command.resource_ref.as_str())
            .map_err(storage)?
            .map(|guard| guard.value());
        if holder == Some(command.command_id.as_u128()) {
            self.executing
                .remove(command.resource_ref.as_str())
                .map_err(storage)?;
        }
        Ok(())
    }

    /// Load `command_id`, insisting it is in one of `allowed`.
    fn transition(
        &self,
        command_id: CommandId,
        allowed: &[CommandState],
    ) -> Result<LifecycleCommand> {
        let command = self.require(command_id)?;
        if !allowed.contains(&command.state) {
            return Err(LessorError::Conflict(format!(
                "command {command_id} is {}",
                command.state
            )));
        }
        Ok(command)
    }
}

fn decode(raw: &[u8]) -> Result<LifecycleCommand> {
    serde_json::from_slice(raw)
        .map_err(|err| LessorError::Fatal(format!("corrupt lifecycle command record: {err}")))
}

fn load<T>(commands: &T, id: u128) -> Result<Option<LifecycleCommand>>
where
    T: ReadableTable<u128, &'static [u8]>,
{
    match commands.get(id).map_err(storage)? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

fn ids_in<T>(by_state: &T, state: CommandState) -> Result<Vec<u128>>
where
    T: ReadableTable<(u8, u128), ()>,
{
    let tag = state.as_u8();
    let mut ids = Vec::new();
    for entry in by_state.range((tag, 0u128)..=(tag, u128::MAX)).map_err(storage)? {
        let (key, _) = entry.map_err(storage)?;
        ids.push(key.value().1);
    }
    Ok(ids)
}

fn in_state<C, S>(commands: &C, by_state: &S, state: CommandState) -> Result<Vec<LifecycleCommand>>
where
    C: ReadableTable<u128, &'static [u8]>,
    S: ReadableTable<(u8, u128), ()>,
{
    let mut out = Vec::new();
    for id in ids_in(by_state, state)? {
        if let Some(command) = load(commands, id)? {
            out.push(command);
        }
    }
    Ok(out)
}

impl RedbCommandQueue {
    /// Open (or create) the queue file at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let location = path.clone();
        let db = tokio::task::spawn_blocking(move || -> Result<Database> {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            Database::create(&path).map_err(storage)
        })
        .await
        .map_err(|err| LessorError::Fatal(format!("queue open task failed: {err}")))??;

        let queue = Self {
            db: Arc::new(db),
            location: Some(location),
        };
        queue.write(|_| Ok(())).await?;
        info!(target: "lessor::lifecycle", path = ?queue.location, "lifecycle queue opened");
        Ok(queue)
    }

    /// Volatile queue. Nothing survives the process; for tests and for running
    /// without a configured queue path.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(storage)?;
        let txn = db.begin_write().map_err(storage)?;
        drop(WriteTables::open(&txn)?);
        txn.commit().map_err(storage)?;
        Ok(Self {
            db: Arc::new(db),
            location: None,
        })
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    async fn write<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteTables<'_>) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(storage)?;
            let out = {
                let mut tables = WriteTables::open(&txn)?;
                op(&mut tables)?
            };
            txn.commit().map_err(storage)?;
            Ok(out)
        })
        .await
        .map_err(|err| LessorError::Fatal(format!("queue write task failed: {err}")))?
    }

    async fn read<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ReadTransaction) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(storage)?;
            op(&txn)
        })
        .await
        .map_err(|err| LessorError::Fatal(format!("queue read task failed: {err}")))?
    }
}

#[async_trait]
impl CommandQueue for RedbCommandQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<CommandHandle> {
        self.write(move |tables| {
            let key = idempotency_key(&request.resource_ref, request.action, &request.request_nonce);
            let existing = tables
                .idempotency
                .get(key.as_str())
                .map_err(storage)?
                .map(|guard| guard.value());
            if let Some(existing) = existing {
                return Ok(CommandHandle::merged(CommandId::from_u128(existing)));
            }

            let command = LifecycleCommand::from_request(request, Utc::now());
            tables.store(&command, None)?;
            tables
                .idempotency
                .insert(key.as_str(), command.command_id.as_u128())
                .map_err(storage)?;
            debug!(
                target: "lessor::lifecycle",
                command_id = %command.command_id,
                resource = %command.resource_ref,
                action = %command.action,
                "command queued"
            );
            Ok(CommandHandle::accepted(command.command_id))
        })
        .await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<LifecycleCommand>> {
        self.write(move |tables| {
            for id in ids_in(&tables.by_state, CommandState::Queued)? {
                let Some(mut command) = load(&tables.commands, id)? else {
                    continue;
                };
                if !command.is_due(now) || tables.is_locked(&command.resource_ref)? {
                    continue;
                }
                command.state = CommandState::Executing;
                command.attempts += 1;
                command.last_attempt_at = Some(now);
                command.updated_at = now;
                tables.store(&command, Some(CommandState::Queued))?;
                tables
                    .executing
                    .insert(command.resource_ref.as_str(), id)
                    .map_err(storage)?;
                return Ok(Some(command));
            }
            Ok(None)
        })
        .await
    }

    async fn complete(&self, command_id: CommandId) -> Result<LifecycleCommand> {
        self.write(move |tables| {
            let mut command = tables.transition(command_id, &[CommandState::Executing])?;
            tables.release(&command)?;
            command.state = CommandState::Succeeded;
            command.backoff_until = None;
            command.updated_at = Utc::now();
            tables.store(&command, Some(CommandState::Executing))?;
            Ok(command)
        })
        .await
    }

    async fn retry(
        &self,
        command_id: CommandId,
        error: String,
        backoff_ms: u64,
        backoff_until: DateTime<Utc>,
    ) -> Result<LifecycleCommand> {
        self.write(move |tables| {
            let mut command = tables.transition(command_id, &[CommandState::Executing])?;
            tables.release(&command)?;
            command.state = CommandState::Queued;
            command.backoff_ms = backoff_ms;
            command.backoff_until = Some(backoff_until);
            command.last_error = Some(error);
            command.updated_at = Utc::now();
            tables.store(&command, Some(CommandState::Executing))?;
            Ok(command)
        })
        .await
    }

    async fn fail(&self, command_id: CommandId, error: String) -> Result<LifecycleCommand> {
        self.write(move |tables| {
            let mut command = tables.transition(
                command_id,
                &[CommandState::Queued, CommandState::Executing],
            )?;
            let previous = command.state;
            tables.release(&command)?;
            command.state = CommandState::Failed;
            command.backoff_until = None;
            command.last_error = Some(error);
            command.updated_at = Utc::now();
            tables.store(&command, Some(previous))?;
            Ok(command)
        })
        .await
    }

    async fn mark_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<LifecycleCommand>> {
        self.write(move |tables| {
            let mut stale = Vec::new();
            for id in ids_in(&tables.by_state, CommandState::Queued)? {
                let Some(mut command) = load(&tables.commands, id)? else {
                    continue;
                };
                if command.updated_at >= cutoff {
                    continue;
                }
                command.state = CommandState::Stale;
                command.updated_at = Utc::now();
                tables.store(&command, Some(CommandState::Queued))?;
                stale.push(command);
            }
            Ok(stale)
        })
        .await
    }

    async fn recover_interrupted(&self) -> Result<Vec<CommandId>> {
        self.write(|tables| {
            let mut recovered = Vec::new();
            for id in ids_in(&tables.by_state, CommandState::Executing)? {
                let Some(mut command) = load(&tables.commands, id)? else {
                    continue;
                };
                command.state = CommandState::Queued;
                command.backoff_until = None;
                command.updated_at = Utc::now();
                tables.store(&command, Some(CommandState::Executing))?;
                recovered.push(command.command_id);
            }

            let mut held = Vec::new();
            for entry in tables.executing.iter().map_err(storage)? {
                let (resource, _) = entry.map_err(storage)?;
                held.push(resource.value().to_string());
            }
            for resource in held {
                tables.executing.remove(resource.as_str()).map_err(storage)?;
            }
            Ok(recovered)
        })
        .await
    }

    async fn requeue(&self, command_id: CommandId) -> Result<LifecycleCommand> {
        self.write(move |tables| {
            let mut command =
                tables.transition(command_id, &[CommandState::Stale, CommandState::Failed])?;
            let previous = command.state;
            command.state = CommandState::Queued;
            command.attempts = 0;
            command.backoff_ms = 0;
            command.backoff_until = None;
            command.updated_at = Utc::now();
            tables.store(&command, Some(previous))?;
            Ok(command)
        })
        .await
    }

    async fn get(&self, command_id: CommandId) -> Result<Option<LifecycleCommand>> {
        self.read(move |txn| {
            let commands = txn.open_table(COMMANDS).map_err(storage)?;
            load(&commands, command_id.as_u128())
        })
        .await
    }

    async fn list_by_state(&self, state: Option<CommandState>) -> Result<Vec<LifecycleCommand>> {
        self.read(move |txn| {
            let commands = txn.open_table(COMMANDS).map_err(storage)?;
            match state {
                Some(state) => {
                    let by_state = txn.open_table(BY_STATE).map_err(storage)?;
                    in_state(&commands, &by_state, state)
                }
                None => {
                    let mut out = Vec::new();
                    for entry in commands.iter().map_err(storage)? {
                        let (_, raw) = entry.map_err(storage)?;
                        out.push(decode(raw.value())?);
                    }
                    Ok(out)
                }
            }
        })
        .await
    }

    async fn pending_for(&self, resource: &ResourceRef) -> Result<Option<LifecycleCommand>> {
        let resource = resource.clone();
        self.read(move |txn| {
            let commands = txn.open_table(COMMANDS).map_err(storage)?;
            let executing = txn.open_table(EXECUTING).map_err(storage)?;
            let holder = executing
                .get(resource.as_str())
                .map_err(storage)?
                .map(|guard| guard.value());
            if let Some(id) = holder {
                return load(&commands, id);
            }
            let by_state = txn.open_table(BY_STATE).map_err(storage)?;
            Ok(in_state(&commands, &by_state, CommandState::Queued)?
                .into_iter()
                .find(|command| command.resource_ref == resource))
        })
        .await
    }
}
