use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{EventHandler, SourceState};
use crate::alerts::{AlertBus, OperatorAlert};
use crate::chain::{ChainClient, ChainEvent, EventQuery, EventStream};
use crate::checkpoint::{Checkpoint, CheckpointStore, EventPosition};
use crate::config::EventSourceConfig;
use crate::error::{ErrorClass, LessorError, Result};
use crate::types::SubscriberId;

/// How a feed loop ended.
enum Exit {
    Shutdown,
    /// The live stream ended or failed; reconnect.
    Disconnected,
    /// The polling feed wants to try the live stream again.
    Resubscribe,
}

/// Subscribes to chain events and delivers them, in chain order, to a handler.
///
/// The source owns the subscriber's checkpoint: it resumes strictly after the
/// stored position and advances it only after the handler accepted a batch.
pub struct ChainEventSource {
    config: EventSourceConfig,
    subscriber: SubscriberId,
    query: EventQuery,
    chain: Arc<dyn ChainClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    alerts: AlertBus,
    state_tx: watch::Sender<SourceState>,
}

impl fmt::Debug for ChainEventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainEventSource")
            .field("subscriber", &self.subscriber)
            .field("query", &self.query)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

impl ChainEventSource {
    pub fn new(
        config: EventSourceConfig,
        chain: Arc<dyn ChainClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        alerts: AlertBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(SourceState::Disconnected);
        Self {
            subscriber: SubscriberId::new(config.subscriber_id.clone()),
            query: EventQuery(config.query.clone()),
            config,
            chain,
            checkpoints,
            alerts,
            state_tx,
        }
    }

    pub fn subscriber(&self) -> &SubscriberId {
        &self.subscriber
    }

    pub fn state(&self) -> watch::Receiver<SourceState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SourceState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(target: "lessor::events", from = %current, to = %state, "source state");
            *current = state;
            true
        });
    }

    /// Run until `shutdown` fires or a fatal error occurs. Fatal errors are
    /// published as an operator alert before being returned.
    pub async fn run(
        &self,
        handler: Arc<dyn EventHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let outcome = self.drive(handler.as_ref(), &shutdown).await;
        match &outcome {
            Ok(()) => {
                self.set_state(SourceState::Disconnected);
                info!(target: "lessor::events", subscriber = %self.subscriber, "event source stopped");
            }
            Err(err) => {
                self.set_state(SourceState::Halted);
                error!(target: "lessor::events", subscriber = %self.subscriber, error = %err, "event source halted");
                self.alerts.publish(OperatorAlert::ComponentHalted {
                    component: format!("event source {}", self.subscriber),
                    error: err.to_string(),
                });
            }
        }
        outcome
    }

    async fn drive(&self, handler: &dyn EventHandler, shutdown: &CancellationToken) -> Result<()> {
        let mut cursor = self
            .checkpoints
            .load(&self.subscriber)
            .await?
            .map(|checkpoint| checkpoint.position());
        info!(
            target: "lessor::events",
            subscriber = %self.subscriber,
            resume_after = ?cursor,
            "event source starting"
        );

        // Sessions in a row that ended without moving the cursor. A remote
        // that accepts subscriptions and then closes or goes silent counts
        // against the connect budget just like a refused subscribe.
        let mut dead_sessions = 0u32;
        let budget = self.config.connect_max_attempts.max(1);

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let stream = if dead_sessions >= budget {
                warn!(
                    target: "lessor::events",
                    sessions = dead_sessions,
                    "subscription keeps ending without events"
                );
                dead_sessions = 0;
                None
            } else {
                self.connect(cursor, shutdown).await
            };
            let exit = match stream {
                Some(stream) => {
                    self.set_state(SourceState::Subscribed);
                    let before = cursor;
                    let exit = self.consume(stream, &mut cursor, handler, shutdown).await?;
                    if cursor == before {
                        dead_sessions += 1;
                    } else {
                        dead_sessions = 0;
                    }
                    exit
                }
                None if shutdown.is_cancelled() => Exit::Shutdown,
                None => {
                    self.set_state(SourceState::Polling);
                    warn!(
                        target: "lessor::events",
                        attempts = budget,
                        "subscription unavailable, falling back to polling"
                    );
                    self.poll(&mut cursor, handler, shutdown).await?
                }
            };
            match exit {
                Exit::Shutdown => return Ok(()),
                Exit::Disconnected => {
                    self.set_state(SourceState::Disconnected);
                    if !sleep_or_cancel(self.config.connect_backoff(), shutdown).await {
                        return Ok(());
                    }
                }
                Exit::Resubscribe => {
                    debug!(target: "lessor::events", "retrying live subscription");
                }
            }
        }
    }

    /// Bounded subscription attempts with a fixed backoff. `None` once they
    /// are used up or shutdown was requested.
    async fn connect(
        &self,
        cursor: Option<EventPosition>,
        shutdown: &CancellationToken,
    ) -> Option<EventStream> {
        let attempts = self.config.connect_max_attempts.max(1);
        for attempt in 1..=attempts {
            self.set_state(SourceState::Connecting);
            let call = tokio::time::timeout(
                self.config.rpc_timeout(),
                self.chain.subscribe(&self.query, cursor),
            );
            let result = tokio::select! {
                _ = shutdown.cancelled() => return None,
                result = call => result.unwrap_or_else(|_| Err(LessorError::timed_out("subscribe"))),
            };
            match result {
                Ok(stream) => {
                    info!(target: "lessor::events", attempt, after = ?cursor, "subscribed");
                    return Some(stream);
                }
                Err(err) => {
                    warn!(target: "lessor::events", attempt, error = %err, "subscription attempt failed");
                    self.set_state(SourceState::Disconnected);
                }
            }
            if attempt < attempts && !sleep_or_cancel(self.config.connect_backoff(), shutdown).await {
                return None;
            }
        }
        None
    }

    async fn consume(
        &self,
        mut stream: EventStream,
        cursor: &mut Option<EventPosition>,
        handler: &dyn EventHandler,
        shutdown: &CancellationToken,
    ) -> Result<Exit> {
        let mut batch: Vec<ChainEvent> = Vec::new();
        let linger = self.config.batch_linger();
        let idle = self.config.idle_timeout();
        let mut deadline: Option<Instant> = None;

        loop {
            let next = match deadline {
                // No partial batch is held here, so giving up loses nothing.
                None => tokio::select! {
                    _ = shutdown.cancelled() => return Ok(Exit::Shutdown),
                    item = tokio::time::timeout(idle, stream.next()) => match item {
                        Ok(item) => item,
                        Err(_) => {
                            warn!(
                                target: "lessor::events",
                                idle_ms = idle.as_millis() as u64,
                                "subscription silent, reconnecting"
                            );
                            return Ok(Exit::Disconnected);
                        }
                    },
                },
                Some(at) => tokio::select! {
                    _ = shutdown.cancelled() => return Ok(Exit::Shutdown),
                    _ = tokio::time::sleep_until(at) => {
                        if !self.dispatch(&mut batch, cursor, handler, shutdown).await? {
                            return Ok(Exit::Shutdown);
                        }
                        deadline = None;
                        continue;
                    }
                    item = stream.next() => item,
                },
            };

            match next {
                Some(Ok(event)) => {
                    if is_replayed(cursor, batch.last(), &event) {
                        trace!(target: "lessor::events", position = ?event.position, "skipping replayed event");
                        continue;
                    }
                    batch.push(event);
                    if batch.len() >= self.config.batch_size.max(1) {
                        if !self.dispatch(&mut batch, cursor, handler, shutdown).await? {
                            return Ok(Exit::Shutdown);
                        }
                        deadline = None;
                    } else if deadline.is_none() {
                        deadline = Some(Instant::now() + linger);
                    }
                }
                Some(Err(err)) => {
                    warn!(target: "lessor::events", error = %err, "subscription stream failed");
                    if !self.dispatch(&mut batch, cursor, handler, shutdown).await? {
                        return Ok(Exit::Shutdown);
                    }
                    return Ok(Exit::Disconnected);
                }
                None => {
                    info!(target: "lessor::events", "subscription stream closed by remote");
                    if !self.dispatch(&mut batch, cursor, handler, shutdown).await? {
                        return Ok(Exit::Shutdown);
                    }
                    return Ok(Exit::Disconnected);
                }
            }
        }
    }

    /// Polling substitute for the live stream, with identical batching and
    /// checkpointing. Periodically hands control back so the subscription can
    /// be retried. Consecutive failures past the connect budget mean the chain
    /// is unreachable altogether, which is fatal.
    async fn poll(
        &self,
        cursor: &mut Option<EventPosition>,
        handler: &dyn EventHandler,
        shutdown: &CancellationToken,
    ) -> Result<Exit> {
        let resubscribe_at = Instant::now() + self.config.resubscribe_interval();
        let limit = self.config.poll_limit.max(1);
        let mut failures = 0u32;

        loop {
            if Instant::now() >= resubscribe_at {
                return Ok(Exit::Resubscribe);
            }
            let call = tokio::time::timeout(
                self.config.rpc_timeout(),
                self.chain.poll_events(&self.query, *cursor, limit),
            );
            let result = tokio::select! {
                _ = shutdown.cancelled() => return Ok(Exit::Shutdown),
                result = call => result.unwrap_or_else(|_| Err(LessorError::timed_out("poll events"))),
            };

            let full_page = match result {
                Ok(events) => {
                    failures = 0;
                    let fetched = events.len();
                    let mut batch: Vec<ChainEvent> = Vec::new();
                    for event in events {
                        if is_replayed(cursor, batch.last(), &event) {
                            continue;
                        }
                        batch.push(event);
                        if batch.len() >= self.config.batch_size.max(1)
                            && !self.dispatch(&mut batch, cursor, handler, shutdown).await?
                        {
                            return Ok(Exit::Shutdown);
                        }
                    }
                    if !self.dispatch(&mut batch, cursor, handler, shutdown).await? {
                        return Ok(Exit::Shutdown);
                    }
                    fetched >= limit
                }
                Err(err) => {
                    failures += 1;
                    warn!(target: "lessor::events", failures, error = %err, "event poll failed");
                    if failures >= self.config.connect_max_attempts.max(1) {
                        return Err(LessorError::Fatal(format!(
                            "chain unreachable: subscription and polling both failing ({err})"
                        )));
                    }
                    false
                }
            };

            if !full_page && !sleep_or_cancel(self.config.poll_interval(), shutdown).await {
                return Ok(Exit::Shutdown);
            }
        }
    }

    /// Hand `batch` to the handler and checkpoint it. Returns `false` when
    /// shutdown interrupted the batch; it is then left unacknowledged and
    /// will be redelivered after restart.
    ///
    /// Only batches the handler rejected as invalid or already applied are
    /// skipped. A handler that gave up (its downstream closed) never moves
    /// the checkpoint: during shutdown the batch is left for the next start,
    /// otherwise the source halts.
    async fn dispatch(
        &self,
        batch: &mut Vec<ChainEvent>,
        cursor: &mut Option<EventPosition>,
        handler: &dyn EventHandler,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let Some(last) = batch.last().map(|event| event.position) else {
            return Ok(true);
        };

        loop {
            match handler.handle_batch(batch).await {
                Ok(()) => break,
                Err(err) => match err.class() {
                    ErrorClass::Fatal => return Err(err),
                    ErrorClass::Transient => {
                        warn!(
                            target: "lessor::events",
                            events = batch.len(),
                            error = %err,
                            "handler failed, batch will be redelivered"
                        );
                        if !sleep_or_cancel(self.config.handler_retry(), shutdown).await {
                            return Ok(false);
                        }
                    }
                    ErrorClass::Validation | ErrorClass::Conflict => {
                        warn!(
                            target: "lessor::events",
                            events = batch.len(),
                            error = %err,
                            "handler rejected batch, skipping"
                        );
                        break;
                    }
                    ErrorClass::Exhausted if shutdown.is_cancelled() => {
                        debug!(
                            target: "lessor::events",
                            events = batch.len(),
                            error = %err,
                            "batch interrupted by shutdown, left unacknowledged"
                        );
                        return Ok(false);
                    }
                    ErrorClass::Exhausted => {
                        return Err(LessorError::Fatal(format!(
                            "handler gave up on a batch of {} events: {err}",
                            batch.len()
                        )));
                    }
                },
            }
        }

        let checkpoint = Checkpoint::new(self.subscriber.clone(), last);
        loop {
            match self.checkpoints.save(&checkpoint).await {
                Ok(()) => break,
                Err(err) if err.is_retryable() => {
                    warn!(target: "lessor::events", error = %err, "checkpoint save failed, retrying");
                    if !sleep_or_cancel(self.config.handler_retry(), shutdown).await {
                        return Ok(false);
                    }
                }
                Err(err) => {
                    return Err(LessorError::Fatal(format!(
                        "checkpoint store for {}: {err}",
                        self.subscriber
                    )));
                }
            }
        }

        debug!(
            target: "lessor::events",
            events = batch.len(),
            height = last.height,
            seq = last.seq,
            "batch dispatched"
        );
        *cursor = Some(last);
        batch.clear();
        Ok(true)
    }
}

/// Whether `event` is at or before what was already checkpointed or queued.
fn is_replayed(
    cursor: &Option<EventPosition>,
    pending: Option<&ChainEvent>,
    event: &ChainEvent,
) -> bool {
    let floor = pending.map(|last| last.position).or(*cursor);
    floor.is_some_and(|floor| event.position <= floor)
}

/// Sleep for `duration`; `false` if shutdown fired first.
async fn sleep_or_cancel(duration: std::time::Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
