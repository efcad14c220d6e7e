use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::{
    sync::{Mutex, Notify, broadcast::error::RecvError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use super::{
    handler::{
        CommandCancelled, CommandContext, CommandHandler, HandlerRegistry,
        HandlerTraits, ProgressSink,
    },
    model::{
        CommandFilter, CommandParameters, CommandRecord, CommandResult,
        CommandStatus, CommandTrigger, DedupeKey,
    },
    store::CommandStore,
};
use crate::{
    config::CommandConfig,
    error::{CoreError, Result},
    events::{DomainEvent, EventBus, EventKind},
    types::ids::CommandId,
    util::panic_message,
};

/// How an enqueue request was absorbed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueDisposition {
    /// A new command was queued.
    Created,
    /// A non-terminal command with the same name and parameters already
    /// existed and is returned instead.
    DuplicateSuppressed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnqueueOutcome {
    pub command: CommandRecord,
    pub disposition: EnqueueDisposition,
}

impl EnqueueOutcome {
    pub fn id(&self) -> CommandId {
        self.command.id
    }

    pub fn is_duplicate(&self) -> bool {
        self.disposition == EnqueueDisposition::DuplicateSuppressed
    }
}

struct RunningCommand {
    name: String,
    traits: HandlerTraits,
    token: CancellationToken,
}

/// Owned command state. Every mutation happens under the scheduler lock,
/// which makes the dedupe lookup and the slot check atomic.
#[derive(Default)]
struct CommandTable {
    records: HashMap<CommandId, CommandRecord>,
    queue: VecDeque<CommandId>,
    active_keys: HashMap<DedupeKey, CommandId>,
    running: HashMap<CommandId, RunningCommand>,
}

impl CommandTable {
    fn slot_available(&self, name: &str, traits: HandlerTraits) -> bool {
        self.running.values().all(|running| {
            let same_name = running.name == name;
            !(same_name && (traits.exclusive || running.traits.exclusive))
                && !(traits.requires_disk_access
                    && running.traits.requires_disk_access)
        })
    }

    fn release_key(&mut self, record: &CommandRecord) {
        let key = record.dedupe_key();
        if self.active_keys.get(&key) == Some(&record.id) {
            self.active_keys.remove(&key);
        }
    }

    fn count(&self, status: CommandStatus) -> usize {
        self.records
            .values()
            .filter(|record| record.status == status)
            .count()
    }
}

struct Claim {
    record: CommandRecord,
    handler: Arc<dyn CommandHandler>,
    token: CancellationToken,
}

struct SchedulerInner {
    config: CommandConfig,
    registry: HandlerRegistry,
    store: Arc<dyn CommandStore>,
    events: EventBus,
    table: Mutex<CommandTable>,
    work: Notify,
    shutdown: CancellationToken,
    degraded: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Queues, deduplicates and runs commands on a bounded worker pool.
///
/// One scheduler exists per process; clones share the same state. Workers
/// equal `max_concurrency`, so the number of Started commands can never
/// exceed it. Handlers run on their own tasks, which contains panics.
#[derive(Clone)]
pub struct CommandScheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for CommandScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandScheduler")
            .field("max_concurrency", &self.inner.config.max_concurrency)
            .field("handlers", &self.inner.registry)
            .field("degraded", &self.is_degraded())
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl CommandScheduler {
    /// Loads history, reconciles commands left behind by a previous run and
    /// starts the worker pool.
    ///
    /// A store that cannot be read is fatal only when
    /// `require_persistence` is set; otherwise the scheduler runs from
    /// memory.
    pub async fn start(
        config: CommandConfig,
        registry: HandlerRegistry,
        store: Arc<dyn CommandStore>,
        events: EventBus,
    ) -> Result<Self> {
        let (records, degraded) = match store.load_all().await {
            Ok(records) => (records, false),
            Err(err) if config.require_persistence => {
                tracing::error!(
                    target: "commands::scheduler",
                    error = %err,
                    "command store unavailable and persistence is required"
                );
                return Err(err);
            }
            Err(err) => {
                tracing::warn!(
                    target: "commands::scheduler",
                    error = %err,
                    "command store unavailable, continuing in memory"
                );
                (Vec::new(), true)
            }
        };

        let (table, reconciled) = recover(records, &registry);
        if !degraded {
            for record in &reconciled {
                if let Err(err) = store.save(record).await {
                    tracing::warn!(
                        target: "commands::scheduler",
                        command_id = %record.id,
                        error = %err,
                        "failed to persist recovered command"
                    );
                }
            }
        }
        tracing::info!(
            target: "commands::scheduler",
            history = table.records.len(),
            requeued = table.queue.len(),
            reconciled = reconciled.len(),
            workers = config.worker_count(),
            "command scheduler starting"
        );

        let inner = Arc::new(SchedulerInner {
            config,
            registry,
            store,
            events,
            table: Mutex::new(table),
            work: Notify::new(),
            shutdown: CancellationToken::new(),
            degraded: AtomicBool::new(degraded),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        {
            let mut tasks = inner.tasks.lock();
            for worker in 0..inner.config.worker_count() {
                tasks.push(tokio::spawn(worker_loop(Arc::clone(&inner), worker)));
            }
            tasks.push(tokio::spawn(housekeeping_loop(Arc::clone(&inner))));
        }

        Ok(Self { inner })
    }

    /// Queues a command, or returns the existing non-terminal command with
    /// the same name and parameters. Never waits for execution.
    pub async fn enqueue(
        &self,
        name: &str,
        parameters: CommandParameters,
        trigger: CommandTrigger,
    ) -> Result<EnqueueOutcome> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoreError::ShutDown);
        }
        let handler = self.inner.registry.require(name)?;
        handler
            .validate(&parameters)
            .map_err(|e| CoreError::InvalidParameters(format!("{e:#}")))?;
        let traits = handler.traits();
        let key = DedupeKey::new(name, &parameters);

        let mut table = self.inner.table.lock().await;
        if let Some(existing) = table
            .active_keys
            .get(&key)
            .and_then(|id| table.records.get(id))
        {
            tracing::debug!(
                target: "commands::scheduler",
                command_id = %existing.id,
                name,
                status = %existing.status,
                "duplicate enqueue suppressed"
            );
            return Ok(EnqueueOutcome {
                command: existing.clone(),
                disposition: EnqueueDisposition::DuplicateSuppressed,
            });
        }

        let record = CommandRecord::queued(name, parameters, trigger);
        if let Err(err) = self.inner.persist(&record).await
            && self.inner.config.require_persistence
        {
            return Err(err);
        }

        if traits.supersedes_queued && record.parameters.is_empty() {
            self.inner.supersede_queued(&mut table, &record).await;
        }

        table.queue.push_back(record.id);
        table.active_keys.insert(key, record.id);
        table.records.insert(record.id, record.clone());
        self.inner
            .events
            .publish(DomainEvent::CommandQueued(record.summary()));
        drop(table);

        tracing::info!(
            target: "commands::scheduler",
            command_id = %record.id,
            name,
            trigger = %trigger,
            "command queued"
        );
        self.inner.work.notify_waiters();

        Ok(EnqueueOutcome {
            command: record,
            disposition: EnqueueDisposition::Created,
        })
    }

    pub async fn get_status(&self, id: CommandId) -> Result<CommandRecord> {
        self.inner
            .table
            .lock()
            .await
            .records
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound(id))
    }

    /// Matching commands, most recently queued first.
    pub async fn list(&self, filter: &CommandFilter) -> Vec<CommandRecord> {
        let mut records: Vec<CommandRecord> = {
            let table = self.inner.table.lock().await;
            table
                .records
                .values()
                .filter(|record| filter.matches(record))
                .cloned()
                .collect()
        };
        records.sort_by(|a, b| {
            b.queued_at.cmp(&a.queued_at).then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        records
    }

    /// Aborts a Queued command, or requests cooperative cancellation of a
    /// Started one. Terminal commands are returned unchanged.
    pub async fn cancel(&self, id: CommandId) -> Result<CommandRecord> {
        let mut table = self.inner.table.lock().await;
        let status = table
            .records
            .get(&id)
            .map(|record| record.status)
            .ok_or(CoreError::NotFound(id))?;

        match status {
            CommandStatus::Queued => {
                let record = self
                    .inner
                    .abort_queued(&mut table, id, "cancelled".to_string())
                    .await
                    .ok_or(CoreError::NotFound(id))?;
                Ok(record)
            }
            CommandStatus::Started => {
                if let Some(running) = table.running.get(&id) {
                    running.token.cancel();
                    tracing::info!(
                        target: "commands::scheduler",
                        command_id = %id,
                        name = %running.name,
                        "cancellation requested"
                    );
                }
                table.records.get(&id).cloned().ok_or(CoreError::NotFound(id))
            }
            _ => table.records.get(&id).cloned().ok_or(CoreError::NotFound(id)),
        }
    }

    /// Resolves with the command once it reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: CommandId) -> Result<CommandRecord> {
        let mut tap = self.inner.events.tap();
        loop {
            let record = self.get_status(id).await?;
            if record.is_terminal() {
                return Ok(record);
            }
            loop {
                match tap.recv().await {
                    Ok(envelope) => {
                        let terminal = matches!(
                            envelope.kind(),
                            EventKind::CommandCompleted
                                | EventKind::CommandFailed
                                | EventKind::CommandAborted
                        );
                        if terminal && envelope.event.command_id() == Some(id) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return Err(CoreError::ShutDown),
                }
            }
        }
    }

    /// Removes terminal commands past retention and trims history to
    /// `max_history`. Returns the number of commands removed.
    pub async fn prune(&self) -> usize {
        self.inner.prune(Utc::now()).await
    }

    pub async fn started_count(&self) -> usize {
        self.inner.table.lock().await.running.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.inner.table.lock().await.queue.len()
    }

    /// True while any Queued or Started command has this name.
    pub async fn is_active(&self, name: &str) -> bool {
        self.inner.table.lock().await.records.values().any(|record| {
            !record.is_terminal() && record.name.eq_ignore_ascii_case(name)
        })
    }

    /// True when the store failed and state is only held in memory.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &CommandConfig {
        &self.inner.config
    }

    /// Stops accepting work, signals cancellation to running handlers and
    /// waits up to `shutdown_grace_ms` for workers to wind down. Commands
    /// still running afterwards are reconciled as interrupted on the next
    /// start.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.work.notify_waiters();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let grace = self.inner.config.shutdown_grace();
        if tokio::time::timeout(grace, join_all(tasks)).await.is_err() {
            tracing::warn!(
                target: "commands::scheduler",
                grace_ms = grace.as_millis() as u64,
                "workers did not stop within the grace period"
            );
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!(target: "commands::scheduler", "command scheduler stopped");
    }
}

/// Rebuilds the table from stored history. Returns the table plus every
/// record whose state changed and must be written back.
fn recover(
    records: Vec<CommandRecord>,
    registry: &HandlerRegistry,
) -> (CommandTable, Vec<CommandRecord>) {
    let mut table = CommandTable::default();
    let mut reconciled = Vec::new();
    let now = Utc::now();

    for mut record in records {
        match record.status {
            CommandStatus::Started => {
                record.finish(
                    CommandResult::Failed {
                        message: "interrupted".to_string(),
                        context: Some(
                            "the process stopped while the command was running"
                                .to_string(),
                        ),
                    },
                    now,
                );
                reconciled.push(record.clone());
            }
            CommandStatus::Queued if !registry.contains(&record.name) => {
                record.finish(
                    CommandResult::Aborted {
                        reason: format!(
                            "no command handler registered for `{}`",
                            record.name
                        ),
                    },
                    now,
                );
                reconciled.push(record.clone());
            }
            CommandStatus::Queued => {
                let key = record.dedupe_key();
                if table.active_keys.contains_key(&key) {
                    record.finish(
                        CommandResult::Aborted {
                            reason: "duplicate of a queued command".to_string(),
                        },
                        now,
                    );
                    reconciled.push(record.clone());
                } else {
                    table.active_keys.insert(key, record.id);
                    table.queue.push_back(record.id);
                }
            }
            _ => {}
        }
        table.records.insert(record.id, record);
    }

    (table, reconciled)
}

impl SchedulerInner {
    /// Writes through to the store. Failures flip the scheduler into
    /// degraded mode and are returned for callers that care.
    async fn persist(&self, record: &CommandRecord) -> Result<()> {
        match self.store.save(record).await {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::AcqRel) {
                    tracing::info!(
                        target: "commands::scheduler",
                        "command store recovered"
                    );
                }
                Ok(())
            }
            Err(err) => {
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        target: "commands::scheduler",
                        command_id = %record.id,
                        error = %err,
                        "command store write failed, continuing in memory"
                    );
                }
                Err(err)
            }
        }
    }

    async fn persist_best_effort(&self, record: &CommandRecord) {
        let _ = self.persist(record).await;
    }

    async fn abort_queued(
        &self,
        table: &mut CommandTable,
        id: CommandId,
        reason: String,
    ) -> Option<CommandRecord> {
        table.queue.retain(|queued| *queued != id);
        let record = {
            let record = table.records.get_mut(&id)?;
            record.finish(
                CommandResult::Aborted {
                    reason: reason.clone(),
                },
                Utc::now(),
            );
            record.clone()
        };
        table.release_key(&record);
        self.persist_best_effort(&record).await;
        self.events.publish(DomainEvent::CommandAborted {
            command: record.summary(),
            reason: reason.clone(),
        });
        tracing::info!(
            target: "commands::scheduler",
            command_id = %id,
            name = %record.name,
            reason = %reason,
            "queued command aborted"
        );
        Some(record)
    }

    /// A broad request replaces queued instances with narrower parameters.
    async fn supersede_queued(
        &self,
        table: &mut CommandTable,
        broad: &CommandRecord,
    ) {
        let narrower: Vec<CommandId> = table
            .queue
            .iter()
            .filter(|id| {
                table.records.get(*id).is_some_and(|queued| {
                    queued.name == broad.name && !queued.parameters.is_empty()
                })
            })
            .copied()
            .collect();
        for id in narrower {
            self.abort_queued(table, id, "superseded".to_string()).await;
        }
    }

    /// Moves the oldest runnable Queued command to Started.
    async fn claim_next(&self) -> Option<Claim> {
        let mut table = self.table.lock().await;
        let position = table.queue.iter().position(|id| {
            table
                .records
                .get(id)
                .and_then(|record| {
                    self.registry.get(&record.name).map(|handler| {
                        table.slot_available(&record.name, handler.traits())
                    })
                })
                .unwrap_or(false)
        })?;
        let id = table.queue.remove(position)?;
        let token = self.shutdown.child_token();

        let record = {
            let record = table.records.get_mut(&id)?;
            record.mark_started(Utc::now());
            record.clone()
        };
        let handler = self.registry.get(&record.name)?;
        table.running.insert(
            id,
            RunningCommand {
                name: record.name.clone(),
                traits: handler.traits(),
                token: token.clone(),
            },
        );
        self.persist_best_effort(&record).await;
        self.events
            .publish(DomainEvent::CommandStarted(record.summary()));
        drop(table);

        tracing::info!(
            target: "commands::scheduler",
            command_id = %id,
            name = %record.name,
            "command started"
        );
        Some(Claim {
            record,
            handler,
            token,
        })
    }

    async fn run(self: &Arc<Self>, claim: Claim) {
        let Claim {
            record,
            handler,
            token,
        } = claim;
        let progress: Arc<dyn ProgressSink> = Arc::clone(self) as Arc<dyn ProgressSink>;
        let ctx = CommandContext::new(
            record.id,
            record.name.clone(),
            record.parameters.clone(),
            record.trigger,
            token.clone(),
            self.events.clone(),
            progress,
        );

        let joined =
            tokio::spawn(async move { handler.execute(ctx).await }).await;

        let result = match joined {
            Ok(Ok(output)) => CommandResult::Succeeded { output },
            Ok(Err(err))
                if token.is_cancelled()
                    || err.downcast_ref::<CommandCancelled>().is_some() =>
            {
                CommandResult::Aborted {
                    reason: if self.shutdown.is_cancelled() {
                        "cancelled during shutdown".to_string()
                    } else {
                        "cancelled".to_string()
                    },
                }
            }
            Ok(Err(err)) => failure_from_error(&err),
            Err(join_err) if join_err.is_panic() => CommandResult::Failed {
                message: format!(
                    "handler panicked: {}",
                    panic_message(join_err.into_panic().as_ref())
                ),
                context: None,
            },
            Err(_) => CommandResult::Aborted {
                reason: "execution task was cancelled".to_string(),
            },
        };

        self.complete(record.id, result).await;
    }

    async fn complete(&self, id: CommandId, result: CommandResult) {
        let mut table = self.table.lock().await;
        table.running.remove(&id);
        let record = match table.records.get_mut(&id) {
            Some(record) => {
                record.finish(result, Utc::now());
                record.clone()
            }
            None => return,
        };
        table.release_key(&record);
        self.persist_best_effort(&record).await;

        let summary = record.summary();
        let duration_ms = record
            .duration()
            .map(|duration| duration.num_milliseconds())
            .unwrap_or_default();
        match &record.result {
            Some(CommandResult::Failed { message, context }) => {
                tracing::warn!(
                    target: "commands::scheduler",
                    command_id = %id,
                    name = %record.name,
                    duration_ms,
                    error = %message,
                    context = context.as_deref().unwrap_or_default(),
                    "command failed"
                );
                self.events.publish(DomainEvent::CommandFailed {
                    command: summary,
                    reason: message.clone(),
                });
            }
            Some(CommandResult::Aborted { reason }) => {
                tracing::info!(
                    target: "commands::scheduler",
                    command_id = %id,
                    name = %record.name,
                    duration_ms,
                    reason = %reason,
                    "command aborted"
                );
                self.events.publish(DomainEvent::CommandAborted {
                    command: summary,
                    reason: reason.clone(),
                });
            }
            _ => {
                tracing::info!(
                    target: "commands::scheduler",
                    command_id = %id,
                    name = %record.name,
                    duration_ms,
                    "command completed"
                );
                self.events.publish(DomainEvent::CommandCompleted(summary));
            }
        }
        drop(table);

        self.work.notify_waiters();
    }

    async fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.retention();
        let mut table = self.table.lock().await;

        let mut terminal: Vec<(DateTime<Utc>, CommandId)> = table
            .records
            .values()
            .filter(|record| record.is_terminal())
            .map(|record| (record.ended_at.unwrap_or(record.queued_at), record.id))
            .collect();
        terminal.sort();

        let overflow = terminal.len().saturating_sub(self.config.max_history);
        let doomed: Vec<CommandId> = terminal
            .iter()
            .enumerate()
            .filter(|(index, (ended, _))| *index < overflow || *ended < cutoff)
            .map(|(_, (_, id))| *id)
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        for id in &doomed {
            table.records.remove(id);
        }
        if let Err(err) = self.store.delete(&doomed).await {
            tracing::warn!(
                target: "commands::scheduler",
                error = %err,
                "failed to delete pruned commands from the store"
            );
        }
        tracing::debug!(
            target: "commands::scheduler",
            removed = doomed.len(),
            remaining = table.records.len(),
            "command history pruned"
        );
        doomed.len()
    }
}

#[async_trait]
impl ProgressSink for SchedulerInner {
    async fn report(&self, id: CommandId, message: String) {
        let mut table = self.table.lock().await;
        let record = match table.records.get_mut(&id) {
            Some(record) if record.status == CommandStatus::Started => {
                record.message = Some(message.clone());
                record.clone()
            }
            _ => return,
        };
        self.persist_best_effort(&record).await;
        self.events.publish(DomainEvent::CommandUpdated {
            command: record.summary(),
            message: message.clone(),
        });
        tracing::debug!(
            target: "commands::scheduler",
            command_id = %id,
            message = %message,
            "command progress"
        );
    }
}

fn failure_from_error(err: &anyhow::Error) -> CommandResult {
    let message = err.to_string();
    let causes: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
    CommandResult::Failed {
        message: if message.is_empty() {
            "command handler failed".to_string()
        } else {
            message
        },
        context: (!causes.is_empty()).then(|| causes.join(": ")),
    }
}

async fn worker_loop(inner: Arc<SchedulerInner>, worker: usize) {
    tracing::debug!(target: "commands::worker", worker, "worker started");
    loop {
        let notified = inner.work.notified();
        if inner.shutdown.is_cancelled() {
            break;
        }
        match inner.claim_next().await {
            Some(claim) => inner.run(claim).await,
            None => {
                tokio::select! {
                    _ = notified => {}
                    _ = inner.shutdown.cancelled() => break,
                }
            }
        }
    }
    tracing::debug!(target: "commands::worker", worker, "worker stopped");
}

async fn housekeeping_loop(inner: Arc<SchedulerInner>) {
    let mut ticker = tokio::time::interval(inner.config.housekeeping_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                inner.prune(Utc::now()).await;
            }
        }
    }
}
