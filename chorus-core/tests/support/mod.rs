#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chorus_core::{
    CoreError,
    commands::{
        CommandCancelled, CommandContext, CommandHandler, CommandRecord,
        CommandScheduler, CommandStatus, CommandStore, HandlerRegistry,
        HandlerTraits, InMemoryCommandStore,
    },
    config::CommandConfig,
    events::{EventBus, EventEnvelope},
    types::CommandId,
};
use serde_json::{Value, json};
use tokio::sync::{Semaphore, broadcast};

pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub fn commands_config(max_concurrency: usize) -> CommandConfig {
    CommandConfig {
        max_concurrency,
        shutdown_grace_ms: 500,
        ..CommandConfig::default()
    }
}

pub struct Harness {
    pub scheduler: CommandScheduler,
    pub bus: EventBus,
    pub store: Arc<InMemoryCommandStore>,
}

pub async fn start_scheduler(
    config: CommandConfig,
    registry: HandlerRegistry,
) -> Harness {
    start_with_store(config, registry, Arc::new(InMemoryCommandStore::new())).await
}

pub async fn start_with_store(
    config: CommandConfig,
    registry: HandlerRegistry,
    store: Arc<InMemoryCommandStore>,
) -> Harness {
    let bus = EventBus::default();
    let scheduler = CommandScheduler::start(
        config,
        registry,
        store.clone(),
        bus.clone(),
    )
    .await
    .expect("scheduler starts");
    Harness {
        scheduler,
        bus,
        store,
    }
}

/// Polls until the command reaches `status`.
pub async fn wait_for_status(
    scheduler: &CommandScheduler,
    id: CommandId,
    status: CommandStatus,
) -> CommandRecord {
    eventually(move || async move {
        scheduler
            .get_status(id)
            .await
            .ok()
            .filter(|record| record.status == status)
    })
    .await
}

pub async fn finished(scheduler: &CommandScheduler, id: CommandId) -> CommandRecord {
    tokio::time::timeout(WAIT_LIMIT, scheduler.wait_for_terminal(id))
        .await
        .expect("command finishes in time")
        .expect("command is known")
}

pub async fn eventually<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            if let Some(value) = probe().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time")
}

/// Everything currently buffered on a tap.
pub fn drain(tap: &mut broadcast::Receiver<Arc<EventEnvelope>>) -> Vec<Arc<EventEnvelope>> {
    let mut events = Vec::new();
    while let Ok(envelope) = tap.try_recv() {
        events.push(envelope);
    }
    events
}

/// Echoes its parameters as output.
pub struct EchoHandler {
    pub name: &'static str,
    pub traits: HandlerTraits,
    pub calls: AtomicUsize,
}

impl EchoHandler {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            traits: HandlerTraits::default(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandHandler for EchoHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn traits(&self) -> HandlerTraits {
        self.traits
    }

    async fn execute(&self, ctx: CommandContext) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "echo": ctx.parameters().to_json() }))
    }
}

/// Blocks every execution until a permit is released or the command is
/// cancelled, tracking how many executions overlap.
pub struct GatedHandler {
    pub name: &'static str,
    pub traits: HandlerTraits,
    gate: Semaphore,
    running: AtomicUsize,
    max_running: AtomicUsize,
    started: AtomicUsize,
}

impl GatedHandler {
    pub fn new(name: &'static str) -> Arc<Self> {
        Self::with_traits(name, HandlerTraits::default())
    }

    pub fn with_traits(name: &'static str, traits: HandlerTraits) -> Arc<Self> {
        Arc::new(Self {
            name,
            traits,
            gate: Semaphore::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
        })
    }

    /// Lets `n` blocked or future executions finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandHandler for GatedHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn traits(&self) -> HandlerTraits {
        self.traits
    }

    async fn execute(&self, ctx: CommandContext) -> anyhow::Result<Value> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let outcome = tokio::select! {
            acquired = self.gate.acquire() => {
                acquired.map(|permit| permit.forget()).map_err(anyhow::Error::from)
            }
            _ = ctx.cancelled() => Err(CommandCancelled.into()),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome.map(|()| json!({ "released": true }))
    }
}

pub struct FailingHandler {
    pub name: &'static str,
}

#[async_trait]
impl CommandHandler for FailingHandler {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, _ctx: CommandContext) -> anyhow::Result<Value> {
        Err(anyhow::anyhow!("indexer returned 503").context("album search failed"))
    }
}

pub struct PanickingHandler {
    pub name: &'static str,
}

#[async_trait]
impl CommandHandler for PanickingHandler {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, _ctx: CommandContext) -> anyhow::Result<Value> {
        panic!("tag writer crashed");
    }
}

/// A store whose every call fails.
#[derive(Debug, Default)]
pub struct BrokenStore;

#[async_trait]
impl CommandStore for BrokenStore {
    async fn save(&self, _record: &CommandRecord) -> chorus_core::Result<()> {
        Err(CoreError::Internal("disk full".into()))
    }

    async fn load_all(&self) -> chorus_core::Result<Vec<CommandRecord>> {
        Err(CoreError::Internal("database is locked".into()))
    }

    async fn delete(&self, _ids: &[CommandId]) -> chorus_core::Result<u64> {
        Err(CoreError::Internal("disk full".into()))
    }
}
