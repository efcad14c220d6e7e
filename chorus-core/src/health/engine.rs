use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{FutureExt, future::join_all};
use parking_lot::RwLock;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::{
    model::{HealthCheckOutcome, HealthCheckResult, HealthSeverity},
    registry::{HealthCheck, HealthCheckRegistry},
};
use crate::{
    config::HealthConfig,
    events::{DomainEvent, EventBus, EventEnvelope, EventHandler, SubscriptionId},
    util::panic_message,
};

struct EngineInner {
    config: HealthConfig,
    registry: HealthCheckRegistry,
    events: EventBus,
    cache: RwLock<BTreeMap<String, HealthCheckResult>>,
    /// Serialises evaluation rounds so compare-and-replace is atomic.
    eval_lock: Mutex<()>,
    pending: parking_lot::Mutex<BTreeSet<String>>,
    wake: mpsc::UnboundedSender<()>,
    shutdown: CancellationToken,
    subscription: parking_lot::Mutex<Option<SubscriptionId>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Keeps the current result per check type and re-evaluates checks when
/// their trigger events fire, on a periodic sweep, and at startup.
///
/// Triggered checks are coalesced over `debounce_window_ms`: every event in
/// a window marks its checks dirty and the window closes with one
/// evaluation per dirty check. `HealthCheckChanged` is published only when
/// severity or message differ from the cached result.
#[derive(Clone)]
pub struct HealthCheckEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for HealthCheckEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckEngine")
            .field("registry", &self.inner.registry)
            .field("cached", &self.inner.cache.read().len())
            .field("pending", &self.inner.pending.lock().len())
            .field("debounce_window_ms", &self.inner.config.debounce_window_ms)
            .finish()
    }
}

/// Bus subscriber that forwards trigger events to the engine. Holds a weak
/// reference so the bus does not keep a stopped engine alive.
struct TriggerListener {
    engine: Weak<EngineInner>,
}

#[async_trait]
impl EventHandler for TriggerListener {
    fn name(&self) -> &str {
        "health::engine"
    }

    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        if let Some(inner) = self.engine.upgrade() {
            inner.on_event(event).await;
        }
        Ok(())
    }
}

impl HealthCheckEngine {
    /// Subscribes to every declared trigger kind, spawns the coalescing and
    /// sweep tasks and, unless disabled, evaluates every check once.
    pub async fn start(
        config: HealthConfig,
        registry: HealthCheckRegistry,
        events: EventBus,
    ) -> Self {
        let (wake, wake_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            config,
            registry,
            events,
            cache: RwLock::new(BTreeMap::new()),
            eval_lock: Mutex::new(()),
            pending: parking_lot::Mutex::new(BTreeSet::new()),
            wake,
            shutdown: CancellationToken::new(),
            subscription: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let kinds = inner.registry.trigger_kinds();
        if !kinds.is_empty() {
            let id = inner.events.subscribe_many(
                kinds.iter().copied(),
                Arc::new(TriggerListener {
                    engine: Arc::downgrade(&inner),
                }),
            );
            *inner.subscription.lock() = Some(id);
        }

        {
            let mut tasks = inner.tasks.lock();
            if !inner.config.debounce_window().is_zero() {
                tasks.push(tokio::spawn(debounce_loop(Arc::clone(&inner), wake_rx)));
            }
            if let Some(period) = inner.config.sweep_interval() {
                tasks.push(tokio::spawn(sweep_loop(Arc::clone(&inner), period)));
            }
        }

        tracing::info!(
            target: "health::engine",
            checks = inner.registry.len(),
            triggers = ?kinds,
            debounce_ms = inner.config.debounce_window_ms,
            "health check engine starting"
        );

        let engine = Self { inner };
        if engine.inner.config.evaluate_on_startup {
            engine.evaluate_all().await;
        }
        engine
    }

    /// Runs every registered check in parallel and returns the snapshot.
    pub async fn evaluate_all(&self) -> Vec<HealthCheckResult> {
        let all = self.inner.registry.check_types();
        self.inner.pending.lock().clear();
        self.inner.evaluate(all).await;
        self.results().into_values().collect()
    }

    /// Re-evaluates the checks registered for this event's kind, honouring
    /// the coalescing window.
    pub async fn on_event(&self, event: &EventEnvelope) {
        self.inner.on_event(event).await;
    }

    /// Evaluates every dirty check now instead of waiting for the window.
    pub async fn flush_pending(&self) -> Vec<HealthCheckResult> {
        self.inner.flush_pending().await
    }

    /// Waits for in-flight event delivery, then flushes. After this returns
    /// every event published before the call is reflected in `results()`.
    pub async fn settle(&self) -> Vec<HealthCheckResult> {
        self.inner.events.wait_idle().await;
        self.inner.flush_pending().await
    }

    /// Copy of the cache.
    pub fn results(&self) -> BTreeMap<String, HealthCheckResult> {
        self.inner.cache.read().clone()
    }

    pub fn result(&self, check_type: &str) -> Option<HealthCheckResult> {
        self.inner.cache.read().get(check_type).cloned()
    }

    /// Worst cached severity; Ok when nothing is cached.
    pub fn overall_severity(&self) -> HealthSeverity {
        self.inner
            .cache
            .read()
            .values()
            .map(|result| result.severity)
            .max()
            .unwrap_or_default()
    }

    pub fn pending(&self) -> Vec<String> {
        self.inner.pending.lock().iter().cloned().collect()
    }

    pub fn registry(&self) -> &HealthCheckRegistry {
        &self.inner.registry
    }

    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        if let Some(id) = self.inner.subscription.lock().take() {
            self.inner.events.unsubscribe(id);
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        join_all(tasks).await;
        tracing::info!(target: "health::engine", "health check engine stopped");
    }
}

impl EngineInner {
    async fn on_event(&self, event: &EventEnvelope) {
        let targets = self.registry.checks_for(event.kind());
        if targets.is_empty() {
            return;
        }
        tracing::debug!(
            target: "health::engine",
            event = %event.kind(),
            sequence = event.meta.sequence,
            checks = ?targets,
            "health checks invalidated"
        );
        self.pending.lock().extend(targets);

        if self.config.debounce_window().is_zero() {
            self.flush_pending().await;
        } else {
            let _ = self.wake.send(());
        }
    }

    async fn flush_pending(&self) -> Vec<HealthCheckResult> {
        let dirty: Vec<String> =
            std::mem::take(&mut *self.pending.lock()).into_iter().collect();
        if dirty.is_empty() {
            return Vec::new();
        }
        self.evaluate(dirty).await
    }

    async fn evaluate_scheduled(&self) -> Vec<HealthCheckResult> {
        let scheduled = self.registry.scheduled_check_types();
        {
            let mut pending = self.pending.lock();
            for check_type in &scheduled {
                pending.remove(check_type);
            }
        }
        self.evaluate(scheduled).await
    }

    /// Evaluates the given checks concurrently, then applies the results
    /// to the cache in check-type order.
    async fn evaluate(&self, check_types: Vec<String>) -> Vec<HealthCheckResult> {
        let _round = self.eval_lock.lock().await;
        let evaluations = check_types
            .iter()
            .filter_map(|check_type| self.registry.get(check_type))
            .map(|entry| run_check(Arc::clone(&entry.check)));
        let results = join_all(evaluations).await;

        for result in &results {
            self.apply(result.clone());
        }
        results
    }

    fn apply(&self, current: HealthCheckResult) {
        let previous = self
            .cache
            .write()
            .insert(current.check_type.clone(), current.clone());

        let changed = match &previous {
            Some(previous) => current.differs_from(previous),
            None => current.differs_from_baseline(),
        };
        if !changed {
            tracing::trace!(
                target: "health::engine",
                check = %current.check_type,
                severity = %current.severity,
                "health check unchanged"
            );
            return;
        }

        if current.severity >= HealthSeverity::Warning {
            tracing::warn!(
                target: "health::engine",
                check = %current.check_type,
                severity = %current.severity,
                message = %current.message,
                "health check changed"
            );
        } else {
            tracing::info!(
                target: "health::engine",
                check = %current.check_type,
                severity = %current.severity,
                message = %current.message,
                "health check changed"
            );
        }
        self.events.publish(DomainEvent::HealthCheckChanged {
            check_type: current.check_type.clone(),
            previous: previous.map(|previous| previous.severity),
            current,
        });
    }
}

/// Evaluates one check, turning errors and panics into Error results.
async fn run_check(check: Arc<dyn HealthCheck>) -> HealthCheckResult {
    let check_type = check.check_type().to_string();
    let outcome = match AssertUnwindSafe(check.evaluate()).catch_unwind().await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            tracing::warn!(
                target: "health::engine",
                check = %check_type,
                error = %format!("{err:#}"),
                "health check failed"
            );
            HealthCheckOutcome::error(format!("{check_type} failed: {err:#}"))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(
                target: "health::engine",
                check = %check_type,
                panic = %message,
                "health check panicked"
            );
            HealthCheckOutcome::error(format!("{check_type} panicked: {message}"))
        }
    };
    outcome.into_result(check_type, Utc::now())
}

async fn debounce_loop(inner: Arc<EngineInner>, mut wake: mpsc::UnboundedReceiver<()>) {
    let window = inner.config.debounce_window();
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            signal = wake.recv() => {
                if signal.is_none() {
                    break;
                }
            }
        }
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(window) => {}
        }
        while wake.try_recv().is_ok() {}
        inner.flush_pending().await;
    }
}

async fn sweep_loop(inner: Arc<EngineInner>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let results = inner.evaluate_scheduled().await;
                tracing::debug!(
                    target: "health::engine",
                    evaluated = results.len(),
                    "periodic health sweep finished"
                );
            }
        }
    }
}
