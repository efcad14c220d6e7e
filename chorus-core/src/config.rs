use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Longest span (about 100 years) a configured retention or interval is
/// taken to mean. Larger values are clamped so date arithmetic stays in
/// range.
pub const MAX_SPAN_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// `secs` as a chrono span, clamped to [`MAX_SPAN_SECS`].
pub(crate) fn clamped_span(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_SPAN_SECS) as i64)
}

/// Global knobs that tune the command and health engines.
///
/// All fields carry defaults so a deployment can supply a partial
/// configuration payload and pick up new settings progressively.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool sizing, history retention and persistence policy.
    pub commands: CommandConfig,
    /// Health check coalescing and sweep cadence.
    pub health: HealthConfig,
    /// Event bus sizing.
    pub events: EventBusConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Maximum number of commands in the Started state at once. Kept small
    /// so indexer and metadata APIs are not flooded. Zero is treated as 1;
    /// see [`CommandConfig::worker_count`].
    pub max_concurrency: usize,
    /// Terminal commands older than this are pruned (seconds). Clamped to
    /// [`MAX_SPAN_SECS`].
    pub retention_secs: u64,
    /// Upper bound on terminal commands kept in history.
    pub max_history: usize,
    /// Cadence of the retention sweep (seconds).
    pub housekeeping_interval_secs: u64,
    /// Refuse to start when the command store cannot be read.
    pub require_persistence: bool,
    /// How long shutdown waits for running handlers (milliseconds).
    pub shutdown_grace_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            retention_secs: 24 * 60 * 60,
            max_history: 1_000,
            housekeeping_interval_secs: 5 * 60,
            require_persistence: false,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl CommandConfig {
    pub fn retention(&self) -> chrono::Duration {
        clamped_span(self.retention_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Worker count actually spawned. A `max_concurrency` of 0 would never
    /// run anything, so it is clamped to one worker.
    pub fn worker_count(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Coalescing window for event-triggered re-evaluation (milliseconds).
    /// Zero evaluates on every trigger.
    pub debounce_window_ms: u64,
    /// Cadence of the periodic full sweep (seconds). Zero disables it.
    pub sweep_interval_secs: u64,
    /// Run every registered check once when the engine starts.
    pub evaluate_on_startup: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 500,
            sweep_interval_secs: 6 * 60 * 60,
            evaluate_on_startup: true,
        }
    }
}

impl HealthConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Buffer of the broadcast tap used by status streams. Slow tap readers
    /// lag and skip; subscribed handlers never do.
    pub tap_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { tap_capacity: 1_024 }
    }
}
