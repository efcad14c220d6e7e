use std::{collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_stream::{Stream, StreamExt};

use crate::{
    commands::{
        CommandFilter, CommandRecord, CommandScheduler, RecurringTaskStatus,
        RecurringTasks,
    },
    error::Result,
    events::EventEnvelope,
    health::{HealthCheckEngine, HealthCheckResult, HealthSeverity},
    types::ids::CommandId,
};

/// Read-only view over commands and health for REST and long-poll
/// connectors. Every read is a copy; nothing here mutates engine state.
#[derive(Clone)]
pub struct StatusSurface {
    scheduler: CommandScheduler,
    health: HealthCheckEngine,
    recurring: Option<RecurringTasks>,
}

impl fmt::Debug for StatusSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusSurface")
            .field("scheduler", &self.scheduler)
            .field("health", &self.health)
            .field("recurring", &self.recurring.is_some())
            .finish()
    }
}

impl StatusSurface {
    pub fn new(scheduler: CommandScheduler, health: HealthCheckEngine) -> Self {
        Self {
            scheduler,
            health,
            recurring: None,
        }
    }

    pub fn with_recurring(mut self, recurring: RecurringTasks) -> Self {
        self.recurring = Some(recurring);
        self
    }

    pub async fn commands(&self, filter: &CommandFilter) -> Vec<CommandRecord> {
        self.scheduler.list(filter).await
    }

    pub async fn command(&self, id: CommandId) -> Result<CommandRecord> {
        self.scheduler.get_status(id).await
    }

    /// Whether a command with this name is queued or running, the check
    /// behind "is searching" style indicators.
    pub async fn is_running(&self, name: &str) -> bool {
        self.scheduler.is_active(name).await
    }

    /// Cached health results ordered by check type.
    pub fn health(&self) -> Vec<HealthCheckResult> {
        self.health.results().into_values().collect()
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            taken_at: Utc::now(),
            commands: self.scheduler.list(&CommandFilter::all()).await,
            health: self.health(),
            overall: self.health.overall_severity(),
            degraded: self.scheduler.is_degraded(),
            recurring: self
                .recurring
                .as_ref()
                .map(RecurringTasks::status)
                .unwrap_or_default(),
        }
    }

    /// Every published event from now on. Slow readers skip events they
    /// fell behind on and should re-read a snapshot.
    pub fn updates(&self) -> impl Stream<Item = Arc<EventEnvelope>> + Send + 'static {
        self.scheduler
            .events()
            .stream()
            .filter_map(|item| item.ok())
    }
}

/// Point-in-time copy of everything a client renders.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Most recently queued first.
    pub commands: Vec<CommandRecord>,
    pub health: Vec<HealthCheckResult>,
    pub overall: HealthSeverity,
    /// Command state is only held in memory.
    pub degraded: bool,
    pub recurring: Vec<RecurringTaskStatus>,
}

/// Items that changed between two snapshots.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatusDiff {
    pub changed_commands: Vec<CommandRecord>,
    pub removed_commands: Vec<CommandId>,
    pub changed_health: Vec<HealthCheckResult>,
    pub removed_health: Vec<String>,
}

impl StatusDiff {
    pub fn is_empty(&self) -> bool {
        self.changed_commands.is_empty()
            && self.removed_commands.is_empty()
            && self.changed_health.is_empty()
            && self.removed_health.is_empty()
    }
}

impl StatusSnapshot {
    /// What a polling client must re-render after `previous`. Health
    /// entries count as changed only on severity or message.
    pub fn diff(&self, previous: &StatusSnapshot) -> StatusDiff {
        let old_commands: HashMap<CommandId, &CommandRecord> = previous
            .commands
            .iter()
            .map(|record| (record.id, record))
            .collect();
        let new_commands: HashMap<CommandId, &CommandRecord> = self
            .commands
            .iter()
            .map(|record| (record.id, record))
            .collect();

        let changed_commands = self
            .commands
            .iter()
            .filter(|record| old_commands.get(&record.id) != Some(record))
            .cloned()
            .collect();
        let removed_commands = previous
            .commands
            .iter()
            .filter(|record| !new_commands.contains_key(&record.id))
            .map(|record| record.id)
            .collect();

        let old_health: HashMap<&str, &HealthCheckResult> = previous
            .health
            .iter()
            .map(|result| (result.check_type.as_str(), result))
            .collect();
        let changed_health = self
            .health
            .iter()
            .filter(|result| {
                old_health
                    .get(result.check_type.as_str())
                    .is_none_or(|old| result.differs_from(old))
            })
            .cloned()
            .collect();
        let removed_health = previous
            .health
            .iter()
            .filter(|old| {
                !self
                    .health
                    .iter()
                    .any(|result| result.check_type == old.check_type)
            })
            .map(|old| old.check_type.clone())
            .collect();

        StatusDiff {
            changed_commands,
            removed_commands,
            changed_health,
            removed_health,
        }
    }
}
