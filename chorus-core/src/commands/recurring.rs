use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    model::{CommandParameters, CommandTrigger},
    scheduler::{CommandScheduler, EnqueueOutcome},
};
use crate::{
    config::clamped_span,
    error::{CoreError, Result},
    types::ids::CommandId,
};

/// Longest the runner sleeps before re-reading the clock.
const MAX_IDLE: Duration = Duration::from_secs(60);

/// A command enqueued on a fixed interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecurringTask {
    pub name: String,
    pub interval_secs: u64,
    #[serde(default)]
    pub parameters: CommandParameters,
}

impl RecurringTask {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval_secs: interval.as_secs(),
            parameters: CommandParameters::new(),
        }
    }

    /// Clamped to [`MAX_SPAN_SECS`](crate::config::MAX_SPAN_SECS).
    pub fn interval(&self) -> chrono::Duration {
        clamped_span(self.interval_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecurringTaskStatus {
    pub name: String,
    pub interval_secs: u64,
    pub last_queued: Option<DateTime<Utc>>,
    pub last_command: Option<CommandId>,
    pub next_due: DateTime<Utc>,
}

#[derive(Debug)]
struct TaskState {
    task: RecurringTask,
    last_queued: Option<DateTime<Utc>>,
    last_command: Option<CommandId>,
    next_due: DateTime<Utc>,
}

/// Enqueues scheduled commands through the regular scheduler, so a
/// previous instance that is still queued or running absorbs the trigger.
#[derive(Clone)]
pub struct RecurringTasks {
    scheduler: CommandScheduler,
    tasks: Arc<Mutex<Vec<TaskState>>>,
    stop: CancellationToken,
    runner: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for RecurringTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurringTasks")
            .field("tasks", &self.tasks.lock().len())
            .field("running", &self.runner.lock().is_some())
            .finish()
    }
}

impl RecurringTasks {
    /// Every task must name a registered handler and have a non-zero
    /// interval. First runs are due one interval from now.
    pub fn new(
        scheduler: CommandScheduler,
        tasks: impl IntoIterator<Item = RecurringTask>,
    ) -> Result<Self> {
        let now = Utc::now();
        let mut states = Vec::new();
        for task in tasks {
            if !scheduler.registry().contains(&task.name) {
                return Err(CoreError::missing_handler(&task.name));
            }
            if task.interval_secs == 0 {
                return Err(CoreError::InvalidParameters(format!(
                    "recurring task `{}` needs a non-zero interval",
                    task.name
                )));
            }
            states.push(TaskState {
                next_due: now + task.interval(),
                task,
                last_queued: None,
                last_command: None,
            });
        }

        Ok(Self {
            scheduler,
            tasks: Arc::new(Mutex::new(states)),
            stop: CancellationToken::new(),
            runner: Arc::new(Mutex::new(None)),
        })
    }

    /// Enqueues every task due at `now` and schedules its next run.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<EnqueueOutcome> {
        let due: Vec<(usize, RecurringTask)> = self
            .tasks
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, state)| state.next_due <= now)
            .map(|(index, state)| (index, state.task.clone()))
            .collect();

        let mut outcomes = Vec::with_capacity(due.len());
        for (index, task) in due {
            let result = self
                .scheduler
                .enqueue(&task.name, task.parameters.clone(), CommandTrigger::Scheduled)
                .await;

            let mut tasks = self.tasks.lock();
            let Some(state) = tasks.get_mut(index) else {
                continue;
            };
            state.next_due = now + task.interval();
            match result {
                Ok(outcome) => {
                    tracing::debug!(
                        target: "commands::recurring",
                        name = %task.name,
                        command_id = %outcome.id(),
                        duplicate = outcome.is_duplicate(),
                        "scheduled command triggered"
                    );
                    state.last_queued = Some(now);
                    state.last_command = Some(outcome.id());
                    outcomes.push(outcome);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "commands::recurring",
                        name = %task.name,
                        error = %err,
                        "scheduled command could not be queued"
                    );
                }
            }
        }
        outcomes
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.tasks.lock().iter().map(|state| state.next_due).min()
    }

    pub fn status(&self) -> Vec<RecurringTaskStatus> {
        self.tasks
            .lock()
            .iter()
            .map(|state| RecurringTaskStatus {
                name: state.task.name.clone(),
                interval_secs: state.task.interval_secs,
                last_queued: state.last_queued,
                last_command: state.last_command,
                next_due: state.next_due,
            })
            .collect()
    }

    /// Spawns the runner. Calling it twice has no effect.
    pub fn start(&self) {
        let mut runner = self.runner.lock();
        if runner.is_some() {
            return;
        }
        let this = self.clone();
        *runner = Some(tokio::spawn(async move { this.run().await }));
    }

    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.runner.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(&self) {
        tracing::info!(
            target: "commands::recurring",
            tasks = self.tasks.lock().len(),
            "recurring task runner started"
        );
        loop {
            let wait = match self.next_due() {
                Some(due) => (due - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => MAX_IDLE,
            }
            .min(MAX_IDLE);
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        tracing::info!(target: "commands::recurring", "recurring task runner stopped");
    }
}
