use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::model::{CommandParameters, CommandTrigger};
use crate::{
    error::{CoreError, Result},
    events::EventBus,
    types::ids::CommandId,
};

/// Scheduling constraints a handler declares for its command type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandlerTraits {
    /// Never run two commands of this name at once.
    pub exclusive: bool,
    /// Shares the single disk slot with every other disk-bound command.
    pub requires_disk_access: bool,
    /// A parameterless enqueue aborts queued instances with narrower
    /// parameters.
    pub supersedes_queued: bool,
}

/// Executable logic for one command name.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;

    fn traits(&self) -> HandlerTraits {
        HandlerTraits::default()
    }

    /// Enqueue-time parameter check. Rejections surface to the caller as
    /// `InvalidParameters` and no command is created.
    fn validate(&self, _parameters: &CommandParameters) -> anyhow::Result<()> {
        Ok(())
    }

    /// Performs the work. The returned value is stored as the command
    /// output; an error marks the command Failed, or Aborted when
    /// cancellation was requested.
    async fn execute(&self, ctx: CommandContext) -> anyhow::Result<Value>;
}

/// Returned by handlers that stop early after observing cancellation.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("command was cancelled")]
pub struct CommandCancelled;

/// Sink for progress messages, implemented by the scheduler.
#[async_trait]
pub(crate) trait ProgressSink: Send + Sync {
    async fn report(&self, id: CommandId, message: String);
}

/// Everything a running handler may read or signal.
#[derive(Clone)]
pub struct CommandContext {
    id: CommandId,
    name: String,
    parameters: CommandParameters,
    trigger: CommandTrigger,
    cancel: CancellationToken,
    events: EventBus,
    progress: Arc<dyn ProgressSink>,
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("trigger", &self.trigger)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl CommandContext {
    pub(crate) fn new(
        id: CommandId,
        name: String,
        parameters: CommandParameters,
        trigger: CommandTrigger,
        cancel: CancellationToken,
        events: EventBus,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            id,
            name,
            parameters,
            trigger,
            cancel,
            events,
            progress,
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &CommandParameters {
        &self.parameters
    }

    pub fn trigger(&self) -> CommandTrigger {
        self.trigger
    }

    /// Bus for domain events produced while the command runs.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Safe-point check for handlers that loop over work items.
    pub fn check_cancelled(&self) -> std::result::Result<(), CommandCancelled> {
        if self.is_cancelled() {
            Err(CommandCancelled)
        } else {
            Ok(())
        }
    }

    /// Records a progress message on the command and publishes
    /// `CommandUpdated`.
    pub async fn set_message(&self, message: impl Into<String>) {
        self.progress.report(self.id, message.into()).await;
    }
}

/// Command name to handler table, filled at startup and read-only after.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if another handler already claimed the name.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) -> Result<()> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(CoreError::Registration(format!(
                "command handler `{name}` registered twice"
            )));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn with(mut self, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        self.register(handler)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn CommandHandler>> {
        self.get(name).ok_or_else(|| CoreError::missing_handler(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> =
            self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
