//! Background command execution: records, handlers, persistence and the
//! scheduler that ties them together.

pub mod handler;
pub mod model;
pub mod recurring;
pub mod scheduler;
pub mod sqlite;
pub mod store;

pub use handler::{
    CommandCancelled, CommandContext, CommandHandler, HandlerRegistry,
    HandlerTraits,
};
pub use model::{
    CommandFilter, CommandParameters, CommandRecord, CommandResult,
    CommandStatus, CommandTrigger, DedupeKey,
};
pub use recurring::{RecurringTask, RecurringTaskStatus, RecurringTasks};
pub use scheduler::{CommandScheduler, EnqueueDisposition, EnqueueOutcome};
pub use sqlite::SqliteCommandStore;
pub use store::{CommandStore, InMemoryCommandStore};
