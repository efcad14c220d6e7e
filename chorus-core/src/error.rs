use thiserror::Error;

use crate::types::ids::CommandId;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Command not found: {0}")]
    NotFound(CommandId),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    #[error("Scheduler has shut down")]
    ShutDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn missing_handler(name: &str) -> Self {
        CoreError::Registration(format!(
            "no command handler registered for `{name}`"
        ))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
