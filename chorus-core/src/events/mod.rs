//! Domain events and the in-process bus that fans them out.

pub mod bus;

use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    commands::model::{CommandStatus, CommandTrigger},
    health::model::{HealthCheckResult, HealthSeverity},
    types::ids::{AlbumId, ArtistId, CommandId, IndexerId},
};

pub use bus::{EventBus, EventHandler, FnEventHandler, SubscriptionId};

/// Identifies the kind of a domain occurrence. Subscriptions and health
/// check triggers are keyed by this value.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EventKind {
    ApplicationStarted,
    ArtistAdded,
    ArtistUpdated,
    ArtistDeleted,
    ArtistMoved,
    AlbumImported,
    IndexerUpdated,
    IndexerDeleted,
    ConfigSaved,
    CommandQueued,
    CommandStarted,
    CommandUpdated,
    CommandCompleted,
    CommandFailed,
    CommandAborted,
    HealthCheckChanged,
}

pub const ALL_EVENT_KINDS: [EventKind; 16] = [
    EventKind::ApplicationStarted,
    EventKind::ArtistAdded,
    EventKind::ArtistUpdated,
    EventKind::ArtistDeleted,
    EventKind::ArtistMoved,
    EventKind::AlbumImported,
    EventKind::IndexerUpdated,
    EventKind::IndexerDeleted,
    EventKind::ConfigSaved,
    EventKind::CommandQueued,
    EventKind::CommandStarted,
    EventKind::CommandUpdated,
    EventKind::CommandCompleted,
    EventKind::CommandFailed,
    EventKind::CommandAborted,
    EventKind::HealthCheckChanged,
];

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ApplicationStarted => "ApplicationStarted",
            EventKind::ArtistAdded => "ArtistAdded",
            EventKind::ArtistUpdated => "ArtistUpdated",
            EventKind::ArtistDeleted => "ArtistDeleted",
            EventKind::ArtistMoved => "ArtistMoved",
            EventKind::AlbumImported => "AlbumImported",
            EventKind::IndexerUpdated => "IndexerUpdated",
            EventKind::IndexerDeleted => "IndexerDeleted",
            EventKind::ConfigSaved => "ConfigSaved",
            EventKind::CommandQueued => "CommandQueued",
            EventKind::CommandStarted => "CommandStarted",
            EventKind::CommandUpdated => "CommandUpdated",
            EventKind::CommandCompleted => "CommandCompleted",
            EventKind::CommandFailed => "CommandFailed",
            EventKind::CommandAborted => "CommandAborted",
            EventKind::HealthCheckChanged => "HealthCheckChanged",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier-only view of a command carried by lifecycle events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSummary {
    pub command_id: CommandId,
    pub name: String,
    pub trigger: CommandTrigger,
    pub status: CommandStatus,
}

/// Typed domain occurrences. Payloads hold identifiers and small values,
/// never full entity graphs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DomainEvent {
    ApplicationStarted,
    ArtistAdded {
        artist_id: ArtistId,
        path: PathBuf,
    },
    ArtistUpdated {
        artist_id: ArtistId,
    },
    ArtistDeleted {
        artist_id: ArtistId,
        delete_files: bool,
    },
    ArtistMoved {
        artist_id: ArtistId,
        source_path: PathBuf,
        destination_path: PathBuf,
    },
    AlbumImported {
        artist_id: ArtistId,
        album_id: AlbumId,
    },
    IndexerUpdated {
        indexer_id: IndexerId,
    },
    IndexerDeleted {
        indexer_id: IndexerId,
    },
    ConfigSaved,
    CommandQueued(CommandSummary),
    CommandStarted(CommandSummary),
    CommandUpdated {
        command: CommandSummary,
        message: String,
    },
    CommandCompleted(CommandSummary),
    CommandFailed {
        command: CommandSummary,
        reason: String,
    },
    CommandAborted {
        command: CommandSummary,
        reason: String,
    },
    HealthCheckChanged {
        check_type: String,
        previous: Option<HealthSeverity>,
        current: HealthCheckResult,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::ApplicationStarted => EventKind::ApplicationStarted,
            DomainEvent::ArtistAdded { .. } => EventKind::ArtistAdded,
            DomainEvent::ArtistUpdated { .. } => EventKind::ArtistUpdated,
            DomainEvent::ArtistDeleted { .. } => EventKind::ArtistDeleted,
            DomainEvent::ArtistMoved { .. } => EventKind::ArtistMoved,
            DomainEvent::AlbumImported { .. } => EventKind::AlbumImported,
            DomainEvent::IndexerUpdated { .. } => EventKind::IndexerUpdated,
            DomainEvent::IndexerDeleted { .. } => EventKind::IndexerDeleted,
            DomainEvent::ConfigSaved => EventKind::ConfigSaved,
            DomainEvent::CommandQueued(_) => EventKind::CommandQueued,
            DomainEvent::CommandStarted(_) => EventKind::CommandStarted,
            DomainEvent::CommandUpdated { .. } => EventKind::CommandUpdated,
            DomainEvent::CommandCompleted(_) => EventKind::CommandCompleted,
            DomainEvent::CommandFailed { .. } => EventKind::CommandFailed,
            DomainEvent::CommandAborted { .. } => EventKind::CommandAborted,
            DomainEvent::HealthCheckChanged { .. } => {
                EventKind::HealthCheckChanged
            }
        }
    }

    /// Command id for lifecycle events, `None` for everything else.
    pub fn command_id(&self) -> Option<CommandId> {
        match self {
            DomainEvent::CommandQueued(summary)
            | DomainEvent::CommandStarted(summary)
            | DomainEvent::CommandCompleted(summary) => Some(summary.command_id),
            DomainEvent::CommandUpdated { command, .. }
            | DomainEvent::CommandFailed { command, .. }
            | DomainEvent::CommandAborted { command, .. } => {
                Some(command.command_id)
            }
            _ => None,
        }
    }
}

/// Publication metadata attached by the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Strictly increasing per bus instance.
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
}

/// Fully qualified event with metadata and payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub meta: EventMeta,
    pub event: DomainEvent,
}

impl EventEnvelope {
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}
