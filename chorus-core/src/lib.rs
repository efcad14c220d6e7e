//! # Chorus Core
//!
//! Background machinery for the Chorus music library manager: the command
//! engine that runs long operations off the request path, the health
//! engine that watches the installation, and the in-process event bus that
//! connects them.
//!
//! ## Overview
//!
//! - **Event Bus**: typed domain events fanned out to subscribers, each on
//!   its own ordered delivery task
//! - **Command Scheduler**: deduplicated, persisted, bounded-concurrency
//!   execution of named commands with lifecycle events
//! - **Health Check Engine**: cached check results re-evaluated on trigger
//!   events (coalesced), on a periodic sweep and at startup
//! - **Status Surface**: copy-on-read views for REST and long-poll clients
//!
//! ## Architecture
//!
//! - [`events`]: domain events and the [`events::EventBus`]
//! - [`commands`]: command records, handlers, stores and the scheduler
//! - [`health`]: check registry, engine and built-in checks
//! - [`status`]: status snapshots and diffs for polling clients
//! - [`optimistic`]: tentative client state resolved by command outcomes
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chorus_core::{
//!     commands::{
//!         CommandParameters, CommandScheduler, CommandTrigger,
//!         HandlerRegistry, InMemoryCommandStore,
//!     },
//!     config::EngineConfig,
//!     events::EventBus,
//! };
//!
//! async fn search_albums(
//!     registry: HandlerRegistry,
//! ) -> chorus_core::Result<()> {
//!     let config = EngineConfig::default();
//!     let bus = EventBus::new(&config.events);
//!     let scheduler = CommandScheduler::start(
//!         config.commands,
//!         registry,
//!         Arc::new(InMemoryCommandStore::new()),
//!         bus,
//!     )
//!     .await?;
//!
//!     let outcome = scheduler
//!         .enqueue(
//!             "AlbumSearch",
//!             CommandParameters::new().with("albumIds", vec![1, 2, 3]),
//!             CommandTrigger::Manual,
//!         )
//!         .await?;
//!     let finished = scheduler.wait_for_terminal(outcome.id()).await?;
//!     println!("{} ended {}", finished.name, finished.status);
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]

pub mod catalog;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod optimistic;
pub mod status;
pub mod types;

mod util;

pub use error::{CoreError, Result};
