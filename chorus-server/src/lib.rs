//! # Chorus Server
//!
//! Process wiring for the Chorus background engines.
//!
//! ## Overview
//!
//! - **Configuration**: `chorus.toml`, `.env` and `CHORUS_*` variables
//! - **Command engine**: SQLite-backed history, built-in handlers and
//!   recurring triggers
//! - **Health engine**: root folder monitoring over the configured catalog
//!
//! The binary runs until Ctrl-C or SIGTERM and also offers `history` and
//! `health` subcommands for inspecting a stopped installation.

pub mod handlers;
pub mod infra;
