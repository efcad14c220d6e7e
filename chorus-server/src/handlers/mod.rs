//! Command handlers shipped with the server.

pub mod check_health;
pub mod refresh_artist;

use std::sync::Arc;

use chorus_core::{
    catalog::ArtistCatalog, commands::HandlerRegistry,
    health::{HealthCheckEngine, checks::DiskProbe},
};

pub use check_health::{CHECK_HEALTH, CheckHealthHandler};
pub use refresh_artist::{REFRESH_ARTIST, RefreshArtistHandler};

/// Registry holding every built-in handler.
pub fn builtin_registry(
    health: HealthCheckEngine,
    catalog: ArtistCatalog,
    disk: Arc<dyn DiskProbe>,
) -> chorus_core::Result<HandlerRegistry> {
    HandlerRegistry::new()
        .with(Arc::new(CheckHealthHandler::new(health)))?
        .with(Arc::new(RefreshArtistHandler::new(catalog, disk)))
}
