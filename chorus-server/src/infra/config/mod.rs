pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    ArtistEntry, CatalogConfig, Config, ConfigMetadata, ScheduleConfig,
};
pub use validation::{ConfigWarning, ConfigWarnings};
