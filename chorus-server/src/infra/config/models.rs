use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use chorus_core::{commands::RecurringTask, config::EngineConfig, types::ArtistId};
use serde::{Deserialize, Serialize};

/// Name of the SQLite command history inside `data_dir`.
pub const DATABASE_FILE: &str = "chorus.db";

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub engine: EngineConfig,
    pub catalog: CatalogConfig,
    pub schedule: ScheduleConfig,
    pub metadata: ConfigMetadata,
}

/// Artists seeded into the in-memory catalog at startup.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub artists: Vec<ArtistEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArtistEntry {
    pub id: i64,
    pub path: PathBuf,
}

impl ArtistEntry {
    pub fn artist_id(&self) -> ArtistId {
        ArtistId(self.id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub tasks: Vec<RecurringTask>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tasks: vec![RecurringTask::new(
                "RefreshArtist",
                Duration::from_secs(24 * 60 * 60),
            )],
        }
    }
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

impl Config {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn ensure_directories(&self) -> io::Result<()> {
        fs::create_dir_all(&self.data_dir)
    }

    /// Resolves a relative `data_dir` against the config file's directory.
    pub fn normalize_paths(&mut self) {
        if self.data_dir.is_absolute() {
            return;
        }
        if let Some(base) = self
            .metadata
            .config_path
            .as_deref()
            .and_then(Path::parent)
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            self.data_dir = base.join(&self.data_dir);
        }
    }
}
