use std::path::PathBuf;

use chorus_core::config::{CommandConfig, EventBusConfig, HealthConfig};
use serde::{Deserialize, Serialize};

use super::models::{CatalogConfig, ScheduleConfig};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub events: EventBusConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Absent means the default schedule; an empty task list disables it.
    pub schedule: Option<ScheduleConfig>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub max_concurrency: Option<usize>,
    pub require_persistence: Option<bool>,
    pub health_debounce_ms: Option<u64>,
    /// Variables that were set but could not be parsed.
    pub rejected: Vec<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        let mut env_config = Self::default();

        env_config.config_path =
            std::env::var("CHORUS_CONFIG").ok().map(PathBuf::from);
        env_config.data_dir =
            std::env::var("CHORUS_DATA_DIR").ok().map(PathBuf::from);
        env_config.max_concurrency =
            env_config.parse_var("CHORUS_MAX_CONCURRENCY");
        env_config.require_persistence = match std::env::var(
            "CHORUS_REQUIRE_PERSISTENCE",
        ) {
            Ok(raw) => {
                let parsed = parse_bool(&raw);
                if parsed.is_none() {
                    env_config
                        .rejected
                        .push("CHORUS_REQUIRE_PERSISTENCE".to_string());
                }
                parsed
            }
            Err(_) => None,
        };
        env_config.health_debounce_ms =
            env_config.parse_var("CHORUS_HEALTH_DEBOUNCE_MS");

        env_config
    }

    fn parse_var<T: std::str::FromStr>(&mut self, name: &str) -> Option<T> {
        let raw = std::env::var(name).ok()?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                self.rejected.push(name.to_string());
                None
            }
        }
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
