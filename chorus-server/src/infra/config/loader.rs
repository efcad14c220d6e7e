use std::{
    fs,
    path::{Path, PathBuf},
};

use chorus_core::config::EngineConfig;
use once_cell::sync::Lazy;
use thiserror::Error;

use super::{
    models::{Config, ConfigMetadata, ScheduleConfig},
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("chorus.toml"),
        PathBuf::from("config/chorus.toml"),
    ]
});

const DEFAULT_DATA_DIR: &str = "./data";

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file {path} does not exist")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to load .env file")]
    EnvFile(#[from] dotenvy::Error),
    #[error("failed to prepare data directory")]
    Filesystem {
        #[source]
        source: std::io::Error,
    },
}

/// Configuration plus the warnings produced while resolving it.
#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// Resolves configuration with precedence: explicit options, then
/// environment, then file, then defaults.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provenance {
    Explicit,
    Env,
    Default,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env`, reads the process environment and resolves the file.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        self.load_with_env(EnvConfig::gather(), env_file_loaded)
    }

    /// Resolves against an already gathered environment.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        self.compose_config(file_config, env, config_path, env_file_loaded)
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let resolved = if let Some(explicit) = &self.options.config_path {
            Some((explicit.clone(), Provenance::Explicit))
        } else if let Some(from_env) = &env.config_path {
            Some((from_env.clone(), Provenance::Env))
        } else {
            DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
                .map(|path| (path.clone(), Provenance::Default))
        };

        let Some((path, provenance)) = resolved else {
            return Ok((None, None));
        };
        if !path.exists() {
            if provenance == Provenance::Explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        if file_config.is_none() {
            warnings.push_with_hint(
                "No chorus.toml detected; using defaults and environment variables",
                "Create chorus.toml or point CHORUS_CONFIG at a configuration file",
            );
        }
        for name in &env.rejected {
            warnings.push(format!("ignoring unparsable value in {name}"));
        }

        let FileConfig {
            data_dir: file_data_dir,
            mut commands,
            mut health,
            events,
            catalog,
            schedule: file_schedule,
        } = file_config.unwrap_or_default();

        if let Some(max) = env.max_concurrency {
            commands.max_concurrency = max;
        }
        if let Some(required) = env.require_persistence {
            commands.require_persistence = required;
        }
        if let Some(window) = env.health_debounce_ms {
            health.debounce_window_ms = window;
        }

        let data_dir = env
            .data_dir
            .or(file_data_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let mut config = Config {
            data_dir,
            engine: EngineConfig {
                commands,
                health,
                events,
            },
            catalog,
            schedule: file_schedule.unwrap_or_else(ScheduleConfig::default),
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        };

        config.normalize_paths();
        config
            .ensure_directories()
            .map_err(|source| ConfigLoadError::Filesystem { source })?;

        warnings.extend(validation::apply_guard_rails(&config));
        Ok(ConfigLoad { config, warnings })
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
