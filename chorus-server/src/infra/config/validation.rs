use std::collections::HashSet;

use super::models::Config;

/// A non-fatal configuration oddity, logged at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(
        &mut self,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Flags settings that work but probably aren't what the operator meant.
pub fn apply_guard_rails(config: &Config) -> ConfigWarnings {
    let mut warnings = ConfigWarnings::default();
    let commands = &config.engine.commands;

    if commands.max_concurrency == 0 {
        warnings.push_with_hint(
            "commands.max_concurrency is 0; one worker will run",
            "Set max_concurrency to at least 1",
        );
    }
    if commands.max_history == 0 {
        warnings.push("commands.max_history is 0; finished commands are dropped at the next sweep");
    }
    if config.engine.health.sweep_interval_secs == 0 {
        warnings.push("health.sweep_interval_secs is 0; checks only run on events and at startup");
    }

    let mut seen = HashSet::new();
    for artist in &config.catalog.artists {
        if !seen.insert(artist.id) {
            warnings.push(format!(
                "artist {} is listed more than once; the last path wins",
                artist.id
            ));
        }
    }

    let mut task_names = HashSet::new();
    for task in &config.schedule.tasks {
        if !task_names.insert(task.name.to_ascii_lowercase()) {
            warnings.push(format!(
                "scheduled task `{}` is listed more than once",
                task.name
            ));
        }
    }

    warnings
}
