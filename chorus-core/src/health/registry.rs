use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;

use super::model::HealthCheckOutcome;
use crate::{
    error::{CoreError, Result},
    events::EventKind,
};

/// A pluggable evaluator of installation health.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Unique identifier; also the cache key.
    fn check_type(&self) -> &str;

    async fn evaluate(&self) -> anyhow::Result<HealthCheckOutcome>;
}

/// How a check is wired into the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckOptions {
    /// Event kinds that trigger a targeted re-evaluation.
    pub triggers: Vec<EventKind>,
    /// Include the check in the periodic sweep.
    pub on_schedule: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            triggers: Vec::new(),
            on_schedule: true,
        }
    }
}

impl CheckOptions {
    pub fn triggered_by(triggers: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            triggers: triggers.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn on_schedule(mut self, on_schedule: bool) -> Self {
        self.on_schedule = on_schedule;
        self
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredCheck {
    pub(crate) check: Arc<dyn HealthCheck>,
    pub(crate) options: CheckOptions,
}

/// Check implementations keyed by type, plus the reverse index from event
/// kind to interested checks.
#[derive(Default, Clone)]
pub struct HealthCheckRegistry {
    checks: BTreeMap<String, RegisteredCheck>,
    by_event: HashMap<EventKind, BTreeSet<String>>,
}

impl fmt::Debug for HealthCheckRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let triggers: BTreeMap<&str, &[EventKind]> = self
            .checks
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.options.triggers.as_slice()))
            .collect();
        f.debug_struct("HealthCheckRegistry")
            .field("checks", &triggers)
            .finish()
    }
}

impl HealthCheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a check for the given trigger kinds. A check with no
    /// triggers only runs in sweeps.
    pub fn register(
        &mut self,
        check: Arc<dyn HealthCheck>,
        triggers: impl IntoIterator<Item = EventKind>,
    ) -> Result<()> {
        self.register_with(check, CheckOptions::triggered_by(triggers))
    }

    pub fn register_with(
        &mut self,
        check: Arc<dyn HealthCheck>,
        mut options: CheckOptions,
    ) -> Result<()> {
        let check_type = check.check_type().to_string();
        if self.checks.contains_key(&check_type) {
            return Err(CoreError::Registration(format!(
                "health check `{check_type}` registered twice"
            )));
        }
        options.triggers.sort();
        options.triggers.dedup();
        for kind in &options.triggers {
            self.by_event
                .entry(*kind)
                .or_default()
                .insert(check_type.clone());
        }
        self.checks
            .insert(check_type, RegisteredCheck { check, options });
        Ok(())
    }

    pub fn contains(&self, check_type: &str) -> bool {
        self.checks.contains_key(check_type)
    }

    pub fn options(&self, check_type: &str) -> Option<&CheckOptions> {
        self.checks.get(check_type).map(|entry| &entry.options)
    }

    pub(crate) fn get(&self, check_type: &str) -> Option<&RegisteredCheck> {
        self.checks.get(check_type)
    }

    /// Check types interested in `kind`, sorted.
    pub fn checks_for(&self, kind: EventKind) -> Vec<String> {
        self.by_event
            .get(&kind)
            .map(|types| types.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every event kind at least one check listens to.
    pub fn trigger_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.by_event.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn check_types(&self) -> Vec<String> {
        self.checks.keys().cloned().collect()
    }

    pub fn scheduled_check_types(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|(_, entry)| entry.options.on_schedule)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl HealthCheck for Fixed {
        fn check_type(&self) -> &str {
            self.0
        }

        async fn evaluate(&self) -> anyhow::Result<HealthCheckOutcome> {
            Ok(HealthCheckOutcome::ok())
        }
    }

    #[test]
    fn event_index_tracks_declared_triggers() {
        let mut registry = HealthCheckRegistry::new();
        registry
            .register(
                Arc::new(Fixed("RootFolderCheck")),
                [EventKind::ArtistDeleted, EventKind::ArtistMoved],
            )
            .expect("register root folder");
        registry
            .register(Arc::new(Fixed("IndexerCheck")), [EventKind::IndexerUpdated])
            .expect("register indexer");
        registry
            .register_with(
                Arc::new(Fixed("UpdateCheck")),
                CheckOptions::default().on_schedule(false),
            )
            .expect("register update");

        assert_eq!(
            registry.checks_for(EventKind::ArtistDeleted),
            vec!["RootFolderCheck".to_string()]
        );
        assert!(registry.checks_for(EventKind::ConfigSaved).is_empty());
        assert_eq!(
            registry.trigger_kinds(),
            vec![
                EventKind::ArtistDeleted,
                EventKind::ArtistMoved,
                EventKind::IndexerUpdated
            ]
        );
        assert_eq!(
            registry.scheduled_check_types(),
            vec!["IndexerCheck".to_string(), "RootFolderCheck".to_string()]
        );
    }

    #[test]
    fn duplicate_check_types_are_rejected() {
        let mut registry = HealthCheckRegistry::new();
        registry
            .register_with(Arc::new(Fixed("RootFolderCheck")), CheckOptions::default())
            .expect("first");
        assert!(matches!(
            registry.register_with(
                Arc::new(Fixed("RootFolderCheck")),
                CheckOptions::default()
            ),
            Err(CoreError::Registration(_))
        ));
    }
}
