use std::{fmt, sync::Arc};

use anyhow::Context;
use chorus_core::{
    catalog::ArtistCatalog,
    commands::{
        CommandScheduler, CommandStore, InMemoryCommandStore, RecurringTasks,
        SqliteCommandStore,
    },
    events::{DomainEvent, EventBus},
    health::{
        HealthCheckEngine, HealthCheckRegistry,
        checks::{DiskProbe, LocalDiskProbe, RootFolderCheck},
    },
    status::StatusSurface,
};
use tracing::{info, warn};

use crate::{handlers, infra::config::Config};

/// Every long-lived component of a running server.
#[derive(Clone)]
pub struct AppContext {
    config: Arc<Config>,
    events: EventBus,
    catalog: ArtistCatalog,
    health: HealthCheckEngine,
    scheduler: CommandScheduler,
    recurring: RecurringTasks,
    status: StatusSurface,
    sqlite: Option<SqliteCommandStore>,
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("data_dir", &self.config.data_dir)
            .field("scheduler", &self.scheduler)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

/// Opens the SQLite history, or falls back to memory unless persistence is
/// required.
pub async fn open_store(
    config: &Config,
) -> anyhow::Result<(Arc<dyn CommandStore>, Option<SqliteCommandStore>)> {
    let path = config.database_path();
    match SqliteCommandStore::open(&path).await {
        Ok(store) => Ok((Arc::new(store.clone()), Some(store))),
        Err(err) if config.engine.commands.require_persistence => Err(err)
            .with_context(|| format!("failed to open command store at {}", path.display())),
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "command store unavailable; command history will not survive a restart"
            );
            Ok((Arc::new(InMemoryCommandStore::new()), None))
        }
    }
}

/// Seeds the catalog from configuration and starts the health engine with
/// the built-in checks.
pub async fn start_health(
    config: &Config,
    events: &EventBus,
    disk: Arc<dyn DiskProbe>,
) -> anyhow::Result<(ArtistCatalog, HealthCheckEngine)> {
    let catalog = ArtistCatalog::seeded(
        events.clone(),
        config
            .catalog
            .artists
            .iter()
            .map(|artist| (artist.artist_id(), artist.path.clone())),
    );

    let mut checks = HealthCheckRegistry::new();
    checks.register_with(
        Arc::new(RootFolderCheck::new(Arc::new(catalog.clone()), disk)),
        RootFolderCheck::options(),
    )?;

    let health =
        HealthCheckEngine::start(config.engine.health.clone(), checks, events.clone())
            .await;
    Ok((catalog, health))
}

impl AppContext {
    /// Wires the server against SQLite and the local filesystem.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let (store, sqlite) = open_store(&config).await?;
        let mut context = Self::start_with(config, store, Arc::new(LocalDiskProbe)).await?;
        context.sqlite = sqlite;
        Ok(context)
    }

    pub async fn start_with(
        config: Config,
        store: Arc<dyn CommandStore>,
        disk: Arc<dyn DiskProbe>,
    ) -> anyhow::Result<Self> {
        let events = EventBus::new(&config.engine.events);
        let (catalog, health) = start_health(&config, &events, disk.clone()).await?;

        let registry =
            handlers::builtin_registry(health.clone(), catalog.clone(), disk)
                .context("failed to register command handlers")?;
        let scheduler = CommandScheduler::start(
            config.engine.commands.clone(),
            registry,
            store,
            events.clone(),
        )
        .await
        .context("failed to start command scheduler")?;

        let recurring =
            RecurringTasks::new(scheduler.clone(), config.schedule.tasks.clone())
                .context("invalid scheduled task")?;
        recurring.start();

        let status = StatusSurface::new(scheduler.clone(), health.clone())
            .with_recurring(recurring.clone());

        info!(
            artists = catalog.len(),
            scheduled_tasks = config.schedule.tasks.len(),
            degraded = scheduler.is_degraded(),
            "chorus started"
        );
        events.publish(DomainEvent::ApplicationStarted);

        Ok(Self {
            config: Arc::new(config),
            events,
            catalog,
            health,
            scheduler,
            recurring,
            status,
            sqlite: None,
        })
    }

    pub fn config(&self) -> &Config {
        self.config.as_ref()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn catalog(&self) -> &ArtistCatalog {
        &self.catalog
    }

    pub fn health(&self) -> &HealthCheckEngine {
        &self.health
    }

    pub fn scheduler(&self) -> &CommandScheduler {
        &self.scheduler
    }

    pub fn recurring(&self) -> &RecurringTasks {
        &self.recurring
    }

    pub fn status(&self) -> &StatusSurface {
        &self.status
    }

    /// Stops triggers first so nothing new is queued while the scheduler
    /// drains.
    pub async fn shutdown(&self) {
        self.recurring.stop().await;
        self.scheduler.shutdown().await;
        self.health.shutdown().await;
        self.events.wait_idle().await;
        if let Some(store) = &self.sqlite {
            store.close().await;
        }
        info!("chorus stopped");
    }
}
