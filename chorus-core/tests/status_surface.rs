mod support;

use std::{path::PathBuf, sync::Arc, time::Duration};

use chorus_core::{
    catalog::ArtistCatalog,
    commands::{
        CommandFilter, CommandParameters, CommandStatus, CommandTrigger,
        HandlerRegistry, RecurringTask, RecurringTasks,
    },
    config::HealthConfig,
    events::{EventBus, EventKind},
    health::{
        HealthCheckEngine, HealthCheckRegistry, HealthSeverity,
        checks::{DiskProbe, ROOT_FOLDER_CHECK, RootFolderCheck},
    },
    optimistic::{OptimisticCell, Resolution},
    status::StatusSurface,
    types::ArtistId,
};
use tokio_stream::StreamExt;

use support::{
    FailingHandler, GatedHandler, commands_config, finished, start_scheduler,
    wait_for_status,
};

/// Every folder except `/music/jazz` exists.
struct FakeDisk;

#[async_trait::async_trait]
impl DiskProbe for FakeDisk {
    async fn folder_exists(&self, path: &std::path::Path) -> bool {
        path != std::path::Path::new("/music/jazz")
    }
}

async fn health_for(catalog: &ArtistCatalog, bus: &EventBus) -> HealthCheckEngine {
    let mut registry = HealthCheckRegistry::new();
    registry
        .register_with(
            Arc::new(RootFolderCheck::new(Arc::new(catalog.clone()), Arc::new(FakeDisk))),
            RootFolderCheck::options(),
        )
        .expect("register");
    let config = HealthConfig {
        debounce_window_ms: 0,
        sweep_interval_secs: 0,
        evaluate_on_startup: true,
    };
    HealthCheckEngine::start(config, registry, bus.clone()).await
}

#[tokio::test]
async fn snapshot_reports_commands_health_and_schedule() {
    let refresh = GatedHandler::new("RefreshArtist");
    let registry = HandlerRegistry::new().with(refresh.clone()).expect("register");
    let h = start_scheduler(commands_config(1), registry).await;

    let catalog = ArtistCatalog::seeded(
        h.bus.clone(),
        [
            (ArtistId(1), PathBuf::from("/music/rock/Queen")),
            (ArtistId(2), PathBuf::from("/music/jazz/Coltrane")),
        ],
    );
    let health = health_for(&catalog, &h.bus).await;
    let recurring = RecurringTasks::new(
        h.scheduler.clone(),
        [RecurringTask::new("RefreshArtist", Duration::from_secs(3600))],
    )
    .expect("tasks");
    let surface = StatusSurface::new(h.scheduler.clone(), health.clone())
        .with_recurring(recurring);

    let outcome = h
        .scheduler
        .enqueue(
            "RefreshArtist",
            CommandParameters::new().with("artistId", 2),
            CommandTrigger::Manual,
        )
        .await
        .expect("enqueue");
    wait_for_status(&h.scheduler, outcome.id(), CommandStatus::Started).await;

    assert!(surface.is_running("RefreshArtist").await);
    assert!(surface.is_running("refreshartist").await);
    assert!(!surface.is_running("AlbumSearch").await);

    let snapshot = surface.snapshot().await;
    assert_eq!(snapshot.commands.len(), 1);
    assert_eq!(snapshot.commands[0].status, CommandStatus::Started);
    assert_eq!(snapshot.overall, HealthSeverity::Error);
    assert_eq!(snapshot.health.len(), 1);
    assert_eq!(snapshot.health[0].message, "Missing root folder: /music/jazz");
    assert!(!snapshot.degraded);
    assert_eq!(snapshot.recurring.len(), 1);
    assert_eq!(snapshot.recurring[0].name, "RefreshArtist");

    catalog.remove(ArtistId(2), false);
    health.settle().await;
    refresh.release(1);
    finished(&h.scheduler, outcome.id()).await;

    let later = surface.snapshot().await;
    let diff = later.diff(&snapshot);
    assert_eq!(diff.changed_commands.len(), 1);
    assert_eq!(diff.changed_commands[0].status, CommandStatus::Completed);
    assert_eq!(diff.changed_health.len(), 1);
    assert_eq!(diff.changed_health[0].check_type, ROOT_FOLDER_CHECK);
    assert_eq!(later.overall, HealthSeverity::Ok);
    assert!(!surface.is_running("RefreshArtist").await);

    let active = surface.commands(&CommandFilter::active()).await;
    assert!(active.is_empty());

    health.shutdown().await;
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn updates_stream_carries_lifecycle_events() {
    let refresh = GatedHandler::new("RefreshArtist");
    let registry = HandlerRegistry::new().with(refresh.clone()).expect("register");
    let h = start_scheduler(commands_config(1), registry).await;
    let catalog = ArtistCatalog::new(h.bus.clone());
    let health = health_for(&catalog, &h.bus).await;
    let surface = StatusSurface::new(h.scheduler.clone(), health.clone());

    let updates = surface.updates();
    tokio::pin!(updates);

    let outcome = h
        .scheduler
        .enqueue("RefreshArtist", CommandParameters::new(), CommandTrigger::Manual)
        .await
        .expect("enqueue");
    refresh.release(1);
    finished(&h.scheduler, outcome.id()).await;

    let mut kinds = Vec::new();
    while kinds.last() != Some(&EventKind::CommandCompleted) {
        let envelope = tokio::time::timeout(Duration::from_secs(5), updates.next())
            .await
            .expect("event in time")
            .expect("stream open");
        kinds.push(envelope.kind());
    }
    assert_eq!(
        kinds,
        vec![
            EventKind::CommandQueued,
            EventKind::CommandStarted,
            EventKind::CommandCompleted
        ]
    );
    health.shutdown().await;
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn optimistic_change_follows_the_command_outcome() {
    let monitor = GatedHandler::new("SetArtistMonitored");
    let registry = HandlerRegistry::new()
        .with(monitor.clone())
        .and_then(|registry| {
            registry.with(Arc::new(FailingHandler {
                name: "DeleteArtist",
            }))
        })
        .expect("register");
    let h = start_scheduler(commands_config(2), registry).await;

    let monitored = OptimisticCell::new(false);
    let revision = monitored.apply(true);
    let outcome = h
        .scheduler
        .enqueue(
            "SetArtistMonitored",
            CommandParameters::new().with("artistId", 7),
            CommandTrigger::Manual,
        )
        .await
        .expect("enqueue");
    assert!(monitored.get());
    monitor.release(1);
    let resolution = monitored
        .resolve_with_command(revision, &h.scheduler, outcome.id())
        .await
        .expect("resolved");
    assert_eq!(resolution, Resolution::Confirmed);
    assert!(monitored.get());
    assert!(!monitored.is_pending());

    let present = OptimisticCell::new(true);
    let revision = present.apply(false);
    let outcome = h
        .scheduler
        .enqueue(
            "DeleteArtist",
            CommandParameters::new().with("artistId", 7),
            CommandTrigger::Manual,
        )
        .await
        .expect("enqueue");
    let resolution = present
        .resolve_with_command(revision, &h.scheduler, outcome.id())
        .await
        .expect("resolved");
    assert_eq!(resolution, Resolution::RolledBack);
    assert!(present.get());
    h.scheduler.shutdown().await;
}
