mod support;

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chorus_core::{
    catalog::ArtistCatalog,
    config::HealthConfig,
    events::{DomainEvent, EventBus, EventKind},
    health::{
        CheckOptions, HealthCheck, HealthCheckEngine, HealthCheckOutcome,
        HealthCheckRegistry, HealthSeverity,
        checks::{LocalDiskProbe, ROOT_FOLDER_CHECK, RootFolderCheck},
    },
    types::ArtistId,
};

use support::drain;

fn immediate() -> HealthConfig {
    HealthConfig {
        debounce_window_ms: 0,
        sweep_interval_secs: 0,
        evaluate_on_startup: true,
    }
}

/// Counts evaluations and reports whatever severity it is told to.
struct CountingCheck {
    check_type: &'static str,
    runs: AtomicUsize,
}

impl CountingCheck {
    fn new(check_type: &'static str) -> Arc<Self> {
        Arc::new(Self {
            check_type,
            runs: AtomicUsize::new(0),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for CountingCheck {
    fn check_type(&self) -> &str {
        self.check_type
    }

    async fn evaluate(&self) -> anyhow::Result<HealthCheckOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(HealthCheckOutcome::ok())
    }
}

struct FailingCheck;

#[async_trait]
impl HealthCheck for FailingCheck {
    fn check_type(&self) -> &str {
        "IndexerCheck"
    }

    async fn evaluate(&self) -> anyhow::Result<HealthCheckOutcome> {
        Err(anyhow::anyhow!("connection refused").context("indexer unreachable"))
    }
}

struct PanickingCheck;

#[async_trait]
impl HealthCheck for PanickingCheck {
    fn check_type(&self) -> &str {
        "DownloadClientCheck"
    }

    async fn evaluate(&self) -> anyhow::Result<HealthCheckOutcome> {
        panic!("client table poisoned");
    }
}

struct Library {
    _dir: tempfile::TempDir,
    rock: PathBuf,
    jazz: PathBuf,
    bus: EventBus,
    catalog: ArtistCatalog,
    engine: HealthCheckEngine,
}

/// Two root folders on disk: `rock` holds artist 1, `jazz` holds 2 and 3.
async fn library(config: HealthConfig) -> Library {
    let dir = tempfile::tempdir().expect("tempdir");
    let rock = dir.path().join("rock");
    let jazz = dir.path().join("jazz");
    std::fs::create_dir_all(rock.join("Queen")).expect("rock root");
    std::fs::create_dir_all(jazz.join("Coltrane")).expect("jazz root");

    let bus = EventBus::default();
    let catalog = ArtistCatalog::seeded(
        bus.clone(),
        [
            (ArtistId(1), rock.join("Queen")),
            (ArtistId(2), jazz.join("Coltrane")),
            (ArtistId(3), jazz.join("Davis")),
        ],
    );

    let mut registry = HealthCheckRegistry::new();
    registry
        .register_with(
            Arc::new(RootFolderCheck::new(
                Arc::new(catalog.clone()),
                Arc::new(LocalDiskProbe),
            )),
            RootFolderCheck::options(),
        )
        .expect("register root folder check");

    let engine = HealthCheckEngine::start(config, registry, bus.clone()).await;
    Library {
        _dir: dir,
        rock,
        jazz,
        bus,
        catalog,
        engine,
    }
}

#[tokio::test]
async fn deleting_an_artist_with_roots_present_stays_ok() {
    let lib = library(immediate()).await;
    let mut tap = lib.bus.tap();
    let before = lib.engine.result(ROOT_FOLDER_CHECK).expect("startup result");
    assert_eq!(before.severity, HealthSeverity::Ok);

    lib.catalog.remove(ArtistId(2), false);
    lib.engine.settle().await;

    let after = lib.engine.result(ROOT_FOLDER_CHECK).expect("cached");
    assert_eq!(after.severity, HealthSeverity::Ok);
    assert!(after.computed_at >= before.computed_at);
    let changes = drain(&mut tap)
        .into_iter()
        .filter(|envelope| envelope.kind() == EventKind::HealthCheckChanged)
        .count();
    assert_eq!(changes, 0);
    lib.engine.shutdown().await;
}

#[tokio::test]
async fn missing_root_flips_to_error_once() {
    let lib = library(immediate()).await;
    let mut tap = lib.bus.tap();

    std::fs::remove_dir_all(&lib.jazz).expect("remove jazz root");
    lib.catalog.remove(ArtistId(2), true);
    lib.engine.settle().await;

    let result = lib.engine.result(ROOT_FOLDER_CHECK).expect("cached");
    assert_eq!(result.severity, HealthSeverity::Error);
    assert_eq!(
        result.message,
        format!("Missing root folder: {}", lib.jazz.display())
    );
    assert_eq!(result.help_link.as_deref(), Some("#missing-root-folder"));
    assert_eq!(lib.engine.overall_severity(), HealthSeverity::Error);

    let changes: Vec<_> = drain(&mut tap)
        .into_iter()
        .filter_map(|envelope| match &envelope.event {
            DomainEvent::HealthCheckChanged {
                check_type,
                previous,
                current,
            } => Some((check_type.clone(), *previous, current.severity)),
            _ => None,
        })
        .collect();
    assert_eq!(
        changes,
        vec![(
            ROOT_FOLDER_CHECK.to_string(),
            Some(HealthSeverity::Ok),
            HealthSeverity::Error
        )]
    );

    lib.catalog.remove(ArtistId(1), false);
    lib.engine.settle().await;
    assert_eq!(
        lib.engine.result(ROOT_FOLDER_CHECK).map(|r| r.message),
        Some(result.message.clone())
    );
    let repeats = drain(&mut tap)
        .into_iter()
        .filter(|envelope| envelope.kind() == EventKind::HealthCheckChanged)
        .count();
    assert_eq!(repeats, 0);
    lib.engine.shutdown().await;
}

#[tokio::test]
async fn message_change_at_the_same_severity_is_published() {
    let lib = library(immediate()).await;
    std::fs::remove_dir_all(&lib.jazz).expect("remove jazz root");
    lib.engine.evaluate_all().await;
    let single = lib.engine.result(ROOT_FOLDER_CHECK).expect("cached");
    assert_eq!(single.severity, HealthSeverity::Error);
    assert_eq!(
        single.message,
        format!("Missing root folder: {}", lib.jazz.display())
    );

    let mut tap = lib.bus.tap();
    std::fs::remove_dir_all(&lib.rock).expect("remove rock root");
    lib.catalog.remove(ArtistId(2), false);
    lib.engine.settle().await;

    let expected = format!(
        "Multiple root folders are missing: {} | {}",
        lib.rock.display(),
        lib.jazz.display()
    );
    let changes: Vec<_> = drain(&mut tap)
        .into_iter()
        .filter_map(|envelope| match &envelope.event {
            DomainEvent::HealthCheckChanged {
                previous, current, ..
            } => Some((*previous, current.severity, current.message.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        changes,
        vec![(
            Some(HealthSeverity::Error),
            HealthSeverity::Error,
            expected.clone()
        )]
    );
    assert_eq!(
        lib.engine.result(ROOT_FOLDER_CHECK).map(|r| r.message),
        Some(expected)
    );
    lib.engine.shutdown().await;
}

#[tokio::test]
async fn moving_artists_out_of_a_missing_root_recovers() {
    let lib = library(immediate()).await;
    std::fs::remove_dir_all(&lib.jazz).expect("remove jazz root");
    lib.engine.evaluate_all().await;
    assert_eq!(
        lib.engine.overall_severity(),
        HealthSeverity::Error
    );

    let mut tap = lib.bus.tap();
    lib.catalog.move_to(ArtistId(2), lib.rock.join("Coltrane"));
    lib.catalog.move_to(ArtistId(3), lib.rock.join("Davis"));
    lib.engine.settle().await;

    assert!(lib.engine.result(ROOT_FOLDER_CHECK).is_some_and(|r| r.is_ok()));
    let recovered = drain(&mut tap)
        .into_iter()
        .filter(|envelope| envelope.kind() == EventKind::HealthCheckChanged)
        .count();
    assert_eq!(recovered, 1);
    lib.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn bursts_of_triggers_are_coalesced() {
    let bus = EventBus::default();
    let check = CountingCheck::new("RootFolderCheck");
    let mut registry = HealthCheckRegistry::new();
    registry
        .register(check.clone(), [EventKind::ArtistDeleted])
        .expect("register");

    let config = HealthConfig {
        debounce_window_ms: 500,
        sweep_interval_secs: 0,
        evaluate_on_startup: false,
    };
    let engine = HealthCheckEngine::start(config, registry, bus.clone()).await;

    for artist in 0..10 {
        bus.publish(DomainEvent::ArtistDeleted {
            artist_id: ArtistId(artist),
            delete_files: false,
        });
    }
    bus.wait_idle().await;
    assert_eq!(check.runs(), 0);
    assert_eq!(engine.pending(), vec!["RootFolderCheck".to_string()]);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(check.runs(), 1);
    assert!(engine.pending().is_empty());

    bus.publish(DomainEvent::ArtistDeleted {
        artist_id: ArtistId(11),
        delete_files: false,
    });
    bus.wait_idle().await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(check.runs(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn unrelated_events_do_not_reevaluate() {
    let bus = EventBus::default();
    let check = CountingCheck::new("RootFolderCheck");
    let mut registry = HealthCheckRegistry::new();
    registry
        .register(check.clone(), [EventKind::ArtistDeleted, EventKind::ArtistMoved])
        .expect("register");
    let engine = HealthCheckEngine::start(immediate(), registry, bus.clone()).await;
    assert_eq!(check.runs(), 1);

    bus.publish(DomainEvent::ArtistUpdated {
        artist_id: ArtistId(4),
    });
    bus.publish(DomainEvent::ConfigSaved);
    engine.settle().await;
    assert_eq!(check.runs(), 1);

    bus.publish(DomainEvent::ArtistDeleted {
        artist_id: ArtistId(4),
        delete_files: false,
    });
    engine.settle().await;
    assert_eq!(check.runs(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn failing_and_panicking_checks_report_errors() {
    let bus = EventBus::default();
    let healthy = CountingCheck::new("RootFolderCheck");
    let mut registry = HealthCheckRegistry::new();
    registry
        .register_with(Arc::new(FailingCheck), CheckOptions::default())
        .expect("register failing");
    registry
        .register_with(Arc::new(PanickingCheck), CheckOptions::default())
        .expect("register panicking");
    registry
        .register_with(healthy.clone(), CheckOptions::default())
        .expect("register healthy");

    let engine = HealthCheckEngine::start(immediate(), registry, bus).await;
    let results = engine.results();

    let failing = &results["IndexerCheck"];
    assert_eq!(failing.severity, HealthSeverity::Error);
    assert_eq!(
        failing.message,
        "IndexerCheck failed: indexer unreachable: connection refused"
    );

    let panicked = &results["DownloadClientCheck"];
    assert_eq!(panicked.severity, HealthSeverity::Error);
    assert!(panicked.message.contains("client table poisoned"));

    assert!(results["RootFolderCheck"].is_ok());
    assert_eq!(healthy.runs(), 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn periodic_sweep_runs_scheduled_checks_only() {
    let bus = EventBus::default();
    let swept = CountingCheck::new("UpdateCheck");
    let triggered_only = CountingCheck::new("RootFolderCheck");
    let mut registry = HealthCheckRegistry::new();
    registry
        .register_with(swept.clone(), CheckOptions::default())
        .expect("register swept");
    registry
        .register_with(
            triggered_only.clone(),
            CheckOptions::triggered_by([EventKind::ArtistDeleted]).on_schedule(false),
        )
        .expect("register triggered");

    let config = HealthConfig {
        debounce_window_ms: 0,
        sweep_interval_secs: 60,
        evaluate_on_startup: false,
    };
    let engine = HealthCheckEngine::start(config, registry, bus).await;
    assert_eq!(swept.runs(), 0);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(swept.runs(), 1);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(swept.runs(), 2);
    assert_eq!(triggered_only.runs(), 0);

    engine.evaluate_all().await;
    assert_eq!(triggered_only.runs(), 1);
    engine.shutdown().await;
}
