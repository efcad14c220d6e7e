use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;

use crate::{
    events::EventKind,
    health::{
        model::HealthCheckOutcome,
        registry::{CheckOptions, HealthCheck},
    },
};

pub const ROOT_FOLDER_CHECK: &str = "RootFolderCheck";
const HELP_LINK: &str = "#missing-root-folder";

/// Supplies the on-disk path of every artist in the catalog.
#[async_trait]
pub trait ArtistPathSource: Send + Sync {
    async fn artist_paths(&self) -> anyhow::Result<Vec<PathBuf>>;
}

#[async_trait]
pub trait DiskProbe: Send + Sync {
    async fn folder_exists(&self, path: &Path) -> bool;
}

/// Probes the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDiskProbe;

#[async_trait]
impl DiskProbe for LocalDiskProbe {
    async fn folder_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
    }
}

/// Reports root folders (parents of artist folders) that no longer exist.
pub struct RootFolderCheck {
    artists: Arc<dyn ArtistPathSource>,
    disk: Arc<dyn DiskProbe>,
}

impl fmt::Debug for RootFolderCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootFolderCheck").finish_non_exhaustive()
    }
}

impl RootFolderCheck {
    pub fn new(
        artists: Arc<dyn ArtistPathSource>,
        disk: Arc<dyn DiskProbe>,
    ) -> Self {
        Self { artists, disk }
    }

    /// Deleting or moving an artist can orphan a root folder.
    pub fn options() -> CheckOptions {
        CheckOptions::triggered_by([EventKind::ArtistDeleted, EventKind::ArtistMoved])
    }
}

#[async_trait]
impl HealthCheck for RootFolderCheck {
    fn check_type(&self) -> &str {
        ROOT_FOLDER_CHECK
    }

    async fn evaluate(&self) -> anyhow::Result<HealthCheckOutcome> {
        let paths = self.artists.artist_paths().await?;

        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for root in paths.iter().filter_map(|path| path.parent()) {
            if root.as_os_str().is_empty() || !seen.insert(root.to_path_buf()) {
                continue;
            }
            if !self.disk.folder_exists(root).await {
                missing.push(root.display().to_string());
            }
        }

        let outcome = match missing.as_slice() {
            [] => HealthCheckOutcome::ok(),
            [single] => HealthCheckOutcome::error(format!("Missing root folder: {single}"))
                .help_link(HELP_LINK),
            many => HealthCheckOutcome::error(format!(
                "Multiple root folders are missing: {}",
                many.join(" | ")
            ))
            .help_link(HELP_LINK),
        };
        Ok(outcome)
    }
}
