use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use chorus_core::{
    catalog::ArtistCatalog,
    commands::{CommandContext, CommandHandler, CommandParameters, HandlerTraits},
    health::checks::DiskProbe,
    types::ArtistId,
};
use serde_json::{Value, json};

pub const REFRESH_ARTIST: &str = "RefreshArtist";
const ARTIST_ID: &str = "artistId";

/// Re-reads one artist (`artistId`) or the whole catalog from disk.
///
/// A missing artist folder fails the command after every other artist has
/// been refreshed.
pub struct RefreshArtistHandler {
    catalog: ArtistCatalog,
    disk: Arc<dyn DiskProbe>,
}

impl std::fmt::Debug for RefreshArtistHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshArtistHandler")
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl RefreshArtistHandler {
    pub fn new(catalog: ArtistCatalog, disk: Arc<dyn DiskProbe>) -> Self {
        Self { catalog, disk }
    }

    fn targets(&self, parameters: &CommandParameters) -> anyhow::Result<Vec<ArtistId>> {
        match parameters.get_i64(ARTIST_ID) {
            Some(id) => {
                let id = ArtistId(id);
                if !self.catalog.contains(id) {
                    bail!("artist {id} is not in the catalog");
                }
                Ok(vec![id])
            }
            None => Ok(self.catalog.ids()),
        }
    }
}

#[async_trait]
impl CommandHandler for RefreshArtistHandler {
    fn name(&self) -> &str {
        REFRESH_ARTIST
    }

    fn traits(&self) -> HandlerTraits {
        HandlerTraits {
            requires_disk_access: true,
            supersedes_queued: true,
            ..HandlerTraits::default()
        }
    }

    fn validate(&self, parameters: &CommandParameters) -> anyhow::Result<()> {
        if parameters.get(ARTIST_ID).is_some() && parameters.get_i64(ARTIST_ID).is_none() {
            bail!("`{ARTIST_ID}` must be an integer");
        }
        Ok(())
    }

    async fn execute(&self, ctx: CommandContext) -> anyhow::Result<Value> {
        let targets = self.targets(ctx.parameters())?;
        let total = targets.len();
        let mut refreshed = 0usize;
        let mut missing = Vec::new();

        for (index, id) in targets.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let Some(path) = self.catalog.path(id) else {
                continue;
            };
            ctx.set_message(format!(
                "Refreshing artist {id} ({}/{total})",
                index + 1
            ))
            .await;

            if !self.disk.folder_exists(&path).await {
                tracing::warn!(
                    target: "handlers::refresh_artist",
                    artist_id = %id,
                    path = %path.display(),
                    "artist folder missing"
                );
                missing.push(path.display().to_string());
                continue;
            }
            self.catalog.mark_updated(id);
            refreshed += 1;
        }

        if !missing.is_empty() {
            return Err(anyhow::anyhow!(missing.join(" | "))
                .context(format!("{} artist folder(s) missing", missing.len())));
        }
        Ok(json!({ "refreshed": refreshed }))
    }
}
