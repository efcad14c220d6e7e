use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    events::{DomainEvent, EventBus},
    health::checks::ArtistPathSource,
    types::ids::ArtistId,
};

/// Artist id to folder table. Mutations publish the matching domain event;
/// only ids and paths travel on the bus.
#[derive(Clone)]
pub struct ArtistCatalog {
    artists: Arc<RwLock<BTreeMap<ArtistId, PathBuf>>>,
    events: EventBus,
}

impl fmt::Debug for ArtistCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtistCatalog")
            .field("artists", &self.artists.read().len())
            .finish()
    }
}

impl ArtistCatalog {
    pub fn new(events: EventBus) -> Self {
        Self::seeded(events, std::iter::empty())
    }

    /// Loads existing artists without publishing anything.
    pub fn seeded(
        events: EventBus,
        artists: impl IntoIterator<Item = (ArtistId, PathBuf)>,
    ) -> Self {
        Self {
            artists: Arc::new(RwLock::new(artists.into_iter().collect())),
            events,
        }
    }

    /// Adds or replaces an artist. Replacing publishes `ArtistUpdated`.
    pub fn add(&self, id: ArtistId, path: impl Into<PathBuf>) {
        let path = path.into();
        let previous = self.artists.write().insert(id, path.clone());
        let event = match previous {
            Some(_) => DomainEvent::ArtistUpdated { artist_id: id },
            None => DomainEvent::ArtistAdded {
                artist_id: id,
                path,
            },
        };
        self.events.publish(event);
    }

    /// Returns the removed path; unknown ids publish nothing.
    pub fn remove(&self, id: ArtistId, delete_files: bool) -> Option<PathBuf> {
        let removed = self.artists.write().remove(&id)?;
        tracing::debug!(
            target: "catalog",
            artist_id = %id,
            path = %removed.display(),
            delete_files,
            "artist removed"
        );
        self.events.publish(DomainEvent::ArtistDeleted {
            artist_id: id,
            delete_files,
        });
        Some(removed)
    }

    /// Points an artist at a new folder. Returns the old path.
    pub fn move_to(
        &self,
        id: ArtistId,
        destination: impl Into<PathBuf>,
    ) -> Option<PathBuf> {
        let destination = destination.into();
        let source = {
            let mut artists = self.artists.write();
            let slot = artists.get_mut(&id)?;
            std::mem::replace(slot, destination.clone())
        };
        self.events.publish(DomainEvent::ArtistMoved {
            artist_id: id,
            source_path: source.clone(),
            destination_path: destination,
        });
        Some(source)
    }

    /// Publishes `ArtistUpdated` for a known artist.
    pub fn mark_updated(&self, id: ArtistId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.events
            .publish(DomainEvent::ArtistUpdated { artist_id: id });
        true
    }

    pub fn path(&self, id: ArtistId) -> Option<PathBuf> {
        self.artists.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ArtistId) -> bool {
        self.artists.read().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ArtistId> {
        self.artists.read().keys().copied().collect()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.artists.read().values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(ArtistId, PathBuf)> {
        self.artists
            .read()
            .iter()
            .map(|(id, path)| (*id, path.clone()))
            .collect()
    }

    /// Artists whose folder sits directly under `root`.
    pub fn under_root(&self, root: &Path) -> Vec<ArtistId> {
        self.artists
            .read()
            .iter()
            .filter(|(_, path)| path.parent() == Some(root))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.artists.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.artists.read().is_empty()
    }
}

#[async_trait]
impl ArtistPathSource for ArtistCatalog {
    async fn artist_paths(&self) -> anyhow::Result<Vec<PathBuf>> {
        Ok(self.paths())
    }
}
