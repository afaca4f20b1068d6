//! Do-not-mail registry storage.
//!
//! Operators add and deactivate entries; the job queue only reads, to report
//! how many fetched properties are suppressed.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use mailhaus_properties::{DnmEntry, NewDnmEntry, RadarId};

use crate::properties::RepositoryError;

pub mod postgres;

pub use postgres::PostgresDnmRegistry;

#[async_trait]
pub trait DnmRegistry: Send + Sync {
    async fn add(&self, request: NewDnmEntry) -> Result<DnmEntry, RepositoryError>;

    async fn deactivate(&self, id: Uuid) -> Result<(), RepositoryError>;

    async fn list_active(&self) -> Result<Vec<DnmEntry>, RepositoryError>;

    /// The subset of `radar_ids` with an active entry.
    async fn blocked_among(&self, radar_ids: &[RadarId]) -> Result<HashSet<RadarId>, RepositoryError>;

    async fn is_blocked(&self, radar_id: &RadarId) -> Result<bool, RepositoryError> {
        let hit = self.blocked_among(std::slice::from_ref(radar_id)).await?;
        Ok(!hit.is_empty())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDnmRegistry {
    entries: RwLock<HashMap<Uuid, DnmEntry>>,
}

impl InMemoryDnmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<Uuid, DnmEntry>>, RepositoryError> {
        self.entries
            .read()
            .map_err(|_| RepositoryError::Storage("dnm registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Uuid, DnmEntry>>, RepositoryError> {
        self.entries
            .write()
            .map_err(|_| RepositoryError::Storage("dnm registry lock poisoned".to_string()))
    }
}

#[async_trait]
impl DnmRegistry for InMemoryDnmRegistry {
    async fn add(&self, request: NewDnmEntry) -> Result<DnmEntry, RepositoryError> {
        let entry = request.into_entry(Utc::now())?;
        self.write()?.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn deactivate(&self, id: Uuid) -> Result<(), RepositoryError> {
        let mut entries = self.write()?;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("dnm entry {id}")))?;
        entry.active = false;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<DnmEntry>, RepositoryError> {
        let mut out: Vec<_> = self.read()?.values().filter(|e| e.active).cloned().collect();
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    async fn blocked_among(&self, radar_ids: &[RadarId]) -> Result<HashSet<RadarId>, RepositoryError> {
        let wanted: HashSet<&RadarId> = radar_ids.iter().collect();
        Ok(self
            .read()?
            .values()
            .filter(|e| e.active)
            .filter_map(|e| e.radar_id.as_ref())
            .filter(|id| wanted.contains(id))
            .cloned()
            .collect())
    }
}
