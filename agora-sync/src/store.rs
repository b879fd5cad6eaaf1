//! The entity persistence collaborator.
//!
//! The engine never owns entity rows; it reads and writes them through
//! [`SpaceStore`]. Reads may run concurrently without coordination. The
//! engine's only write paths are its mutation helpers and the streaming
//! relay's periodic persist.
//!
//! [`MemoryStore`] backs tests and the demo server; a relational
//! implementation would satisfy the same trait.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{Being, Intention, SpaceId};

/// Store-side failures, kept separate from engine errors so a backend
/// can be swapped without touching the engine's taxonomy.
#[derive(Debug, Clone)]
pub enum StoreError {
    NotFound(Uuid),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "Entity not found: {id}"),
            Self::Backend(e) => write!(f, "Store backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e.to_string())
    }
}

/// Entity snapshot source and write-through interface.
///
/// List results are ordered by `(modified_at, id)` for beings and
/// `(created_at, id)` for intentions so that two snapshots with no
/// intervening mutation are byte-identical.
pub trait SpaceStore: Send + Sync {
    fn beings_in(&self, space: SpaceId) -> Result<Vec<Being>, StoreError>;
    fn intentions_in(&self, space: SpaceId) -> Result<Vec<Intention>, StoreError>;

    /// Entities with `modified_at` strictly after `since`.
    fn beings_modified_since(
        &self,
        space: SpaceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Being>, StoreError>;
    fn intentions_modified_since(
        &self,
        space: SpaceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Intention>, StoreError>;

    fn being(&self, id: Uuid) -> Result<Option<Being>, StoreError>;
    fn intention(&self, id: Uuid) -> Result<Option<Intention>, StoreError>;

    fn upsert_being(&self, being: Being) -> Result<(), StoreError>;
    fn upsert_intention(&self, intention: Intention) -> Result<(), StoreError>;

    /// Returns whether the entity existed.
    fn delete_being(&self, id: Uuid) -> Result<bool, StoreError>;
    fn delete_intention(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// In-memory store.
pub struct MemoryStore {
    beings: RwLock<HashMap<Uuid, Being>>,
    intentions: RwLock<HashMap<Uuid, Intention>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            beings: RwLock::new(HashMap::new()),
            intentions: RwLock::new(HashMap::new()),
        }
    }

    pub fn being_count(&self) -> usize {
        self.beings.read().len()
    }

    pub fn intention_count(&self) -> usize {
        self.intentions.read().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceStore for MemoryStore {
    fn beings_in(&self, space: SpaceId) -> Result<Vec<Being>, StoreError> {
        let mut rows: Vec<Being> = self
            .beings
            .read()
            .values()
            .filter(|b| b.space_id == space)
            .cloned()
            .collect();
        rows.sort_by_key(|b| (b.modified_at, b.id));
        Ok(rows)
    }

    fn intentions_in(&self, space: SpaceId) -> Result<Vec<Intention>, StoreError> {
        let mut rows: Vec<Intention> = self
            .intentions
            .read()
            .values()
            .filter(|i| i.space_id == space)
            .cloned()
            .collect();
        rows.sort_by_key(|i| (i.created_at, i.id));
        Ok(rows)
    }

    fn beings_modified_since(
        &self,
        space: SpaceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Being>, StoreError> {
        let mut rows: Vec<Being> = self
            .beings
            .read()
            .values()
            .filter(|b| b.space_id == space && b.modified_at > since)
            .cloned()
            .collect();
        rows.sort_by_key(|b| (b.modified_at, b.id));
        Ok(rows)
    }

    fn intentions_modified_since(
        &self,
        space: SpaceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Intention>, StoreError> {
        let mut rows: Vec<Intention> = self
            .intentions
            .read()
            .values()
            .filter(|i| i.space_id == space && i.modified_at > since)
            .cloned()
            .collect();
        rows.sort_by_key(|i| (i.created_at, i.id));
        Ok(rows)
    }

    fn being(&self, id: Uuid) -> Result<Option<Being>, StoreError> {
        Ok(self.beings.read().get(&id).cloned())
    }

    fn intention(&self, id: Uuid) -> Result<Option<Intention>, StoreError> {
        Ok(self.intentions.read().get(&id).cloned())
    }

    fn upsert_being(&self, being: Being) -> Result<(), StoreError> {
        self.beings.write().insert(being.id, being);
        Ok(())
    }

    fn upsert_intention(&self, intention: Intention) -> Result<(), StoreError> {
        self.intentions.write().insert(intention.id, intention);
        Ok(())
    }

    fn delete_being(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.beings.write().remove(&id).is_some())
    }

    fn delete_intention(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.intentions.write().remove(&id).is_some())
    }
}
