//! Uniform read/write/count access to each datastore.
//!
//! Every connector decodes rows through [`Entity::from_stored`], so a row is
//! judged valid or invalid the same way on both stores, and derives versions
//! from payloads rather than trusting stored values.

mod d1;
mod memory;
mod sql;
mod sqlite;

pub use d1::{D1Connector, LoopbackQueryClient, QueryClient, ReqwestQueryClient};
pub use memory::MemoryConnector;
pub use sql::CREATE_TABLE_SQL;
pub use sqlite::SqliteConnector;

use crate::error::SyncResult;
use edgesync_protocol::{Entity, EntityType, InvalidEntity, Side};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A consistent read of one entity type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Valid entities, sorted by entity ID.
    pub entities: Vec<Entity>,
    /// Rows that failed validation.
    pub invalid: Vec<InvalidEntity>,
}

impl Snapshot {
    /// Decodes raw `(entity_id, updated_at, payload)` rows.
    pub fn decode<I>(entity_type: EntityType, rows: I) -> Self
    where
        I: IntoIterator<Item = (String, String, String)>,
    {
        let mut snapshot = Snapshot::default();
        for (entity_id, updated_at, payload) in rows {
            match Entity::from_stored(entity_type, &entity_id, &updated_at, &payload) {
                Ok(entity) => snapshot.entities.push(entity),
                Err(e) => snapshot.invalid.push(InvalidEntity::from_error(&entity_id, e)),
            }
        }
        snapshot
            .entities
            .sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        snapshot
    }

    /// Number of rows read, valid or not.
    pub fn row_count(&self) -> usize {
        self.entities.len() + self.invalid.len()
    }
}

/// Writes to apply to one store for one entity type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    /// Entities to insert or overwrite, keyed by `entity_id`.
    pub upserts: Vec<Entity>,
    /// Entity IDs to delete.
    pub deletes: Vec<String>,
}

impl Changeset {
    /// Returns true if there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    /// Number of writes.
    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }
}

/// One entity a store refused to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyFailure {
    /// Entity ID.
    pub entity_id: String,
    /// Why the write failed.
    pub message: String,
}

/// Result of applying a changeset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedResult {
    /// Writes that succeeded.
    pub applied_count: u64,
    /// Writes that failed; the rest of the batch was still committed.
    pub failures: Vec<ApplyFailure>,
}

impl AppliedResult {
    /// Returns true if the given entity failed to apply.
    pub fn failed(&self, entity_id: &str) -> bool {
        self.failures.iter().any(|f| f.entity_id == entity_id)
    }
}

/// Uniform interface over a datastore.
///
/// `apply` is the only mutating operation. It is idempotent: upserts and
/// deletes are keyed by `entity_id`, so re-applying a changeset is harmless.
pub trait StoreConnector: Send + Sync {
    /// Which side of the sync this store is.
    fn side(&self) -> Side;

    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Cheap connection probe.
    fn ping(&self) -> SyncResult<()>;

    /// Reads every entity of a type as one consistent snapshot.
    fn fetch_all(&self, entity_type: EntityType) -> SyncResult<Snapshot>;

    /// Applies a changeset for one entity type as a single batch.
    fn apply(&self, entity_type: EntityType, changeset: &Changeset) -> SyncResult<AppliedResult>;

    /// Counts stored rows of a type.
    fn count(&self, entity_type: EntityType) -> SyncResult<u64>;

    /// Counts entities of a type grouped by a string payload field.
    fn count_by_field(
        &self,
        entity_type: EntityType,
        field: &str,
    ) -> SyncResult<BTreeMap<String, u64>> {
        let snapshot = self.fetch_all(entity_type)?;
        let mut counts = BTreeMap::new();
        for entity in &snapshot.entities {
            if let Some(value) = entity.field_str(field) {
                *counts.entry(value.to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}
