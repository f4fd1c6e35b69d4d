//! Per-store aggregate counts for health display.

use crate::entity::{EntityType, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read-only projection of one store's entity counts.
///
/// Computed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Store the counts were read from.
    pub store: Side,
    /// Count per entity type.
    pub counts: BTreeMap<EntityType, u64>,
    /// Users per role (`STUDENT`, `DIRECTOR`, `TEACHER`, ...).
    pub users_by_role: BTreeMap<String, u64>,
    /// When the counts were read.
    pub captured_at: DateTime<Utc>,
}

impl StatsSnapshot {
    /// Creates an empty snapshot.
    pub fn new(store: Side, captured_at: DateTime<Utc>) -> Self {
        Self {
            store,
            counts: BTreeMap::new(),
            users_by_role: BTreeMap::new(),
            captured_at,
        }
    }

    /// Count for one entity type (0 if not collected).
    pub fn count(&self, entity_type: EntityType) -> u64 {
        self.counts.get(&entity_type).copied().unwrap_or(0)
    }

    /// Total number of users.
    pub fn total_users(&self) -> u64 {
        self.count(EntityType::User)
    }

    /// Returns true if both snapshots hold identical counts.
    pub fn converged_with(&self, other: &StatsSnapshot) -> bool {
        self.counts == other.counts && self.users_by_role == other.users_by_role
    }
}
