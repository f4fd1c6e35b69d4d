//! Live per-store counts for the health panel.

use crate::connector::StoreConnector;
use crate::error::SyncResult;
use chrono::Utc;
use edgesync_protocol::{EntityType, StatsSnapshot, SyncRun};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Field whose values make up the per-role user breakdown.
pub const ROLE_FIELD: &str = "role";

/// Connection state and counts of one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    /// Whether the store answered its probe.
    pub connected: bool,
    /// Counts, when they could be read.
    pub stats: Option<StatsSnapshot>,
    /// Why the store is unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health comparison of both stores plus recent run history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Primary answered its probe.
    pub primary_connected: bool,
    /// Replica answered its probe.
    pub replica_connected: bool,
    /// Primary counts.
    pub primary_stats: Option<StatsSnapshot>,
    /// Replica counts.
    pub replica_stats: Option<StatsSnapshot>,
    /// Most recent finished runs, newest first.
    pub recent_runs: Vec<SyncRun>,
}

impl HealthReport {
    /// Assembles a report from both stores' health.
    pub fn new(primary: StoreHealth, replica: StoreHealth, recent_runs: Vec<SyncRun>) -> Self {
        Self {
            primary_connected: primary.connected,
            replica_connected: replica.connected,
            primary_stats: primary.stats,
            replica_stats: replica.stats,
            recent_runs,
        }
    }

    /// Returns true if both stores hold identical counts.
    pub fn converged(&self) -> bool {
        match (&self.primary_stats, &self.replica_stats) {
            (Some(p), Some(r)) => p.converged_with(r),
            _ => false,
        }
    }
}

/// Computes [`StatsSnapshot`]s on demand.
///
/// Reads go straight to the connectors and never take the run lock. Only
/// `ping`, `count` and `count_by_field` are called, which connectors serve
/// without waiting on an in-progress apply (see [`crate::SqliteConnector`]).
pub struct StatsCollector {
    primary: Arc<dyn StoreConnector>,
    replica: Arc<dyn StoreConnector>,
    entity_types: Vec<EntityType>,
}

impl StatsCollector {
    /// Creates a collector over both stores.
    pub fn new(
        primary: Arc<dyn StoreConnector>,
        replica: Arc<dyn StoreConnector>,
        entity_types: Vec<EntityType>,
    ) -> Self {
        Self {
            primary,
            replica,
            entity_types,
        }
    }

    /// Counts every configured entity type on one store.
    pub fn snapshot(&self, store: &dyn StoreConnector) -> SyncResult<StatsSnapshot> {
        let mut snapshot = StatsSnapshot::new(store.side(), Utc::now());
        for entity_type in &self.entity_types {
            let n = store.count(*entity_type)?;
            snapshot.counts.insert(*entity_type, n);
        }
        if self.entity_types.contains(&EntityType::User) {
            snapshot.users_by_role = store.count_by_field(EntityType::User, ROLE_FIELD)?;
        }
        Ok(snapshot)
    }

    /// Probes and counts one store, never failing.
    pub fn health(&self, store: &dyn StoreConnector) -> StoreHealth {
        if let Err(e) = store.ping() {
            debug!(store = store.name(), error = %e, "store probe failed");
            return StoreHealth {
                connected: false,
                stats: None,
                error: Some(e.to_string()),
            };
        }
        match self.snapshot(store) {
            Ok(stats) => StoreHealth {
                connected: true,
                stats: Some(stats),
                error: None,
            },
            Err(e) => StoreHealth {
                connected: false,
                stats: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Health of the primary store.
    pub fn primary(&self) -> StoreHealth {
        self.health(self.primary.as_ref())
    }

    /// Health of the replica store.
    pub fn replica(&self) -> StoreHealth {
        self.health(self.replica.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemoryConnector;
    use edgesync_protocol::{Entity, Payload, Side};
    use serde_json::json;

    fn user(id: &str, role: &str) -> Entity {
        let mut payload = Payload::new();
        payload.insert("role".into(), json!(role));
        Entity::new(EntityType::User, id, Utc::now(), payload)
    }

    #[test]
    fn collects_counts_and_roles() {
        let primary = Arc::new(MemoryConnector::new(Side::Primary));
        primary.insert_all(&[user("u1", "STUDENT"), user("u2", "DIRECTOR")]);
        let replica = Arc::new(MemoryConnector::new(Side::Replica));
        let collector = StatsCollector::new(primary, replica.clone(), EntityType::ALL.to_vec());

        let health = collector.primary();
        assert!(health.connected);
        let stats = health.stats.unwrap();
        assert_eq!(stats.total_users(), 2);
        assert_eq!(stats.users_by_role.get("DIRECTOR"), Some(&1));
        assert_eq!(stats.count(EntityType::Academy), 0);

        replica.set_unreachable(true);
        let health = collector.replica();
        assert!(!health.connected);
        assert!(health.stats.is_none());
        assert!(health.error.is_some());
    }

    #[test]
    fn report_convergence() {
        let primary = Arc::new(MemoryConnector::new(Side::Primary));
        let replica = Arc::new(MemoryConnector::new(Side::Replica));
        let u = user("u1", "STUDENT");
        primary.insert(&u);
        replica.insert(&u);
        let collector = StatsCollector::new(primary, replica, EntityType::ALL.to_vec());

        let report = HealthReport::new(collector.primary(), collector.replica(), Vec::new());
        assert!(report.primary_connected && report.replica_connected);
        assert!(report.converged());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["primaryStats"]["counts"]["user"], 1);
        assert!(json["recentRuns"].as_array().unwrap().is_empty());
    }
}
