//! Test fixtures and store helpers.
//!
//! Provides entity builders and a harness wiring two in-memory stores to an
//! orchestrator.

use chrono::{DateTime, Duration, TimeZone, Utc};
use edgesync_engine::{
    CancelToken, EngineConfig, FileHistoryLog, FileStateStore, MemoryConnector,
    MemoryHistoryLog, MemoryStateStore, RetryConfig, ServiceParts, StatsCollector,
    SyncOrchestrator,
};
use edgesync_protocol::{Direction, Entity, EntityType, Payload, Side, SyncRequest, SyncRun};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

/// Fixed reference time all fixtures are relative to.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
        .single()
        .expect("valid fixture time")
}

/// `epoch()` plus `minutes`.
pub fn at(minutes: i64) -> DateTime<Utc> {
    epoch() + Duration::minutes(minutes)
}

/// Builds a user entity.
pub fn user(
    id: &str,
    name: &str,
    role: &str,
    academy_id: &str,
    updated_at: DateTime<Utc>,
) -> Entity {
    let mut payload = Payload::new();
    payload.insert("name".into(), json!(name));
    payload.insert("email".into(), json!(format!("{id}@example.test")));
    payload.insert("role".into(), json!(role));
    payload.insert("academyId".into(), json!(academy_id));
    Entity::new(EntityType::User, id, updated_at, payload)
}

/// Builds an academy entity.
pub fn academy(id: &str, name: &str, updated_at: DateTime<Utc>) -> Entity {
    let mut payload = Payload::new();
    payload.insert("name".into(), json!(name));
    Entity::new(EntityType::Academy, id, updated_at, payload)
}

/// Builds a role aggregate entity for one academy and role.
pub fn role_aggregate(
    academy_id: &str,
    role: &str,
    count: u64,
    updated_at: DateTime<Utc>,
) -> Entity {
    let mut payload = Payload::new();
    payload.insert("academyId".into(), json!(academy_id));
    payload.insert("role".into(), json!(role));
    payload.insert("count".into(), json!(count));
    Entity::new(
        EntityType::RoleAggregate,
        format!("{academy_id}:{role}"),
        updated_at,
        payload,
    )
}

/// `n` students of one academy, named `{prefix}-000`, `{prefix}-001`, ...
pub fn students(prefix: &str, academy_id: &str, n: usize) -> Vec<Entity> {
    (0..n)
        .map(|i| {
            let id = format!("{prefix}-{i:03}");
            user(&id, &format!("Student {i}"), "STUDENT", academy_id, epoch())
        })
        .collect()
}

/// Retry policy that keeps tests fast.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new(3)
        .with_initial_delay(std::time::Duration::from_millis(1))
        .with_max_delay(std::time::Duration::from_millis(5))
        .without_jitter()
}

/// Engine config used by harnesses.
pub fn test_config() -> EngineConfig {
    EngineConfig::new()
        .with_retry(fast_retry())
        .with_interval_bounds(
            std::time::Duration::from_millis(10),
            std::time::Duration::from_secs(3600),
        )
}

/// Two in-memory stores, in-memory engine state and an orchestrator.
pub struct SyncHarness {
    /// Primary store.
    pub primary: Arc<MemoryConnector>,
    /// Replica store.
    pub replica: Arc<MemoryConnector>,
    /// Engine state.
    pub state: Arc<MemoryStateStore>,
    /// Run history.
    pub history: Arc<MemoryHistoryLog>,
    /// Orchestrator over the stores above.
    pub orchestrator: SyncOrchestrator,
}

impl SyncHarness {
    /// Creates a harness with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a harness with a custom config.
    pub fn with_config(config: EngineConfig) -> Self {
        let primary = Arc::new(MemoryConnector::new(Side::Primary));
        let replica = Arc::new(MemoryConnector::new(Side::Replica));
        let state = Arc::new(MemoryStateStore::new());
        let history = Arc::new(MemoryHistoryLog::new());
        let orchestrator = SyncOrchestrator::new(
            primary.clone(),
            replica.clone(),
            state.clone(),
            history.clone(),
            config,
        );
        Self {
            primary,
            replica,
            state,
            history,
            orchestrator,
        }
    }

    /// Runs a request to completion.
    pub fn execute(&self, request: &SyncRequest) -> SyncRun {
        self.orchestrator.run(request, &CancelToken::new())
    }

    /// Runs a manual, non-dry run across all entity types.
    pub fn run(&self, direction: Direction) -> SyncRun {
        self.execute(&SyncRequest::manual(direction, false, None))
    }

    /// Runs a manual dry run across all entity types.
    pub fn dry_run(&self, direction: Direction) -> SyncRun {
        self.execute(&SyncRequest::manual(direction, true, None))
    }

    /// Stats collector over both stores.
    pub fn stats(&self) -> StatsCollector {
        StatsCollector::new(
            self.primary.clone(),
            self.replica.clone(),
            EntityType::ALL.to_vec(),
        )
    }

    /// Asserts both stores hold identical entities of every type.
    pub fn assert_converged(&self) {
        for entity_type in EntityType::ALL {
            assert_eq!(
                self.primary.entities(entity_type),
                self.replica.entities(entity_type),
                "stores diverge on {entity_type}"
            );
        }
    }

    /// Service parts over the same stores, with file-backed state in `dir`.
    pub fn service_parts(&self, dir: &StateDir) -> ServiceParts {
        ServiceParts {
            primary: self.primary.clone(),
            replica: self.replica.clone(),
            state: Arc::new(dir.state_store()),
            history: Arc::new(dir.history_log()),
            config: test_config(),
        }
    }
}

impl Default for SyncHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// A temporary engine state directory.
pub struct StateDir {
    dir: TempDir,
}

impl StateDir {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Path of the directory.
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Opens (and locks) the state store in this directory.
    pub fn state_store(&self) -> FileStateStore {
        FileStateStore::open(self.dir.path()).expect("Failed to open state store")
    }

    /// Opens the history log in this directory.
    pub fn history_log(&self) -> FileHistoryLog {
        FileHistoryLog::open(self.dir.path()).expect("Failed to open history log")
    }
}

impl Default for StateDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocks until `condition` holds, panicking after five seconds.
pub fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !condition() {
        assert!(std::time::Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}
