//! In-process store with fault injection.

use super::{AppliedResult, ApplyFailure, Changeset, Snapshot, StoreConnector};
use crate::error::{SyncError, SyncResult};
use edgesync_protocol::{Entity, EntityType, Side};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredRow {
    updated_at: String,
    payload: String,
}

#[derive(Debug, Default)]
struct Faults {
    unreachable: bool,
    transient_failures: u32,
    fetch_failures: BTreeSet<EntityType>,
    apply_failures: BTreeSet<EntityType>,
    entity_failures: BTreeSet<String>,
    apply_latency: Duration,
}

/// A store held in memory.
///
/// Rows are kept as raw text so tests can plant malformed data, and every
/// failure mode a real store exhibits can be switched on. It also tracks how
/// many `apply` calls overlap, which is how single-flight is checked.
#[derive(Debug)]
pub struct MemoryConnector {
    side: Side,
    name: String,
    rows: Mutex<BTreeMap<(EntityType, String), StoredRow>>,
    faults: Mutex<Faults>,
    fetch_calls: AtomicU64,
    apply_calls: AtomicU64,
    in_flight_applies: AtomicUsize,
    max_in_flight_applies: AtomicUsize,
    pings: AtomicU32,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryConnector {
    /// Creates an empty store for one side.
    pub fn new(side: Side) -> Self {
        Self {
            side,
            name: side.as_str().to_string(),
            rows: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            fetch_calls: AtomicU64::new(0),
            apply_calls: AtomicU64::new(0),
            in_flight_applies: AtomicUsize::new(0),
            max_in_flight_applies: AtomicUsize::new(0),
            pings: AtomicU32::new(0),
        }
    }

    /// Sets the name used in logs and errors.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Inserts or replaces an entity.
    pub fn insert(&self, entity: &Entity) {
        self.rows.lock().insert(
            (entity.entity_type, entity.entity_id.clone()),
            StoredRow {
                updated_at: entity.updated_at_text(),
                payload: entity.payload_json(),
            },
        );
    }

    /// Inserts several entities.
    pub fn insert_all<'a>(&self, entities: impl IntoIterator<Item = &'a Entity>) {
        for entity in entities {
            self.insert(entity);
        }
    }

    /// Inserts a raw row, bypassing validation.
    pub fn insert_raw(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        updated_at: &str,
        payload: &str,
    ) {
        self.rows.lock().insert(
            (entity_type, entity_id.to_string()),
            StoredRow {
                updated_at: updated_at.to_string(),
                payload: payload.to_string(),
            },
        );
    }

    /// Removes a row. Returns true if it existed.
    pub fn remove(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.rows
            .lock()
            .remove(&(entity_type, entity_id.to_string()))
            .is_some()
    }

    /// Returns a decoded entity, if present and valid.
    pub fn get(&self, entity_type: EntityType, entity_id: &str) -> Option<Entity> {
        let rows = self.rows.lock();
        let row = rows.get(&(entity_type, entity_id.to_string()))?;
        Entity::from_stored(entity_type, entity_id, &row.updated_at, &row.payload).ok()
    }

    /// Returns all valid entities of a type, sorted by ID.
    pub fn entities(&self, entity_type: EntityType) -> Vec<Entity> {
        self.read(entity_type).entities
    }

    /// Number of rows of a type, valid or not.
    pub fn len(&self, entity_type: EntityType) -> usize {
        self.rows
            .lock()
            .keys()
            .filter(|(t, _)| *t == entity_type)
            .count()
    }

    /// Returns true if the store holds no rows at all.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Makes every call fail with a non-retryable connectivity error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.lock().unreachable = unreachable;
    }

    /// Fails the next `n` calls with a retryable connectivity error.
    pub fn fail_next_calls(&self, n: u32) {
        self.faults.lock().transient_failures = n;
    }

    /// Makes fetches of one entity type time out.
    pub fn fail_fetches_for(&self, entity_type: EntityType) {
        self.faults.lock().fetch_failures.insert(entity_type);
    }

    /// Makes applies of one entity type fail as a whole.
    pub fn fail_applies_for(&self, entity_type: EntityType) {
        self.faults.lock().apply_failures.insert(entity_type);
    }

    /// Makes writes of one entity fail while the rest of the batch commits.
    pub fn reject_entity(&self, entity_id: impl Into<String>) {
        self.faults.lock().entity_failures.insert(entity_id.into());
    }

    /// Clears every injected fault.
    pub fn heal(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Makes each `apply` call take at least this long.
    pub fn set_apply_latency(&self, latency: Duration) {
        self.faults.lock().apply_latency = latency;
    }

    /// Number of `fetch_all` calls so far.
    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of `apply` calls that reached the store.
    pub fn apply_calls(&self) -> u64 {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `apply` calls observed.
    pub fn max_concurrent_applies(&self) -> usize {
        self.max_in_flight_applies.load(Ordering::SeqCst)
    }

    /// Number of `ping` calls so far.
    pub fn ping_calls(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> SyncResult<()> {
        let mut faults = self.faults.lock();
        if faults.unreachable {
            return Err(SyncError::connectivity_fatal(&self.name, "connection refused"));
        }
        if faults.transient_failures > 0 {
            faults.transient_failures -= 1;
            return Err(SyncError::connectivity_retryable(&self.name, "connection reset"));
        }
        Ok(())
    }

    fn read(&self, entity_type: EntityType) -> Snapshot {
        let rows = self.rows.lock();
        Snapshot::decode(
            entity_type,
            rows.iter()
                .filter(|((t, _), _)| *t == entity_type)
                .map(|((_, id), row)| (id.clone(), row.updated_at.clone(), row.payload.clone())),
        )
    }
}

impl StoreConnector for MemoryConnector {
    fn side(&self) -> Side {
        self.side
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn ping(&self) -> SyncResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()
    }

    fn fetch_all(&self, entity_type: EntityType) -> SyncResult<Snapshot> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if self.faults.lock().fetch_failures.contains(&entity_type) {
            return Err(SyncError::Timeout {
                store: self.name.clone(),
                after: Duration::from_secs(30),
            });
        }
        Ok(self.read(entity_type))
    }

    fn apply(&self, entity_type: EntityType, changeset: &Changeset) -> SyncResult<AppliedResult> {
        self.check_reachable()?;

        let now = self.in_flight_applies.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight_applies);
        self.max_in_flight_applies.fetch_max(now, Ordering::SeqCst);
        self.apply_calls.fetch_add(1, Ordering::SeqCst);

        let (latency, whole_batch_fails, rejected) = {
            let faults = self.faults.lock();
            (
                faults.apply_latency,
                faults.apply_failures.contains(&entity_type),
                faults.entity_failures.clone(),
            )
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if whole_batch_fails {
            return Err(SyncError::connectivity_fatal(
                &self.name,
                format!("batch for {entity_type} rejected"),
            ));
        }

        let mut result = AppliedResult::default();
        let mut rows = self.rows.lock();
        for entity in &changeset.upserts {
            if rejected.contains(&entity.entity_id) {
                result.failures.push(ApplyFailure {
                    entity_id: entity.entity_id.clone(),
                    message: "write rejected by store".into(),
                });
                continue;
            }
            rows.insert(
                (entity_type, entity.entity_id.clone()),
                StoredRow {
                    updated_at: entity.updated_at_text(),
                    payload: entity.payload_json(),
                },
            );
            result.applied_count += 1;
        }
        for entity_id in &changeset.deletes {
            if rejected.contains(entity_id) {
                result.failures.push(ApplyFailure {
                    entity_id: entity_id.clone(),
                    message: "delete rejected by store".into(),
                });
                continue;
            }
            rows.remove(&(entity_type, entity_id.clone()));
            result.applied_count += 1;
        }
        Ok(result)
    }

    fn count(&self, entity_type: EntityType) -> SyncResult<u64> {
        self.check_reachable()?;
        Ok(self.len(entity_type) as u64)
    }
}
