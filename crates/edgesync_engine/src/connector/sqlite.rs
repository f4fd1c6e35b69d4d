//! Primary store backed by SQLite.

use super::sql::{
    is_plain_field, COUNT_BY_FIELD_SQL, COUNT_SQL, CREATE_TABLE_SQL, DELETE_SQL, PING_SQL,
    SELECT_ALL_SQL, UPSERT_SQL,
};
use super::{AppliedResult, ApplyFailure, Changeset, Snapshot, StoreConnector};
use crate::error::{SyncError, SyncResult};
use edgesync_protocol::{Entity, EntityType, Side};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Store connector over a SQLite database.
///
/// Reads run inside a transaction so a fetch sees one consistent snapshot;
/// a changeset is applied in a single transaction.
///
/// A file database is opened twice in WAL mode. `fetch_all` and `apply` use
/// the writer; `ping`, `count` and `count_by_field` use a read-only
/// connection, so health probes never queue behind a running apply and see
/// the last committed state. An in-memory database has a single connection.
pub struct SqliteConnector {
    side: Side,
    name: String,
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnector")
            .field("side", &self.side)
            .field("name", &self.name)
            .field("separate_reader", &self.reader.is_some())
            .finish_non_exhaustive()
    }
}

impl SqliteConnector {
    /// Opens (creating if needed) a database file.
    ///
    /// `busy_timeout` bounds how long a call waits on a locked database.
    pub fn open(path: &Path, side: Side, busy_timeout: Duration) -> SyncResult<Self> {
        let cannot_open = |e: rusqlite::Error| {
            SyncError::connectivity_fatal(
                side.as_str(),
                format!("cannot open {}: {e}", path.display()),
            )
        };

        let writer = Connection::open(path).map_err(cannot_open)?;
        writer.busy_timeout(busy_timeout)?;
        let mode: String = writer.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        writer.execute_batch("PRAGMA synchronous = NORMAL;")?;
        writer.execute_batch(CREATE_TABLE_SQL)?;
        debug!(store = side.as_str(), path = %path.display(), %mode, "opened sqlite store");

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(cannot_open)?;
        reader.busy_timeout(busy_timeout)?;

        Ok(Self {
            side,
            name: side.as_str().to_string(),
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(side: Side) -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(CREATE_TABLE_SQL)?;
        Ok(Self {
            side,
            name: side.as_str().to_string(),
            writer: Mutex::new(conn),
            reader: None,
        })
    }

    /// Connection for probes and counts.
    fn read_conn(&self) -> MutexGuard<'_, Connection> {
        self.reader.as_ref().unwrap_or(&self.writer).lock()
    }

    /// Sets the name used in logs and errors.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Writes entities directly, outside of any sync run.
    pub fn seed(&self, entities: &[Entity]) -> SyncResult<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        for entity in entities {
            tx.execute(
                UPSERT_SQL,
                params![
                    entity.entity_type.as_str(),
                    entity.entity_id,
                    entity.updated_at_text(),
                    entity.payload_json()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Writes a raw row, bypassing validation.
    pub fn insert_raw(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        updated_at: &str,
        payload: &str,
    ) -> SyncResult<()> {
        self.writer.lock().execute(
            UPSERT_SQL,
            params![entity_type.as_str(), entity_id, updated_at, payload],
        )?;
        Ok(())
    }
}

impl StoreConnector for SqliteConnector {
    fn side(&self) -> Side {
        self.side
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn ping(&self) -> SyncResult<()> {
        self.read_conn()
            .query_row(PING_SQL, [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn fetch_all(&self, entity_type: EntityType) -> SyncResult<Snapshot> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare(SELECT_ALL_SQL)?;
            let rows = stmt
                .query_map(params![entity_type.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        tx.commit()?;

        debug!(store = %self.name, %entity_type, rows = rows.len(), "fetched snapshot");
        Ok(Snapshot::decode(entity_type, rows))
    }

    fn apply(&self, entity_type: EntityType, changeset: &Changeset) -> SyncResult<AppliedResult> {
        let mut result = AppliedResult::default();
        if changeset.is_empty() {
            return Ok(result);
        }

        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        for entity in &changeset.upserts {
            match tx.execute(
                UPSERT_SQL,
                params![
                    entity_type.as_str(),
                    entity.entity_id,
                    entity.updated_at_text(),
                    entity.payload_json()
                ],
            ) {
                Ok(_) => result.applied_count += 1,
                Err(e) => result.failures.push(ApplyFailure {
                    entity_id: entity.entity_id.clone(),
                    message: e.to_string(),
                }),
            }
        }
        for entity_id in &changeset.deletes {
            match tx.execute(DELETE_SQL, params![entity_type.as_str(), entity_id]) {
                Ok(_) => result.applied_count += 1,
                Err(e) => result.failures.push(ApplyFailure {
                    entity_id: entity_id.clone(),
                    message: e.to_string(),
                }),
            }
        }
        tx.commit()?;
        Ok(result)
    }

    fn count(&self, entity_type: EntityType) -> SyncResult<u64> {
        let n: i64 = self.read_conn().query_row(
            COUNT_SQL,
            params![entity_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    fn count_by_field(
        &self,
        entity_type: EntityType,
        field: &str,
    ) -> SyncResult<BTreeMap<String, u64>> {
        if !is_plain_field(field) {
            return Err(SyncError::Validation(format!("unsupported field name {field:?}")));
        }
        let conn = self.read_conn();
        let mut stmt = conn.prepare(COUNT_BY_FIELD_SQL)?;
        let rows = stmt
            .query_map(params![entity_type.as_str(), field], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(value, n)| (value, u64::try_from(n).unwrap_or(0)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use edgesync_protocol::Payload;
    use serde_json::json;

    fn user(id: &str, role: &str) -> Entity {
        let mut payload = Payload::new();
        payload.insert("role".into(), json!(role));
        payload.insert("name".into(), json!(format!("User {id}")));
        Entity::new(
            EntityType::User,
            id,
            Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap(),
            payload,
        )
    }

    #[test]
    fn fetch_returns_sorted_entities() {
        let store = SqliteConnector::open_in_memory(Side::Primary).unwrap();
        store.seed(&[user("u2", "STUDENT"), user("u1", "TEACHER")]).unwrap();

        let snapshot = store.fetch_all(EntityType::User).unwrap();
        let ids: Vec<_> = snapshot.entities.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2"]);
        assert_eq!(snapshot.entities[0], user("u1", "TEACHER"));
        assert!(store.fetch_all(EntityType::Academy).unwrap().entities.is_empty());
    }

    #[test]
    fn apply_is_idempotent() {
        let store = SqliteConnector::open_in_memory(Side::Primary).unwrap();
        store.seed(&[user("gone", "STUDENT")]).unwrap();

        let changeset = Changeset {
            upserts: vec![user("u1", "STUDENT"), user("u2", "DIRECTOR")],
            deletes: vec!["gone".into()],
        };
        let first = store.apply(EntityType::User, &changeset).unwrap();
        assert_eq!(first.applied_count, 3);
        store.apply(EntityType::User, &changeset).unwrap();

        assert_eq!(store.count(EntityType::User).unwrap(), 2);
    }

    #[test]
    fn invalid_rows_surface_in_snapshot() {
        let store = SqliteConnector::open_in_memory(Side::Primary).unwrap();
        store
            .insert_raw(EntityType::User, "u1", "not a date", "{}")
            .unwrap();
        let snapshot = store.fetch_all(EntityType::User).unwrap();
        assert!(snapshot.entities.is_empty());
        assert_eq!(snapshot.invalid.len(), 1);
    }

    #[test]
    fn count_by_role_in_sql() {
        let store = SqliteConnector::open_in_memory(Side::Primary).unwrap();
        store
            .seed(&[user("u1", "STUDENT"), user("u2", "STUDENT"), user("u3", "DIRECTOR")])
            .unwrap();
        store
            .insert_raw(EntityType::User, "u4", "2024-01-01T00:00:00Z", "oops")
            .unwrap();

        let by_role = store.count_by_field(EntityType::User, "role").unwrap();
        assert_eq!(by_role.get("STUDENT"), Some(&2));
        assert_eq!(by_role.get("DIRECTOR"), Some(&1));
        assert_eq!(by_role.len(), 2);
        assert!(store.count_by_field(EntityType::User, "role'--").is_err());
    }

    #[test]
    fn file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("primary.db");
        {
            let store =
                SqliteConnector::open(&path, Side::Primary, Duration::from_secs(1)).unwrap();
            store.seed(&[user("u1", "STUDENT")]).unwrap();
        }
        let store = SqliteConnector::open(&path, Side::Primary, Duration::from_secs(1)).unwrap();
        assert_eq!(store.count(EntityType::User).unwrap(), 1);
        assert!(store.ping().is_ok());
    }

    #[test]
    fn counts_read_committed_state_while_writer_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("primary.db");
        let store = SqliteConnector::open(&path, Side::Primary, Duration::from_secs(1)).unwrap();
        store.seed(&[user("u1", "STUDENT")]).unwrap();

        let mut writer = store.writer.lock();
        let tx = writer.transaction().unwrap();
        let pending = user("u2", "STUDENT");
        tx.execute(
            UPSERT_SQL,
            params![
                "user",
                pending.entity_id,
                pending.updated_at_text(),
                pending.payload_json()
            ],
        )
        .unwrap();

        // Writer lock held mid-transaction: reads must still answer.
        assert!(store.ping().is_ok());
        assert_eq!(store.count(EntityType::User).unwrap(), 1);
        let by_role = store.count_by_field(EntityType::User, "role").unwrap();
        assert_eq!(by_role.get("STUDENT"), Some(&1));

        tx.commit().unwrap();
        drop(writer);
        assert_eq!(store.count(EntityType::User).unwrap(), 2);
    }

    #[test]
    fn count_runs_beside_a_large_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("primary.db");
        let store = std::sync::Arc::new(
            SqliteConnector::open(&path, Side::Primary, Duration::from_secs(5)).unwrap(),
        );
        let changeset = Changeset {
            upserts: (0..20_000).map(|i| user(&format!("u{i:05}"), "STUDENT")).collect(),
            deletes: Vec::new(),
        };

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || store.apply(EntityType::User, &changeset).unwrap())
        };
        let mut seen = Vec::new();
        while !writer.is_finished() {
            seen.push(store.count(EntityType::User).unwrap());
        }
        let applied = writer.join().unwrap();

        assert_eq!(applied.applied_count, 20_000);
        // Every read saw all of the transaction or none of it.
        assert!(seen.iter().all(|n| *n == 0 || *n == 20_000));
        assert_eq!(store.count(EntityType::User).unwrap(), 20_000);
    }
}
