//! Sync between a SQLite primary and a D1 replica served by the loopback client.

use edgesync_engine::{
    CancelToken, D1Connector, FileHistoryLog, FileStateStore, HistoryLog, LoopbackQueryClient,
    SqliteConnector, StoreConnector, SyncOrchestrator,
};
use edgesync_protocol::{Direction, EntityType, RunStatus, Side, SyncRequest};
use edgesync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

struct Stores {
    primary: Arc<SqliteConnector>,
    replica: Arc<D1Connector<LoopbackQueryClient>>,
    orchestrator: SyncOrchestrator,
    history: Arc<FileHistoryLog>,
    _dir: StateDir,
    _db_dir: tempfile::TempDir,
}

fn stores() -> Stores {
    let db_dir = tempfile::tempdir().unwrap();
    let primary_path = db_dir.path().join("primary.db");
    let primary = Arc::new(
        SqliteConnector::open(&primary_path, Side::Primary, Duration::from_secs(1)).unwrap(),
    );
    let replica = Arc::new(D1Connector::new(LoopbackQueryClient::new().unwrap()));
    let dir = StateDir::new();
    let state = Arc::new(FileStateStore::open(dir.path()).unwrap());
    let history = Arc::new(FileHistoryLog::open(dir.path()).unwrap());
    let orchestrator = SyncOrchestrator::new(
        primary.clone(),
        replica.clone(),
        state,
        history.clone(),
        test_config(),
    );
    Stores {
        primary,
        replica,
        orchestrator,
        history,
        _dir: dir,
        _db_dir: db_dir,
    }
}

fn run(stores: &Stores, direction: Direction) -> edgesync_protocol::SyncRun {
    stores
        .orchestrator
        .run(&SyncRequest::manual(direction, false, None), &CancelToken::new())
}

#[test]
fn sqlite_primary_converges_with_d1_replica() {
    let stores = stores();
    stores.primary.seed(&students("s", "acad-1", 6)).unwrap();
    stores
        .primary
        .seed(&[academy("acad-1", "North", at(0))])
        .unwrap();

    let first = run(&stores, Direction::ToReplica);
    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(first.counts.added, 7);
    assert_eq!(stores.replica.count(EntityType::User).unwrap(), 6);
    assert_eq!(
        stores
            .replica
            .count_by_field(EntityType::User, "role")
            .unwrap()
            .get("STUDENT"),
        Some(&6)
    );

    let second = run(&stores, Direction::Bidirectional);
    assert_eq!(second.counts.writes(), 0);
    assert_eq!(stores.history.run_count(), 2);

    for entity_type in EntityType::ALL {
        let p = stores.primary.fetch_all(entity_type).unwrap();
        let r = stores.replica.fetch_all(entity_type).unwrap();
        assert_eq!(p.entities, r.entities);
    }
}

#[test]
fn replica_outage_fails_the_run_without_writes() {
    let stores = stores();
    stores.primary.seed(&students("s", "acad-1", 2)).unwrap();
    stores.replica.client().set_reachable(false);

    let run = run(&stores, Direction::FromReplica);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(stores.primary.count(EntityType::User).unwrap(), 2);

    stores.replica.client().set_reachable(true);
    let run = self::run(&stores, Direction::ToReplica);
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(stores.replica.count(EntityType::User).unwrap(), 2);
}

#[test]
fn malformed_primary_row_is_held_for_review() {
    let stores = stores();
    stores.primary.seed(&students("s", "acad-1", 2)).unwrap();
    stores
        .primary
        .insert_raw(EntityType::User, "broken", "yesterday", "{}")
        .unwrap();

    let run = run(&stores, Direction::ToReplica);
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.counts.added, 2);
    assert_eq!(run.counts.conflicted, 1);
    let conflicts = stores.history.conflicts_for(run.id);
    assert_eq!(conflicts[0].entity_id, "broken");
    assert!(conflicts[0].is_pending());
    assert_eq!(stores.replica.count(EntityType::User).unwrap(), 2);
}
