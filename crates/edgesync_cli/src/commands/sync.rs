//! Sync command implementation.

use super::StoreArgs;
use edgesync_engine::{
    CancelToken, EngineConfig, FileHistoryLog, FileStateStore, HistoryLog, SyncOrchestrator,
};
use edgesync_protocol::{Direction, EntityType, RunStatus, SyncRequest, SyncRun, SyncScope};
use std::sync::Arc;

/// What to sync.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Direction name.
    pub direction: String,
    /// Suppress writes.
    pub dry_run: bool,
    /// Entity type names; empty means all.
    pub entity_types: Vec<String>,
    /// Role filter.
    pub role: Option<String>,
    /// Academy filter.
    pub academy_id: Option<String>,
    /// Caller identity.
    pub triggered_by: Option<String>,
}

impl SyncOptions {
    /// Builds the request to run.
    pub fn request(&self) -> Result<SyncRequest, Box<dyn std::error::Error>> {
        let direction: Direction = self.direction.parse()?;
        let mut scope = SyncScope::all();
        for name in &self.entity_types {
            let entity_type: EntityType = name.parse()?;
            if !scope.entity_types.contains(&entity_type) {
                scope.entity_types.push(entity_type);
            }
        }
        if let Some(role) = &self.role {
            scope = scope.with_role(role.clone());
        }
        if let Some(academy_id) = &self.academy_id {
            scope = scope.with_academy(academy_id.clone());
        }
        Ok(
            SyncRequest::manual(direction, self.dry_run, self.triggered_by.clone())
                .with_scope(scope),
        )
    }
}

/// Runs the sync command.
///
/// Takes the state directory lock, so it refuses to run while a server owns
/// the same state.
pub fn run(
    stores: &StoreArgs,
    options: SyncOptions,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = options.request()?;
    let opened = stores.open()?;
    let state = Arc::new(FileStateStore::open(&stores.state_dir)?);
    let history = Arc::new(FileHistoryLog::open(&stores.state_dir)?);
    let orchestrator = SyncOrchestrator::new(
        opened.primary,
        opened.replica,
        state,
        history.clone(),
        EngineConfig::new().with_call_timeout(stores.timeout()),
    );

    let run = orchestrator.run(&request, &CancelToken::new());
    let conflicts = history.conflicts_for(run.id).len();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&run)?),
        _ => print_text(&run, conflicts),
    }

    if run.status == RunStatus::Failed {
        return Err(format!("Sync run {} failed", run.id).into());
    }
    Ok(())
}

fn print_text(run: &SyncRun, conflicts: usize) {
    println!("Run {} ({}{})", run.id, run.direction, if run.dry_run { ", dry run" } else { "" });
    println!("  Status:     {}", run.status);
    println!("  Added:      {}", run.counts.added);
    println!("  Updated:    {}", run.counts.updated);
    println!("  Deleted:    {}", run.counts.deleted);
    println!("  Conflicted: {} ({} recorded)", run.counts.conflicted, conflicts);
    println!("  Skipped:    {}", run.counts.skipped);
    for outcome in &run.entity_types {
        println!(
            "  {:<14} {:?} +{} ~{} -{}",
            outcome.entity_type.as_str(),
            outcome.status,
            outcome.counts.added,
            outcome.counts.updated,
            outcome.counts.deleted
        );
    }
    for error in &run.errors {
        println!("  Error ({:?}): {}", error.kind, error.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use edgesync_engine::{SqliteConnector, StoreConnector};
    use edgesync_protocol::{Entity, Payload, Side};
    use serde_json::json;
    use std::time::Duration;

    fn options() -> SyncOptions {
        SyncOptions {
            direction: "toReplica".into(),
            dry_run: true,
            entity_types: vec!["user".into(), "users".into(), "academy".into()],
            role: Some("STUDENT".into()),
            academy_id: None,
            triggered_by: Some("ops".into()),
        }
    }

    #[test]
    fn builds_request_from_options() {
        let request = options().request().unwrap();
        assert_eq!(request.direction, Direction::ToReplica);
        assert!(request.dry_run);
        assert_eq!(
            request.scope.entity_types,
            vec![EntityType::User, EntityType::Academy]
        );
        assert_eq!(request.scope.role.as_deref(), Some("STUDENT"));
        assert_eq!(request.triggered_by.as_deref(), Some("ops"));
    }

    #[test]
    fn rejects_unknown_names() {
        let mut bad = options();
        bad.direction = "sideways".into();
        assert!(bad.request().is_err());

        let mut bad = options();
        bad.entity_types = vec!["invoice".into()];
        assert!(bad.request().is_err());
    }

    #[test]
    fn syncs_two_sqlite_files() {
        let dir = tempfile::tempdir().unwrap();
        let primary_path = dir.path().join("primary.db");
        let replica_path = dir.path().join("replica.db");
        {
            let primary =
                SqliteConnector::open(&primary_path, Side::Primary, Duration::from_secs(1))
                    .unwrap();
            let payload: Payload = [
                ("name".to_string(), json!("Ann")),
                ("role".to_string(), json!("STUDENT")),
            ]
            .into_iter()
            .collect();
            primary
                .seed(&[Entity::new(EntityType::User, "u1", Utc::now(), payload)])
                .unwrap();
        }

        let stores = StoreArgs {
            primary: primary_path,
            replica_url: None,
            replica_token: None,
            replica_db: Some(replica_path.clone()),
            state_dir: dir.path().join("state"),
            timeout_ms: 1_000,
        };
        let mut options = options();
        options.dry_run = false;
        options.entity_types.clear();
        run(&stores, options, "json").unwrap();

        let replica =
            SqliteConnector::open(&replica_path, Side::Replica, Duration::from_secs(1)).unwrap();
        assert_eq!(replica.count(EntityType::User).unwrap(), 1);
    }
}
