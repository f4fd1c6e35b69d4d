//! Sync run execution.
//!
//! A run goes `Pending -> Running -> {Succeeded, PartiallyFailed, Failed,
//! Cancelled}`. For each entity type in scope the orchestrator:
//!
//! 1. Fetches a snapshot from both stores
//! 2. Diffs them against the type's baseline
//! 3. Resolves divergent entities through the [`ConflictResolver`]
//! 4. Builds one changeset per destination and applies it (unless dry run)
//! 5. Advances the baseline for every entity that converged
//!
//! Failures are attached to the run; `run` never returns an error.

use crate::config::EngineConfig;
use crate::connector::{Changeset, Snapshot, StoreConnector};
use crate::error::{SyncError, SyncResult};
use crate::history::HistoryLog;
use crate::retry::with_retry;
use crate::state::{Checkpoint, StateStore};
use chrono::Utc;
use edgesync_protocol::{
    Baseline, ConflictResolver, Diff, DiffEngine, Direction, Entity, EntityType,
    EntityTypeOutcome, ErrorKind, RunCounts, RunError, RunStatus, Side, SyncConflict,
    SyncRequest, SyncRun, SyncScope, Trigger, TypeStatus, Version,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cooperative cancellation flag, checked between entity types.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Added,
    Updated,
    Deleted,
    Resolved,
}

/// One write the plan for an entity type calls for.
#[derive(Debug)]
struct PlannedWrite {
    entity_id: String,
    target: Side,
    kind: WriteKind,
    /// Version both stores hold once the write lands; `None` for deletes.
    converged: Option<Version>,
}

#[derive(Debug, Default)]
struct Plan {
    writes: Vec<PlannedWrite>,
    to_primary: Changeset,
    to_replica: Changeset,
    baseline_updates: BTreeMap<String, Option<Version>>,
    conflicts: Vec<SyncConflict>,
    counts: RunCounts,
}

impl Plan {
    fn changeset(&mut self, side: Side) -> &mut Changeset {
        match side {
            Side::Primary => &mut self.to_primary,
            Side::Replica => &mut self.to_replica,
        }
    }

    fn write(&mut self, entity_id: &str, target: Side, kind: WriteKind, state: Option<&Entity>) {
        match state {
            Some(entity) => self.changeset(target).upserts.push(entity.clone()),
            None => self.changeset(target).deletes.push(entity_id.to_string()),
        }
        self.writes.push(PlannedWrite {
            entity_id: entity_id.to_string(),
            target,
            kind,
            converged: state.map(|e| e.version.clone()),
        });
    }
}

struct TypeResult {
    outcome: EntityTypeOutcome,
    conflicts: Vec<SyncConflict>,
    errors: Vec<RunError>,
}

impl TypeResult {
    fn failed(entity_type: EntityType, error: &SyncError) -> Self {
        Self {
            outcome: EntityTypeOutcome {
                entity_type,
                status: TypeStatus::Failed,
                counts: RunCounts::default(),
                error: Some(error.to_string()),
            },
            conflicts: Vec::new(),
            errors: vec![run_error(error, Some(entity_type), None)],
        }
    }
}

fn run_error(
    error: &SyncError,
    entity_type: Option<EntityType>,
    entity_id: Option<&str>,
) -> RunError {
    RunError {
        kind: error.kind(),
        entity_type,
        entity_id: entity_id.map(str::to_string),
        message: error.to_string(),
    }
}

/// Drives sync runs between the primary and the replica.
///
/// Holds a run lock for the whole of [`run`](Self::run), so at most one run
/// executes at a time even if several callers share the orchestrator.
pub struct SyncOrchestrator {
    primary: Arc<dyn StoreConnector>,
    replica: Arc<dyn StoreConnector>,
    state: Arc<dyn StateStore>,
    history: Arc<dyn HistoryLog>,
    config: EngineConfig,
    resolver: ConflictResolver,
    run_lock: Mutex<()>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        primary: Arc<dyn StoreConnector>,
        replica: Arc<dyn StoreConnector>,
        state: Arc<dyn StateStore>,
        history: Arc<dyn HistoryLog>,
        config: EngineConfig,
    ) -> Self {
        let resolver = ConflictResolver::new(config.conflict_policy);
        Self {
            primary,
            replica,
            state,
            history,
            config,
            resolver,
            run_lock: Mutex::new(()),
        }
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the connector for one side.
    pub fn connector(&self, side: Side) -> &Arc<dyn StoreConnector> {
        match side {
            Side::Primary => &self.primary,
            Side::Replica => &self.replica,
        }
    }

    /// Executes a request and returns the terminal run.
    ///
    /// If the state store holds a checkpoint for the same run ID, the run
    /// resumes after the last completed entity type.
    pub fn run(&self, request: &SyncRequest, cancel: &CancelToken) -> SyncRun {
        let _guard = self.run_lock.lock();

        let mut run = self.resume_or_create(request);
        let direction = run.direction;

        if run.status == RunStatus::Pending {
            if cancel.is_cancelled() {
                return self.finish(run, RunStatus::Cancelled);
            }
            if let Err(e) = run.start(Utc::now()) {
                error!(run_id = %run.id, error = %e, "cannot start run");
                return self.finish(run, RunStatus::Failed);
            }
        }

        info!(
            run_id = %run.id,
            %direction,
            dry_run = run.dry_run,
            trigger = ?run.trigger,
            "sync run started"
        );

        let primary_probe = self.probe(Side::Primary);
        let replica_probe = self.probe(Side::Replica);
        if let (Err(p), Err(r)) = (&primary_probe, &replica_probe) {
            run.record_error(RunError {
                kind: ErrorKind::Fatal,
                entity_type: None,
                entity_id: None,
                message: format!("both stores unreachable: {p}; {r}"),
            });
            return self.finish(run, RunStatus::Failed);
        }
        let unreachable = primary_probe.err().or(replica_probe.err());
        if let Some(e) = &unreachable {
            run.record_error(run_error(e, None, None));
        }

        let completed = run.completed_types();
        let entity_types = run.scope.resolve_types(&self.config.entity_types);
        let mut cancelled = false;

        for entity_type in entity_types {
            if completed.contains(&entity_type) {
                debug!(run_id = %run.id, %entity_type, "already completed, skipping");
                continue;
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let result = match &unreachable {
                Some(e) => {
                    let mut result = TypeResult::failed(entity_type, e);
                    // The probe error is already on the run.
                    result.errors.clear();
                    result
                }
                None => self.sync_type(&run, entity_type),
            };
            self.record(&mut run, result);
        }

        let status = if cancelled {
            run.record_error(run_error(&SyncError::Cancelled, None, None));
            RunStatus::Cancelled
        } else {
            run.derived_status()
        };
        self.finish(run, status)
    }

    /// Records a queued request that was cancelled before it started.
    ///
    /// A resumed request keeps the progress of its checkpoint.
    pub fn record_cancelled(&self, request: &SyncRequest) -> SyncRun {
        let mut run = match self.state.load_checkpoint() {
            Ok(Some(checkpoint)) if checkpoint.run.id == request.run_id => checkpoint.run,
            _ => SyncRun::pending(request),
        };
        run.record_error(run_error(&SyncError::Cancelled, None, None));
        self.finish(run, RunStatus::Cancelled)
    }

    fn resume_or_create(&self, request: &SyncRequest) -> SyncRun {
        match self.state.load_checkpoint() {
            Ok(Some(checkpoint)) if checkpoint.run.id == request.run_id => {
                let mut run = checkpoint.run;
                run.trigger = Trigger::Resume;
                info!(
                    run_id = %run.id,
                    completed = run.entity_types.len(),
                    "resuming interrupted run"
                );
                run
            }
            Ok(Some(checkpoint)) => {
                warn!(
                    run_id = %request.run_id,
                    stale_run_id = %checkpoint.run.id,
                    "discarding checkpoint of another run"
                );
                SyncRun::pending(request)
            }
            Ok(None) => SyncRun::pending(request),
            Err(e) => {
                warn!(run_id = %request.run_id, error = %e, "cannot read checkpoint");
                SyncRun::pending(request)
            }
        }
    }

    fn probe(&self, side: Side) -> SyncResult<()> {
        let connector = self.connector(side);
        with_retry(&self.config.retry, connector.name(), "ping", || connector.ping())
    }

    fn fetch(&self, side: Side, entity_type: EntityType) -> SyncResult<Snapshot> {
        let connector = self.connector(side);
        with_retry(&self.config.retry, connector.name(), "fetch", || {
            connector.fetch_all(entity_type)
        })
    }

    fn record(&self, run: &mut SyncRun, result: TypeResult) {
        if let Err(e) = self.history.append_conflicts(&result.conflicts) {
            error!(run_id = %run.id, error = %e, "cannot record conflicts");
        }
        for error in result.errors {
            run.record_error(error);
        }
        run.record_type(result.outcome);

        let checkpoint = Checkpoint {
            run: run.clone(),
            saved_at: Utc::now(),
        };
        if let Err(e) = self.state.save_checkpoint(&checkpoint) {
            warn!(run_id = %run.id, error = %e, "cannot save checkpoint");
        }
    }

    fn finish(&self, mut run: SyncRun, status: RunStatus) -> SyncRun {
        if let Err(e) = run.finish(status, Utc::now()) {
            error!(run_id = %run.id, error = %e, "invalid run transition");
        }
        if let Err(e) = self.history.append_run(&run) {
            error!(run_id = %run.id, error = %e, "cannot record run");
        }
        match self.state.load_checkpoint() {
            Ok(Some(checkpoint)) if checkpoint.run.id == run.id => {
                if let Err(e) = self.state.clear_checkpoint() {
                    warn!(run_id = %run.id, error = %e, "cannot clear checkpoint");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(run_id = %run.id, error = %e, "cannot read checkpoint"),
        }

        let counts = run.counts;
        match run.status {
            RunStatus::Succeeded | RunStatus::Cancelled => info!(
                run_id = %run.id,
                status = %run.status,
                added = counts.added,
                updated = counts.updated,
                deleted = counts.deleted,
                conflicted = counts.conflicted,
                skipped = counts.skipped,
                "sync run finished"
            ),
            RunStatus::PartiallyFailed => warn!(
                run_id = %run.id,
                errors = run.errors.len(),
                added = counts.added,
                updated = counts.updated,
                deleted = counts.deleted,
                "sync run partially failed"
            ),
            _ => error!(
                run_id = %run.id,
                errors = run.errors.len(),
                first_error = run.errors.first().map(|e| e.message.as_str()).unwrap_or(""),
                "sync run failed"
            ),
        }
        run
    }

    /// Synchronizes one entity type.
    fn sync_type(&self, run: &SyncRun, entity_type: EntityType) -> TypeResult {
        let baseline = match self.state.load_baseline(entity_type) {
            Ok(baseline) => baseline,
            Err(e) => return TypeResult::failed(entity_type, &e),
        };
        let primary = match self.fetch(Side::Primary, entity_type) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(run_id = %run.id, %entity_type, error = %e, "primary fetch failed");
                return TypeResult::failed(entity_type, &e);
            }
        };
        let replica = match self.fetch(Side::Replica, entity_type) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(run_id = %run.id, %entity_type, error = %e, "replica fetch failed");
                return TypeResult::failed(entity_type, &e);
            }
        };

        let mut errors = Vec::new();
        let mut invalid_conflicts = Vec::new();
        let mut excluded = BTreeSet::new();
        for (side, snapshot) in [(Side::Primary, &primary), (Side::Replica, &replica)] {
            for invalid in &snapshot.invalid {
                warn!(
                    run_id = %run.id,
                    %entity_type,
                    entity_id = %invalid.entity_id,
                    store = %side,
                    reason = %invalid.reason,
                    "skipping invalid entity"
                );
                invalid_conflicts.push(SyncConflict::invalid(
                    run.id,
                    entity_type,
                    invalid.entity_id.clone(),
                    side,
                    invalid.reason.clone(),
                ));
                errors.push(RunError {
                    kind: ErrorKind::Validation,
                    entity_type: Some(entity_type),
                    entity_id: Some(invalid.entity_id.clone()),
                    message: format!("invalid on {side}: {}", invalid.reason),
                });
                excluded.insert(invalid.entity_id.clone());
            }
        }

        let (primary_entities, replica_entities, scoped_baseline) =
            scope_inputs(&run.scope, primary.entities, replica.entities, &baseline, &excluded);
        let diff = DiffEngine::compute(
            entity_type,
            &primary_entities,
            &replica_entities,
            &scoped_baseline,
        );
        debug!(
            run_id = %run.id,
            %entity_type,
            primary = primary_entities.len(),
            replica = replica_entities.len(),
            changes = diff.change_count(),
            "computed diff"
        );

        let mut plan = self.plan(run.id, run.direction, &diff);
        plan.counts.conflicted += invalid_conflicts.len() as u64;
        invalid_conflicts.append(&mut plan.conflicts);
        let conflicts = invalid_conflicts;

        if run.dry_run {
            let mut counts = plan.counts;
            for write in &plan.writes {
                tally(&mut counts, write.kind);
            }
            return TypeResult {
                outcome: EntityTypeOutcome {
                    entity_type,
                    status: TypeStatus::Succeeded,
                    counts,
                    error: None,
                },
                conflicts,
                errors,
            };
        }

        let mut failed_ids: BTreeSet<(Side, String)> = BTreeSet::new();
        let mut failed_sides: BTreeSet<Side> = BTreeSet::new();
        let mut attempted = 0;
        let mut batch_error = None;

        for side in [Side::Primary, Side::Replica] {
            let changeset = match side {
                Side::Primary => &plan.to_primary,
                Side::Replica => &plan.to_replica,
            };
            if changeset.is_empty() {
                continue;
            }
            attempted += 1;
            let connector = self.connector(side);
            match with_retry(&self.config.retry, connector.name(), "apply", || {
                connector.apply(entity_type, changeset)
            }) {
                Ok(result) => {
                    for failure in result.failures {
                        warn!(
                            run_id = %run.id,
                            %entity_type,
                            entity_id = %failure.entity_id,
                            store = %side,
                            message = %failure.message,
                            "entity write failed"
                        );
                        errors.push(RunError {
                            kind: ErrorKind::Connectivity,
                            entity_type: Some(entity_type),
                            entity_id: Some(failure.entity_id.clone()),
                            message: format!("write to {side} failed: {}", failure.message),
                        });
                        failed_ids.insert((side, failure.entity_id));
                    }
                }
                Err(e) => {
                    warn!(
                        run_id = %run.id,
                        %entity_type,
                        store = %side,
                        error = %e,
                        "apply failed"
                    );
                    errors.push(run_error(&e, Some(entity_type), None));
                    failed_sides.insert(side);
                    batch_error = Some(e.to_string());
                }
            }
        }

        let mut counts = plan.counts;
        let mut baseline_updates = plan.baseline_updates;
        for write in &plan.writes {
            if failed_sides.contains(&write.target)
                || failed_ids.contains(&(write.target, write.entity_id.clone()))
            {
                counts.skipped += 1;
                continue;
            }
            tally(&mut counts, write.kind);
            baseline_updates.insert(write.entity_id.clone(), write.converged.clone());
        }

        let mut next_baseline = baseline;
        for (entity_id, version) in baseline_updates {
            match version {
                Some(version) => {
                    next_baseline.insert(entity_id, version);
                }
                None => {
                    next_baseline.remove(&entity_id);
                }
            }
        }
        let mut baseline_error = None;
        if let Err(e) = self.state.save_baseline(entity_type, &next_baseline) {
            error!(run_id = %run.id, %entity_type, error = %e, "cannot save baseline");
            errors.push(run_error(&e, Some(entity_type), None));
            baseline_error = Some(e.to_string());
        }

        let status = if attempted > 0 && failed_sides.len() == attempted {
            TypeStatus::Failed
        } else if !failed_sides.is_empty() || !failed_ids.is_empty() || baseline_error.is_some() {
            TypeStatus::PartiallyFailed
        } else {
            TypeStatus::Succeeded
        };

        debug!(
            run_id = %run.id,
            %entity_type,
            status = ?status,
            added = counts.added,
            updated = counts.updated,
            deleted = counts.deleted,
            conflicted = counts.conflicted,
            skipped = counts.skipped,
            "entity type synced"
        );

        TypeResult {
            outcome: EntityTypeOutcome {
                entity_type,
                status,
                counts,
                error: batch_error.or(baseline_error),
            },
            conflicts,
            errors,
        }
    }

    /// Turns a diff into writes, honoring the run direction.
    fn plan(&self, run_id: Uuid, direction: Direction, diff: &Diff) -> Plan {
        let mut plan = Plan::default();

        for (entity_id, version) in &diff.unchanged {
            plan.baseline_updates
                .insert(entity_id.clone(), Some(version.clone()));
        }
        for entity_id in &diff.vanished {
            plan.baseline_updates.insert(entity_id.clone(), None);
        }

        let deterministic = diff
            .added
            .iter()
            .map(|e| (e, WriteKind::Added))
            .chain(diff.updated.iter().map(|e| (e, WriteKind::Updated)))
            .chain(diff.deleted.iter().map(|e| (e, WriteKind::Deleted)));
        for (entry, kind) in deterministic {
            if direction.writes_to(entry.target()) {
                plan.write(&entry.entity_id, entry.target(), kind, entry.entity.as_ref());
            } else {
                plan.counts.skipped += 1;
            }
        }

        let now = Utc::now();
        for divergence in &diff.conflicted {
            let conflict =
                self.resolver
                    .resolve_divergence(run_id, diff.entity_type, divergence, now);
            plan.counts.conflicted += 1;

            match conflict.resolution.winner() {
                Some(winner) if direction.writes_to(winner.opposite()) => {
                    plan.write(
                        &divergence.entity_id,
                        winner.opposite(),
                        WriteKind::Resolved,
                        divergence.state(winner),
                    );
                }
                _ => plan.counts.skipped += 1,
            }
            plan.conflicts.push(conflict);
        }

        plan
    }
}

fn tally(counts: &mut RunCounts, kind: WriteKind) {
    match kind {
        WriteKind::Added => counts.added += 1,
        WriteKind::Updated => counts.updated += 1,
        WriteKind::Deleted => counts.deleted += 1,
        // Already counted as conflicted.
        WriteKind::Resolved => {}
    }
}

/// Applies the scope filters and drops invalid entity IDs from all inputs.
///
/// An ID stays in scope when either side's copy matches the filters, so a
/// filter never turns a change into a deletion.
fn scope_inputs(
    scope: &SyncScope,
    primary: Vec<Entity>,
    replica: Vec<Entity>,
    baseline: &Baseline,
    excluded: &BTreeSet<String>,
) -> (Vec<Entity>, Vec<Entity>, Baseline) {
    let in_scope: Option<BTreeSet<String>> = scope.has_filters().then(|| {
        primary
            .iter()
            .chain(replica.iter())
            .filter(|e| scope.matches(e))
            .map(|e| e.entity_id.clone())
            .collect()
    });
    let keep = |id: &str| {
        !excluded.contains(id) && in_scope.as_ref().map_or(true, |ids| ids.contains(id))
    };

    let primary = primary.into_iter().filter(|e| keep(&e.entity_id)).collect();
    let replica = replica.into_iter().filter(|e| keep(&e.entity_id)).collect();
    let baseline = baseline
        .iter()
        .filter(|(id, _)| keep(id))
        .map(|(id, v)| (id.clone(), v.clone()))
        .collect();
    (primary, replica, baseline)
}
