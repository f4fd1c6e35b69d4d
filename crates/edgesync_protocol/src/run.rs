//! Sync requests and run records.

use crate::entity::{Entity, EntityType, Side};
use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Which way data flows in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Primary → replica.
    ToReplica,
    /// Replica → primary.
    FromReplica,
    /// Both ways, conflicts resolved by policy.
    Bidirectional,
}

impl Direction {
    /// Returns true if a run in this direction may write to `side`.
    pub fn writes_to(&self, side: Side) -> bool {
        match self {
            Direction::ToReplica => side == Side::Replica,
            Direction::FromReplica => side == Side::Primary,
            Direction::Bidirectional => true,
        }
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToReplica => "toReplica",
            Direction::FromReplica => "fromReplica",
            Direction::Bidirectional => "bidirectional",
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Bidirectional
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "toreplica" | "tod1" => Ok(Direction::ToReplica),
            "fromreplica" | "fromd1" => Ok(Direction::FromReplica),
            "bidirectional" | "both" => Ok(Direction::Bidirectional),
            _ => Err(ProtocolError::UnknownDirection(s.to_string())),
        }
    }
}

/// What caused a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    /// An operator pressed "sync now".
    Manual,
    /// The auto-sync timer.
    Scheduler,
    /// A change notification from the replica.
    Webhook,
    /// Continuation of a run interrupted by a restart.
    Resume,
}

/// Which entities a run covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncScope {
    /// Entity types to sync; empty means every configured type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_types: Vec<EntityType>,
    /// Only users with this role (e.g. `STUDENT`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Only records belonging to this academy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academy_id: Option<String>,
}

impl SyncScope {
    /// Scope covering every configured type.
    pub fn all() -> Self {
        Self::default()
    }

    /// Scope covering a single entity type.
    pub fn only(entity_type: EntityType) -> Self {
        Self {
            entity_types: vec![entity_type],
            ..Self::default()
        }
    }

    /// Restricts to users with the given role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Restricts to one academy.
    pub fn with_academy(mut self, academy_id: impl Into<String>) -> Self {
        self.academy_id = Some(academy_id.into());
        self
    }

    /// Returns the types to process, in configured order.
    pub fn resolve_types(&self, configured: &[EntityType]) -> Vec<EntityType> {
        if self.entity_types.is_empty() {
            configured.to_vec()
        } else {
            configured
                .iter()
                .copied()
                .filter(|t| self.entity_types.contains(t))
                .collect()
        }
    }

    /// Returns true if a role or academy filter is set.
    pub fn has_filters(&self) -> bool {
        self.role.is_some() || self.academy_id.is_some()
    }

    /// Returns true if the entity falls inside the role/academy filters.
    pub fn matches(&self, entity: &Entity) -> bool {
        if let Some(role) = &self.role {
            if entity.entity_type == EntityType::User && entity.field_str("role") != Some(role) {
                return false;
            }
        }
        if let Some(academy_id) = &self.academy_id {
            let owner = match entity.entity_type {
                EntityType::Academy => Some(entity.entity_id.as_str()),
                _ => entity.field_str("academyId"),
            };
            if owner != Some(academy_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A queued request to run a sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// ID the resulting run will carry.
    pub run_id: Uuid,
    /// Direction of the run.
    pub direction: Direction,
    /// Compute and report without writing.
    pub dry_run: bool,
    /// Entity types and filters.
    #[serde(default)]
    pub scope: SyncScope,
    /// What caused the request.
    pub trigger: Trigger,
    /// Caller identity for manual runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    /// When the request was enqueued.
    pub requested_at: DateTime<Utc>,
}

impl SyncRequest {
    /// Creates a request with a fresh run ID.
    pub fn new(direction: Direction, dry_run: bool, trigger: Trigger) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            direction,
            dry_run,
            scope: SyncScope::all(),
            trigger,
            triggered_by: None,
            requested_at: Utc::now(),
        }
    }

    /// A manual request on behalf of `triggered_by`.
    pub fn manual(direction: Direction, dry_run: bool, triggered_by: Option<String>) -> Self {
        let mut request = Self::new(direction, dry_run, Trigger::Manual);
        request.triggered_by = triggered_by;
        request
    }

    /// The full bidirectional request the auto-sync timer enqueues.
    pub fn scheduled() -> Self {
        Self::new(Direction::Bidirectional, false, Trigger::Scheduler)
    }

    /// A targeted pull of one entity type after a replica-side change.
    pub fn webhook(entity_type: EntityType) -> Self {
        Self::new(Direction::FromReplica, false, Trigger::Webhook)
            .with_scope(SyncScope::only(entity_type))
    }

    /// Sets the scope.
    pub fn with_scope(mut self, scope: SyncScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    /// Queued, not yet started.
    Pending,
    /// Being executed by the orchestrator.
    Running,
    /// Every entity type synced.
    Succeeded,
    /// Some entity types (or entities) failed, others synced.
    PartiallyFailed,
    /// Nothing could be synced.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl RunStatus {
    /// Returns true once the run can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Returns true if the lifecycle allows moving to `next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            RunStatus::Pending => matches!(
                next,
                RunStatus::Running | RunStatus::Failed | RunStatus::Cancelled
            ),
            RunStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallyFailed => "partiallyFailed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run (or per-entity-type) change counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Entities created on the destination.
    pub added: u64,
    /// Entities overwritten on the destination.
    pub updated: u64,
    /// Entities deleted on the destination.
    pub deleted: u64,
    /// Conflicts recorded (auto-resolved or pending).
    pub conflicted: u64,
    /// Differences left alone (direction, pending conflict, failed entity).
    pub skipped: u64,
}

impl RunCounts {
    /// Adds another set of counts into this one.
    pub fn absorb(&mut self, other: &RunCounts) {
        self.added += other.added;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.conflicted += other.conflicted;
        self.skipped += other.skipped;
    }

    /// Number of writes (projected or applied).
    pub fn writes(&self) -> u64 {
        self.added + self.updated + self.deleted
    }
}

/// Outcome of one entity type within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TypeStatus {
    /// Fully synced.
    Succeeded,
    /// Applied, but some entities failed.
    PartiallyFailed,
    /// Fetch or apply failed; nothing written for this type.
    Failed,
}

/// Per-entity-type result recorded on the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTypeOutcome {
    /// Entity type.
    pub entity_type: EntityType,
    /// How it went.
    pub status: TypeStatus,
    /// Counts for this type.
    pub counts: RunCounts,
    /// Failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error taxonomy recorded on runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Transient store or network unavailability.
    Connectivity,
    /// Malformed entity data.
    Validation,
    /// Bad credentials or signature.
    Authentication,
    /// The run could not proceed at all.
    Fatal,
    /// The run was cancelled.
    Cancelled,
}

/// An error attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    /// Category.
    pub kind: ErrorKind,
    /// Entity type, when the error is scoped to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    /// Entity, when the error is scoped to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Human-readable message.
    pub message: String,
}

/// One execution of the orchestrator.
///
/// Created when a request is dequeued, mutated only by the orchestrator
/// executing it, immutable once its status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    /// Run ID (same as the originating request).
    pub id: Uuid,
    /// Direction.
    pub direction: Direction,
    /// Whether writes were suppressed.
    pub dry_run: bool,
    /// Entity types and filters.
    pub scope: SyncScope,
    /// What caused the run.
    pub trigger: Trigger,
    /// Caller identity for manual runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    /// Current status.
    pub status: RunStatus,
    /// When the request was enqueued.
    pub created_at: DateTime<Utc>,
    /// When execution began.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Totals across entity types.
    pub counts: RunCounts,
    /// Per-entity-type outcomes, in processing order.
    #[serde(default)]
    pub entity_types: Vec<EntityTypeOutcome>,
    /// Errors encountered.
    #[serde(default)]
    pub errors: Vec<RunError>,
}

impl SyncRun {
    /// Creates a pending run for a request.
    pub fn pending(request: &SyncRequest) -> Self {
        Self {
            id: request.run_id,
            direction: request.direction,
            dry_run: request.dry_run,
            scope: request.scope.clone(),
            trigger: request.trigger,
            triggered_by: request.triggered_by.clone(),
            status: RunStatus::Pending,
            created_at: request.requested_at,
            started_at: None,
            finished_at: None,
            counts: RunCounts::default(),
            entity_types: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn transition(&mut self, next: RunStatus) -> ProtocolResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ProtocolError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Moves the run to `Running`.
    pub fn start(&mut self, now: DateTime<Utc>) -> ProtocolResult<()> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Moves the run to a terminal status.
    pub fn finish(&mut self, status: RunStatus, now: DateTime<Utc>) -> ProtocolResult<()> {
        if !status.is_terminal() {
            return Err(ProtocolError::InvalidTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.transition(status)?;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Records the outcome of one entity type and folds in its counts.
    pub fn record_type(&mut self, outcome: EntityTypeOutcome) {
        self.counts.absorb(&outcome.counts);
        self.entity_types.push(outcome);
    }

    /// Attaches an error.
    pub fn record_error(&mut self, error: RunError) {
        self.errors.push(error);
    }

    /// Terminal status implied by the recorded entity-type outcomes.
    pub fn derived_status(&self) -> RunStatus {
        let failed = self
            .entity_types
            .iter()
            .filter(|o| o.status == TypeStatus::Failed)
            .count();
        let partial = self
            .entity_types
            .iter()
            .any(|o| o.status == TypeStatus::PartiallyFailed);

        if !self.entity_types.is_empty() && failed == self.entity_types.len() {
            RunStatus::Failed
        } else if failed > 0 || partial {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Succeeded
        }
    }

    /// Entity types already recorded on this run.
    pub fn completed_types(&self) -> Vec<EntityType> {
        self.entity_types.iter().map(|o| o.entity_type).collect()
    }
}
