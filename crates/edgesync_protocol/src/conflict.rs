//! Conflict resolution for divergent entities.

use crate::diff::Divergence;
use crate::entity::{Entity, EntityType, Side, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of resolving a divergent entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// The primary's state is written to the replica.
    PrimaryWins,
    /// The replica's state is written to the primary.
    ReplicaWins,
    /// Nothing is written; an operator must decide.
    ManualPending,
}

impl Resolution {
    /// Returns the winning side, if the conflict was resolved automatically.
    pub fn winner(&self) -> Option<Side> {
        match self {
            Resolution::PrimaryWins => Some(Side::Primary),
            Resolution::ReplicaWins => Some(Side::Replica),
            Resolution::ManualPending => None,
        }
    }
}

/// Policy for automatic conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// Later `updatedAt` wins; equal timestamps go to the primary.
    LastWriteWins,
    /// Primary always wins.
    PrimaryWins,
    /// Replica always wins.
    ReplicaWins,
    /// Every conflict waits for an operator.
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy resolves conflicts without an operator.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::LastWriteWins
    }
}

/// Decides the winner of a divergent entity.
///
/// Resolution is a pure function of its inputs, so resolving the same pair
/// twice always yields the same answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    /// Creates a resolver with the given policy.
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// Returns the configured policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Resolves one entity given its state on each side (`None` = deleted).
    pub fn resolve(
        &self,
        _entity_id: &str,
        primary: Option<&Entity>,
        replica: Option<&Entity>,
    ) -> Resolution {
        match self.policy {
            ConflictPolicy::PrimaryWins => Resolution::PrimaryWins,
            ConflictPolicy::ReplicaWins => Resolution::ReplicaWins,
            ConflictPolicy::Manual => Resolution::ManualPending,
            ConflictPolicy::LastWriteWins => match (primary, replica) {
                (Some(p), Some(r)) => {
                    if r.updated_at > p.updated_at {
                        Resolution::ReplicaWins
                    } else {
                        Resolution::PrimaryWins
                    }
                }
                // A deletion carries no timestamp; the surviving row wins.
                (Some(_), None) => Resolution::PrimaryWins,
                (None, Some(_)) => Resolution::ReplicaWins,
                (None, None) => Resolution::PrimaryWins,
            },
        }
    }

    /// Resolves a divergence and produces its audit record.
    pub fn resolve_divergence(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        divergence: &Divergence,
        now: DateTime<Utc>,
    ) -> SyncConflict {
        let resolution = self.resolve(
            &divergence.entity_id,
            divergence.primary.as_ref(),
            divergence.replica.as_ref(),
        );
        SyncConflict {
            run_id,
            entity_type,
            entity_id: divergence.entity_id.clone(),
            primary_version: divergence.version(Side::Primary).cloned(),
            replica_version: divergence.version(Side::Replica).cloned(),
            resolution,
            resolved_at: resolution.winner().map(|_| now),
            reason: None,
        }
    }
}

/// Audit record of one conflict.
///
/// Written once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Run that detected the conflict.
    pub run_id: Uuid,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity ID.
    pub entity_id: String,
    /// Primary version (`None` if absent or unreadable).
    pub primary_version: Option<Version>,
    /// Replica version (`None` if absent or unreadable).
    pub replica_version: Option<Version>,
    /// How the conflict was resolved.
    pub resolution: Resolution,
    /// When it was resolved; absent while pending.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Why it needs an operator, when it does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SyncConflict {
    /// Records an entity that could not be synced because it failed validation.
    pub fn invalid(
        run_id: Uuid,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        side: Side,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            entity_type,
            entity_id: entity_id.into(),
            primary_version: None,
            replica_version: None,
            resolution: Resolution::ManualPending,
            resolved_at: None,
            reason: Some(format!("invalid on {side}: {}", reason.into())),
        }
    }

    /// Returns true if an operator still has to act.
    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::ManualPending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Payload;
    use chrono::TimeZone;
    use serde_json::json;

    fn user_at(name: &str, hour: u32) -> Entity {
        let mut payload = Payload::new();
        payload.insert("name".into(), json!(name));
        Entity::new(
            EntityType::User,
            "u1",
            Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap(),
            payload,
        )
    }

    #[test]
    fn last_write_wins_by_timestamp() {
        let resolver = ConflictResolver::default();
        let earlier = user_at("a", 9);
        let later = user_at("b", 10);

        assert_eq!(
            resolver.resolve("u1", Some(&later), Some(&earlier)),
            Resolution::PrimaryWins
        );
        assert_eq!(
            resolver.resolve("u1", Some(&earlier), Some(&later)),
            Resolution::ReplicaWins
        );
    }

    #[test]
    fn equal_timestamps_favor_primary() {
        let resolver = ConflictResolver::default();
        let p = user_at("a", 9);
        let r = user_at("b", 9);
        assert_eq!(resolver.resolve("u1", Some(&p), Some(&r)), Resolution::PrimaryWins);
    }

    #[test]
    fn surviving_side_beats_deletion() {
        let resolver = ConflictResolver::default();
        let r = user_at("b", 9);
        assert_eq!(resolver.resolve("u1", None, Some(&r)), Resolution::ReplicaWins);
        assert_eq!(resolver.resolve("u1", Some(&r), None), Resolution::PrimaryWins);
    }

    #[test]
    fn resolution_is_deterministic() {
        let resolver = ConflictResolver::default();
        let p = user_at("a", 11);
        let r = user_at("b", 7);
        let first = resolver.resolve("u1", Some(&p), Some(&r));
        let second = resolver.resolve("u1", Some(&p), Some(&r));
        assert_eq!(first, second);
    }

    #[test]
    fn fixed_policies() {
        let p = user_at("a", 1);
        let r = user_at("b", 2);
        assert_eq!(
            ConflictResolver::new(ConflictPolicy::PrimaryWins).resolve("u1", Some(&p), Some(&r)),
            Resolution::PrimaryWins
        );
        assert_eq!(
            ConflictResolver::new(ConflictPolicy::Manual).resolve("u1", Some(&p), Some(&r)),
            Resolution::ManualPending
        );
        assert!(!ConflictPolicy::Manual.auto_resolves());
        assert!(ConflictPolicy::LastWriteWins.auto_resolves());
    }

    #[test]
    fn divergence_record() {
        let resolver = ConflictResolver::default();
        let divergence = Divergence {
            entity_id: "u1".into(),
            primary: Some(user_at("a", 12)),
            replica: Some(user_at("b", 8)),
            baseline: None,
        };
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        let conflict =
            resolver.resolve_divergence(Uuid::nil(), EntityType::User, &divergence, now);

        assert_eq!(conflict.resolution, Resolution::PrimaryWins);
        assert_eq!(conflict.resolved_at, Some(now));
        assert_eq!(
            conflict.primary_version.as_ref(),
            divergence.version(Side::Primary)
        );
        assert!(!conflict.is_pending());

        let manual = ConflictResolver::new(ConflictPolicy::Manual)
            .resolve_divergence(Uuid::nil(), EntityType::User, &divergence, now);
        assert!(manual.is_pending());
        assert!(manual.resolved_at.is_none());
    }

    #[test]
    fn invalid_entity_conflict() {
        let conflict = SyncConflict::invalid(
            Uuid::nil(),
            EntityType::User,
            "u9",
            Side::Replica,
            "payload is not valid JSON",
        );
        assert!(conflict.is_pending());
        assert_eq!(
            conflict.reason.as_deref(),
            Some("invalid on replica: payload is not valid JSON")
        );
    }
}
