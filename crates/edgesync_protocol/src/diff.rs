//! Divergence detection between two snapshots of one entity type.
//!
//! The diff is computed against a *baseline*: the version each entity had on
//! both stores at the end of the last successful sync. The baseline is what
//! distinguishes "only one side changed" from "both sides changed".
//!
//! This module is pure; it performs no I/O.

use crate::entity::{Entity, EntityType, Side, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Versions both stores agreed on after the last successful sync, by entity ID.
pub type Baseline = BTreeMap<String, Version>;

/// Classification of one entity ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiffClass {
    /// Present only on the primary and never synced.
    AddedOnPrimary,
    /// Present only on the replica and never synced.
    AddedOnReplica,
    /// Exactly one side changed (or deleted) the entity since the baseline.
    UpdatedOneSided,
    /// Both sides changed the entity independently.
    UpdatedDivergent,
    /// Same version on both sides.
    Unchanged,
    /// Deleted on both sides since the baseline.
    Vanished,
}

/// A change that propagates deterministically from `source` to the other side.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    /// Entity ID.
    pub entity_id: String,
    /// Side whose state wins.
    pub source: Side,
    /// Source state; `None` when the source deleted the entity.
    pub entity: Option<Entity>,
}

impl DiffEntry {
    /// The side that must be written.
    pub fn target(&self) -> Side {
        self.source.opposite()
    }

    /// Returns true if this entry propagates a deletion.
    pub fn is_delete(&self) -> bool {
        self.entity.is_none()
    }
}

/// An entity both sides changed since the baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    /// Entity ID.
    pub entity_id: String,
    /// Primary state (`None` if deleted there).
    pub primary: Option<Entity>,
    /// Replica state (`None` if deleted there).
    pub replica: Option<Entity>,
    /// Baseline version, if the entity was synced before.
    pub baseline: Option<Version>,
}

impl Divergence {
    /// Returns the state on the given side.
    pub fn state(&self, side: Side) -> Option<&Entity> {
        match side {
            Side::Primary => self.primary.as_ref(),
            Side::Replica => self.replica.as_ref(),
        }
    }

    /// Returns the version on the given side.
    pub fn version(&self, side: Side) -> Option<&Version> {
        self.state(side).map(|e| &e.version)
    }
}

/// Result of diffing one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    /// Entity type that was diffed.
    pub entity_type: EntityType,
    /// Never-synced entities present on one side only.
    pub added: Vec<DiffEntry>,
    /// One-sided updates.
    pub updated: Vec<DiffEntry>,
    /// One-sided deletions to propagate.
    pub deleted: Vec<DiffEntry>,
    /// Divergent entities; the conflict resolver decides these.
    pub conflicted: Vec<Divergence>,
    /// Entities already identical on both sides.
    pub unchanged: Vec<(String, Version)>,
    /// Entities deleted on both sides since the baseline.
    pub vanished: Vec<String>,
}

impl Diff {
    fn empty(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            added: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            conflicted: Vec::new(),
            unchanged: Vec::new(),
            vanished: Vec::new(),
        }
    }

    /// Returns true if the two sides already agree.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.conflicted.is_empty()
    }

    /// Number of entities that need some action.
    pub fn change_count(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len() + self.conflicted.len()
    }

    /// Looks up the classification of an entity ID.
    pub fn classify(&self, entity_id: &str) -> Option<DiffClass> {
        if let Some(entry) = self.added.iter().find(|e| e.entity_id == entity_id) {
            return Some(match entry.source {
                Side::Primary => DiffClass::AddedOnPrimary,
                Side::Replica => DiffClass::AddedOnReplica,
            });
        }
        if self
            .updated
            .iter()
            .chain(self.deleted.iter())
            .any(|e| e.entity_id == entity_id)
        {
            return Some(DiffClass::UpdatedOneSided);
        }
        if self.conflicted.iter().any(|d| d.entity_id == entity_id) {
            return Some(DiffClass::UpdatedDivergent);
        }
        if self.unchanged.iter().any(|(id, _)| id == entity_id) {
            return Some(DiffClass::Unchanged);
        }
        if self.vanished.iter().any(|id| id == entity_id) {
            return Some(DiffClass::Vanished);
        }
        None
    }
}

/// Computes diffs between primary and replica snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffEngine;

impl DiffEngine {
    /// Diffs two snapshots of `entity_type` against `baseline`.
    ///
    /// Output vectors are ordered by entity ID.
    pub fn compute(
        entity_type: EntityType,
        primary: &[Entity],
        replica: &[Entity],
        baseline: &Baseline,
    ) -> Diff {
        let primary_index: BTreeMap<&str, &Entity> =
            primary.iter().map(|e| (e.entity_id.as_str(), e)).collect();
        let replica_index: BTreeMap<&str, &Entity> =
            replica.iter().map(|e| (e.entity_id.as_str(), e)).collect();

        let keys: BTreeSet<&str> = primary_index
            .keys()
            .chain(replica_index.keys())
            .copied()
            .chain(baseline.keys().map(String::as_str))
            .collect();

        let mut diff = Diff::empty(entity_type);

        for id in keys {
            let p = primary_index.get(id).copied();
            let r = replica_index.get(id).copied();
            let b = baseline.get(id);

            match (p, r) {
                (Some(p), Some(r)) if p.version == r.version => {
                    diff.unchanged.push((id.to_string(), p.version.clone()));
                }
                (Some(p), Some(r)) => match b {
                    Some(b) if *b == r.version => {
                        diff.updated.push(propagate(id, Side::Primary, Some(p)));
                    }
                    Some(b) if *b == p.version => {
                        diff.updated.push(propagate(id, Side::Replica, Some(r)));
                    }
                    _ => diff.conflicted.push(diverge(id, Some(p), Some(r), b)),
                },
                (Some(p), None) => match b {
                    None => diff.added.push(propagate(id, Side::Primary, Some(p))),
                    Some(b) if *b == p.version => {
                        diff.deleted.push(propagate(id, Side::Replica, None));
                    }
                    Some(b) => diff.conflicted.push(diverge(id, Some(p), None, Some(b))),
                },
                (None, Some(r)) => match b {
                    None => diff.added.push(propagate(id, Side::Replica, Some(r))),
                    Some(b) if *b == r.version => {
                        diff.deleted.push(propagate(id, Side::Primary, None));
                    }
                    Some(b) => diff.conflicted.push(diverge(id, None, Some(r), Some(b))),
                },
                (None, None) => diff.vanished.push(id.to_string()),
            }
        }

        diff
    }
}

fn propagate(id: &str, source: Side, entity: Option<&Entity>) -> DiffEntry {
    DiffEntry {
        entity_id: id.to_string(),
        source,
        entity: entity.cloned(),
    }
}

fn diverge(
    id: &str,
    primary: Option<&Entity>,
    replica: Option<&Entity>,
    baseline: Option<&Version>,
) -> Divergence {
    Divergence {
        entity_id: id.to_string(),
        primary: primary.cloned(),
        replica: replica.cloned(),
        baseline: baseline.cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Payload;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn user(id: &str, name: &str) -> Entity {
        let mut payload = Payload::new();
        payload.insert("name".into(), json!(name));
        Entity::new(
            EntityType::User,
            id,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            payload,
        )
    }

    fn baseline_of(entities: &[&Entity]) -> Baseline {
        entities
            .iter()
            .map(|e| (e.entity_id.clone(), e.version.clone()))
            .collect()
    }

    #[test]
    fn additions_without_baseline() {
        let primary = vec![user("a", "Ann"), user("b", "Bo")];
        let replica = vec![user("b", "Bo"), user("c", "Cy")];

        let diff = DiffEngine::compute(EntityType::User, &primary, &replica, &Baseline::new());

        assert_eq!(diff.classify("a"), Some(DiffClass::AddedOnPrimary));
        assert_eq!(diff.classify("b"), Some(DiffClass::Unchanged));
        assert_eq!(diff.classify("c"), Some(DiffClass::AddedOnReplica));
        assert_eq!(diff.added.len(), 2);
        assert_eq!(diff.added[0].target(), Side::Replica);
        assert_eq!(diff.added[1].target(), Side::Primary);
    }

    #[test]
    fn one_sided_update_follows_the_changed_side() {
        let old = user("a", "Ann");
        let new = user("a", "Anne");
        let baseline = baseline_of(&[&old]);

        let diff = DiffEngine::compute(
            EntityType::User,
            &[new.clone()],
            &[old.clone()],
            &baseline,
        );
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].source, Side::Primary);
        assert_eq!(diff.updated[0].entity.as_ref(), Some(&new));

        let diff = DiffEngine::compute(EntityType::User, &[old], &[new.clone()], &baseline);
        assert_eq!(diff.updated[0].source, Side::Replica);
    }

    #[test]
    fn both_sides_changed_is_divergent() {
        let old = user("a", "Ann");
        let baseline = baseline_of(&[&old]);

        let diff = DiffEngine::compute(
            EntityType::User,
            &[user("a", "Anna")],
            &[user("a", "Annie")],
            &baseline,
        );
        assert_eq!(diff.classify("a"), Some(DiffClass::UpdatedDivergent));
        assert_eq!(diff.conflicted[0].baseline.as_ref(), Some(&old.version));
    }

    #[test]
    fn independent_creation_is_divergent() {
        let diff = DiffEngine::compute(
            EntityType::User,
            &[user("a", "Anna")],
            &[user("a", "Annie")],
            &Baseline::new(),
        );
        assert_eq!(diff.classify("a"), Some(DiffClass::UpdatedDivergent));
        assert!(diff.conflicted[0].baseline.is_none());
    }

    #[test]
    fn one_sided_deletion_propagates() {
        let a = user("a", "Ann");
        let baseline = baseline_of(&[&a]);

        let diff = DiffEngine::compute(EntityType::User, &[a.clone()], &[], &baseline);
        assert_eq!(diff.deleted.len(), 1);
        assert_eq!(diff.deleted[0].source, Side::Replica);
        assert_eq!(diff.deleted[0].target(), Side::Primary);
        assert!(diff.deleted[0].is_delete());

        let diff = DiffEngine::compute(EntityType::User, &[], &[a], &baseline);
        assert_eq!(diff.deleted[0].target(), Side::Replica);
    }

    #[test]
    fn update_against_delete_is_divergent() {
        let a = user("a", "Ann");
        let baseline = baseline_of(&[&a]);

        let diff = DiffEngine::compute(EntityType::User, &[user("a", "Anne")], &[], &baseline);
        assert_eq!(diff.classify("a"), Some(DiffClass::UpdatedDivergent));
        assert!(diff.conflicted[0].replica.is_none());
    }

    #[test]
    fn deleted_on_both_sides_vanishes() {
        let a = user("a", "Ann");
        let baseline = baseline_of(&[&a]);

        let diff = DiffEngine::compute(EntityType::User, &[], &[], &baseline);
        assert_eq!(diff.vanished, vec!["a".to_string()]);
        assert!(diff.is_empty());
    }

    fn entity_set() -> impl Strategy<Value = Vec<Entity>> {
        prop::collection::btree_map("[a-f]{1,2}", "[a-z]{0,4}", 0..12).prop_map(|m| {
            m.into_iter()
                .map(|(id, name)| user(&id, &name))
                .collect::<Vec<_>>()
        })
    }

    proptest! {
        #[test]
        fn identical_snapshots_have_empty_diff(set in entity_set()) {
            let diff = DiffEngine::compute(EntityType::User, &set, &set, &Baseline::new());
            prop_assert!(diff.is_empty());
            prop_assert_eq!(diff.unchanged.len(), set.len());
        }

        #[test]
        fn swapping_sides_swaps_additions(p in entity_set(), r in entity_set()) {
            let forward = DiffEngine::compute(EntityType::User, &p, &r, &Baseline::new());
            let backward = DiffEngine::compute(EntityType::User, &r, &p, &Baseline::new());

            for entry in &forward.added {
                let expected = match entry.source {
                    Side::Primary => DiffClass::AddedOnReplica,
                    Side::Replica => DiffClass::AddedOnPrimary,
                };
                prop_assert_eq!(backward.classify(&entry.entity_id), Some(expected));
            }
            prop_assert_eq!(forward.conflicted.len(), backward.conflicted.len());
        }

        #[test]
        fn every_key_lands_in_exactly_one_class(
            p in entity_set(),
            r in entity_set(),
            b in entity_set(),
        ) {
            let baseline = b.iter().map(|e| (e.entity_id.clone(), e.version.clone())).collect();
            let diff = DiffEngine::compute(EntityType::User, &p, &r, &baseline);

            let mut keys: BTreeSet<String> = BTreeSet::new();
            keys.extend(p.iter().map(|e| e.entity_id.clone()));
            keys.extend(r.iter().map(|e| e.entity_id.clone()));
            keys.extend(b.iter().map(|e| e.entity_id.clone()));

            let total = diff.added.len()
                + diff.updated.len()
                + diff.deleted.len()
                + diff.conflicted.len()
                + diff.unchanged.len()
                + diff.vanished.len();
            prop_assert_eq!(total, keys.len());
            for key in &keys {
                prop_assert!(diff.classify(key).is_some());
            }
        }
    }
}
