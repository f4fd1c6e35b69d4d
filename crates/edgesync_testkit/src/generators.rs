//! Property-based test generators using proptest.

use crate::fixtures::{at, user};
use edgesync_protocol::Entity;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for valid entity IDs.
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,15}").expect("Invalid regex")
}

/// Strategy for user roles.
pub fn role_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["STUDENT", "TEACHER", "DIRECTOR", "ADMIN"])
}

/// Strategy for a single user.
pub fn user_strategy() -> impl Strategy<Value = Entity> {
    (
        entity_id_strategy(),
        "[A-Z][a-z]{1,8}",
        role_strategy(),
        prop::sample::select(vec!["acad-1", "acad-2"]),
        0i64..10_000,
    )
        .prop_map(|(id, name, role, academy, minutes)| user(&id, &name, role, academy, at(minutes)))
}

/// Strategy for a set of users with distinct IDs.
pub fn users_strategy(max: usize) -> impl Strategy<Value = Vec<Entity>> {
    prop::collection::vec(user_strategy(), 0..max).prop_map(|users| {
        users
            .into_iter()
            .map(|u| (u.entity_id.clone(), u))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect()
    })
}

/// How one ID is placed in a generated store pair.
#[derive(Debug, Clone, Copy)]
enum Placement {
    PrimaryOnly,
    ReplicaOnly,
    Both,
    BothEdited,
}

/// Strategy for the contents of two stores that overlap partially.
///
/// Some IDs live on one side only, some on both with the same content, and
/// some on both with different content and timestamps.
pub fn store_pair_strategy(max: usize) -> impl Strategy<Value = (Vec<Entity>, Vec<Entity>)> {
    users_strategy(max)
        .prop_flat_map(|users| {
            let n = users.len();
            let placements = prop::collection::vec(
                prop::sample::select(vec![
                    Placement::PrimaryOnly,
                    Placement::ReplicaOnly,
                    Placement::Both,
                    Placement::BothEdited,
                ]),
                n,
            );
            (Just(users), placements)
        })
        .prop_map(|(users, placements)| {
            let mut primary = Vec::new();
            let mut replica = Vec::new();
            for (u, placement) in users.into_iter().zip(placements) {
                match placement {
                    Placement::PrimaryOnly => primary.push(u),
                    Placement::ReplicaOnly => replica.push(u),
                    Placement::Both => {
                        replica.push(u.clone());
                        primary.push(u);
                    }
                    Placement::BothEdited => {
                        let mut edited = u.payload.clone();
                        edited.insert("name".into(), serde_json::json!("Edited"));
                        let later = u.updated_at + chrono::Duration::minutes(5);
                        replica.push(Entity::new(
                            u.entity_type,
                            u.entity_id.clone(),
                            later,
                            edited,
                        ));
                        primary.push(u);
                    }
                }
            }
            (primary, replica)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgesync_protocol::validate_entity_id;
    use std::collections::BTreeSet;

    proptest! {
        #[test]
        fn generated_ids_are_valid(id in entity_id_strategy()) {
            prop_assert!(validate_entity_id(&id).is_ok());
        }

        #[test]
        fn users_have_distinct_ids(users in users_strategy(20)) {
            let ids: BTreeSet<_> = users.iter().map(|u| u.entity_id.clone()).collect();
            prop_assert_eq!(ids.len(), users.len());
        }
    }
}
