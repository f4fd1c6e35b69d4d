//! Mirrored entities and their content versions.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque field map carried by an entity.
///
/// A `BTreeMap` keeps keys sorted so the JSON encoding is canonical.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Maximum length of an entity ID.
pub const MAX_ENTITY_ID_LEN: usize = 128;

/// One of the two datastores kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    /// The system-of-record relational store.
    Primary,
    /// The edge replica.
    Replica,
}

impl Side {
    /// Returns the other side.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Primary => Side::Replica,
            Side::Replica => Side::Primary,
        }
    }

    /// Returns the lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Primary => "primary",
            Side::Replica => "replica",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of mirrored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    /// A user account (student, teacher, director, ...).
    User,
    /// An academy.
    Academy,
    /// Per-academy role counts.
    RoleAggregate,
}

impl EntityType {
    /// All entity types, in default processing order.
    pub const ALL: [EntityType; 3] = [
        EntityType::User,
        EntityType::Academy,
        EntityType::RoleAggregate,
    ];

    /// Returns the wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::Academy => "academy",
            EntityType::RoleAggregate => "roleAggregate",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "user" | "users" => Ok(EntityType::User),
            "academy" | "academies" => Ok(EntityType::Academy),
            "roleaggregate" | "roleaggregates" => Ok(EntityType::RoleAggregate),
            _ => Err(ProtocolError::UnknownEntityType(s.to_string())),
        }
    }
}

/// Content version of an entity: hex SHA-256 of the canonical payload encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    /// Computes the version of a payload.
    pub fn of_payload(payload: &Payload) -> Self {
        // Serializing a string-keyed map cannot fail.
        let canonical = serde_json::to_vec(payload).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        Self(hex::encode(digest))
    }

    /// Wraps an already computed version string.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a 12-character prefix for log output.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A domain row mirrored on both stores.
///
/// `entity_id` is the only field used to correlate rows across stores and is
/// never regenerated by either side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Stable cross-store key.
    pub entity_id: String,
    /// Kind of record.
    pub entity_type: EntityType,
    /// Content version, derived from `payload`.
    pub version: Version,
    /// Store-local modification time.
    pub updated_at: DateTime<Utc>,
    /// Field map.
    pub payload: Payload,
}

impl Entity {
    /// Creates an entity, deriving its version from the payload.
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        updated_at: DateTime<Utc>,
        payload: Payload,
    ) -> Self {
        let version = Version::of_payload(&payload);
        Self {
            entity_id: entity_id.into(),
            entity_type,
            version,
            updated_at,
            payload,
        }
    }

    /// Decodes an entity from its stored text columns.
    ///
    /// This is the single decode path shared by every connector, so a row is
    /// judged valid or invalid the same way regardless of which store it came from.
    pub fn from_stored(
        entity_type: EntityType,
        entity_id: &str,
        updated_at: &str,
        payload_json: &str,
    ) -> ProtocolResult<Self> {
        validate_entity_id(entity_id)?;

        let updated_at = DateTime::parse_from_rfc3339(updated_at)
            .map_err(|e| {
                ProtocolError::invalid_entity(
                    entity_id,
                    format!("bad updatedAt {updated_at:?}: {e}"),
                )
            })?
            .with_timezone(&Utc);

        let value: serde_json::Value = serde_json::from_str(payload_json).map_err(|e| {
            ProtocolError::invalid_entity(entity_id, format!("payload is not valid JSON: {e}"))
        })?;
        let payload = match value {
            serde_json::Value::Object(map) => map.into_iter().collect::<Payload>(),
            other => {
                return Err(ProtocolError::invalid_entity(
                    entity_id,
                    format!("payload must be a JSON object, got {}", json_kind(&other)),
                ))
            }
        };

        Ok(Self::new(entity_type, entity_id, updated_at, payload))
    }

    /// Encodes the payload as canonical JSON text for storage.
    pub fn payload_json(&self) -> String {
        serde_json::to_string(&self.payload).unwrap_or_else(|_| "{}".to_string())
    }

    /// Returns `updated_at` as RFC 3339 text with millisecond precision.
    pub fn updated_at_text(&self) -> String {
        self.updated_at
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    /// Returns a payload field as a string, if present and a string.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(|v| v.as_str())
    }
}

/// Checks that an entity ID is usable as a cross-store key.
pub fn validate_entity_id(entity_id: &str) -> ProtocolResult<()> {
    if entity_id.is_empty() {
        return Err(ProtocolError::invalid_entity(entity_id, "entity id is empty"));
    }
    if entity_id.len() > MAX_ENTITY_ID_LEN {
        return Err(ProtocolError::invalid_entity(
            entity_id,
            format!("entity id longer than {MAX_ENTITY_ID_LEN} bytes"),
        ));
    }
    if entity_id
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ProtocolError::invalid_entity(
            entity_id,
            "entity id contains whitespace or control characters",
        ));
    }
    Ok(())
}

/// A row that was read from a store but failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidEntity {
    /// Entity ID as stored.
    pub entity_id: String,
    /// Validation failure.
    pub reason: String,
}

impl InvalidEntity {
    /// Converts a protocol error into an invalid-entity record.
    pub fn from_error(entity_id: &str, error: ProtocolError) -> Self {
        match error {
            ProtocolError::InvalidEntity { entity_id, reason } => Self { entity_id, reason },
            other => Self {
                entity_id: entity_id.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn payload(pairs: &[(&str, serde_json::Value)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn entity_type_parsing() {
        assert_eq!("user".parse::<EntityType>().unwrap(), EntityType::User);
        assert_eq!("Users".parse::<EntityType>().unwrap(), EntityType::User);
        assert_eq!(
            "role_aggregate".parse::<EntityType>().unwrap(),
            EntityType::RoleAggregate
        );
        assert_eq!(
            "roleAggregate".parse::<EntityType>().unwrap(),
            EntityType::RoleAggregate
        );
        assert!(matches!(
            "classroom".parse::<EntityType>(),
            Err(ProtocolError::UnknownEntityType(_))
        ));
    }

    #[test]
    fn entity_type_serde_names() {
        let json = serde_json::to_string(&EntityType::RoleAggregate).unwrap();
        assert_eq!(json, "\"roleAggregate\"");
    }

    #[test]
    fn version_ignores_key_order() {
        let a = payload(&[("name", json!("Kim")), ("role", json!("STUDENT"))]);
        let mut b = Payload::new();
        b.insert("role".into(), json!("STUDENT"));
        b.insert("name".into(), json!("Kim"));
        assert_eq!(Version::of_payload(&a), Version::of_payload(&b));

        let c = payload(&[("name", json!("Lee")), ("role", json!("STUDENT"))]);
        assert_ne!(Version::of_payload(&a), Version::of_payload(&c));
        assert_eq!(Version::of_payload(&a).as_str().len(), 64);
        assert_eq!(Version::of_payload(&a).short().len(), 12);
    }

    #[test]
    fn decode_stored_row() {
        let entity = Entity::from_stored(
            EntityType::User,
            "user-1",
            "2024-03-01T10:00:00.000Z",
            r#"{"email":"kim@example.com","role":"STUDENT"}"#,
        )
        .unwrap();

        assert_eq!(entity.entity_id, "user-1");
        assert_eq!(
            entity.updated_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(entity.field_str("role"), Some("STUDENT"));
        assert_eq!(entity.version, Version::of_payload(&entity.payload));
    }

    #[test]
    fn decode_rejects_malformed_rows() {
        let err = Entity::from_stored(EntityType::User, "u1", "yesterday", "{}").unwrap_err();
        assert!(err.to_string().contains("updatedAt"));

        let at = "2024-03-01T10:00:00Z";
        let err = Entity::from_stored(EntityType::User, "u1", at, "[1,2]").unwrap_err();
        assert!(err.to_string().contains("array"));

        let err = Entity::from_stored(EntityType::User, "u1", at, "{oops").unwrap_err();
        assert!(err.to_string().contains("JSON"));

        let err = Entity::from_stored(EntityType::User, "has space", at, "{}").unwrap_err();
        assert!(err.to_string().contains("whitespace"));
    }

    #[test]
    fn entity_id_limits() {
        assert!(validate_entity_id("").is_err());
        assert!(validate_entity_id(&"x".repeat(MAX_ENTITY_ID_LEN)).is_ok());
        assert!(validate_entity_id(&"x".repeat(MAX_ENTITY_ID_LEN + 1)).is_err());
    }

    #[test]
    fn payload_text_roundtrips_version() {
        let entity = Entity::new(
            EntityType::Academy,
            "academy-9",
            Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap(),
            payload(&[("name", json!("Seoul Math")), ("seats", json!(40))]),
        );
        let decoded = Entity::from_stored(
            EntityType::Academy,
            &entity.entity_id,
            &entity.updated_at_text(),
            &entity.payload_json(),
        )
        .unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn side_opposite() {
        assert_eq!(Side::Primary.opposite(), Side::Replica);
        assert_eq!(Side::Replica.opposite(), Side::Primary);
        assert_eq!(Side::Replica.to_string(), "replica");
    }
}
