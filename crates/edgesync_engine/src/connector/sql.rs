//! Table layout and statements shared by the SQL-backed connectors.

/// Schema of the entity table on both stores.
pub const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS sync_entities (
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    payload     TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
)";

pub(crate) const SELECT_ALL_SQL: &str = "SELECT entity_id, updated_at, payload \
     FROM sync_entities WHERE entity_type = ?1 ORDER BY entity_id";

pub(crate) const UPSERT_SQL: &str = "INSERT INTO sync_entities \
     (entity_type, entity_id, updated_at, payload) VALUES (?1, ?2, ?3, ?4) \
     ON CONFLICT (entity_type, entity_id) \
     DO UPDATE SET updated_at = excluded.updated_at, payload = excluded.payload";

pub(crate) const DELETE_SQL: &str =
    "DELETE FROM sync_entities WHERE entity_type = ?1 AND entity_id = ?2";

pub(crate) const COUNT_SQL: &str =
    "SELECT COUNT(*) AS n FROM sync_entities WHERE entity_type = ?1";

/// Row count and newest timestamp; used to detect a torn snapshot.
pub(crate) const CHECKSUM_SQL: &str = "SELECT COUNT(*) AS n, MAX(updated_at) AS latest \
     FROM sync_entities WHERE entity_type = ?1";

pub(crate) const COUNT_BY_FIELD_SQL: &str = "SELECT value, COUNT(*) AS n FROM ( \
     SELECT CASE WHEN json_valid(payload) THEN \
     CASE WHEN json_type(payload, '$.' || ?2) = 'text' \
     THEN json_extract(payload, '$.' || ?2) END END AS value \
     FROM sync_entities WHERE entity_type = ?1) \
     WHERE value IS NOT NULL GROUP BY value ORDER BY value";

pub(crate) const PING_SQL: &str = "SELECT 1";

/// Returns true if `field` is safe to splice into a JSON path.
pub(crate) fn is_plain_field(field: &str) -> bool {
    !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_fields() {
        assert!(is_plain_field("role"));
        assert!(is_plain_field("academy_id"));
        assert!(!is_plain_field(""));
        assert!(!is_plain_field("a.b"));
        assert!(!is_plain_field("x' OR 1=1"));
    }
}
