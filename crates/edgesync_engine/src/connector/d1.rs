//! Edge replica reached through a D1-style HTTP query API.
//!
//! The wire contract is a single endpoint that accepts either one statement
//! `{sql, params}` or an atomic batch `{batch: [{sql, params}, ...]}` and
//! answers `{success, result: [{results: [row, ...]}], errors: [...]}`.
//!
//! The HTTP client is abstracted behind [`QueryClient`] so the connector can be
//! exercised against [`LoopbackQueryClient`], which executes the statements on
//! an in-memory SQLite database.

use super::sql::{
    is_plain_field, CHECKSUM_SQL, COUNT_BY_FIELD_SQL, COUNT_SQL, CREATE_TABLE_SQL, DELETE_SQL,
    PING_SQL, SELECT_ALL_SQL, UPSERT_SQL,
};
use super::{AppliedResult, Changeset, Snapshot, StoreConnector};
use crate::error::{SyncError, SyncResult};
use edgesync_protocol::{EntityType, Side};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Number of re-reads after a torn snapshot before giving up.
const SNAPSHOT_RETRIES: usize = 1;

/// Transport for query requests.
///
/// Implement this trait to plug in an HTTP library, or to answer requests
/// in-process for tests.
pub trait QueryClient: Send + Sync {
    /// Sends a JSON request body and returns the JSON response body.
    fn post(&self, body: &[u8]) -> SyncResult<Vec<u8>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Statement {
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
}

impl Statement {
    fn new(sql: &str, params: Vec<Value>) -> Self {
        Self {
            sql: sql.to_string(),
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum QueryBody {
    Batch { batch: Vec<Statement> },
    Single(Statement),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    results: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    message: String,
}

type Row = Map<String, Value>;

/// Store connector for the edge replica.
pub struct D1Connector<C: QueryClient> {
    client: C,
    name: String,
}

impl<C: QueryClient> std::fmt::Debug for D1Connector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("D1Connector")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<C: QueryClient> D1Connector<C> {
    /// Creates a connector over a query client.
    pub fn new(client: C) -> Self {
        Self {
            client,
            name: Side::Replica.as_str().to_string(),
        }
    }

    /// Sets the name used in logs and errors.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn execute(&self, mut statements: Vec<Statement>) -> SyncResult<Vec<StatementResult>> {
        let body = if statements.len() == 1 {
            QueryBody::Single(statements.remove(0))
        } else {
            QueryBody::Batch { batch: statements }
        };
        let request = serde_json::to_vec(&body)?;
        let response = self.client.post(&request)?;

        let envelope: Envelope = serde_json::from_slice(&response).map_err(|e| {
            SyncError::connectivity_fatal(&self.name, format!("malformed response: {e}"))
        })?;
        if !envelope.success {
            let message = envelope
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(SyncError::connectivity_fatal(
                &self.name,
                format!("query rejected: {message}"),
            ));
        }
        Ok(envelope.result)
    }

    fn query(&self, sql: &str, params: Vec<Value>) -> SyncResult<Vec<Row>> {
        Ok(self
            .execute(vec![Statement::new(sql, params)])?
            .into_iter()
            .next()
            .map(|r| r.results)
            .unwrap_or_default())
    }

    fn text(&self, row: &Row, column: &str) -> SyncResult<String> {
        match row.get(column) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Null) | None => Err(SyncError::connectivity_fatal(
                &self.name,
                format!("row is missing column {column}"),
            )),
            Some(other) => Ok(other.to_string()),
        }
    }

    fn number(row: &Row, column: &str) -> u64 {
        row.get(column).and_then(Value::as_u64).unwrap_or(0)
    }
}

impl<C: QueryClient> StoreConnector for D1Connector<C> {
    fn side(&self) -> Side {
        Side::Replica
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn ping(&self) -> SyncResult<()> {
        self.query(PING_SQL, Vec::new()).map(|_| ())
    }

    fn fetch_all(&self, entity_type: EntityType) -> SyncResult<Snapshot> {
        let type_param = vec![json!(entity_type.as_str())];

        for attempt in 0..=SNAPSHOT_RETRIES {
            let rows = self.query(SELECT_ALL_SQL, type_param.clone())?;
            let raw = rows
                .iter()
                .map(|row| {
                    Ok((
                        self.text(row, "entity_id")?,
                        self.text(row, "updated_at")?,
                        self.text(row, "payload")?,
                    ))
                })
                .collect::<SyncResult<Vec<_>>>()?;

            let checksum = self.query(CHECKSUM_SQL, type_param.clone())?;
            let (remote_count, remote_latest) = checksum
                .first()
                .map(|row| {
                    (
                        Self::number(row, "n"),
                        row.get("latest").and_then(Value::as_str).map(str::to_string),
                    )
                })
                .unwrap_or((0, None));

            let local_latest = raw.iter().map(|(_, updated_at, _)| updated_at.as_str()).max();
            if remote_count == raw.len() as u64 && remote_latest.as_deref() == local_latest {
                debug!(store = %self.name, %entity_type, rows = raw.len(), "fetched snapshot");
                return Ok(Snapshot::decode(entity_type, raw));
            }

            warn!(
                store = %self.name,
                %entity_type,
                attempt = attempt + 1,
                read = raw.len(),
                expected = remote_count,
                "snapshot changed while reading"
            );
        }

        Err(SyncError::connectivity_fatal(
            &self.name,
            format!("{entity_type} snapshot changed while reading"),
        ))
    }

    fn apply(&self, entity_type: EntityType, changeset: &Changeset) -> SyncResult<AppliedResult> {
        if changeset.is_empty() {
            return Ok(AppliedResult::default());
        }

        let mut statements = Vec::with_capacity(changeset.len());
        for entity in &changeset.upserts {
            statements.push(Statement::new(
                UPSERT_SQL,
                vec![
                    json!(entity_type.as_str()),
                    json!(entity.entity_id),
                    json!(entity.updated_at_text()),
                    json!(entity.payload_json()),
                ],
            ));
        }
        for entity_id in &changeset.deletes {
            statements.push(Statement::new(
                DELETE_SQL,
                vec![json!(entity_type.as_str()), json!(entity_id)],
            ));
        }

        // A batch commits or fails as a whole.
        self.execute(statements)?;
        Ok(AppliedResult {
            applied_count: changeset.len() as u64,
            failures: Vec::new(),
        })
    }

    fn count(&self, entity_type: EntityType) -> SyncResult<u64> {
        let rows = self.query(COUNT_SQL, vec![json!(entity_type.as_str())])?;
        Ok(rows.first().map(|row| Self::number(row, "n")).unwrap_or(0))
    }

    fn count_by_field(
        &self,
        entity_type: EntityType,
        field: &str,
    ) -> SyncResult<BTreeMap<String, u64>> {
        if !is_plain_field(field) {
            return Err(SyncError::Validation(format!("unsupported field name {field:?}")));
        }
        let rows = self.query(
            COUNT_BY_FIELD_SQL,
            vec![json!(entity_type.as_str()), json!(field)],
        )?;
        let mut counts = BTreeMap::new();
        for row in &rows {
            if let Some(value) = row.get("value").and_then(Value::as_str) {
                counts.insert(value.to_string(), Self::number(row, "n"));
            }
        }
        Ok(counts)
    }
}

/// Blocking HTTP client for a D1 query endpoint.
pub struct ReqwestQueryClient {
    http: reqwest::blocking::Client,
    url: String,
    token: Zeroizing<String>,
    timeout: Duration,
}

impl std::fmt::Debug for ReqwestQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestQueryClient")
            .field("url", &self.url)
            .field("token", &"[redacted]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ReqwestQueryClient {
    /// Creates a client for a full query URL.
    ///
    /// `timeout` bounds every request, connect included.
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Fatal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            token: Zeroizing::new(token.into()),
            timeout,
        })
    }

    /// Creates a client for a Cloudflare D1 database.
    pub fn cloudflare(
        account_id: &str,
        database_id: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        Self::new(
            format!(
                "https://api.cloudflare.com/client/v4/accounts/{account_id}\
                 /d1/database/{database_id}/query"
            ),
            token,
            timeout,
        )
    }

    /// Returns the query URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl QueryClient for ReqwestQueryClient {
    fn post(&self, body: &[u8]) -> SyncResult<Vec<u8>> {
        let store = Side::Replica.as_str();
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(self.token.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::Timeout {
                        store: store.to_string(),
                        after: self.timeout,
                    }
                } else {
                    SyncError::connectivity_retryable(store, e.to_string())
                }
            })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .map_err(|e| SyncError::connectivity_retryable(store, e.to_string()))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::Authentication(format!(
                "replica rejected credentials ({status})"
            )));
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SyncError::connectivity_retryable(
                store,
                format!("replica answered {status}"),
            ));
        }
        // Other 4xx answers still carry an error envelope worth reporting.
        Ok(bytes.to_vec())
    }
}

/// In-process [`QueryClient`] that executes statements on in-memory SQLite.
///
/// Used by tests and the demo mode. It can simulate an unreachable endpoint
/// and writers that race with a snapshot read.
pub struct LoopbackQueryClient {
    conn: Mutex<Connection>,
    reachable: AtomicBool,
    racing_writes: AtomicU32,
    requests: AtomicU64,
}

impl std::fmt::Debug for LoopbackQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackQueryClient")
            .field("reachable", &self.reachable.load(Ordering::SeqCst))
            .field("requests", &self.requests.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl LoopbackQueryClient {
    /// Creates a client over an empty database.
    pub fn new() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLE_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            reachable: AtomicBool::new(true),
            racing_writes: AtomicU32::new(0),
            requests: AtomicU64::new(0),
        })
    }

    /// Makes every request fail as if the endpoint were down.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Inserts a row between the next `n` snapshot reads and their checksum.
    pub fn race_next_snapshots(&self, n: u32) {
        self.racing_writes.store(n, Ordering::SeqCst);
    }

    /// Number of requests received.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    fn race_write(&self, conn: &Connection, statement: &Statement) -> rusqlite::Result<()> {
        let pending = self.racing_writes.load(Ordering::SeqCst);
        if pending == 0 || statement.sql != CHECKSUM_SQL {
            return Ok(());
        }
        self.racing_writes.store(pending - 1, Ordering::SeqCst);

        let entity_type = statement
            .params
            .first()
            .and_then(Value::as_str)
            .unwrap_or("user");
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        conn.execute(
            UPSERT_SQL,
            rusqlite::params![
                entity_type,
                format!("racing-{}", self.requests.load(Ordering::SeqCst)),
                now,
                "{}"
            ],
        )?;
        Ok(())
    }

    fn failure(message: impl std::fmt::Display) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(&json!({
            "success": false,
            "result": [],
            "errors": [{ "code": 7500, "message": message.to_string() }],
            "messages": [],
        }))?)
    }
}

impl QueryClient for LoopbackQueryClient {
    fn post(&self, body: &[u8]) -> SyncResult<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::connectivity_retryable(
                Side::Replica.as_str(),
                "connection refused",
            ));
        }

        let statements = match serde_json::from_slice::<QueryBody>(body) {
            Ok(QueryBody::Batch { batch }) => batch,
            Ok(QueryBody::Single(statement)) => vec![statement],
            Err(e) => return Self::failure(format!("malformed request: {e}")),
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in &statements {
            if let Err(e) = self.race_write(&tx, statement) {
                return Self::failure(e);
            }
            match execute_statement(&tx, statement) {
                Ok(rows) => results.push(json!({ "results": rows, "success": true, "meta": {} })),
                // Dropping the transaction rolls the whole batch back.
                Err(e) => return Self::failure(e),
            }
        }
        tx.commit()?;

        Ok(serde_json::to_vec(&json!({
            "success": true,
            "result": results,
            "errors": [],
            "messages": [],
        }))?)
    }
}

fn execute_statement(conn: &Connection, statement: &Statement) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(&statement.sql)?;
    let params: Vec<SqlValue> = statement.params.iter().map(json_to_sql).collect();
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    if columns.is_empty() {
        stmt.execute(rusqlite::params_from_iter(params.iter()))?;
        return Ok(Vec::new());
    }

    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Map::new();
        for (i, name) in columns.iter().enumerate() {
            map.insert(name.clone(), sql_to_json(row.get_ref(i)?));
        }
        out.push(map);
    }
    Ok(out)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}
