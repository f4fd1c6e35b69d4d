//! HTTP routes.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use edgesync_engine::{Enqueued, HealthReport, SyncService};
use edgesync_protocol::{
    AutoSyncConfig, Direction, EntityType, SyncConflict, SyncRequest, SyncRun, SyncScope,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ServerError, ServerResult};
use crate::webhook::{WebhookNotification, WebhookVerifier};

/// Header the upstream identity layer uses to name the caller.
pub const AUTHENTICATED_USER_HEADER: &str = "x-authenticated-user";

/// Shared state of all handlers.
#[derive(Clone)]
pub struct AppState {
    service: Arc<SyncService>,
    webhook: Arc<WebhookVerifier>,
}

impl AppState {
    /// Wraps a running service and a webhook verifier.
    pub fn new(service: Arc<SyncService>, webhook: WebhookVerifier) -> Self {
        Self {
            service,
            webhook: Arc::new(webhook),
        }
    }

    /// The service behind the routes.
    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }
}

/// Builds the router.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sync", post(trigger_sync))
        .route("/sync/status", get(sync_status))
        .route("/sync/{run_id}", get(get_run))
        .route("/sync/{run_id}/cancel", post(cancel_run))
        .route("/sync/{run_id}/conflicts", get(run_conflicts))
        .route("/auto-sync", get(get_auto_sync).post(set_auto_sync))
        .route("/webhook", post(webhook))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

/// Runs a blocking service call off the async workers.
async fn blocking<T, F>(service: Arc<SyncService>, f: F) -> ServerResult<T>
where
    F: FnOnce(&SyncService) -> ServerResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&service))
        .await
        .map_err(|e| ServerError::Internal(format!("blocking task failed: {e}")))?
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    queue_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_run: Option<Uuid>,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        queue_length: state.service.queue_len(),
        active_run: state.service.active_run(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
struct TriggerBody {
    dry_run: bool,
}

/// Response to an accepted trigger.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
    /// ID the run carries.
    pub run_id: Uuid,
    /// True if the request joined an identical pending run.
    pub coalesced: bool,
}

impl From<Enqueued> for RunAccepted {
    fn from(enqueued: Enqueued) -> Self {
        Self {
            run_id: enqueued.run_id(),
            coalesced: matches!(enqueued, Enqueued::Coalesced(_)),
        }
    }
}

/// Parses the `POST /sync` query string.
///
/// `entityType` may repeat or carry a comma-separated list. A missing
/// direction means bidirectional.
fn parse_sync_query(params: &[(String, String)]) -> ServerResult<(Direction, SyncScope)> {
    let mut direction = Direction::default();
    let mut scope = SyncScope::all();
    for (key, value) in params {
        match key.as_str() {
            "direction" => direction = value.parse()?,
            "entityType" | "entityTypes" => {
                for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                    let entity_type: EntityType = name.parse()?;
                    if !scope.entity_types.contains(&entity_type) {
                        scope.entity_types.push(entity_type);
                    }
                }
            }
            "role" => scope = scope.with_role(value.trim()),
            "academyId" => scope = scope.with_academy(value.trim()),
            other => {
                return Err(ServerError::InvalidRequest(format!(
                    "unknown query parameter: {other}"
                )))
            }
        }
    }
    Ok((direction, scope))
}

fn triggered_by(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHENTICATED_USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

async fn trigger_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> ServerResult<(StatusCode, Json<RunAccepted>)> {
    let (direction, scope) = parse_sync_query(&params)?;
    let body: TriggerBody = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServerError::InvalidRequest(format!("invalid body: {e}")))?
    };

    let request =
        SyncRequest::manual(direction, body.dry_run, triggered_by(&headers)).with_scope(scope);
    let enqueued = state.service.trigger(request)?;
    Ok((StatusCode::ACCEPTED, Json(enqueued.into())))
}

async fn sync_status(State(state): State<AppState>) -> ServerResult<Json<HealthReport>> {
    let report = blocking(state.service, |service| Ok(service.health())).await?;
    Ok(Json(report))
}

fn parse_run_id(raw: &str) -> ServerResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ServerError::InvalidRequest(format!("invalid run id: {raw}")))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ServerResult<Json<SyncRun>> {
    let run_id = parse_run_id(&run_id)?;
    let run = blocking(state.service, move |service| {
        service
            .find_run(run_id)
            .ok_or_else(|| ServerError::NotFound(format!("run {run_id}")))
    })
    .await?;
    Ok(Json(run))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ServerResult<Json<SyncRun>> {
    let run_id = parse_run_id(&run_id)?;
    let run = blocking(state.service, move |service| Ok(service.cancel(run_id)?)).await?;
    Ok(Json(run))
}

async fn run_conflicts(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ServerResult<Json<Vec<SyncConflict>>> {
    let run_id = parse_run_id(&run_id)?;
    let conflicts =
        blocking(state.service, move |service| Ok(service.conflicts_for(run_id)?)).await?;
    Ok(Json(conflicts))
}

async fn get_auto_sync(State(state): State<AppState>) -> Json<AutoSyncConfig> {
    Json(state.service.auto_sync())
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
enum AutoSyncAction {
    Start,
    Stop,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutoSyncBody {
    action: AutoSyncAction,
    #[serde(default)]
    interval_ms: Option<u64>,
}

async fn set_auto_sync(
    State(state): State<AppState>,
    payload: Result<Json<AutoSyncBody>, JsonRejection>,
) -> ServerResult<Json<AutoSyncConfig>> {
    let Json(body) = payload?;
    let config = blocking(state.service, move |service| {
        let config = match body.action {
            AutoSyncAction::Start => {
                let interval_ms = body
                    .interval_ms
                    .unwrap_or_else(|| service.auto_sync().interval_ms);
                service.start_auto_sync(interval_ms)?
            }
            AutoSyncAction::Stop => service.stop_auto_sync()?,
        };
        Ok(config)
    })
    .await?;
    Ok(Json(config))
}

async fn webhook(
    State(state): State<AppState>,
    payload: Result<Json<WebhookNotification>, JsonRejection>,
) -> ServerResult<(StatusCode, Json<RunAccepted>)> {
    let Json(notification) = payload?;
    let entity_type = state
        .webhook
        .verify(&notification, Utc::now())
        .inspect_err(|e| {
            warn!(error = %e, entity_type = %notification.entity_type, "webhook rejected")
        })?;

    let enqueued = state.service.webhook(entity_type)?;
    info!(
        run_id = %enqueued.run_id(),
        %entity_type,
        changed_at = %notification.changed_at,
        "webhook accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(enqueued.into())))
}
