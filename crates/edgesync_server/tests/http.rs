//! HTTP surface over a service backed by in-memory stores.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use edgesync_engine::SyncService;
use edgesync_protocol::EntityType;
use edgesync_server::{
    app_router, AppState, WebhookConfig, WebhookVerifier, AUTHENTICATED_USER_HEADER,
};
use edgesync_testkit::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &[u8] = b"webhook-secret-for-tests";

struct TestApp {
    harness: SyncHarness,
    service: Arc<SyncService>,
    router: Router,
    signer: WebhookVerifier,
    _dir: StateDir,
}

impl TestApp {
    fn new() -> Self {
        Self::with_harness(SyncHarness::new())
    }

    fn with_harness(harness: SyncHarness) -> Self {
        let dir = StateDir::new();
        let service = Arc::new(SyncService::start(harness.service_parts(&dir)).unwrap());
        let verifier = WebhookVerifier::new(WebhookConfig::new(SECRET.to_vec())).unwrap();
        let router = app_router(AppState::new(service.clone(), verifier.clone()));
        Self {
            harness,
            service,
            router,
            signer: verifier,
            _dir: dir,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    fn wait_finished(&self, run_id: Uuid) {
        wait_for("run to finish", || {
            self.service
                .find_run(run_id)
                .is_some_and(|run| run.status.is_terminal())
        });
    }
}

fn run_id(body: &Value) -> Uuid {
    body["runId"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn manual_trigger_is_accepted_and_tracked() {
    let app = TestApp::new();
    app.harness.primary.insert_all(&students("s", "acad-1", 3));

    let (status, body) = app
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/sync?direction=toReplica")
                .header(AUTHENTICATED_USER_HEADER, "admin@academy.test")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"dryRun":false}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = run_id(&body);

    app.wait_finished(id);
    let (status, run) = app.get(&format!("/sync/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "succeeded");
    assert_eq!(run["direction"], "toReplica");
    assert_eq!(run["triggeredBy"], "admin@academy.test");
    assert_eq!(run["counts"]["added"], 3);
    assert_eq!(app.harness.replica.len(EntityType::User), 3);
}

#[tokio::test]
async fn trigger_without_body_defaults_to_real_bidirectional_run() {
    let app = TestApp::new();
    app.harness.replica.insert_all(&students("r", "acad-1", 2));

    let (status, body) = app
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/sync?entityType=user")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let id = run_id(&body);
    app.wait_finished(id);
    let run = app.service.find_run(id).unwrap();
    assert!(!run.dry_run);
    assert_eq!(run.scope.entity_types, vec![EntityType::User]);
    assert_eq!(app.harness.primary.len(EntityType::User), 2);
}

#[tokio::test]
async fn invalid_trigger_is_a_bad_request() {
    let app = TestApp::new();

    let (status, body) = app.post("/sync?direction=sideways", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("sideways"));

    let (status, _) = app.post("/sync", json!({"dryRun": "yes"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.service.queue_len(), 0);
    assert!(app.service.recent_runs().is_empty());
}

#[tokio::test]
async fn unknown_runs_are_not_found() {
    let app = TestApp::new();
    let unknown = Uuid::new_v4();

    let (status, body) = app.get(&format!("/sync/{unknown}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = app.post(&format!("/sync/{unknown}/cancel"), json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.get(&format!("/sync/{unknown}/conflicts")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.get("/sync/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn queued_run_is_cancelled_over_http() {
    let app = TestApp::new();
    app.harness.primary.insert_all(&students("s", "acad-1", 2));
    app.harness
        .replica
        .set_apply_latency(Duration::from_millis(150));

    let (_, first) = app.post("/sync?direction=toReplica", json!({})).await;
    let first = run_id(&first);
    wait_for("first run to start", || app.service.active_run() == Some(first));

    let (_, second) = app.post("/sync?direction=toReplica", json!({})).await;
    let second = run_id(&second);
    let (status, run) = app.get(&format!("/sync/{second}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "pending");

    let (status, run) = app.post(&format!("/sync/{second}/cancel"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "cancelled");
    assert_eq!(app.service.queue_len(), 0);
}

#[tokio::test]
async fn conflicts_are_listed_per_run() {
    let app = TestApp::new();
    app.harness
        .primary
        .insert(&user("u1", "Primary", "STUDENT", "acad-1", at(1)));
    app.harness
        .replica
        .insert(&user("u1", "Replica", "STUDENT", "acad-1", at(2)));

    let (_, body) = app.post("/sync?direction=bidirectional", json!({})).await;
    let id = run_id(&body);
    app.wait_finished(id);

    let (status, conflicts) = app.get(&format!("/sync/{id}/conflicts")).await;
    assert_eq!(status, StatusCode::OK);
    let conflicts = conflicts.as_array().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["entityId"], "u1");
    assert_eq!(conflicts[0]["resolution"], "replicaWins");
}

#[tokio::test]
async fn status_reports_stores_even_when_one_is_down() {
    let app = TestApp::new();
    app.harness.primary.insert_all(&students("s", "acad-1", 4));
    let (_, body) = app.post("/sync?direction=toReplica", json!({})).await;
    app.wait_finished(run_id(&body));

    let (status, report) = app.get("/sync/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["primaryConnected"], true);
    assert_eq!(report["replicaConnected"], true);
    assert_eq!(report["recentRuns"].as_array().unwrap().len(), 1);

    app.harness.replica.set_unreachable(true);
    let (status, report) = app.get("/sync/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["replicaConnected"], false);
    assert!(report["replicaStats"].is_null());
    assert_eq!(report["recentRuns"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn auto_sync_can_be_started_and_stopped() {
    let app = TestApp::new();

    let (status, config) = app.get("/auto-sync").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["enabled"], false);

    let (status, config) = app
        .post("/auto-sync", json!({"action": "start", "intervalMs": 60_000}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["enabled"], true);
    assert_eq!(config["intervalMs"], 60_000);
    assert!(config["nextRunAt"].is_string());

    let (status, _) = app
        .post("/auto-sync", json!({"action": "start", "intervalMs": 1}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.post("/auto-sync", json!({"action": "pause"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, config) = app.post("/auto-sync", json!({"action": "stop"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["enabled"], false);
    assert!(config["nextRunAt"].is_null());
    assert_eq!(config["intervalMs"], 60_000);
    assert_eq!(config["totalRuns"], 0);
}

#[tokio::test]
async fn signed_webhook_enqueues_targeted_pull() {
    let app = TestApp::new();
    app.harness.replica.insert(&academy("acad-9", "East", at(0)));
    app.harness.replica.insert_all(&students("r", "acad-9", 2));

    let notification = app.signer.notification(EntityType::Academy, Utc::now());
    let (status, body) = app
        .post("/webhook", serde_json::to_value(&notification).unwrap())
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["coalesced"], false);

    let id = run_id(&body);
    app.wait_finished(id);
    let (_, run) = app.get(&format!("/sync/{id}")).await;
    assert_eq!(run["trigger"], "webhook");
    assert_eq!(run["direction"], "fromReplica");
    assert_eq!(app.harness.primary.len(EntityType::Academy), 1);
    assert_eq!(app.harness.primary.len(EntityType::User), 0);
}

#[tokio::test]
async fn bad_webhook_signature_is_rejected_without_work() {
    let app = TestApp::new();
    app.harness.replica.insert_all(&students("r", "acad-1", 2));
    let queue_before = app.service.queue_len();

    let mut notification = app.signer.notification(EntityType::User, Utc::now());
    notification.signature = "00".repeat(32);
    let (status, body) = app
        .post("/webhook", serde_json::to_value(&notification).unwrap())
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("signature"));
    assert_eq!(app.service.queue_len(), queue_before);
    assert!(app.service.active_run().is_none());
    assert!(app.service.recent_runs().is_empty());
    assert_eq!(app.harness.replica.fetch_calls(), 0);
}

#[tokio::test]
async fn replayed_or_unknown_webhooks_are_rejected() {
    let app = TestApp::new();

    let stale = app
        .signer
        .notification(EntityType::User, Utc::now() - ChronoDuration::hours(1));
    let (status, _) = app
        .post("/webhook", serde_json::to_value(&stale).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let changed_at = Utc::now().to_rfc3339();
    let signature = app.signer.sign("invoice", &changed_at);
    let unknown = json!({
        "entityType": "invoice",
        "changedAt": changed_at,
        "signature": signature,
    });
    let (status, _) = app.post("/webhook", unknown).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.post("/webhook", json!({"entityType": "user"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(app.service.queue_len(), 0);
    assert!(app.service.recent_runs().is_empty());
}

#[tokio::test]
async fn healthz_reports_queue_length() {
    let app = TestApp::new();

    let (status, body) = app.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queueLength"], 0);
    assert!(body["timestamp"].is_i64());
}
