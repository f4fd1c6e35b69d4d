//! # EdgeSync Server
//!
//! HTTP surface for the EdgeSync engine.
//!
//! This crate provides:
//! - Trigger, status, cancel and conflict endpoints over a [`SyncService`]
//! - Auto-sync control
//! - Webhook ingress (HMAC-SHA256 signed notifications)
//! - Environment configuration and server bootstrap
//!
//! # Endpoints
//!
//! | Method | Path | Result |
//! |---|---|---|
//! | `POST` | `/sync?direction=&entityType=&role=&academyId=` | `202 {runId}` |
//! | `GET` | `/sync/status` | both stores' counts and recent runs |
//! | `GET` | `/sync/{runId}` | the run, wherever it is |
//! | `POST` | `/sync/{runId}/cancel` | the run after cancellation |
//! | `GET` | `/sync/{runId}/conflicts` | conflicts the run recorded |
//! | `GET`/`POST` | `/auto-sync` | auto-sync config and counters |
//! | `POST` | `/webhook` | `202 {runId}` or `401` |
//! | `GET` | `/healthz` | liveness and queue length |
//!
//! Errors are JSON `{"error": "..."}`.
//!
//! # Identity
//!
//! The server does not authenticate users. An upstream identity layer
//! forwards the caller in `x-authenticated-user`, which is recorded as the
//! run's `triggeredBy`.
//!
//! [`SyncService`]: edgesync_engine::SyncService

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod routes;
mod server;
mod webhook;

pub use config::{ConfigError, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use routes::{app_router, AppState, RunAccepted, AUTHENTICATED_USER_HEADER};
pub use server::SyncServer;
pub use webhook::{WebhookConfig, WebhookNotification, WebhookVerifier};
