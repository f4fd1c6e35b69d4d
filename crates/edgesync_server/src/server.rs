//! Server bootstrap.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::routes::{app_router, AppState};
use crate::webhook::WebhookVerifier;
use axum::Router;
use edgesync_engine::{
    D1Connector, FileHistoryLog, FileStateStore, ReqwestQueryClient, ServiceParts, SqliteConnector,
    SyncService,
};
use edgesync_protocol::Side;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// The sync server.
///
/// Owns the running [`SyncService`] and serves its HTTP surface.
///
/// The replica client is a blocking HTTP client, so a server must be built
/// and dropped outside the async runtime. Only [`SyncServer::serve`] runs
/// inside it.
///
/// # Example
///
/// ```rust,ignore
/// use edgesync_server::{ServerConfig, SyncServer};
///
/// let config = ServerConfig::from_env()?;
/// let server = SyncServer::from_config(&config)?;
/// let runtime = tokio::runtime::Runtime::new()?;
/// runtime.block_on(server.serve(config.bind_addr, tokio::signal::ctrl_c()))?;
/// server.shutdown();
/// ```
pub struct SyncServer {
    service: Arc<SyncService>,
    state: AppState,
}

impl SyncServer {
    /// Wraps an already running service.
    pub fn new(service: SyncService, webhook: WebhookVerifier) -> Self {
        let service = Arc::new(service);
        let state = AppState::new(service.clone(), webhook);
        Self { service, state }
    }

    /// Opens the stores and engine state named by `config` and starts the
    /// service.
    pub fn from_config(config: &ServerConfig) -> ServerResult<Self> {
        std::fs::create_dir_all(&config.state_dir)?;

        let primary =
            SqliteConnector::open(&config.primary_path, Side::Primary, config.call_timeout)?;
        let client = ReqwestQueryClient::new(
            config.replica_url.clone(),
            config.replica_token.as_str(),
            config.call_timeout,
        )?;
        let replica = D1Connector::new(client);
        let state = FileStateStore::open(&config.state_dir)?;
        let history = FileHistoryLog::open(&config.state_dir)?;

        let service = SyncService::start(ServiceParts {
            primary: Arc::new(primary),
            replica: Arc::new(replica),
            state: Arc::new(state),
            history: Arc::new(history),
            config: config.engine_config(),
        })?;
        info!(
            primary = %config.primary_path.display(),
            replica = %config.replica_url,
            state_dir = %config.state_dir.display(),
            "sync service started"
        );

        Ok(Self::new(service, WebhookVerifier::new(config.webhook.clone())?))
    }

    /// The running service.
    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }

    /// Builds the HTTP router.
    pub fn router(&self) -> Router {
        app_router(self.state.clone())
    }

    /// Serves HTTP on `addr` until `shutdown` resolves.
    pub async fn serve<F>(&self, addr: SocketAddr, shutdown: F) -> ServerResult<()>
    where
        F: Future + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        info!("edgesync listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("shutdown signal received");
            })
            .await?;
        Ok(())
    }

    /// Stops the worker and the scheduler.
    ///
    /// Blocks until the active run has stopped.
    pub fn shutdown(&self) {
        self.service.shutdown();
    }
}

