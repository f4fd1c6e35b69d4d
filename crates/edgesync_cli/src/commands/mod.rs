//! CLI command implementations.

pub mod serve;
pub mod sign_webhook;
pub mod status;
pub mod sync;

use clap::Args;
use edgesync_engine::{D1Connector, ReqwestQueryClient, SqliteConnector, StoreConnector};
use edgesync_protocol::Side;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where the two stores and the engine state live.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Primary SQLite database
    #[arg(long, env = "EDGESYNC_PRIMARY_PATH")]
    pub primary: PathBuf,

    /// Replica query endpoint
    #[arg(long, env = "EDGESYNC_REPLICA_URL")]
    pub replica_url: Option<String>,

    /// Replica bearer token
    #[arg(long, env = "EDGESYNC_REPLICA_TOKEN", hide_env_values = true)]
    pub replica_token: Option<String>,

    /// Use a local SQLite file as the replica (takes precedence over --replica-url)
    #[arg(long)]
    pub replica_db: Option<PathBuf>,

    /// Engine state and history directory
    #[arg(long, env = "EDGESYNC_STATE_DIR", default_value = ".edgesync")]
    pub state_dir: PathBuf,

    /// Timeout per store call, in milliseconds
    #[arg(long, default_value = "30000")]
    pub timeout_ms: u64,
}

/// Both connectors opened from [`StoreArgs`].
pub struct Stores {
    /// Primary connector.
    pub primary: Arc<dyn StoreConnector>,
    /// Replica connector.
    pub replica: Arc<dyn StoreConnector>,
}

impl StoreArgs {
    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Opens both stores.
    pub fn open(&self) -> Result<Stores, Box<dyn std::error::Error>> {
        let primary: Arc<dyn StoreConnector> = Arc::new(SqliteConnector::open(
            &self.primary,
            Side::Primary,
            self.timeout(),
        )?);

        let replica: Arc<dyn StoreConnector> = match (&self.replica_db, &self.replica_url) {
            (Some(path), _) => Arc::new(
                SqliteConnector::open(path, Side::Replica, self.timeout())?.with_name("replica"),
            ),
            (None, Some(url)) => {
                let token = self
                    .replica_token
                    .as_deref()
                    .ok_or("Replica token required with --replica-url")?;
                let client = ReqwestQueryClient::new(url.clone(), token, self.timeout())?;
                Arc::new(D1Connector::new(client))
            }
            (None, None) => return Err("Either --replica-url or --replica-db is required".into()),
        };

        Ok(Stores { primary, replica })
    }
}
