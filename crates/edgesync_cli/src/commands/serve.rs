//! Serve command implementation.

use edgesync_server::{ServerConfig, SyncServer};
use std::net::SocketAddr;
use tracing::info;

/// Runs the server until Ctrl-C.
///
/// The service is started before the async runtime exists and shut down after
/// it is gone: the replica client blocks and must not live inside the runtime.
pub fn run(bind: Option<SocketAddr>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ServerConfig::from_env()?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    info!("Starting edgesync with config: {:?}", config);

    let server = SyncServer::from_config(&config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("edgesync-http")
        .build()?;

    let served = runtime.block_on(server.serve(config.bind_addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C");
        }
    }));
    drop(runtime);

    server.shutdown();
    served?;
    Ok(())
}
