//! EdgeSync CLI
//!
//! Command-line entry point for the EdgeSync engine.
//!
//! # Commands
//!
//! - `serve` - Run the HTTP server, worker and scheduler
//! - `sync` - Run one sync in the foreground
//! - `status` - Compare both stores and list recent runs
//! - `sign-webhook` - Produce a signed webhook body

mod commands;

use clap::{Parser, Subcommand};
use commands::StoreArgs;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Keeps a primary SQL store and an edge replica in sync.
#[derive(Parser)]
#[command(name = "edgesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (configured from EDGESYNC_* variables)
    Serve {
        /// Override EDGESYNC_BIND_ADDR
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Run one sync in the foreground
    Sync {
        #[command(flatten)]
        stores: StoreArgs,

        /// toReplica, fromReplica or bidirectional
        #[arg(short, long, default_value = "bidirectional")]
        direction: String,

        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,

        /// Restrict to an entity type (repeatable)
        #[arg(short, long = "entity-type")]
        entity_types: Vec<String>,

        /// Only users with this role
        #[arg(long)]
        role: Option<String>,

        /// Only records of this academy
        #[arg(long)]
        academy_id: Option<String>,

        /// Recorded as the run's triggeredBy
        #[arg(long = "as")]
        triggered_by: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Compare both stores and list recent runs
    Status {
        #[command(flatten)]
        stores: StoreArgs,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print a signed webhook body
    SignWebhook {
        /// Entity type that changed
        #[arg(short, long)]
        entity_type: String,

        /// Change time, RFC 3339 (default: now)
        #[arg(long)]
        changed_at: Option<String>,

        /// Shared webhook secret
        #[arg(long, env = "EDGESYNC_WEBHOOK_SECRET", hide_env_values = true)]
        secret: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production injects the environment.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { bind } => {
            commands::serve::run(bind)?;
        }
        Commands::Sync {
            stores,
            direction,
            dry_run,
            entity_types,
            role,
            academy_id,
            triggered_by,
            format,
        } => {
            let options = commands::sync::SyncOptions {
                direction,
                dry_run,
                entity_types,
                role,
                academy_id,
                triggered_by,
            };
            commands::sync::run(&stores, options, &format)?;
        }
        Commands::Status { stores, format } => {
            commands::status::run(&stores, &format)?;
        }
        Commands::SignWebhook {
            entity_type,
            changed_at,
            secret,
        } => {
            commands::sign_webhook::run(&entity_type, changed_at.as_deref(), &secret)?;
        }
    }

    Ok(())
}
