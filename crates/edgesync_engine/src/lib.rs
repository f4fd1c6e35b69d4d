//! # EdgeSync Engine
//!
//! Keeps a primary SQL store and an edge replica consistent.
//!
//! This crate provides:
//! - `StoreConnector` with SQLite, D1 and in-memory implementations
//! - `SyncOrchestrator` (fetch, diff, resolve, apply per entity type)
//! - A FIFO `RunQueue` drained by a single `Worker`
//! - `Scheduler` for periodic auto-sync
//! - `StateStore` for baselines, checkpoints and auto-sync config
//! - `HistoryLog` and `StatsCollector` for the status panel
//! - `SyncService`, the facade the HTTP layer and CLI talk to
//!
//! ## Architecture
//!
//! Manual triggers, scheduler ticks and webhooks only enqueue. One worker
//! thread executes runs in arrival order, so runs never overlap. Within a
//! run, entity types are processed in configured order and each one is
//! checkpointed, so an interrupted run resumes where it stopped.
//!
//! ## Key Invariants
//!
//! - At most one run executes at a time
//! - A failure in one entity type never aborts the others
//! - Dry runs never write to a store or a baseline
//! - Errors are recorded on the run; `run` never fails
//! - History is append-only

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connector;
mod error;
mod history;
mod orchestrator;
mod queue;
mod retry;
mod scheduler;
mod service;
mod state;
mod stats;
mod worker;

pub use config::{EngineConfig, RetryConfig, MAX_INTERVAL, MIN_INTERVAL};
pub use connector::{
    AppliedResult, ApplyFailure, Changeset, D1Connector, LoopbackQueryClient, MemoryConnector,
    QueryClient, ReqwestQueryClient, Snapshot, SqliteConnector, StoreConnector, CREATE_TABLE_SQL,
};
pub use error::{SyncError, SyncResult};
pub use history::{FileHistoryLog, HistoryLog, MemoryHistoryLog};
pub use orchestrator::{CancelToken, SyncOrchestrator};
pub use queue::{Enqueued, RunQueue};
pub use retry::with_retry;
pub use scheduler::{Scheduler, SchedulerState};
pub use service::{ServiceParts, SyncService};
pub use state::{Checkpoint, FileStateStore, MemoryStateStore, StateStore};
pub use stats::{HealthReport, StatsCollector, StoreHealth, ROLE_FIELD};
pub use worker::{ActiveRun, ActiveSlot, RunListener, Worker};
