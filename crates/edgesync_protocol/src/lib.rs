//! # EdgeSync Protocol
//!
//! Entity model and sync decision logic for EdgeSync.
//!
//! This crate provides:
//! - `Entity` with content-derived `Version`s
//! - `DiffEngine` for classifying divergence between two snapshots
//! - `ConflictResolver` and `SyncConflict` audit records
//! - `SyncRequest` / `SyncRun` run records and their lifecycle
//! - `AutoSyncConfig` and `StatsSnapshot`
//!
//! This is a pure crate with no I/O operations.
//!
//! ## Key Invariants
//!
//! - `entityId` is the only cross-store correlation key
//! - Versions are derived from payloads, never trusted from storage
//! - Conflict resolution is deterministic
//! - Terminal runs are immutable

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auto_sync;
mod conflict;
mod diff;
mod entity;
mod error;
mod run;
mod stats;

pub use auto_sync::{AutoSyncConfig, DEFAULT_INTERVAL_MS};
pub use conflict::{ConflictPolicy, ConflictResolver, Resolution, SyncConflict};
pub use diff::{Baseline, Diff, DiffClass, DiffEngine, DiffEntry, Divergence};
pub use entity::{
    validate_entity_id, Entity, EntityType, InvalidEntity, Payload, Side, Version,
    MAX_ENTITY_ID_LEN,
};
pub use error::{ProtocolError, ProtocolResult};
pub use run::{
    Direction, EntityTypeOutcome, ErrorKind, RunCounts, RunError, RunStatus, SyncRequest,
    SyncRun, SyncScope, Trigger, TypeStatus,
};
pub use stats::StatsSnapshot;
