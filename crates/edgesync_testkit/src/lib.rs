//! # EdgeSync Testkit
//!
//! Test utilities for EdgeSync.
//!
//! This crate provides:
//! - Entity fixtures (users, academies, role aggregates)
//! - `SyncHarness`, two in-memory stores wired to an orchestrator
//! - `StateDir` for file-backed engine state
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use edgesync_testkit::prelude::*;
//!
//! #[test]
//! fn copies_new_users() {
//!     let harness = SyncHarness::new();
//!     harness.primary.insert_all(&students("s", "acad-1", 10));
//!     harness.run(Direction::ToReplica);
//!     harness.assert_converged();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use edgesync_protocol::Direction;
}

pub use fixtures::*;
pub use generators::*;
