//! # WorldSync Testkit
//!
//! Test utilities for WorldSync.
//!
//! This crate provides:
//! - Save-directory fixtures shaped like real worlds
//! - Property-based generators for directory trees
//!
//! ## Usage
//!
//! ```rust,ignore
//! use worldsync_testkit::prelude::*;
//!
//! #[test]
//! fn snapshot_of_sample() {
//!     with_sample_world("Survival", |world| {
//!         let snapshot = SnapshotBuilder::new().build(world.path()).unwrap();
//!         // ...
//!     });
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
}

pub use fixtures::*;
pub use generators::*;
