//! # Tessera Testkit
//!
//! Test utilities for Tessera.
//!
//! This crate provides:
//! - In-process multi-member clusters with explicit leader assignment
//! - File-backed partition storage in temporary directories
//! - Property-based generators for paths, nodes and modifications
//! - Concurrent commit stress harnesses
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn commits_on_three_members() {
//!     let cluster = TestCluster::new(&["m1", "m2", "m3"], DatastoreConfig::for_testing()).unwrap();
//!     cluster.add_shard("default").unwrap();
//!     cluster.elect("default", "m1", 1).await.unwrap();
//!     let datastore = cluster.datastore("m1");
//!     // ... transactions
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use crate::stress::*;
    pub use tessera_core::DatastoreConfig;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;

use tracing_subscriber::EnvFilter;

/// Installs a test-friendly `tracing` subscriber. Honours `RUST_LOG` and
/// defaults to `warn`. Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
