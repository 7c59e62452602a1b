//! # rowsync Testkit
//!
//! Test utilities for rowsync.
//!
//! This crate provides:
//! - Sample schemas and setups, with and without filters
//! - A two-replica harness over in-memory stores
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rowsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_replicas() {
//!     let replicas = TestReplicas::new(&sales_schema()).await;
//!     replicas.server.insert_row("Customer", customer(1, "A")).await.unwrap();
//!     // ... build orchestrators over replicas.server and replicas.client
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
