//! Shared domain model and persistence for PassGate.
//!
//! Everything that more than one crate needs to agree on lives here: the
//! persisted records, the transactional [`store::Store`] seam with its
//! Postgres and in-memory implementations, and pool/migration setup.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod db;
pub mod store;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use store::{MemoryStore, PgStore, Store, StoreError, StoreResult, StoreTx};
pub use types::*;
