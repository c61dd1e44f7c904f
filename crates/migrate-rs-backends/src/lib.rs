//! # migrate-rs-backends
//!
//! Document database backends for migrate-rs. A backend dispatches raw
//! command documents to one logical database and scopes batches of them in
//! multi-document transactions.
//!
//! Supported backends:
//! - `MongoDB` (feature `mongodb`)
//! - an in-memory store, for tests and dry runs

pub mod base;
pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

pub use base::{BackendTransaction, DocumentBackend};
pub use memory::MemoryBackend;
#[cfg(feature = "mongodb")]
pub use mongo::MongoBackend;
