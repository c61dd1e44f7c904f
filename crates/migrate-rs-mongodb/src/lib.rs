//! # migrate-rs-mongodb
//!
//! Versioned migrations for MongoDB. A migration script is a JSON array of
//! database commands; the driver applies it under a database-resident
//! advisory lock and records the resulting `{version, dirty}` state in the
//! `schema_migrations` collection.
//!
//! With `x-transaction-mode=true` (or [`DriverConfig::transaction_mode`])
//! the script and its version update commit or abort together, which
//! requires a replica set or sharded cluster.
//!
//! ## Modules
//!
//! - [`codec`] - script decoding into typed commands
//! - [`connection`] - handle lifecycle and ownership
//! - [`lock`] - the advisory lock
//! - [`version`] - the version record and teardown
//! - [`executor`] - the run state machine
//! - [`driver`] - the public [`MongoDriver`]
//!
//! [`DriverConfig::transaction_mode`]: migrate_rs_core::DriverConfig::transaction_mode

pub mod codec;
pub mod connection;
pub mod driver;
pub mod executor;
pub mod lock;
pub mod version;

pub use codec::{Command, MigrationScript};
pub use connection::HandleOwnership;
pub use driver::MongoDriver;
pub use executor::{ExecutionMode, RunReport};
pub use version::{VersionRecord, NIL_VERSION};
