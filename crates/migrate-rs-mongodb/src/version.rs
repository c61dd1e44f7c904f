//! Version record persistence.
//!
//! The migrations collection holds at most one document,
//! `{ version: <i64>, dirty: <bool> }`. Writes go through a single
//! replacement upsert, so the record is replaced atomically and a failed
//! write leaves the previous one in place.

use std::fmt;
use std::sync::Arc;

use bson::{doc, Document};
use migrate_rs_backends::base::{bson_to_i64, first_batch};
use migrate_rs_backends::{BackendTransaction, DocumentBackend};
use migrate_rs_core::error::NAMESPACE_EXISTS;
use migrate_rs_core::{DropFailure, MigrateError, MigrateResult};

/// The version reported when no migration has ever been recorded.
pub const NIL_VERSION: i64 = -1;

/// The applied version and whether the run that set it was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRecord {
    /// The applied version, or [`NIL_VERSION`].
    pub version: i64,
    /// Whether the database state relative to `version` is unverified.
    pub dirty: bool,
}

impl VersionRecord {
    /// The record of a database no migration was ever applied to.
    pub const NIL: Self = Self {
        version: NIL_VERSION,
        dirty: false,
    };

    /// Creates a record.
    pub const fn new(version: i64, dirty: bool) -> Self {
        Self { version, dirty }
    }

    /// Returns whether this is the clean "no version" state.
    pub const fn is_nil(&self) -> bool {
        self.version == NIL_VERSION && !self.dirty
    }
}

impl Default for VersionRecord {
    fn default() -> Self {
        Self::NIL
    }
}

impl fmt::Display for VersionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dirty {
            write!(f, "{} (dirty)", self.version)
        } else {
            write!(f, "{}", self.version)
        }
    }
}

/// Reads and writes the version record.
pub struct VersionStore {
    backend: Arc<dyn DocumentBackend>,
    collection: String,
}

impl VersionStore {
    /// Creates a store over `collection`.
    pub fn new(backend: Arc<dyn DocumentBackend>, collection: impl Into<String>) -> Self {
        Self {
            backend,
            collection: collection.into(),
        }
    }

    /// Returns the migrations collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the recorded version, or [`VersionRecord::NIL`] if none.
    pub async fn current_version(&self) -> MigrateResult<VersionRecord> {
        let reply = self
            .backend
            .run_command(doc! { "find": &self.collection, "filter": {}, "limit": 1 })
            .await?;
        let batch = first_batch(&reply)?;
        batch.first().map_or(Ok(VersionRecord::NIL), parse_record)
    }

    /// Replaces the version record.
    ///
    /// `(NIL_VERSION, false)` removes the record instead.
    pub async fn set_version(&self, version: i64, dirty: bool) -> MigrateResult<()> {
        self.backend
            .run_command(self.write_command(version, dirty))
            .await?;
        tracing::debug!(version, dirty, collection = %self.collection, "recorded version");
        Ok(())
    }

    /// Replaces the version record inside an open transaction.
    pub async fn set_version_in(
        &self,
        transaction: &mut dyn BackendTransaction,
        version: i64,
        dirty: bool,
    ) -> MigrateResult<()> {
        transaction
            .run_command(self.write_command(version, dirty))
            .await?;
        Ok(())
    }

    /// Creates the migrations collection if it does not exist yet.
    ///
    /// Needed before a transactional run, because a transaction may not
    /// create collections implicitly on every server version.
    pub async fn ensure_collection(&self) -> MigrateResult<()> {
        match self
            .backend
            .run_command(doc! { "create": &self.collection })
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some(NAMESPACE_EXISTS) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Drops every collection of the database, the migrations and lock
    /// collections included. `system.*` collections are left alone.
    ///
    /// Every collection is attempted; if any fail, the error lists both
    /// the dropped and the failed ones.
    pub async fn drop_all(&self) -> MigrateResult<Vec<String>> {
        let names = self.backend.list_collection_names().await?;
        let mut dropped = Vec::new();
        let mut failed = Vec::new();
        for name in names.into_iter().filter(|n| !n.starts_with("system.")) {
            match self.backend.drop_collection(&name).await {
                Ok(()) => dropped.push(name),
                Err(err) => {
                    tracing::warn!(collection = %name, error = %err, "failed to drop collection");
                    failed.push(DropFailure {
                        collection: name,
                        cause: err.to_string(),
                    });
                }
            }
        }
        if failed.is_empty() {
            tracing::info!(count = dropped.len(), "dropped all collections");
            Ok(dropped)
        } else {
            Err(MigrateError::Drop { dropped, failed })
        }
    }

    fn write_command(&self, version: i64, dirty: bool) -> Document {
        if version == NIL_VERSION && !dirty {
            return doc! {
                "delete": &self.collection,
                "deletes": [{ "q": {}, "limit": 0 }],
            };
        }
        doc! {
            "update": &self.collection,
            "updates": [{
                "q": {},
                "u": { "version": version, "dirty": dirty },
                "upsert": true,
            }],
        }
    }
}

fn parse_record(document: &Document) -> MigrateResult<VersionRecord> {
    let version = document
        .get("version")
        .and_then(bson_to_i64)
        .ok_or_else(|| MigrateError::Database {
            code: None,
            message: format!("version record has no numeric 'version': {document}"),
        })?;
    let dirty = document.get_bool("dirty").unwrap_or(false);
    Ok(VersionRecord { version, dirty })
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrate_rs_backends::MemoryBackend;

    fn store() -> (Arc<MemoryBackend>, VersionStore) {
        let backend = Arc::new(MemoryBackend::new("app"));
        let versions = VersionStore::new(backend.clone(), "schema_migrations");
        (backend, versions)
    }

    // ── reading and writing ─────────────────────────────────────────

    #[tokio::test]
    async fn test_nil_version() {
        let (_, versions) = store();
        let record = versions.current_version().await.unwrap();
        assert_eq!(record, VersionRecord::NIL);
        assert!(record.is_nil());
    }

    #[tokio::test]
    async fn test_set_version_round_trip() {
        let (backend, versions) = store();
        for (version, dirty) in [(1, false), (1, true), (7, false), (NIL_VERSION, true), (0, false)] {
            versions.set_version(version, dirty).await.unwrap();
            assert_eq!(
                versions.current_version().await.unwrap(),
                VersionRecord::new(version, dirty)
            );
            assert_eq!(backend.count_documents("schema_migrations").await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_nil_clean_removes_record() {
        let (backend, versions) = store();
        versions.set_version(3, true).await.unwrap();
        versions.set_version(NIL_VERSION, false).await.unwrap();
        assert_eq!(versions.current_version().await.unwrap(), VersionRecord::NIL);
        assert_eq!(backend.count_documents("schema_migrations").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_version_in_transaction() {
        let (backend, versions) = store();
        versions.ensure_collection().await.unwrap();

        let mut transaction = backend.begin_transaction().await.unwrap();
        versions.set_version_in(transaction.as_mut(), 4, false).await.unwrap();
        assert!(versions.current_version().await.unwrap().is_nil());
        transaction.commit().await.unwrap();
        assert_eq!(versions.current_version().await.unwrap(), VersionRecord::new(4, false));

        let mut transaction = backend.begin_transaction().await.unwrap();
        versions.set_version_in(transaction.as_mut(), 5, false).await.unwrap();
        transaction.abort().await.unwrap();
        assert_eq!(versions.current_version().await.unwrap().version, 4);
    }

    #[tokio::test]
    async fn test_ensure_collection_is_idempotent() {
        let (backend, versions) = store();
        versions.ensure_collection().await.unwrap();
        versions.ensure_collection().await.unwrap();
        assert_eq!(
            backend.list_collection_names().await.unwrap(),
            vec!["schema_migrations".to_string()]
        );
    }

    #[test]
    fn test_record_display() {
        assert_eq!(VersionRecord::new(3, false).to_string(), "3");
        assert_eq!(VersionRecord::new(3, true).to_string(), "3 (dirty)");
    }

    // ── drop ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_drop_all() {
        let (backend, versions) = store();
        versions.set_version(2, false).await.unwrap();
        backend
            .run_command(doc! { "insert": "hello", "documents": [{ "wild": "world" }] })
            .await
            .unwrap();

        let mut dropped = versions.drop_all().await.unwrap();
        dropped.sort();
        assert_eq!(dropped, ["hello", "schema_migrations"]);
        assert!(backend.list_collection_names().await.unwrap().is_empty());
        assert!(versions.current_version().await.unwrap().is_nil());
    }

    #[tokio::test]
    async fn test_drop_all_on_empty_database() {
        let (_, versions) = store();
        assert!(versions.drop_all().await.unwrap().is_empty());
    }
}
