//! Database-resident advisory lock.
//!
//! The lock is a single document in the lock collection whose `_id` is
//! derived from the database name, so a second insert fails with a
//! duplicate key error while the first holder is active. A TTL index on
//! `created_at` lets the server expire the record of a run that crashed
//! before releasing it.
//!
//! The lock only serializes cooperating migration drivers. Nothing stops
//! another client from writing to the database while it is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bson::{doc, Document};
use migrate_rs_backends::DocumentBackend;
use migrate_rs_core::{LockingSettings, MigrateError, MigrateResult};

/// Name of the TTL index ensured on the lock collection.
pub const TTL_INDEX_NAME: &str = "created_at_ttl";

// IndexOptionsConflict / IndexKeySpecsConflict: an index with the same
// name exists with another lifetime, left behind by a differently
// configured driver.
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;

/// The advisory lock of one driver instance.
pub struct AdvisoryLock {
    backend: Arc<dyn DocumentBackend>,
    settings: LockingSettings,
    lock_id: String,
    locking_key: String,
    held: AtomicBool,
    ttl_ready: AtomicBool,
}

impl AdvisoryLock {
    /// Creates the lock for the backend's database.
    ///
    /// Every instance gets its own random locking key, so a driver can only
    /// release a record it inserted itself.
    pub fn new(backend: Arc<dyn DocumentBackend>, settings: LockingSettings) -> Self {
        let lock_id = format!("{}.lock", backend.database_name());
        Self {
            backend,
            settings,
            lock_id,
            locking_key: uuid::Uuid::new_v4().to_string(),
            held: AtomicBool::new(false),
            ttl_ready: AtomicBool::new(false),
        }
    }

    /// Returns whether locking is enabled at all.
    pub const fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Returns whether this instance currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Returns this instance's locking key.
    pub fn locking_key(&self) -> &str {
        &self.locking_key
    }

    /// Returns the `_id` of the lock record.
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Makes one attempt to take the lock.
    ///
    /// Fails with [`MigrateError::LockHeld`] if any driver, this one
    /// included, already holds it. There is no waiting or retrying.
    pub async fn acquire(&self) -> MigrateResult<()> {
        if !self.settings.enabled {
            tracing::debug!("advisory locking disabled; acquire is a no-op");
            return Ok(());
        }
        if self.is_locked() {
            return Err(self.held_error());
        }

        self.ensure_ttl_index().await?;

        let record = doc! {
            "_id": &self.lock_id,
            "locking_key": &self.locking_key,
            "pid": i64::from(std::process::id()),
            "hostname": std::env::var("HOSTNAME").unwrap_or_default(),
            "created_at": bson::DateTime::now(),
        };
        let insert = doc! {
            "insert": &self.settings.collection,
            "documents": [record],
        };
        match self.backend.run_command(insert).await {
            Ok(_) => {
                self.held.store(true, Ordering::Release);
                tracing::debug!(lock = %self.lock_id, "acquired advisory lock");
                Ok(())
            }
            Err(err) if err.is_duplicate_key() => {
                tracing::info!(lock = %self.lock_id, "advisory lock is held by another run");
                Err(self.held_error())
            }
            Err(err) => Err(err),
        }
    }

    /// Releases the lock.
    ///
    /// Releasing a lock this instance does not hold is a no-op. Only the
    /// record carrying this instance's locking key is deleted.
    pub async fn release(&self) -> MigrateResult<()> {
        if !self.settings.enabled || !self.is_locked() {
            return Ok(());
        }
        self.backend.run_command(self.delete_command()).await?;
        self.held.store(false, Ordering::Release);
        tracing::debug!(lock = %self.lock_id, "released advisory lock");
        Ok(())
    }

    /// Deletes this instance's lock record without consulting the in-process
    /// state, for when an acquire was interrupted and may or may not have
    /// inserted it.
    pub async fn abandon(&self) -> MigrateResult<()> {
        if !self.settings.enabled {
            return Ok(());
        }
        self.backend.run_command(self.delete_command()).await?;
        self.held.store(false, Ordering::Release);
        Ok(())
    }

    /// Forgets the in-process state after the lock collection was dropped,
    /// so the TTL index is recreated by the next acquire.
    pub fn reset(&self) {
        self.held.store(false, Ordering::Release);
        self.ttl_ready.store(false, Ordering::Release);
    }

    fn delete_command(&self) -> Document {
        doc! {
            "delete": &self.settings.collection,
            "deletes": [{
                "q": { "_id": &self.lock_id, "locking_key": &self.locking_key },
                "limit": 1,
            }],
        }
    }

    async fn ensure_ttl_index(&self) -> MigrateResult<()> {
        if self.ttl_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let expire_after = i64::try_from(self.settings.timeout_secs).unwrap_or(i64::MAX);
        let command = doc! {
            "createIndexes": &self.settings.collection,
            "indexes": [{
                "key": { "created_at": 1 },
                "name": TTL_INDEX_NAME,
                "expireAfterSeconds": expire_after,
            }],
        };
        match self.backend.run_command(command).await {
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.code(),
                    Some(INDEX_OPTIONS_CONFLICT | INDEX_KEY_SPECS_CONFLICT)
                ) =>
            {
                tracing::warn!(
                    collection = %self.settings.collection,
                    error = %err,
                    "lock TTL index exists with different options; keeping it"
                );
            }
            Err(err) => return Err(err),
        }
        self.ttl_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn held_error(&self) -> MigrateError {
        MigrateError::LockHeld {
            collection: self.settings.collection.clone(),
        }
    }
}
