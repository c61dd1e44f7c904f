//! The public migration driver.

use std::fmt;
use std::future::{pending, Future};
use std::sync::Arc;

use migrate_rs_backends::{DocumentBackend, MongoBackend};
use migrate_rs_core::{DriverConfig, MigrateError, MigrateResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

use crate::codec;
use crate::connection::{Connection, HandleOwnership};
use crate::executor::{ExecutionEngine, RunReport};
use crate::lock::AdvisoryLock;
use crate::version::{VersionRecord, VersionStore};

/// A migration driver bound to one MongoDB database.
///
/// Runs issued through the same driver are serialized in process; the
/// advisory lock serializes them across processes.
///
/// # Examples
///
/// ```no_run
/// use migrate_rs_mongodb::MongoDriver;
///
/// # async fn example() -> migrate_rs_core::MigrateResult<()> {
/// let driver = MongoDriver::open("mongodb://localhost:27017/app?x-transaction-mode=true").await?;
/// driver
///     .migrate(1, &br#"[{"insert": "hello", "documents": [{"wild": "world"}]}]"#[..])
///     .await?;
/// assert_eq!(driver.version().await?.version, 1);
/// driver.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct MongoDriver {
    connection: Connection,
    config: DriverConfig,
    engine: ExecutionEngine,
    run_guard: Mutex<()>,
}

impl MongoDriver {
    /// Opens a driver from a connection URI.
    ///
    /// The driver owns the client and shuts it down on [`close`](Self::close).
    /// No server round-trip happens here: bad credentials and a server
    /// without transaction support are reported by the first run.
    pub async fn open(uri: &str) -> MigrateResult<Self> {
        let (connection, config) = Connection::open(uri).await?;
        Self::build(connection, config)
    }

    /// Adopts an existing MongoDB client.
    ///
    /// The client stays the caller's; closing the driver leaves it connected.
    pub async fn with_instance(
        client: mongodb::Client,
        config: DriverConfig,
    ) -> MigrateResult<Self> {
        config.validate()?;
        let backend = MongoBackend::new(client, &config.database_name);
        Self::with_backend(Arc::new(backend), config).await
    }

    /// Adopts any document backend, borrowed.
    ///
    /// With transaction mode requested, transaction support is checked
    /// here and a backend without it is rejected with
    /// [`MigrateError::Config`].
    pub async fn with_backend(
        backend: Arc<dyn DocumentBackend>,
        config: DriverConfig,
    ) -> MigrateResult<Self> {
        let driver = Self::build(Connection::borrowed(backend), config)?;
        driver.engine.resolve_mode().await?;
        Ok(driver)
    }

    /// Takes ownership of a document backend. Like [`open`](Self::open),
    /// this performs no I/O.
    pub fn with_owned_backend(
        backend: Arc<dyn DocumentBackend>,
        config: DriverConfig,
    ) -> MigrateResult<Self> {
        Self::build(Connection::owned(backend), config)
    }

    fn build(connection: Connection, config: DriverConfig) -> MigrateResult<Self> {
        config.validate()?;
        let backend = Arc::clone(connection.backend());
        if backend.database_name() != config.database_name {
            return Err(MigrateError::Config(format!(
                "backend is bound to database '{}' but the configuration names '{}'",
                backend.database_name(),
                config.database_name
            )));
        }

        let lock = AdvisoryLock::new(Arc::clone(&backend), config.locking.clone());
        let versions = VersionStore::new(Arc::clone(&backend), config.migrations_collection.clone());
        let engine = ExecutionEngine::new(
            backend,
            lock,
            versions,
            config.transaction_mode,
            config.operation_timeout(),
        );
        tracing::debug!(
            database = %config.database_name,
            ownership = ?connection.ownership(),
            transaction_mode = config.transaction_mode,
            locking = config.locking.enabled,
            "migration driver ready"
        );
        Ok(Self {
            connection,
            config,
            engine,
            run_guard: Mutex::new(()),
        })
    }

    // ── accessors ───────────────────────────────────────────────────

    /// Returns the effective configuration.
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Returns who owns the underlying handle.
    pub const fn ownership(&self) -> HandleOwnership {
        self.connection.ownership()
    }

    /// Returns whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Returns whether this driver currently holds the advisory lock.
    pub fn is_locked(&self) -> bool {
        self.engine.lock().is_locked()
    }

    // ── running scripts ─────────────────────────────────────────────

    /// Runs a script read from `script`, keeping the recorded version.
    pub async fn run<R>(&self, script: R) -> MigrateResult<RunReport>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.run_with_cancel(script, pending()).await
    }

    /// Like [`run`](Self::run), stopping when `cancel` completes.
    pub async fn run_with_cancel<R, C>(&self, script: R, cancel: C) -> MigrateResult<RunReport>
    where
        R: AsyncRead + Unpin + Send,
        C: Future<Output = ()> + Send,
    {
        let bytes = read_script(script).await?;
        self.execute(None, &bytes, cancel).await
    }

    /// Runs a script held in memory, keeping the recorded version.
    pub async fn run_bytes(&self, script: &[u8]) -> MigrateResult<RunReport> {
        self.execute(None, script, pending()).await
    }

    /// Applies the migration `version` from `script` and records it.
    pub async fn migrate<R>(&self, version: i64, script: R) -> MigrateResult<RunReport>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.migrate_with_cancel(version, script, pending()).await
    }

    /// Like [`migrate`](Self::migrate), stopping when `cancel` completes.
    pub async fn migrate_with_cancel<R, C>(
        &self,
        version: i64,
        script: R,
        cancel: C,
    ) -> MigrateResult<RunReport>
    where
        R: AsyncRead + Unpin + Send,
        C: Future<Output = ()> + Send,
    {
        if version < 0 {
            return Err(MigrateError::Config(format!(
                "migration versions must be non-negative, got {version}"
            )));
        }
        let bytes = read_script(script).await?;
        self.execute(Some(version), &bytes, cancel).await
    }

    async fn execute<C>(&self, target: Option<i64>, bytes: &[u8], cancel: C) -> MigrateResult<RunReport>
    where
        C: Future<Output = ()> + Send,
    {
        self.connection.ensure_open()?;
        let script = codec::decode(bytes)?;
        let _guard = self.run_guard.lock().await;
        self.engine.execute(target, &script, cancel).await
    }

    // ── version state ───────────────────────────────────────────────

    /// Returns the recorded version.
    pub async fn version(&self) -> MigrateResult<VersionRecord> {
        self.connection.ensure_open()?;
        self.bounded(self.versions().current_version()).await
    }

    /// Overwrites the version record, e.g. to clear a dirty flag after a
    /// manual fix. `(NIL_VERSION, false)` removes the record.
    pub async fn set_version(&self, version: i64, dirty: bool) -> MigrateResult<()> {
        self.connection.ensure_open()?;
        let _guard = self.run_guard.lock().await;
        self.bounded(self.versions().set_version(version, dirty)).await?;
        tracing::info!(version, dirty, "version forced");
        Ok(())
    }

    // ── locking ─────────────────────────────────────────────────────

    /// Takes the advisory lock. Fails with [`MigrateError::LockHeld`]
    /// when any driver, this one included, holds it.
    pub async fn lock(&self) -> MigrateResult<()> {
        self.connection.ensure_open()?;
        self.bounded(self.engine.lock().acquire()).await
    }

    /// Releases the advisory lock. Releasing an unheld lock is a no-op.
    pub async fn unlock(&self) -> MigrateResult<()> {
        self.connection.ensure_open()?;
        self.bounded(self.engine.lock().release()).await
    }

    // ── teardown ────────────────────────────────────────────────────

    /// Drops every collection of the database, including the version and
    /// lock collections. Returns the dropped collection names.
    pub async fn drop_all(&self) -> MigrateResult<Vec<String>> {
        self.connection.ensure_open()?;
        let _guard = self.run_guard.lock().await;
        self.bounded(self.engine.lock().release()).await?;
        let result = self.bounded(self.versions().drop_all()).await;
        self.engine.lock().reset();
        result
    }

    /// Closes the driver. Idempotent; a borrowed handle is never shut down.
    pub async fn close(&self) -> MigrateResult<()> {
        self.connection.close().await
    }

    const fn versions(&self) -> &VersionStore {
        self.engine.versions()
    }

    async fn bounded<T, F>(&self, work: F) -> MigrateResult<T>
    where
        F: Future<Output = MigrateResult<T>> + Send,
    {
        match self.engine.operation_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, work)
                .await
                .unwrap_or_else(|_| Err(MigrateError::Timeout(timeout))),
            None => work.await,
        }
    }
}

impl fmt::Debug for MongoDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoDriver")
            .field("connection", &self.connection)
            .field("config", &self.config)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

async fn read_script<R>(mut script: R) -> MigrateResult<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut bytes = Vec::new();
    script.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrate_rs_backends::MemoryBackend;

    fn memory_driver(backend: &Arc<MemoryBackend>) -> MongoDriver {
        MongoDriver::with_owned_backend(backend.clone(), DriverConfig::new("app")).unwrap()
    }

    #[tokio::test]
    async fn test_build_rejects_database_mismatch() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new("app"));
        let err = MongoDriver::with_backend(backend, DriverConfig::new("other"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[tokio::test]
    async fn test_build_validates_config() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new("app"));
        let config = DriverConfig::new("app").with_lock_collection("schema_migrations");
        assert!(MongoDriver::with_owned_backend(backend, config).is_err());
    }

    #[tokio::test]
    async fn test_negative_migration_version_is_rejected() {
        let backend = Arc::new(MemoryBackend::new("app"));
        let driver = memory_driver(&backend);
        let err = driver.migrate(-1, &b"[]"[..]).await.unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[tokio::test]
    async fn test_malformed_script_touches_nothing() {
        let backend = Arc::new(MemoryBackend::new("app"));
        let driver = memory_driver(&backend);
        let err = driver.run_bytes(b"{not json").await.unwrap_err();
        assert!(matches!(err, MigrateError::MalformedScript(_)));
        assert!(backend.list_collection_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let backend = Arc::new(MemoryBackend::new("app"));
        let driver = memory_driver(&backend);
        driver.close().await.unwrap();
        assert!(driver.is_closed());
        assert!(backend.is_shut_down());
        assert!(matches!(
            driver.version().await,
            Err(MigrateError::Connection(_))
        ));
        assert!(matches!(
            driver.run_bytes(b"[]").await,
            Err(MigrateError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_run_reads_async_stream() {
        let backend = Arc::new(MemoryBackend::new("app"));
        let driver = memory_driver(&backend);
        let script: &[u8] = br#"[{"insert": "hello", "documents": [{"wild": "world"}]}]"#;
        let report = driver.migrate(1, script).await.unwrap();
        assert_eq!(report.commands, 1);
        assert_eq!(driver.version().await.unwrap(), VersionRecord::new(1, false));
    }
}
