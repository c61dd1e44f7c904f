//! Connection lifecycle.
//!
//! A [`Connection`] wraps the backend handle every other component shares,
//! together with a [`HandleOwnership`] fixed when the connection is made.
//! Only owned handles are shut down on [`Connection::close`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use migrate_rs_backends::{DocumentBackend, MongoBackend};
use migrate_rs_core::settings_loader::{self, ParsedUri};
use migrate_rs_core::{DriverConfig, MigrateError, MigrateResult};

/// Who is responsible for shutting the handle down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOwnership {
    /// The driver created the handle and releases it on close.
    Owned,
    /// The caller supplied the handle and keeps responsibility for it.
    Borrowed,
}

/// A backend handle bound to one logical database.
pub struct Connection {
    backend: Arc<dyn DocumentBackend>,
    ownership: HandleOwnership,
    closed: AtomicBool,
}

impl Connection {
    /// Opens an owned connection from a `mongodb://` or `mongodb+srv://` URI.
    ///
    /// Driver options (`x-*`) are stripped from the URI and returned as
    /// the [`DriverConfig`]. No server round-trip happens here, so wrong
    /// credentials are reported by the first operation rather than by
    /// `open`.
    pub async fn open(uri: &str) -> MigrateResult<(Self, DriverConfig)> {
        let ParsedUri {
            client_uri,
            config,
            direct_connection,
        } = settings_loader::from_uri(uri)?;
        let backend =
            MongoBackend::connect(&client_uri, direct_connection, &config.database_name).await?;
        tracing::debug!(
            uri = %settings_loader::redact(&client_uri),
            database = %config.database_name,
            "opened MongoDB client"
        );
        Ok((Self::owned(Arc::new(backend)), config))
    }

    /// Wraps a handle the driver is responsible for.
    pub fn owned(backend: Arc<dyn DocumentBackend>) -> Self {
        Self::new(backend, HandleOwnership::Owned)
    }

    /// Wraps a handle the caller keeps ownership of.
    pub fn borrowed(backend: Arc<dyn DocumentBackend>) -> Self {
        Self::new(backend, HandleOwnership::Borrowed)
    }

    fn new(backend: Arc<dyn DocumentBackend>, ownership: HandleOwnership) -> Self {
        Self {
            backend,
            ownership,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the shared backend handle.
    pub const fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Returns the ownership fixed at construction.
    pub const fn ownership(&self) -> HandleOwnership {
        self.ownership
    }

    /// Returns whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fails with a connection error once the connection is closed.
    pub fn ensure_open(&self) -> MigrateResult<()> {
        if self.is_closed() {
            return Err(MigrateError::Connection("driver is closed".into()));
        }
        Ok(())
    }

    /// Closes the connection.
    ///
    /// The first call shuts an owned handle down; later calls and borrowed
    /// handles are no-ops.
    pub async fn close(&self) -> MigrateResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.ownership {
            HandleOwnership::Owned => {
                tracing::debug!(vendor = self.backend.vendor(), "shutting down owned handle");
                self.backend.shutdown().await
            }
            HandleOwnership::Borrowed => Ok(()),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("vendor", &self.backend.vendor())
            .field("database", &self.backend.database_name())
            .field("ownership", &self.ownership)
            .field("closed", &self.is_closed())
            .finish()
    }
}
