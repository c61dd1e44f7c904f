//! Driver configuration.
//!
//! [`DriverConfig`] holds every option the migration driver recognizes. It
//! deserializes with `deny_unknown_fields`, so a misspelled option in a
//! configuration file fails fast instead of being silently ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, MigrateResult};

/// Default name of the collection holding the version record.
pub const DEFAULT_MIGRATIONS_COLLECTION: &str = "schema_migrations";
/// Default name of the collection holding the advisory lock record.
pub const DEFAULT_LOCK_COLLECTION: &str = "migrate_advisory_lock";
/// Default lifetime of a lock record, in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 15;

/// Advisory lock configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockingSettings {
    /// Whether the advisory lock is used at all.
    ///
    /// When disabled, acquiring and releasing the lock always succeed
    /// without touching the database.
    pub enabled: bool,
    /// The collection holding the lock record.
    pub collection: String,
    /// Seconds after which an abandoned lock record expires.
    pub timeout_secs: u64,
}

impl Default for LockingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            collection: DEFAULT_LOCK_COLLECTION.to_string(),
            timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }
}

impl LockingSettings {
    /// Returns the lock lifetime as a [`Duration`].
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Logging configuration consumed by [`crate::logging::setup_logging`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    /// An `EnvFilter` directive such as `"info"` or `"migrate_rs_mongodb=debug"`.
    pub level: String,
    /// Emit structured JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Configuration for one migration driver instance.
///
/// # Examples
///
/// ```
/// use migrate_rs_core::settings::DriverConfig;
///
/// let config = DriverConfig::new("app").with_transaction_mode(true);
/// assert_eq!(config.migrations_collection, "schema_migrations");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    /// The target logical database. Required.
    pub database_name: String,
    /// Wrap each script and its version update in one transaction.
    pub transaction_mode: bool,
    /// The collection holding the version record.
    pub migrations_collection: String,
    /// Advisory lock settings.
    pub locking: LockingSettings,
    /// Upper bound, in seconds, on any single driver operation.
    pub operation_timeout_secs: Option<u64>,
    /// Logging settings.
    pub log: LogSettings,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            database_name: String::new(),
            transaction_mode: false,
            migrations_collection: DEFAULT_MIGRATIONS_COLLECTION.to_string(),
            locking: LockingSettings::default(),
            operation_timeout_secs: None,
            log: LogSettings::default(),
        }
    }
}

impl DriverConfig {
    /// Creates a configuration with defaults for the given database.
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            ..Self::default()
        }
    }

    /// Enables or disables transactional mode.
    #[must_use]
    pub const fn with_transaction_mode(mut self, enabled: bool) -> Self {
        self.transaction_mode = enabled;
        self
    }

    /// Sets the collection holding the version record.
    #[must_use]
    pub fn with_migrations_collection(mut self, name: impl Into<String>) -> Self {
        self.migrations_collection = name.into();
        self
    }

    /// Sets the collection holding the lock record.
    #[must_use]
    pub fn with_lock_collection(mut self, name: impl Into<String>) -> Self {
        self.locking.collection = name.into();
        self
    }

    /// Enables or disables the advisory lock.
    #[must_use]
    pub const fn with_locking(mut self, enabled: bool) -> Self {
        self.locking.enabled = enabled;
        self
    }

    /// Sets the per-operation timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Returns the per-operation timeout, if one is configured.
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Checks the configuration for missing or conflicting values.
    pub fn validate(&self) -> MigrateResult<()> {
        if self.database_name.trim().is_empty() {
            return Err(MigrateError::Config("database_name is required".into()));
        }
        if self.database_name.contains(['/', '\\', '.', ' ', '"', '$']) {
            return Err(MigrateError::Config(format!(
                "invalid database name '{}'",
                self.database_name
            )));
        }
        check_collection_name("migrations_collection", &self.migrations_collection)?;
        if self.locking.enabled {
            check_collection_name("locking.collection", &self.locking.collection)?;
            if self.locking.collection == self.migrations_collection {
                return Err(MigrateError::Config(format!(
                    "lock and migrations collections must differ (both '{}')",
                    self.migrations_collection
                )));
            }
            if self.locking.timeout_secs == 0 {
                return Err(MigrateError::Config(
                    "locking.timeout_secs must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

fn check_collection_name(option: &str, name: &str) -> MigrateResult<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(format!("{option} must not be empty")));
    }
    if name.starts_with("system.") || name.contains('$') || name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "{option}: invalid collection name '{name}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert!(config.database_name.is_empty());
        assert!(!config.transaction_mode);
        assert_eq!(config.migrations_collection, DEFAULT_MIGRATIONS_COLLECTION);
        assert!(config.locking.enabled);
        assert_eq!(config.locking.collection, DEFAULT_LOCK_COLLECTION);
        assert_eq!(config.locking.timeout(), Duration::from_secs(15));
        assert_eq!(config.operation_timeout(), None);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_builder() {
        let config = DriverConfig::new("app")
            .with_transaction_mode(true)
            .with_migrations_collection("versions")
            .with_lock_collection("locks")
            .with_operation_timeout(Duration::from_secs(30));
        assert!(config.transaction_mode);
        assert_eq!(config.migrations_collection, "versions");
        assert_eq!(config.locking.collection, "locks");
        assert_eq!(config.operation_timeout(), Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_database_name() {
        let err = DriverConfig::default().validate().unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_database_name() {
        assert!(DriverConfig::new("my.db").validate().is_err());
        assert!(DriverConfig::new("a/b").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shared_collections() {
        let config = DriverConfig::new("app").with_lock_collection(DEFAULT_MIGRATIONS_COLLECTION);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_ignores_lock_collection_when_disabled() {
        let config = DriverConfig::new("app")
            .with_locking(false)
            .with_lock_collection("");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_system_collection() {
        let config = DriverConfig::new("app").with_migrations_collection("system.users");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_operation_timeout_means_none() {
        let mut config = DriverConfig::new("app");
        config.operation_timeout_secs = Some(0);
        assert_eq!(config.operation_timeout(), None);
    }
}
