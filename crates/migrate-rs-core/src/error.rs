//! Core error types for migrate-rs.
//!
//! [`MigrateError`] is the single error type returned by every layer of the
//! workspace. Its variants are chosen so a caller can always tell "nothing
//! happened" apart from "something happened and the database is now dirty";
//! see [`MigrateError::leaves_dirty`].

use thiserror::Error;

/// Server error code for a duplicate key violation.
pub const DUPLICATE_KEY: i32 = 11000;
/// Server error code for `AuthenticationFailed`.
pub const AUTHENTICATION_FAILED: i32 = 18;
/// Server error code for `Unauthorized`.
pub const UNAUTHORIZED: i32 = 13;
/// Server error code for `NamespaceExists`.
pub const NAMESPACE_EXISTS: i32 = 48;
/// Server error code for `NamespaceNotFound`.
pub const NAMESPACE_NOT_FOUND: i32 = 26;
/// Server error code for `CommandNotFound`.
pub const COMMAND_NOT_FOUND: i32 = 59;
/// Server error code for `OperationNotSupportedInTransaction`.
pub const NOT_SUPPORTED_IN_TRANSACTION: i32 = 263;
/// Server error code for `WriteConflict`.
pub const WRITE_CONFLICT: i32 = 112;

/// A collection that could not be dropped during teardown, with the cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropFailure {
    /// The collection name.
    pub collection: String,
    /// The error reported by the backend.
    pub cause: String,
}

/// The primary error type for migrate-rs.
#[derive(Error, Debug)]
pub enum MigrateError {
    // ── Connection ───────────────────────────────────────────────────

    /// The connection could not be established (bad URI, DNS, transport).
    ///
    /// Fatal to `open` and never retried internally.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server rejected the credentials.
    ///
    /// Reported on the first authenticated operation, never by `open`.
    #[error("Authentication error: {0}")]
    Authentication(String),

    // ── Locking ──────────────────────────────────────────────────────

    /// Another migration run holds the advisory lock.
    #[error("Advisory lock is held (collection '{collection}')")]
    LockHeld {
        /// The lock collection.
        collection: String,
    },

    // ── Scripts ──────────────────────────────────────────────────────

    /// The migration script is not a well-formed array of command documents.
    #[error("Malformed migration script: {0}")]
    MalformedScript(String),

    /// A specific command of the script failed.
    #[error("Command #{index} ('{name}') failed: {cause}")]
    Command {
        /// Zero-based position of the command within the script.
        index: usize,
        /// The command name.
        name: String,
        /// The backend failure.
        cause: Box<MigrateError>,
        /// Whether the version record was left dirty by this failure.
        dirty: bool,
    },

    /// Writing the version record failed after the script's commands ran.
    #[error("Recording version {version} failed: {cause}")]
    VersionUpdate {
        /// The version that was being recorded.
        version: i64,
        /// The backend failure.
        cause: Box<MigrateError>,
        /// Whether the record still carries the dirty flag.
        dirty: bool,
    },

    /// A previous run left the database dirty; new runs are refused.
    #[error("Database is dirty at version {version}; fix it and force the version first")]
    Dirty {
        /// The version recorded together with the dirty flag.
        version: i64,
    },

    /// Beginning, committing, or aborting the atomic unit failed.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The commit was sent but the server never confirmed whether it took
    /// effect. The data and the version record are either both applied or
    /// both untouched; read the version record to find out which.
    #[error("Transaction commit outcome unknown: {0}")]
    CommitUnknown(String),

    // ── Teardown ─────────────────────────────────────────────────────

    /// Dropping managed state partially failed.
    #[error("Drop failed for {} collection(s) ({} dropped)", .failed.len(), .dropped.len())]
    Drop {
        /// Collections that were dropped.
        dropped: Vec<String>,
        /// Collections that could not be dropped.
        failed: Vec<DropFailure>,
    },

    // ── Configuration ────────────────────────────────────────────────

    /// A configuration value is missing, invalid, or unsupported.
    #[error("Configuration error: {0}")]
    Config(String),

    // ── Backend ──────────────────────────────────────────────────────

    /// A server error not covered by a more specific variant.
    #[error("Database error{}: {message}", .code.map(|c| format!(" ({c})")).unwrap_or_default())]
    Database {
        /// The server error code, when one was reported.
        code: Option<i32>,
        /// The server message.
        message: String,
    },

    // ── Control ──────────────────────────────────────────────────────

    /// The caller's cancellation signal fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// The configured operation timeout elapsed.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Reading the migration script failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    /// Creates a [`MigrateError::Database`] carrying a server error code.
    pub fn database(code: i32, message: impl Into<String>) -> Self {
        Self::Database {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Returns the server error code, looking through command failures.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Database { code, .. } => *code,
            Self::Command { cause, .. } | Self::VersionUpdate { cause, .. } => cause.code(),
            _ => None,
        }
    }

    /// Returns whether this is a duplicate key violation.
    pub fn is_duplicate_key(&self) -> bool {
        self.code() == Some(DUPLICATE_KEY)
    }

    /// Returns whether this failure is an authentication failure, looking
    /// through command failures.
    pub fn is_authentication(&self) -> bool {
        match self {
            Self::Authentication(_) => true,
            Self::Command { cause, .. } => cause.is_authentication(),
            _ => false,
        }
    }

    /// Returns whether the failure left the version record dirty.
    ///
    /// `false` means the database is exactly as it was before the attempt.
    pub const fn leaves_dirty(&self) -> bool {
        matches!(
            self,
            Self::Command { dirty: true, .. } | Self::VersionUpdate { dirty: true, .. }
        )
    }

    /// Returns whether it is unknown if the failed operation took effect.
    pub const fn outcome_unknown(&self) -> bool {
        matches!(self, Self::CommitUnknown(_))
    }

    /// Returns whether the caller may simply retry the same operation later.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }
}

/// A convenience type alias for `Result<T, MigrateError>`.
pub type MigrateResult<T> = Result<T, MigrateError>;
