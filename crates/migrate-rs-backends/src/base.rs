//! Base document backend traits and reply helpers.
//!
//! This module defines the [`DocumentBackend`] trait every backend
//! implementation must satisfy, along with [`BackendTransaction`] for running
//! commands inside one multi-document transaction.
//!
//! Everything the migration driver does is expressed as database commands
//! (`insert`, `find`, `delete`, `createIndexes`, ...), so a backend only has
//! to know how to dispatch a command document and how to scope a batch of
//! them in a transaction.

use bson::{Bson, Document};
use migrate_rs_core::error::{AUTHENTICATION_FAILED, NAMESPACE_NOT_FOUND, UNAUTHORIZED};
use migrate_rs_core::{MigrateError, MigrateResult};

/// A multi-document transaction opened by [`DocumentBackend::begin_transaction`].
///
/// A transaction must be finished with [`commit`](Self::commit) or
/// [`abort`](Self::abort). Dropping it without either leaves the outcome to
/// the backend, which for every shipped backend means the changes are
/// discarded.
#[async_trait::async_trait]
pub trait BackendTransaction: Send {
    /// Runs one command inside the transaction.
    ///
    /// Write errors reported in the reply are returned as errors.
    async fn run_command(&mut self, command: Document) -> MigrateResult<Document>;

    /// Commits every command run so far.
    async fn commit(self: Box<Self>) -> MigrateResult<()>;

    /// Discards every command run so far.
    async fn abort(self: Box<Self>) -> MigrateResult<()>;
}

/// The core trait for document database backends.
///
/// A backend is bound to a single logical database. All methods are async
/// because database operations are I/O-bound; the in-memory backend keeps
/// the same interface so it can stand in for a server in tests.
#[async_trait::async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Returns the vendor name (e.g., "mongodb", "memory").
    fn vendor(&self) -> &str;

    /// Returns the logical database this backend is bound to.
    fn database_name(&self) -> &str;

    /// Runs a command against the database and returns the server reply.
    ///
    /// Replies with `ok: 0`, `writeErrors`, or `writeConcernError` are
    /// returned as errors; see [`ensure_command_ok`].
    async fn run_command(&self, command: Document) -> MigrateResult<Document>;

    /// Reports whether this backend can run multi-document transactions.
    ///
    /// Callers resolve this once, before relying on transactions, because
    /// attempting one on a backend without support may have side effects.
    async fn supports_transactions(&self) -> MigrateResult<bool>;

    /// Begins a new multi-document transaction.
    async fn begin_transaction(&self) -> MigrateResult<Box<dyn BackendTransaction>>;

    /// Returns the names of every collection in the database.
    async fn list_collection_names(&self) -> MigrateResult<Vec<String>> {
        let reply = self
            .run_command(bson::doc! { "listCollections": 1, "nameOnly": true })
            .await?;
        Ok(first_batch(&reply)?
            .iter()
            .filter_map(|entry| entry.get_str("name").ok().map(str::to_string))
            .collect())
    }

    /// Drops a collection. Dropping a missing collection is not an error.
    async fn drop_collection(&self, name: &str) -> MigrateResult<()> {
        match self.run_command(bson::doc! { "drop": name }).await {
            Err(err) if err.code() == Some(NAMESPACE_NOT_FOUND) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Releases the underlying connection resources.
    async fn shutdown(&self) -> MigrateResult<()>;
}

/// Maps a server error code and message to a [`MigrateError`].
///
/// Authentication-related codes become [`MigrateError::Authentication`];
/// everything else is a [`MigrateError::Database`].
pub fn classify_server_error(code: i32, message: impl Into<String>) -> MigrateError {
    match code {
        AUTHENTICATION_FAILED | UNAUTHORIZED => MigrateError::Authentication(message.into()),
        _ => MigrateError::database(code, message),
    }
}

/// Turns a command reply into an error when it reports a failure.
///
/// The server answers write commands with `ok: 1` even when individual
/// writes failed, listing them under `writeErrors`. Those are surfaced here
/// so a failed insert can never be mistaken for a successful one.
pub fn ensure_command_ok(reply: Document) -> MigrateResult<Document> {
    let ok = reply.get("ok").map_or(true, |ok| bson_to_i64(ok) != Some(0));
    if !ok {
        let code = reply.get("code").and_then(bson_to_i64).unwrap_or(0);
        let message = reply.get_str("errmsg").unwrap_or("command failed").to_string();
        return Err(classify_server_error(i32::try_from(code).unwrap_or(0), message));
    }

    if let Ok(write_errors) = reply.get_array("writeErrors") {
        if let Some(Bson::Document(first)) = write_errors.first() {
            let code = first.get("code").and_then(bson_to_i64).unwrap_or(0);
            let index = first.get("index").and_then(bson_to_i64).unwrap_or(0);
            let message = first.get_str("errmsg").unwrap_or("write error");
            return Err(classify_server_error(
                i32::try_from(code).unwrap_or(0),
                format!("write error at document {index}: {message}"),
            ));
        }
    }

    if let Ok(concern) = reply.get_document("writeConcernError") {
        let code = concern.get("code").and_then(bson_to_i64).unwrap_or(0);
        let message = concern.get_str("errmsg").unwrap_or("write concern error");
        return Err(classify_server_error(
            i32::try_from(code).unwrap_or(0),
            format!("write concern error: {message}"),
        ));
    }

    Ok(reply)
}

/// Extracts `cursor.firstBatch` from a `find` / `listCollections` reply.
pub fn first_batch(reply: &Document) -> MigrateResult<Vec<Document>> {
    let batch = reply
        .get_document("cursor")
        .and_then(|cursor| cursor.get_array("firstBatch"))
        .map_err(|e| MigrateError::Database {
            code: None,
            message: format!("unexpected cursor reply: {e}"),
        })?;
    Ok(batch
        .iter()
        .filter_map(|entry| entry.as_document().cloned())
        .collect())
}

/// Reads any numeric BSON value as an `i64`.
pub fn bson_to_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        #[allow(clippy::cast_possible_truncation)]
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        Bson::Boolean(v) => Some(i64::from(*v)),
        _ => None,
    }
}
