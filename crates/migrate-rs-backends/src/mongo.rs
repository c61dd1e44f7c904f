//! MongoDB backend using the official `mongodb` driver.
//!
//! This module provides the [`MongoBackend`] which implements the
//! [`DocumentBackend`](crate::base::DocumentBackend) trait on top of a
//! [`mongodb::Client`]. Transactions use a client session per
//! [`BackendTransaction`].
//!
//! Creating a backend never talks to the server: the driver selects a server
//! and authenticates lazily, on the first operation. A wrong password is
//! therefore reported by the first command, as
//! [`MigrateError::Authentication`].

use bson::{doc, Document};
use migrate_rs_core::{MigrateError, MigrateResult};
use mongodb::error::{
    Error as MongoError, ErrorKind, WriteFailure, UNKNOWN_TRANSACTION_COMMIT_RESULT,
};
use mongodb::options::ClientOptions;
use mongodb::{Client, ClientSession, Database};

use crate::base::{
    bson_to_i64, classify_server_error, ensure_command_ok, BackendTransaction, DocumentBackend,
};

/// Wire version of MongoDB 4.0, the first with replica set transactions.
const REPLICA_SET_TRANSACTIONS_WIRE_VERSION: i64 = 7;
/// Wire version of MongoDB 4.2, the first with sharded transactions.
const SHARDED_TRANSACTIONS_WIRE_VERSION: i64 = 8;
/// How many times a commit with an unknown outcome is sent again.
const COMMIT_RETRIES: usize = 2;

/// A MongoDB database backend.
pub struct MongoBackend {
    client: Client,
    database: Database,
}

impl MongoBackend {
    /// Creates a backend over an existing client, bound to `database`.
    pub fn new(client: Client, database: &str) -> Self {
        let database = client.database(database);
        Self { client, database }
    }

    /// Builds a client from a connection string.
    ///
    /// Only the connection string is validated (including SRV/DNS lookups
    /// for `mongodb+srv://`); no server is contacted and no credentials are
    /// checked.
    pub async fn connect(uri: &str, direct_connection: bool, database: &str) -> MigrateResult<Self> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| MigrateError::Connection(format!("Failed to parse connection string: {e}")))?;
        if direct_connection {
            options.direct_connection = Some(true);
        }
        options.app_name.get_or_insert_with(|| "migrate-rs".to_string());

        let client = Client::with_options(options)
            .map_err(|e| MigrateError::Connection(format!("Failed to create client: {e}")))?;
        Ok(Self::new(client, database))
    }

    /// Returns the underlying client.
    pub const fn client(&self) -> &Client {
        &self.client
    }
}

/// Maps a driver error to a [`MigrateError`].
fn classify(err: MongoError) -> MigrateError {
    let message = err.to_string();
    match *err.kind {
        ErrorKind::Authentication { .. } => MigrateError::Authentication(message),
        ErrorKind::Command(ref command) => classify_server_error(command.code, command.message.clone()),
        ErrorKind::Write(WriteFailure::WriteError(ref write)) => {
            classify_server_error(write.code, write.message.clone())
        }
        ErrorKind::ServerSelection { .. }
        | ErrorKind::DnsResolve { .. }
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::Io(_) => MigrateError::Connection(message),
        ErrorKind::InvalidArgument { .. } => MigrateError::Config(message),
        ErrorKind::Transaction { .. } => MigrateError::Transaction(message),
        _ => MigrateError::Database {
            code: None,
            message,
        },
    }
}

#[async_trait::async_trait]
impl DocumentBackend for MongoBackend {
    fn vendor(&self) -> &str {
        "mongodb"
    }

    fn database_name(&self) -> &str {
        self.database.name()
    }

    async fn run_command(&self, command: Document) -> MigrateResult<Document> {
        tracing::trace!(
            database = %self.database.name(),
            command = command.keys().next().map_or("", String::as_str),
            "sending command"
        );
        let reply = self
            .database
            .run_command(command, None)
            .await
            .map_err(classify)?;
        ensure_command_ok(reply)
    }

    async fn supports_transactions(&self) -> MigrateResult<bool> {
        // `isMaster` rather than `hello` so 3.6 / 4.0 servers answer too.
        let reply = self.run_command(doc! { "isMaster": 1 }).await?;
        let wire_version = reply.get("maxWireVersion").and_then(bson_to_i64).unwrap_or(0);
        let replica_set = reply.contains_key("setName");
        let mongos = reply.get_str("msg").is_ok_and(|msg| msg == "isdbgrid");
        Ok((replica_set && wire_version >= REPLICA_SET_TRANSACTIONS_WIRE_VERSION)
            || (mongos && wire_version >= SHARDED_TRANSACTIONS_WIRE_VERSION))
    }

    async fn begin_transaction(&self) -> MigrateResult<Box<dyn BackendTransaction>> {
        let mut session = self.client.start_session(None).await.map_err(classify)?;
        session.start_transaction(None).await.map_err(classify)?;
        tracing::debug!(database = %self.database.name(), "started transaction");
        Ok(Box::new(MongoTransaction {
            session,
            database: self.database.clone(),
        }))
    }

    async fn list_collection_names(&self) -> MigrateResult<Vec<String>> {
        self.database
            .list_collection_names(None)
            .await
            .map_err(classify)
    }

    async fn drop_collection(&self, name: &str) -> MigrateResult<()> {
        // The driver already treats a missing namespace as success.
        self.database
            .collection::<Document>(name)
            .drop(None)
            .await
            .map_err(classify)
    }

    async fn shutdown(&self) -> MigrateResult<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

/// A transaction bound to one client session.
struct MongoTransaction {
    session: ClientSession,
    database: Database,
}

#[async_trait::async_trait]
impl BackendTransaction for MongoTransaction {
    async fn run_command(&mut self, command: Document) -> MigrateResult<Document> {
        let reply = self
            .database
            .run_command_with_session(command, None, &mut self.session)
            .await
            .map_err(classify)?;
        ensure_command_ok(reply)
    }

    async fn commit(self: Box<Self>) -> MigrateResult<()> {
        let mut this = *self;
        let mut attempt = 0;
        loop {
            match this.session.commit_transaction().await {
                Ok(()) => {
                    tracing::debug!(database = %this.database.name(), "committed transaction");
                    return Ok(());
                }
                Err(e) if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) => {
                    if attempt == COMMIT_RETRIES {
                        return Err(MigrateError::CommitUnknown(e.to_string()));
                    }
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "commit outcome unknown; retrying");
                }
                Err(e) => return Err(MigrateError::Transaction(format!("commit failed: {e}"))),
            }
        }
    }

    async fn abort(self: Box<Self>) -> MigrateResult<()> {
        let mut this = *self;
        this.session
            .abort_transaction()
            .await
            .map_err(|e| MigrateError::Transaction(format!("abort failed: {e}")))?;
        tracing::debug!(database = %this.database.name(), "aborted transaction");
        Ok(())
    }
}
