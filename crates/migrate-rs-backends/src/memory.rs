//! In-memory document backend.
//!
//! [`MemoryBackend`] interprets the subset of MongoDB commands the migration
//! driver and typical migration scripts use, against a process-local store.
//! It mirrors server behaviour where the driver depends on it:
//!
//! - `insert` answers with `ok: 1` plus `writeErrors` on a duplicate key,
//!   keeping the documents inserted before the failure (ordered inserts)
//! - unique indexes (including the implicit one on `_id`) and TTL indexes
//!   on date fields
//! - transactions work on a private copy of the database that is swapped in
//!   on commit; `create`, `createIndexes`, `drop`, `createUser` and inserts
//!   into a missing collection are refused inside a transaction, as on
//!   MongoDB 4.0
//! - when a backend carries credentials, every command checks them against
//!   users created with `createUser`, so a wrong password surfaces on the
//!   first command and not when the backend is created
//!
//! Query filters support top-level and dotted-path equality only, and
//! `update` accepts replacement documents only (no `$set` and friends).
//!
//! Several backends can share one store via [`MemoryBackend::attach`],
//! which is how tests model separate clients talking to the same server.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use migrate_rs_core::error::{
    COMMAND_NOT_FOUND, DUPLICATE_KEY, NAMESPACE_EXISTS, NAMESPACE_NOT_FOUND,
    NOT_SUPPORTED_IN_TRANSACTION, WRITE_CONFLICT,
};
use migrate_rs_core::{MigrateError, MigrateResult};
use tokio::sync::Mutex;

use crate::base::{bson_to_i64, ensure_command_ok, BackendTransaction, DocumentBackend};

const BAD_VALUE: i32 = 2;
const INVALID_NAMESPACE: i32 = 73;
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const USER_ALREADY_EXISTS: i32 = 51003;

/// An index definition on a memory collection.
#[derive(Debug, Clone, PartialEq)]
struct IndexSpec {
    name: String,
    key: Vec<String>,
    unique: bool,
    expire_after_secs: Option<i64>,
}

impl IndexSpec {
    fn id_index() -> Self {
        Self {
            name: "_id_".into(),
            key: vec!["_id".into()],
            unique: true,
            expire_after_secs: None,
        }
    }

    fn parse(spec: &Document) -> MigrateResult<Self> {
        let key = spec
            .get_document("key")
            .map_err(|_| MigrateError::database(BAD_VALUE, "index specification must have a 'key' document"))?;
        if key.is_empty() {
            return Err(MigrateError::database(BAD_VALUE, "index key pattern must not be empty"));
        }
        let name = spec
            .get_str("name")
            .map_err(|_| MigrateError::database(BAD_VALUE, "index specification must have a 'name'"))?;
        Ok(Self {
            name: name.to_string(),
            key: key.keys().cloned().collect(),
            unique: spec.get_bool("unique").unwrap_or(false),
            expire_after_secs: spec.get("expireAfterSeconds").and_then(bson_to_i64),
        })
    }

    fn key_of(&self, document: &Document) -> Vec<Bson> {
        self.key
            .iter()
            .map(|field| get_path(document, field).cloned().unwrap_or(Bson::Null))
            .collect()
    }
}

#[derive(Debug, Clone)]
struct MemoryCollection {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

impl Default for MemoryCollection {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            indexes: vec![IndexSpec::id_index()],
        }
    }
}

impl MemoryCollection {
    fn duplicate_of(&self, document: &Document) -> Option<&IndexSpec> {
        self.indexes.iter().filter(|index| index.unique).find(|index| {
            let key = index.key_of(document);
            self.documents.iter().any(|existing| index.key_of(existing) == key)
        })
    }

    fn purge_expired(&mut self, now_millis: i64) {
        let ttl: Vec<(String, i64)> = self
            .indexes
            .iter()
            .filter(|index| index.key.len() == 1)
            .filter_map(|index| index.expire_after_secs.map(|secs| (index.key[0].clone(), secs)))
            .collect();
        for (field, secs) in ttl {
            self.documents.retain(|document| match get_path(document, &field) {
                Some(Bson::DateTime(at)) => at.timestamp_millis() + secs * 1000 > now_millis,
                _ => true,
            });
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryDatabase {
    collections: BTreeMap<String, MemoryCollection>,
    revision: u64,
}

#[derive(Debug, Default)]
struct MemoryStore {
    databases: HashMap<String, MemoryDatabase>,
    /// Users keyed by the database they were created in.
    users: HashMap<String, HashMap<String, String>>,
}

impl MemoryStore {
    fn authenticate(&self, database: &str, credentials: Option<&Credentials>) -> MigrateResult<()> {
        let Some(credentials) = credentials else {
            return Ok(());
        };
        let source = credentials.source.as_deref().unwrap_or(database);
        let known = self
            .users
            .get(source)
            .and_then(|users| users.get(&credentials.user))
            .is_some_and(|password| *password == credentials.password);
        if known {
            Ok(())
        } else {
            Err(MigrateError::Authentication(format!(
                "SCRAM failure: Authentication failed for user '{}' on '{source}'",
                credentials.user
            )))
        }
    }
}

#[derive(Debug, Clone)]
struct Credentials {
    user: String,
    password: String,
    source: Option<String>,
}

/// A document backend backed by a process-local store.
///
/// # Examples
///
/// ```
/// use bson::doc;
/// use migrate_rs_backends::{DocumentBackend, MemoryBackend};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let backend = MemoryBackend::new("app");
/// backend
///     .run_command(doc! { "insert": "users", "documents": [{ "name": "ada" }] })
///     .await
///     .unwrap();
/// assert_eq!(backend.count_documents("users").await.unwrap(), 1);
/// # }
/// ```
pub struct MemoryBackend {
    store: Arc<Mutex<MemoryStore>>,
    database: String,
    credentials: Option<Credentials>,
    transactions: bool,
    shut_down: AtomicBool,
}

impl MemoryBackend {
    /// Creates a backend over a new, empty store.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            store: Arc::new(Mutex::new(MemoryStore::default())),
            database: database.into(),
            credentials: None,
            transactions: true,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Creates another backend over the same store, bound to `database`.
    ///
    /// The new backend has no credentials and supports transactions.
    pub fn attach(&self, database: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            database: database.into(),
            credentials: None,
            transactions: true,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Authenticates every command as `user`, using the target database as
    /// the authentication source.
    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
            source: None,
        });
        self
    }

    /// Sets the database holding the user definitions.
    #[must_use]
    pub fn with_auth_source(mut self, source: impl Into<String>) -> Self {
        if let Some(credentials) = self.credentials.as_mut() {
            credentials.source = Some(source.into());
        }
        self
    }

    /// Models a standalone server: no multi-document transactions.
    #[must_use]
    pub fn without_transactions(mut self) -> Self {
        self.transactions = false;
        self
    }

    /// Returns whether [`DocumentBackend::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Counts the documents of a collection (zero if it does not exist).
    pub async fn count_documents(&self, collection: &str) -> MigrateResult<u64> {
        let reply = self.run_command(doc! { "count": collection }).await?;
        Ok(reply
            .get("n")
            .and_then(bson_to_i64)
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0))
    }

    fn check_open(&self) -> MigrateResult<()> {
        if self.is_shut_down() {
            return Err(MigrateError::Connection("client has been shut down".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentBackend for MemoryBackend {
    fn vendor(&self) -> &str {
        "memory"
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    async fn run_command(&self, command: Document) -> MigrateResult<Document> {
        self.check_open()?;
        let mut store = self.store.lock().await;
        store.authenticate(&self.database, self.credentials.as_ref())?;
        let MemoryStore { databases, users } = &mut *store;
        let database = databases.entry(self.database.clone()).or_default();
        let reply = execute(&self.database, database, users, &command, false)?;
        ensure_command_ok(reply)
    }

    async fn supports_transactions(&self) -> MigrateResult<bool> {
        Ok(self.transactions)
    }

    async fn begin_transaction(&self) -> MigrateResult<Box<dyn BackendTransaction>> {
        self.check_open()?;
        if !self.transactions {
            return Err(MigrateError::database(
                20,
                "Transaction numbers are only allowed on a replica set member or mongos",
            ));
        }
        let store = self.store.lock().await;
        store.authenticate(&self.database, self.credentials.as_ref())?;
        let working = store.databases.get(&self.database).cloned().unwrap_or_default();
        Ok(Box::new(MemoryTransaction {
            store: Arc::clone(&self.store),
            database: self.database.clone(),
            base_revision: working.revision,
            working,
        }))
    }

    async fn shutdown(&self) -> MigrateResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A transaction over a private copy of one memory database.
struct MemoryTransaction {
    store: Arc<Mutex<MemoryStore>>,
    database: String,
    working: MemoryDatabase,
    base_revision: u64,
}

#[async_trait::async_trait]
impl BackendTransaction for MemoryTransaction {
    async fn run_command(&mut self, command: Document) -> MigrateResult<Document> {
        // Users are never modified inside a transaction; a scratch map keeps
        // `execute`'s signature uniform.
        let mut users = HashMap::new();
        let reply = execute(&self.database, &mut self.working, &mut users, &command, true)?;
        ensure_command_ok(reply)
    }

    async fn commit(self: Box<Self>) -> MigrateResult<()> {
        let Self {
            store,
            database,
            mut working,
            base_revision,
        } = *self;
        let mut store = store.lock().await;
        let current = store.databases.entry(database).or_default();
        if current.revision != base_revision {
            return Err(MigrateError::database(
                WRITE_CONFLICT,
                "WriteConflict: the database changed while the transaction was open",
            ));
        }
        working.revision = current.revision + 1;
        *current = working;
        tracing::debug!(revision = current.revision, "committed in-memory transaction");
        Ok(())
    }

    async fn abort(self: Box<Self>) -> MigrateResult<()> {
        tracing::debug!(database = %self.database, "discarded in-memory transaction");
        Ok(())
    }
}

// ============================================================
// Command interpreter
// ============================================================

fn execute(
    db_name: &str,
    database: &mut MemoryDatabase,
    users: &mut HashMap<String, HashMap<String, String>>,
    command: &Document,
    in_transaction: bool,
) -> MigrateResult<Document> {
    let Some((name, target)) = command.iter().next() else {
        return Err(MigrateError::database(BAD_VALUE, "empty command document"));
    };

    let now = bson::DateTime::now().timestamp_millis();
    for collection in database.collections.values_mut() {
        collection.purge_expired(now);
    }

    let refuse_in_transaction = || {
        MigrateError::database(
            NOT_SUPPORTED_IN_TRANSACTION,
            format!("Cannot run '{name}' in a multi-document transaction."),
        )
    };

    let reply = match name.as_str() {
        "ping" => doc! { "ok": 1 },
        "hello" | "isMaster" | "ismaster" => doc! {
            "isWritablePrimary": true,
            "maxWireVersion": 17,
            "ok": 1,
        },
        "insert" => {
            let collection = collection_name(name, target)?;
            if in_transaction && !database.collections.contains_key(collection) {
                return Err(MigrateError::database(
                    NOT_SUPPORTED_IN_TRANSACTION,
                    format!("Cannot create namespace {db_name}.{collection} in multi-document transaction."),
                ));
            }
            let documents = document_array(command, "documents")?;
            let ordered = command.get_bool("ordered").unwrap_or(true);
            database.revision += 1;
            insert(db_name, database.collections.entry(collection.to_string()).or_default(), collection, documents, ordered)
        }
        "create" => {
            if in_transaction {
                return Err(refuse_in_transaction());
            }
            let collection = collection_name(name, target)?;
            if database.collections.contains_key(collection) {
                return Err(MigrateError::database(
                    NAMESPACE_EXISTS,
                    format!("Collection already exists. NS: {db_name}.{collection}"),
                ));
            }
            database.collections.insert(collection.to_string(), MemoryCollection::default());
            database.revision += 1;
            doc! { "ok": 1 }
        }
        "createIndexes" => {
            if in_transaction {
                return Err(refuse_in_transaction());
            }
            let collection = collection_name(name, target)?;
            let specs = document_array(command, "indexes")?
                .into_iter()
                .map(IndexSpec::parse)
                .collect::<MigrateResult<Vec<_>>>()?;
            database.revision += 1;
            create_indexes(db_name, database.collections.entry(collection.to_string()).or_default(), collection, specs)?
        }
        "update" => {
            let collection = collection_name(name, target)?;
            if in_transaction && !database.collections.contains_key(collection) {
                return Err(MigrateError::database(
                    NOT_SUPPORTED_IN_TRANSACTION,
                    format!("Cannot create namespace {db_name}.{collection} in multi-document transaction."),
                ));
            }
            let updates = document_array(command, "updates")?;
            database.revision += 1;
            update(db_name, database.collections.entry(collection.to_string()).or_default(), collection, updates)?
        }
        "find" => {
            let collection = collection_name(name, target)?;
            let filter = optional_document(command, "filter")?;
            let limit = command.get("limit").and_then(bson_to_i64).unwrap_or(0);
            let mut batch = Vec::new();
            if let Some(coll) = database.collections.get(collection) {
                for document in &coll.documents {
                    if matches_filter(document, &filter)? {
                        batch.push(Bson::Document(document.clone()));
                        if limit > 0 && i64::try_from(batch.len()).unwrap_or(i64::MAX) >= limit {
                            break;
                        }
                    }
                }
            }
            doc! {
                "cursor": { "firstBatch": batch, "id": 0_i64, "ns": format!("{db_name}.{collection}") },
                "ok": 1,
            }
        }
        "count" => {
            let collection = collection_name(name, target)?;
            let query = optional_document(command, "query")?;
            let mut n = 0_i64;
            if let Some(coll) = database.collections.get(collection) {
                for document in &coll.documents {
                    if matches_filter(document, &query)? {
                        n += 1;
                    }
                }
            }
            doc! { "n": n, "ok": 1 }
        }
        "delete" => {
            let collection = collection_name(name, target)?;
            let deletes = document_array(command, "deletes")?;
            let mut removed = 0_i64;
            if let Some(coll) = database.collections.get_mut(collection) {
                for statement in deletes {
                    let filter = optional_document(statement, "q")?;
                    let limit = statement.get("limit").and_then(bson_to_i64).unwrap_or(0);
                    let mut kept = Vec::with_capacity(coll.documents.len());
                    let mut hits = 0_i64;
                    for document in coll.documents.drain(..) {
                        if (limit == 0 || hits < limit) && matches_filter(&document, &filter)? {
                            hits += 1;
                        } else {
                            kept.push(document);
                        }
                    }
                    coll.documents = kept;
                    removed += hits;
                }
            }
            database.revision += 1;
            doc! { "n": removed, "ok": 1 }
        }
        "drop" => {
            if in_transaction {
                return Err(refuse_in_transaction());
            }
            let collection = collection_name(name, target)?;
            if database.collections.remove(collection).is_none() {
                return Err(MigrateError::database(NAMESPACE_NOT_FOUND, "ns not found"));
            }
            database.revision += 1;
            doc! { "ns": format!("{db_name}.{collection}"), "ok": 1 }
        }
        "dropDatabase" => {
            if in_transaction {
                return Err(refuse_in_transaction());
            }
            database.collections.clear();
            database.revision += 1;
            doc! { "dropped": db_name, "ok": 1 }
        }
        "listCollections" => {
            let batch: Vec<Bson> = database
                .collections
                .keys()
                .map(|name| Bson::Document(doc! { "name": name, "type": "collection" }))
                .collect();
            doc! {
                "cursor": { "firstBatch": batch, "id": 0_i64, "ns": format!("{db_name}.$cmd.listCollections") },
                "ok": 1,
            }
        }
        "createUser" => {
            if in_transaction {
                return Err(refuse_in_transaction());
            }
            let user = collection_name(name, target)?;
            let password = command
                .get_str("pwd")
                .map_err(|_| MigrateError::database(BAD_VALUE, "createUser requires 'pwd'"))?;
            let db_users = users.entry(db_name.to_string()).or_default();
            if db_users.contains_key(user) {
                return Err(MigrateError::database(
                    USER_ALREADY_EXISTS,
                    format!("User \"{user}@{db_name}\" already exists"),
                ));
            }
            db_users.insert(user.to_string(), password.to_string());
            doc! { "ok": 1 }
        }
        other => {
            return Err(MigrateError::database(
                COMMAND_NOT_FOUND,
                format!("no such command: '{other}'"),
            ))
        }
    };
    Ok(reply)
}

fn insert(
    db_name: &str,
    coll: &mut MemoryCollection,
    collection: &str,
    documents: Vec<&Document>,
    ordered: bool,
) -> Document {
    let mut inserted = 0_i64;
    let mut write_errors = Vec::new();
    for (index, document) in documents.into_iter().enumerate() {
        let document = with_object_id(document);
        if let Some(violated) = coll.duplicate_of(&document) {
            write_errors.push(Bson::Document(doc! {
                "index": i64::try_from(index).unwrap_or(i64::MAX),
                "code": DUPLICATE_KEY,
                "errmsg": format!(
                    "E11000 duplicate key error collection: {db_name}.{collection} index: {} dup key: {:?}",
                    violated.name,
                    violated.key_of(&document),
                ),
            }));
            if ordered {
                break;
            }
            continue;
        }
        coll.documents.push(document);
        inserted += 1;
    }
    let mut reply = doc! { "n": inserted };
    if !write_errors.is_empty() {
        reply.insert("writeErrors", write_errors);
    }
    reply.insert("ok", 1);
    reply
}

/// Applies replacement-style updates (`u` is a whole document, no `$` operators).
fn update(
    db_name: &str,
    coll: &mut MemoryCollection,
    collection: &str,
    updates: Vec<&Document>,
) -> MigrateResult<Document> {
    let mut matched = 0_i64;
    let mut upserted = Vec::new();
    let mut write_errors = Vec::new();
    for (index, statement) in updates.into_iter().enumerate() {
        let index = i64::try_from(index).unwrap_or(i64::MAX);
        let filter = optional_document(statement, "q")?;
        let replacement = statement
            .get_document("u")
            .map_err(|_| MigrateError::database(BAD_VALUE, "update statement requires a 'u' document"))?;
        if replacement.keys().any(|key| key.starts_with('$')) {
            return Err(MigrateError::database(BAD_VALUE, "update operators are not supported"));
        }
        if statement.get_bool("multi").unwrap_or(false) {
            return Err(MigrateError::database(BAD_VALUE, "multi update is not supported for replacement-style update"));
        }

        let mut position = None;
        for (pos, document) in coll.documents.iter().enumerate() {
            if matches_filter(document, &filter)? {
                position = Some(pos);
                break;
            }
        }

        match position {
            Some(pos) => {
                let mut replaced = Document::new();
                if let Some(id) = coll.documents[pos].get("_id") {
                    replaced.insert("_id", id.clone());
                }
                for (key, value) in replacement {
                    if key != "_id" {
                        replaced.insert(key.clone(), value.clone());
                    }
                }
                coll.documents[pos] = replaced;
                matched += 1;
            }
            None if statement.get_bool("upsert").unwrap_or(false) => {
                let document = with_object_id(replacement);
                if let Some(violated) = coll.duplicate_of(&document) {
                    write_errors.push(Bson::Document(doc! {
                        "index": index,
                        "code": DUPLICATE_KEY,
                        "errmsg": format!(
                            "E11000 duplicate key error collection: {db_name}.{collection} index: {}",
                            violated.name
                        ),
                    }));
                    break;
                }
                upserted.push(Bson::Document(doc! {
                    "index": index,
                    "_id": document.get("_id").cloned().unwrap_or(Bson::Null),
                }));
                coll.documents.push(document);
            }
            None => {}
        }
    }
    let upserted_count = i64::try_from(upserted.len()).unwrap_or(i64::MAX);
    let mut reply = doc! { "n": matched + upserted_count, "nModified": matched };
    if !upserted.is_empty() {
        reply.insert("upserted", upserted);
    }
    if !write_errors.is_empty() {
        reply.insert("writeErrors", write_errors);
    }
    reply.insert("ok", 1);
    Ok(reply)
}

fn create_indexes(
    db_name: &str,
    coll: &mut MemoryCollection,
    collection: &str,
    specs: Vec<IndexSpec>,
) -> MigrateResult<Document> {
    let before = coll.indexes.len();
    for spec in specs {
        if let Some(existing) = coll.indexes.iter().find(|index| index.name == spec.name) {
            if *existing == spec {
                continue;
            }
            return Err(MigrateError::database(
                INDEX_OPTIONS_CONFLICT,
                format!("An existing index has the same name as the requested index: {}", spec.name),
            ));
        }
        if spec.unique {
            let mut seen = Vec::new();
            for document in &coll.documents {
                let key = spec.key_of(document);
                if seen.contains(&key) {
                    return Err(MigrateError::database(
                        DUPLICATE_KEY,
                        format!(
                            "E11000 duplicate key error collection: {db_name}.{collection} index: {} dup key: {key:?}",
                            spec.name
                        ),
                    ));
                }
                seen.push(key);
            }
        }
        coll.indexes.push(spec);
    }
    let to_i32 = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
    Ok(doc! {
        "numIndexesBefore": to_i32(before),
        "numIndexesAfter": to_i32(coll.indexes.len()),
        "ok": 1,
    })
}

// ============================================================
// Helpers
// ============================================================

fn collection_name<'a>(command: &str, target: &'a Bson) -> MigrateResult<&'a str> {
    match target {
        Bson::String(name) if !name.is_empty() && !name.contains('$') => Ok(name),
        _ => Err(MigrateError::database(
            INVALID_NAMESPACE,
            format!("'{command}' requires a non-empty collection name"),
        )),
    }
}

fn document_array<'a>(command: &'a Document, field: &str) -> MigrateResult<Vec<&'a Document>> {
    let array = command
        .get_array(field)
        .map_err(|_| MigrateError::database(BAD_VALUE, format!("'{field}' must be an array")))?;
    array
        .iter()
        .map(|entry| {
            entry.as_document().ok_or_else(|| {
                MigrateError::database(BAD_VALUE, format!("'{field}' must contain only documents"))
            })
        })
        .collect()
}

fn optional_document(command: &Document, field: &str) -> MigrateResult<Document> {
    match command.get(field) {
        None | Some(Bson::Null) => Ok(Document::new()),
        Some(Bson::Document(document)) => Ok(document.clone()),
        Some(_) => Err(MigrateError::database(BAD_VALUE, format!("'{field}' must be a document"))),
    }
}

fn with_object_id(document: &Document) -> Document {
    if document.contains_key("_id") {
        return document.clone();
    }
    let mut with_id = doc! { "_id": ObjectId::new() };
    for (key, value) in document {
        with_id.insert(key.clone(), value.clone());
    }
    with_id
}

fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = current.as_document()?.get(part)?;
    }
    Some(current)
}

fn matches_filter(document: &Document, filter: &Document) -> MigrateResult<bool> {
    for (field, expected) in filter {
        if field.starts_with('$') {
            return Err(MigrateError::database(
                BAD_VALUE,
                format!("unsupported query operator '{field}'"),
            ));
        }
        if let Bson::Document(inner) = expected {
            if inner.keys().next().is_some_and(|key| key.starts_with('$')) {
                return Err(MigrateError::database(
                    BAD_VALUE,
                    format!("unsupported query operator in filter on '{field}'"),
                ));
            }
        }
        let actual = get_path(document, field).unwrap_or(&Bson::Null);
        if actual != expected {
            return Ok(false);
        }
    }
    Ok(true)
}
