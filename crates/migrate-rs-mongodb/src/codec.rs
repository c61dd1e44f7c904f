//! Migration script decoding.
//!
//! A migration script is a JSON array of command documents written in
//! MongoDB Extended JSON, canonical or relaxed:
//!
//! ```json
//! [
//!   { "createIndexes": "hello", "indexes": [{ "key": { "wild": 1 }, "name": "unique_wild", "unique": true }] },
//!   { "insert": "hello", "documents": [{ "wild": "world" }] }
//! ]
//! ```
//!
//! [`decode`] turns the bytes into a [`MigrationScript`] of typed
//! [`Command`]s. Known commands are checked for structure only; anything
//! else becomes [`Command::Opaque`] and is forwarded untouched so the server
//! gets to decide whether it is supported.

use bson::{Bson, Document};
use migrate_rs_core::{MigrateError, MigrateResult};

/// Commands that cannot run inside a multi-document transaction.
///
/// `create` and `createIndexes` are listed here too; they have their own
/// [`Command`] variants but share the restriction.
pub const STRUCTURAL_COMMANDS: &[&str] = &[
    "create",
    "createIndexes",
    "drop",
    "dropIndexes",
    "dropDatabase",
    "renameCollection",
    "collMod",
    "createUser",
    "dropUser",
    "updateUser",
    "grantRolesToUser",
];

/// Structural commands that a transactional run may move ahead of the data
/// commands preceding them in the script.
pub const HOISTABLE_COMMANDS: &[&str] = &["create", "createIndexes"];

/// One decoded database command.
///
/// Every variant keeps the full command document in `raw`, which is what
/// gets sent to the server. The typed fields are views used for logging and
/// for deciding where the command may run.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `{ insert: <collection>, documents: [...] }`
    Insert {
        /// Target collection.
        collection: String,
        /// Documents to insert.
        documents: Vec<Document>,
        /// The full command document.
        raw: Document,
    },
    /// `{ create: <collection>, ... }`
    Create {
        /// Collection to create.
        collection: String,
        /// The full command document.
        raw: Document,
    },
    /// `{ createIndexes: <collection>, indexes: [...] }`
    CreateIndexes {
        /// Target collection.
        collection: String,
        /// Index specifications.
        indexes: Vec<Document>,
        /// The full command document.
        raw: Document,
    },
    /// Any other command, forwarded verbatim.
    Opaque {
        /// The command name (the first key of `raw`).
        name: String,
        /// The full command document.
        raw: Document,
    },
}

impl Command {
    /// Builds a command from a decoded document.
    ///
    /// `index` is the position in the script and only used in error messages.
    pub fn from_document(index: usize, raw: Document) -> MigrateResult<Self> {
        let Some(name) = raw.keys().next().cloned() else {
            return Err(malformed(index, "empty command document"));
        };
        match name.as_str() {
            "insert" => {
                let collection = collection_of(index, &raw, "insert")?;
                let documents = documents_of(index, &raw, "documents")?;
                Ok(Self::Insert {
                    collection,
                    documents,
                    raw,
                })
            }
            "create" => {
                let collection = collection_of(index, &raw, "create")?;
                Ok(Self::Create { collection, raw })
            }
            "createIndexes" => {
                let collection = collection_of(index, &raw, "createIndexes")?;
                let indexes = documents_of(index, &raw, "indexes")?;
                Ok(Self::CreateIndexes {
                    collection,
                    indexes,
                    raw,
                })
            }
            _ => Ok(Self::Opaque { name, raw }),
        }
    }

    /// Returns the command name.
    pub fn name(&self) -> &str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Create { .. } => "create",
            Self::CreateIndexes { .. } => "createIndexes",
            Self::Opaque { name, .. } => name,
        }
    }

    /// Returns the collection the command targets, for the typed variants.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Self::Insert { collection, .. }
            | Self::Create { collection, .. }
            | Self::CreateIndexes { collection, .. } => Some(collection),
            Self::Opaque { .. } => None,
        }
    }

    /// Returns the command document as it will be sent.
    pub const fn document(&self) -> &Document {
        match self {
            Self::Insert { raw, .. }
            | Self::Create { raw, .. }
            | Self::CreateIndexes { raw, .. }
            | Self::Opaque { raw, .. } => raw,
        }
    }

    /// Consumes the command, returning the document to send.
    pub fn into_document(self) -> Document {
        match self {
            Self::Insert { raw, .. }
            | Self::Create { raw, .. }
            | Self::CreateIndexes { raw, .. }
            | Self::Opaque { raw, .. } => raw,
        }
    }

    /// Returns whether the command alters schema and therefore has to run
    /// outside any transaction.
    pub fn is_structural(&self) -> bool {
        STRUCTURAL_COMMANDS.contains(&self.name())
    }

    /// Returns whether a transactional run may execute this command ahead of
    /// earlier data commands.
    pub fn is_hoistable(&self) -> bool {
        HOISTABLE_COMMANDS.contains(&self.name())
    }
}

/// An ordered, decoded migration script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationScript {
    commands: Vec<Command>,
}

impl MigrationScript {
    /// Creates a script from already-built commands.
    pub const fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// Returns the commands in execution order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Returns the number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns whether the script has no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Iterates over the commands in execution order.
    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }

    /// Returns how many commands must run outside a transaction.
    pub fn structural_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_structural()).count()
    }

    /// Checks that the script keeps its meaning when run in transactional
    /// mode.
    ///
    /// Structural commands run before the transaction opens. Only `create`
    /// and `createIndexes` may be moved ahead of a data command; any other
    /// structural command following one would change what the script does.
    pub fn check_transactional(&self) -> MigrateResult<()> {
        let Some(first_data) = self.commands.iter().position(|c| !c.is_structural()) else {
            return Ok(());
        };
        let misplaced = self.commands[first_data..]
            .iter()
            .enumerate()
            .find(|(_, c)| c.is_structural() && !c.is_hoistable());
        match misplaced {
            Some((offset, command)) => Err(malformed(
                first_data + offset,
                format!(
                    "'{}' cannot run in transactional mode after data command #{first_data} ('{}')",
                    command.name(),
                    self.commands[first_data].name()
                ),
            )),
            None => Ok(()),
        }
    }
}

impl<'a> IntoIterator for &'a MigrationScript {
    type Item = &'a Command;
    type IntoIter = std::slice::Iter<'a, Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.iter()
    }
}

/// Decodes a migration script.
///
/// Empty or all-whitespace input, and `[]`, decode to an empty script.
///
/// # Examples
///
/// ```
/// use migrate_rs_mongodb::codec::decode;
///
/// let script = decode(br#"[{"insert": "hello", "documents": [{"wild": "world"}]}]"#).unwrap();
/// assert_eq!(script.len(), 1);
/// assert_eq!(script.commands()[0].name(), "insert");
/// ```
pub fn decode(bytes: &[u8]) -> MigrateResult<MigrationScript> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(MigrationScript::default());
    }

    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| MigrateError::MalformedScript(format!("invalid JSON: {e}")))?;
    let serde_json::Value::Array(elements) = value else {
        return Err(MigrateError::MalformedScript(
            "expected a JSON array of command documents".into(),
        ));
    };

    let commands = elements
        .into_iter()
        .enumerate()
        .map(|(index, element)| decode_element(index, element))
        .collect::<MigrateResult<Vec<_>>>()?;
    Ok(MigrationScript { commands })
}

fn decode_element(index: usize, element: serde_json::Value) -> MigrateResult<Command> {
    if !element.is_object() {
        return Err(malformed(index, "expected a command document"));
    }
    match Bson::try_from(element) {
        Ok(Bson::Document(raw)) => Command::from_document(index, raw),
        // An object such as {"$oid": ...} decodes to a scalar.
        Ok(other) => Err(malformed(
            index,
            format!("expected a command document, found {:?}", other.element_type()),
        )),
        Err(e) => Err(malformed(index, format!("invalid extended JSON: {e}"))),
    }
}

fn collection_of(index: usize, raw: &Document, key: &str) -> MigrateResult<String> {
    match raw.get_str(key) {
        Ok(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(malformed(
            index,
            format!("'{key}' requires a collection name string"),
        )),
    }
}

fn documents_of(index: usize, raw: &Document, field: &str) -> MigrateResult<Vec<Document>> {
    let array = raw
        .get_array(field)
        .map_err(|_| malformed(index, format!("'{field}' must be an array of documents")))?;
    array
        .iter()
        .enumerate()
        .map(|(position, entry)| match entry {
            Bson::Document(document) => Ok(document.clone()),
            _ => Err(malformed(
                index,
                format!("'{field}' element {position} is not a document"),
            )),
        })
        .collect()
}

fn malformed(index: usize, message: impl std::fmt::Display) -> MigrateError {
    MigrateError::MalformedScript(format!("command #{index}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── decoding ────────────────────────────────────────────────────

    #[test]
    fn test_decode_insert() {
        let script = decode(
            br#"[{"insert":"hello","documents":[{"wild":"world"}]}]"#,
        )
        .unwrap();
        match &script.commands()[0] {
            Command::Insert {
                collection,
                documents,
                ..
            } => {
                assert_eq!(collection, "hello");
                assert_eq!(documents.len(), 1);
                assert_eq!(documents[0].get_str("wild").unwrap(), "world");
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_preserves_order() {
        let script = decode(
            br#"[
                {"create": "hello"},
                {"createIndexes": "hello", "indexes": [{"key": {"wild": 1}, "name": "unique_wild", "unique": true}]},
                {"insert": "hello", "documents": [{"wild": "world"}]},
                {"ping": 1}
            ]"#,
        )
        .unwrap();
        let names: Vec<_> = script.iter().map(Command::name).collect();
        assert_eq!(names, ["create", "createIndexes", "insert", "ping"]);
    }

    #[test]
    fn test_decode_keeps_key_order() {
        let script =
            decode(br#"[{"insert":"hello","ordered":true,"documents":[{"z":1,"a":2}]}]"#).unwrap();
        let raw = script.commands()[0].document();
        let keys: Vec<_> = raw.keys().map(String::as_str).collect();
        assert_eq!(keys, ["insert", "ordered", "documents"]);
    }

    #[test]
    fn test_decode_extended_json() {
        let script = decode(
            br#"[{"insert":"events","documents":[{
                "_id": {"$oid": "5f0c6b1e2a1b3c4d5e6f7a8b"},
                "at": {"$date": "2020-07-01T00:00:00Z"},
                "count": {"$numberLong": "42"}
            }]}]"#,
        )
        .unwrap();
        let Command::Insert { documents, .. } = &script.commands()[0] else {
            panic!("expected insert");
        };
        let doc = &documents[0];
        assert!(doc.get_object_id("_id").is_ok());
        assert!(doc.get_datetime("at").is_ok());
        assert_eq!(doc.get_i64("count").unwrap(), 42);
    }

    #[test]
    fn test_decode_empty_inputs() {
        assert!(decode(b"").unwrap().is_empty());
        assert!(decode(b"  \n\t").unwrap().is_empty());
        assert!(decode(b"[]").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_command_is_opaque() {
        let script = decode(br#"[{"frobnicate": "hello", "level": 3}]"#).unwrap();
        match &script.commands()[0] {
            Command::Opaque { name, raw } => {
                assert_eq!(name, "frobnicate");
                assert_eq!(raw.get_i32("level").unwrap(), 3);
            }
            other => panic!("expected opaque, got {other:?}"),
        }
    }

    // ── malformed input ─────────────────────────────────────────────

    fn assert_malformed(input: &[u8], fragment: &str) {
        match decode(input) {
            Err(MigrateError::MalformedScript(message)) => {
                assert!(message.contains(fragment), "'{message}' lacks '{fragment}'");
            }
            other => panic!("expected MalformedScript, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_json() {
        assert_malformed(b"[{\"insert\": ", "invalid JSON");
        assert_malformed(&[0x5b, 0xff, 0x5d], "invalid JSON");
    }

    #[test]
    fn test_top_level_must_be_array() {
        assert_malformed(br#"{"insert": "hello"}"#, "JSON array");
    }

    #[test]
    fn test_elements_must_be_documents() {
        assert_malformed(br#"[{"ping": 1}, 3]"#, "command #1");
        assert_malformed(br#"[{"$oid": "5f0c6b1e2a1b3c4d5e6f7a8b"}]"#, "command #0");
    }

    #[test]
    fn test_empty_document_is_malformed() {
        assert_malformed(b"[{}]", "empty command document");
    }

    #[test]
    fn test_known_command_structure_is_checked() {
        assert_malformed(br#"[{"insert": "hello"}]"#, "'documents'");
        assert_malformed(br#"[{"insert": 5, "documents": []}]"#, "collection name");
        assert_malformed(br#"[{"insert": "hello", "documents": [1]}]"#, "element 0");
        assert_malformed(br#"[{"create": ""}]"#, "collection name");
        assert_malformed(br#"[{"createIndexes": "hello", "indexes": {}}]"#, "'indexes'");
    }

    // ── classification ──────────────────────────────────────────────

    #[test]
    fn test_is_structural() {
        let script = decode(
            br#"[
                {"create": "a"},
                {"createIndexes": "a", "indexes": []},
                {"dropIndexes": "a", "index": "*"},
                {"insert": "a", "documents": [{}]},
                {"update": "a", "updates": []}
            ]"#,
        )
        .unwrap();
        let flags: Vec<_> = script.iter().map(Command::is_structural).collect();
        assert_eq!(flags, [true, true, true, false, false]);
        assert_eq!(script.structural_count(), 3);
    }

    #[test]
    fn test_check_transactional_allows_leading_structural_commands() {
        let script = decode(
            br#"[
                {"drop": "logs"},
                {"create": "logs"},
                {"insert": "logs", "documents": [{"n": 1}]},
                {"createIndexes": "logs", "indexes": []}
            ]"#,
        )
        .unwrap();
        script.check_transactional().unwrap();
        assert!(MigrationScript::default().check_transactional().is_ok());
    }

    #[test]
    fn test_check_transactional_rejects_drop_after_data() {
        let script = decode(
            br#"[
                {"insert": "logs", "documents": [{"n": 2}]},
                {"create": "other"},
                {"drop": "logs"}
            ]"#,
        )
        .unwrap();
        let err = script.check_transactional().unwrap_err();
        assert!(matches!(err, MigrateError::MalformedScript(_)));
        let message = err.to_string();
        assert!(message.contains("command #2"), "{message}");
        assert!(message.contains("'drop'"), "{message}");
    }

    #[test]
    fn test_collection_and_into_document() {
        let script = decode(br#"[{"create": "hello"}, {"ping": 1}]"#).unwrap();
        assert_eq!(script.commands()[0].collection(), Some("hello"));
        assert_eq!(script.commands()[1].collection(), None);
        let raw = script.commands()[1].clone().into_document();
        assert_eq!(raw.get_i32("ping").unwrap(), 1);
    }
}
