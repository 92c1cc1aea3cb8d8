use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::firestore::error::{failed_precondition, internal_error, FirestoreResult};
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::persistence::{
    BundleMetadata, ClientMetadata, MutationBatchOutcome, NamedQuery, Persistence,
    PersistenceTransaction, PrimaryLease, TransactionBody,
};
use crate::firestore::local::target_cache::TargetData;
use crate::firestore::model::{
    BatchId, DatabaseId, Document, DocumentKey, ListenSequenceNumber, MutationBatch, Overlay,
    ResourcePath, TargetId,
};
use crate::firestore::LOGGER;

/// Current on-disk layout. Version 1 lacked the named query and bundle
/// tables, version 2 the batch outcomes shared between clients.
pub const SCHEMA_VERSION: i64 = 3;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS remote_documents (
    path TEXT PRIMARY KEY,
    collection_path TEXT NOT NULL,
    collection_id TEXT NOT NULL,
    byte_size INTEGER NOT NULL,
    contents TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS remote_documents_by_collection ON remote_documents(collection_path);
CREATE INDEX IF NOT EXISTS remote_documents_by_collection_id ON remote_documents(collection_id);
CREATE TABLE IF NOT EXISTS mutations (
    user_id TEXT NOT NULL,
    batch_id INTEGER NOT NULL,
    contents TEXT NOT NULL,
    PRIMARY KEY (user_id, batch_id)
);
CREATE TABLE IF NOT EXISTS mutation_queues (
    user_id TEXT PRIMARY KEY,
    last_stream_token BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS document_overlays (
    user_id TEXT NOT NULL,
    path TEXT NOT NULL,
    collection_path TEXT NOT NULL,
    collection_id TEXT NOT NULL,
    largest_batch_id INTEGER NOT NULL,
    contents TEXT NOT NULL,
    PRIMARY KEY (user_id, path)
);
CREATE TABLE IF NOT EXISTS targets (
    target_id INTEGER PRIMARY KEY,
    canonical_id TEXT NOT NULL,
    contents TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS targets_by_canonical_id ON targets(canonical_id);
CREATE TABLE IF NOT EXISTS target_documents (
    target_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    PRIMARY KEY (target_id, path)
);
CREATE INDEX IF NOT EXISTS target_documents_by_path ON target_documents(path);
CREATE TABLE IF NOT EXISTS document_sequence (
    path TEXT PRIMARY KEY,
    sequence_number INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS primary_lease (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    owner_id TEXT NOT NULL,
    lease_timestamp_ms INTEGER NOT NULL,
    allow_tab_synchronization INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS client_metadata (
    client_id TEXT PRIMARY KEY,
    contents TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS globals (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const SCHEMA_V2: &str = "
CREATE TABLE IF NOT EXISTS named_queries (
    name TEXT PRIMARY KEY,
    contents TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS bundles (
    bundle_id TEXT PRIMARY KEY,
    contents TEXT NOT NULL
);
";

const SCHEMA_V3: &str = "
CREATE TABLE IF NOT EXISTS mutation_results (
    user_id TEXT NOT NULL,
    batch_id INTEGER NOT NULL,
    update_time_ms INTEGER NOT NULL,
    contents TEXT NOT NULL,
    PRIMARY KEY (user_id, batch_id)
);
";

/// Durable persistence backed by one SQLite file. Several clients may open
/// the same file; `BEGIN IMMEDIATE` serializes their writers.
pub struct SqlitePersistence {
    path: PathBuf,
    connection: Mutex<Connection>,
    serializer: LocalSerializer,
    shut_down: AtomicBool,
}

impl SqlitePersistence {
    pub fn open(path: &Path, database_id: DatabaseId) -> FirestoreResult<Self> {
        let mut connection = Connection::open(path)?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        migrate(&mut connection)?;
        LOGGER.debug(format!("opened sqlite persistence at {}", path.display()));
        Ok(Self {
            path: path.to_path_buf(),
            connection: Mutex::new(connection),
            serializer: LocalSerializer::new(database_id),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the database file and its journals. Missing files are ignored.
    pub fn delete_database(path: &Path) -> FirestoreResult<()> {
        let mut candidates = vec![path.to_path_buf()];
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut name = path.as_os_str().to_owned();
            name.push(suffix);
            candidates.push(PathBuf::from(name));
        }
        for candidate in candidates {
            match std::fs::remove_file(&candidate) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(internal_error(format!(
                        "failed to delete {}: {err}",
                        candidate.display()
                    )))
                }
            }
        }
        Ok(())
    }
}

fn migrate(connection: &mut Connection) -> FirestoreResult<()> {
    let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let version: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(failed_precondition(format!(
            "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    if version < 1 {
        tx.execute_batch(SCHEMA_V1)?;
    }
    if version < 2 {
        tx.execute_batch(SCHEMA_V2)?;
    }
    if version < 3 {
        tx.execute_batch(SCHEMA_V3)?;
    }
    if version != SCHEMA_VERSION {
        LOGGER.debug(format!("migrated persistence schema from {version} to {SCHEMA_VERSION}"));
        tx.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
    }
    tx.commit()?;
    Ok(())
}

impl Persistence for SqlitePersistence {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn run_transaction_dyn(&self, label: &str, body: &mut TransactionBody<'_>) -> FirestoreResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(failed_precondition(format!(
                "transaction '{label}' attempted after persistence shutdown"
            )));
        }
        let mut connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut txn = SqliteTransaction {
            tx: &tx,
            serializer: &self.serializer,
        };
        // Dropping `tx` without commit rolls back.
        body(&mut txn)?;
        tx.commit()?;
        Ok(())
    }

    fn shutdown(&self) -> FirestoreResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct SqliteTransaction<'t> {
    tx: &'t Transaction<'t>,
    serializer: &'t LocalSerializer,
}

fn path_string(key: &DocumentKey) -> String {
    key.path().canonical_string()
}

fn parse_key(path: &str) -> FirestoreResult<DocumentKey> {
    DocumentKey::from_string(path)
}

impl SqliteTransaction<'_> {
    fn documents_where(&self, sql: &str, arg: &str) -> FirestoreResult<Vec<Document>> {
        let mut stmt = self.tx.prepare(sql)?;
        let rows = stmt.query_map(params![arg], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut documents = Vec::new();
        for row in rows {
            let (path, contents) = row?;
            documents.push(self.serializer.decode_document(&parse_key(&path)?, &contents)?);
        }
        Ok(documents)
    }

    fn overlays_where(&self, sql: &str, user_id: &str, arg: &str) -> FirestoreResult<Vec<Overlay>> {
        let mut stmt = self.tx.prepare(sql)?;
        let rows = stmt.query_map(params![user_id, arg], |row| row.get::<_, String>(0))?;
        let mut overlays = Vec::new();
        for row in rows {
            overlays.push(self.serializer.decode_overlay(&row?)?);
        }
        Ok(overlays)
    }
}

impl PersistenceTransaction for SqliteTransaction<'_> {
    fn get_document(&mut self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        let contents: Option<String> = self
            .tx
            .query_row(
                "SELECT contents FROM remote_documents WHERE path = ?1",
                params![path_string(key)],
                |row| row.get(0),
            )
            .optional()?;
        contents
            .map(|contents| self.serializer.decode_document(key, &contents))
            .transpose()
    }

    fn put_document(&mut self, document: &Document, byte_size: u64) -> FirestoreResult<()> {
        let key = document.key();
        let collection_path = key.collection_path();
        self.tx.execute(
            "INSERT OR REPLACE INTO remote_documents
                (path, collection_path, collection_id, byte_size, contents)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                path_string(key),
                collection_path.canonical_string(),
                collection_path.last_segment().unwrap_or_default(),
                i64::try_from(byte_size).unwrap_or(i64::MAX),
                self.serializer.encode_document(document)?,
            ],
        )?;
        Ok(())
    }

    fn remove_document(&mut self, key: &DocumentKey) -> FirestoreResult<()> {
        self.tx.execute(
            "DELETE FROM remote_documents WHERE path = ?1",
            params![path_string(key)],
        )?;
        Ok(())
    }

    fn get_documents_in_collection(&mut self, collection: &ResourcePath) -> FirestoreResult<Vec<Document>> {
        self.documents_where(
            "SELECT path, contents FROM remote_documents WHERE collection_path = ?1 ORDER BY path",
            &collection.canonical_string(),
        )
    }

    fn get_documents_in_collection_group(&mut self, collection_id: &str) -> FirestoreResult<Vec<Document>> {
        self.documents_where(
            "SELECT path, contents FROM remote_documents WHERE collection_id = ?1 ORDER BY path",
            collection_id,
        )
    }

    fn document_cache_byte_size(&mut self) -> FirestoreResult<u64> {
        let total: i64 = self.tx.query_row(
            "SELECT COALESCE(SUM(byte_size), 0) FROM remote_documents",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    fn get_mutation_batch(&mut self, user_id: &str, batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        let contents: Option<String> = self
            .tx
            .query_row(
                "SELECT contents FROM mutations WHERE user_id = ?1 AND batch_id = ?2",
                params![user_id, batch_id],
                |row| row.get(0),
            )
            .optional()?;
        contents
            .map(|contents| self.serializer.decode_mutation_batch(&contents))
            .transpose()
    }

    fn get_all_mutation_batches(&mut self, user_id: &str) -> FirestoreResult<Vec<MutationBatch>> {
        let mut stmt = self
            .tx
            .prepare("SELECT contents FROM mutations WHERE user_id = ?1 ORDER BY batch_id")?;
        let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
        let mut batches = Vec::new();
        for row in rows {
            batches.push(self.serializer.decode_mutation_batch(&row?)?);
        }
        Ok(batches)
    }

    fn put_mutation_batch(&mut self, user_id: &str, batch: &MutationBatch) -> FirestoreResult<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO mutations (user_id, batch_id, contents) VALUES (?1, ?2, ?3)",
            params![user_id, batch.batch_id, self.serializer.encode_mutation_batch(batch)?],
        )?;
        Ok(())
    }

    fn remove_mutation_batch(&mut self, user_id: &str, batch_id: BatchId) -> FirestoreResult<()> {
        self.tx.execute(
            "DELETE FROM mutations WHERE user_id = ?1 AND batch_id = ?2",
            params![user_id, batch_id],
        )?;
        Ok(())
    }

    fn get_last_stream_token(&mut self, user_id: &str) -> FirestoreResult<Vec<u8>> {
        let token: Option<Vec<u8>> = self
            .tx
            .query_row(
                "SELECT last_stream_token FROM mutation_queues WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token.unwrap_or_default())
    }

    fn set_last_stream_token(&mut self, user_id: &str, token: &[u8]) -> FirestoreResult<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO mutation_queues (user_id, last_stream_token) VALUES (?1, ?2)",
            params![user_id, token],
        )?;
        Ok(())
    }

    fn put_mutation_outcome(&mut self, user_id: &str, outcome: &MutationBatchOutcome) -> FirestoreResult<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO mutation_results (user_id, batch_id, update_time_ms, contents)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id,
                outcome.batch_id,
                outcome.update_time_ms,
                serde_json::to_string(outcome)?
            ],
        )?;
        Ok(())
    }

    fn get_mutation_outcome(&mut self, user_id: &str, batch_id: BatchId) -> FirestoreResult<Option<MutationBatchOutcome>> {
        let contents: Option<String> = self
            .tx
            .query_row(
                "SELECT contents FROM mutation_results WHERE user_id = ?1 AND batch_id = ?2",
                params![user_id, batch_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(contents.map(|contents| serde_json::from_str(&contents)).transpose()?)
    }

    fn remove_mutation_outcome(&mut self, user_id: &str, batch_id: BatchId) -> FirestoreResult<()> {
        self.tx.execute(
            "DELETE FROM mutation_results WHERE user_id = ?1 AND batch_id = ?2",
            params![user_id, batch_id],
        )?;
        Ok(())
    }

    fn remove_mutation_outcomes_before(&mut self, update_time_ms: i64) -> FirestoreResult<()> {
        self.tx.execute(
            "DELETE FROM mutation_results WHERE update_time_ms < ?1",
            params![update_time_ms],
        )?;
        Ok(())
    }

    fn get_overlay(&mut self, user_id: &str, key: &DocumentKey) -> FirestoreResult<Option<Overlay>> {
        let contents: Option<String> = self
            .tx
            .query_row(
                "SELECT contents FROM document_overlays WHERE user_id = ?1 AND path = ?2",
                params![user_id, path_string(key)],
                |row| row.get(0),
            )
            .optional()?;
        contents
            .map(|contents| self.serializer.decode_overlay(&contents))
            .transpose()
    }

    fn put_overlay(&mut self, user_id: &str, overlay: &Overlay) -> FirestoreResult<()> {
        let key = overlay.key();
        let collection_path = key.collection_path();
        self.tx.execute(
            "INSERT OR REPLACE INTO document_overlays
                (user_id, path, collection_path, collection_id, largest_batch_id, contents)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                path_string(key),
                collection_path.canonical_string(),
                collection_path.last_segment().unwrap_or_default(),
                overlay.largest_batch_id,
                self.serializer.encode_overlay(overlay)?,
            ],
        )?;
        Ok(())
    }

    fn remove_overlay(&mut self, user_id: &str, key: &DocumentKey) -> FirestoreResult<()> {
        self.tx.execute(
            "DELETE FROM document_overlays WHERE user_id = ?1 AND path = ?2",
            params![user_id, path_string(key)],
        )?;
        Ok(())
    }

    fn get_overlays_for_collection(&mut self, user_id: &str, collection: &ResourcePath) -> FirestoreResult<Vec<Overlay>> {
        self.overlays_where(
            "SELECT contents FROM document_overlays WHERE user_id = ?1 AND collection_path = ?2",
            user_id,
            &collection.canonical_string(),
        )
    }

    fn get_overlays_for_collection_group(&mut self, user_id: &str, collection_id: &str) -> FirestoreResult<Vec<Overlay>> {
        self.overlays_where(
            "SELECT contents FROM document_overlays WHERE user_id = ?1 AND collection_id = ?2",
            user_id,
            collection_id,
        )
    }

    fn get_target(&mut self, target_id: TargetId) -> FirestoreResult<Option<TargetData>> {
        let contents: Option<String> = self
            .tx
            .query_row(
                "SELECT contents FROM targets WHERE target_id = ?1",
                params![target_id],
                |row| row.get(0),
            )
            .optional()?;
        contents
            .map(|contents| self.serializer.decode_target(&contents))
            .transpose()
    }

    fn get_target_by_canonical_id(&mut self, canonical_id: &str) -> FirestoreResult<Option<TargetData>> {
        let contents: Option<String> = self
            .tx
            .query_row(
                "SELECT contents FROM targets WHERE canonical_id = ?1 ORDER BY target_id LIMIT 1",
                params![canonical_id],
                |row| row.get(0),
            )
            .optional()?;
        contents
            .map(|contents| self.serializer.decode_target(&contents))
            .transpose()
    }

    fn put_target(&mut self, target: &TargetData) -> FirestoreResult<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO targets (target_id, canonical_id, contents) VALUES (?1, ?2, ?3)",
            params![
                target.target_id,
                target.canonical_id(),
                self.serializer.encode_target(target)?
            ],
        )?;
        Ok(())
    }

    fn remove_target(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        self.tx
            .execute("DELETE FROM targets WHERE target_id = ?1", params![target_id])?;
        Ok(())
    }

    fn get_all_targets(&mut self) -> FirestoreResult<Vec<TargetData>> {
        let mut stmt = self
            .tx
            .prepare("SELECT contents FROM targets ORDER BY target_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut targets = Vec::new();
        for row in rows {
            targets.push(self.serializer.decode_target(&row?)?);
        }
        Ok(targets)
    }

    fn add_matching_key(&mut self, target_id: TargetId, key: &DocumentKey) -> FirestoreResult<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO target_documents (target_id, path) VALUES (?1, ?2)",
            params![target_id, path_string(key)],
        )?;
        Ok(())
    }

    fn remove_matching_key(&mut self, target_id: TargetId, key: &DocumentKey) -> FirestoreResult<()> {
        self.tx.execute(
            "DELETE FROM target_documents WHERE target_id = ?1 AND path = ?2",
            params![target_id, path_string(key)],
        )?;
        Ok(())
    }

    fn get_matching_keys(&mut self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let mut stmt = self
            .tx
            .prepare("SELECT path FROM target_documents WHERE target_id = ?1")?;
        let rows = stmt.query_map(params![target_id], |row| row.get::<_, String>(0))?;
        let mut keys = BTreeSet::new();
        for row in rows {
            keys.insert(parse_key(&row?)?);
        }
        Ok(keys)
    }

    fn remove_matching_keys_for_target(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        self.tx.execute(
            "DELETE FROM target_documents WHERE target_id = ?1",
            params![target_id],
        )?;
        Ok(())
    }

    fn is_key_in_any_target(&mut self, key: &DocumentKey) -> FirestoreResult<bool> {
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM target_documents WHERE path = ?1 LIMIT 1",
                params![path_string(key)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn set_document_sequence_number(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) -> FirestoreResult<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO document_sequence (path, sequence_number) VALUES (?1, ?2)",
            params![path_string(key), sequence_number],
        )?;
        Ok(())
    }

    fn remove_document_sequence_number(&mut self, key: &DocumentKey) -> FirestoreResult<()> {
        self.tx.execute(
            "DELETE FROM document_sequence WHERE path = ?1",
            params![path_string(key)],
        )?;
        Ok(())
    }

    fn get_document_sequence_numbers(&mut self) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
        let mut stmt = self
            .tx
            .prepare("SELECT path, sequence_number FROM document_sequence ORDER BY sequence_number")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut entries = Vec::new();
        for row in rows {
            let (path, sequence_number) = row?;
            entries.push((parse_key(&path)?, sequence_number));
        }
        Ok(entries)
    }

    fn get_primary_lease(&mut self) -> FirestoreResult<Option<PrimaryLease>> {
        Ok(self
            .tx
            .query_row(
                "SELECT owner_id, lease_timestamp_ms, allow_tab_synchronization FROM primary_lease WHERE id = 0",
                [],
                |row| {
                    Ok(PrimaryLease {
                        owner_id: row.get(0)?,
                        lease_timestamp_ms: row.get(1)?,
                        allow_tab_synchronization: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    fn put_primary_lease(&mut self, lease: &PrimaryLease) -> FirestoreResult<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO primary_lease
                (id, owner_id, lease_timestamp_ms, allow_tab_synchronization)
             VALUES (0, ?1, ?2, ?3)",
            params![
                lease.owner_id,
                lease.lease_timestamp_ms,
                lease.allow_tab_synchronization
            ],
        )?;
        Ok(())
    }

    fn delete_primary_lease(&mut self) -> FirestoreResult<()> {
        self.tx.execute("DELETE FROM primary_lease", [])?;
        Ok(())
    }

    fn get_all_client_metadata(&mut self) -> FirestoreResult<Vec<ClientMetadata>> {
        let mut stmt = self
            .tx
            .prepare("SELECT contents FROM client_metadata ORDER BY client_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut clients = Vec::new();
        for row in rows {
            clients.push(serde_json::from_str(&row?)?);
        }
        Ok(clients)
    }

    fn put_client_metadata(&mut self, metadata: &ClientMetadata) -> FirestoreResult<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO client_metadata (client_id, contents) VALUES (?1, ?2)",
            params![metadata.client_id, serde_json::to_string(metadata)?],
        )?;
        Ok(())
    }

    fn remove_client_metadata(&mut self, client_id: &str) -> FirestoreResult<()> {
        self.tx.execute(
            "DELETE FROM client_metadata WHERE client_id = ?1",
            params![client_id],
        )?;
        Ok(())
    }

    fn get_named_query(&mut self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        let contents: Option<String> = self
            .tx
            .query_row(
                "SELECT contents FROM named_queries WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        contents
            .map(|contents| self.serializer.decode_named_query(&contents))
            .transpose()
    }

    fn save_named_query(&mut self, query: &NamedQuery) -> FirestoreResult<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO named_queries (name, contents) VALUES (?1, ?2)",
            params![query.name, self.serializer.encode_named_query(query)?],
        )?;
        Ok(())
    }

    fn get_bundle_metadata(&mut self, bundle_id: &str) -> FirestoreResult<Option<BundleMetadata>> {
        let contents: Option<String> = self
            .tx
            .query_row(
                "SELECT contents FROM bundles WHERE bundle_id = ?1",
                params![bundle_id],
                |row| row.get(0),
            )
            .optional()?;
        contents
            .map(|contents| self.serializer.decode_bundle(&contents))
            .transpose()
    }

    fn save_bundle_metadata(&mut self, metadata: &BundleMetadata) -> FirestoreResult<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO bundles (bundle_id, contents) VALUES (?1, ?2)",
            params![metadata.id, self.serializer.encode_bundle(metadata)?],
        )?;
        Ok(())
    }

    fn get_global(&mut self, key: &str) -> FirestoreResult<Option<String>> {
        Ok(self
            .tx
            .query_row(
                "SELECT value FROM globals WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn put_global(&mut self, key: &str, value: &str) -> FirestoreResult<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO globals (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{Mutation, Timestamp};
    use std::sync::Arc;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn open(path: &Path) -> Arc<dyn Persistence> {
        Arc::new(SqlitePersistence::open(path, DatabaseId::new("p", "(default)")).unwrap())
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let persistence = open(&path);
            persistence
                .run_transaction("write", |txn| {
                    txn.put_document(&Document::new_no_document(key("a/1"), Timestamp::new(3, 0)), 12)?;
                    txn.put_mutation_batch(
                        "u",
                        &MutationBatch::new(1, Timestamp::new(4, 0), vec![Mutation::delete(key("a/2"))]),
                    )?;
                    txn.set_last_stream_token("u", &[9, 9])
                })
                .unwrap();
        }
        let persistence = open(&path);
        let (doc, batches, token, size) = persistence
            .run_transaction("read", |txn| {
                Ok((
                    txn.get_document(&key("a/1"))?,
                    txn.get_all_mutation_batches("u")?,
                    txn.get_last_stream_token("u")?,
                    txn.document_cache_byte_size()?,
                ))
            })
            .unwrap();
        assert!(doc.unwrap().is_no_document());
        assert_eq!(batches.len(), 1);
        assert_eq!(token, vec![9, 9]);
        assert_eq!(size, 12);
    }

    #[test]
    fn failed_body_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = open(&dir.path().join("cache.db"));
        let _ = persistence.run_transaction("fail", |txn| {
            txn.put_global("k", "v")?;
            Err::<(), _>(internal_error("abort"))
        });
        let value = persistence
            .run_transaction("read", |txn| txn.get_global("k"))
            .unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn lease_row_is_a_singleton() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = open(&dir.path().join("cache.db"));
        persistence
            .run_transaction("lease", |txn| {
                txn.put_primary_lease(&PrimaryLease {
                    owner_id: "a".into(),
                    lease_timestamp_ms: 1,
                    allow_tab_synchronization: true,
                })?;
                txn.put_primary_lease(&PrimaryLease {
                    owner_id: "b".into(),
                    lease_timestamp_ms: 2,
                    allow_tab_synchronization: true,
                })
            })
            .unwrap();
        let lease = persistence
            .run_transaction("get", |txn| txn.get_primary_lease())
            .unwrap()
            .unwrap();
        assert_eq!(lease.owner_id, "b");
    }

    #[test]
    fn refuses_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("PRAGMA user_version = 99")
            .unwrap();
        let err = SqlitePersistence::open(&path, DatabaseId::new("p", "(default)"))
            .err()
            .unwrap();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }

    #[test]
    fn upgrades_version_one_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(SCHEMA_V1).unwrap();
            conn.execute_batch("PRAGMA user_version = 1").unwrap();
        }
        let persistence = open(&path);
        persistence
            .run_transaction("bundle", |txn| {
                txn.save_bundle_metadata(&BundleMetadata {
                    id: "b1".into(),
                    create_time: Timestamp::new(1, 0),
                    version: 1,
                })
            })
            .unwrap();
        let version: i64 = Connection::open(&path)
            .unwrap()
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn batch_outcomes_round_trip_and_expire() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = open(&dir.path().join("cache.db"));
        let rejected = MutationBatchOutcome::rejected(
            4,
            &crate::firestore::error::permission_denied("no access"),
            1_000,
        );
        persistence
            .run_transaction("outcomes", |txn| {
                txn.put_mutation_outcome("u", &rejected)?;
                txn.put_mutation_outcome("u", &MutationBatchOutcome::acknowledged(5, 9_000))
            })
            .unwrap();
        let read = persistence
            .run_transaction("read", |txn| txn.get_mutation_outcome("u", 4))
            .unwrap();
        assert_eq!(read, Some(rejected));
        let (old, recent) = persistence
            .run_transaction("expire", |txn| {
                txn.remove_mutation_outcomes_before(5_000)?;
                Ok((txn.get_mutation_outcome("u", 4)?, txn.get_mutation_outcome("u", 5)?))
            })
            .unwrap();
        assert!(old.is_none());
        assert!(recent.is_some());
    }

    #[test]
    fn delete_database_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        SqlitePersistence::delete_database(&path).unwrap();
        drop(open(&path));
        SqlitePersistence::delete_database(&path).unwrap();
        assert!(!path.exists());
    }
}
