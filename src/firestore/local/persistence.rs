use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::Query;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::memory::MemoryPersistence;
use crate::firestore::local::sqlite::SqlitePersistence;
use crate::firestore::local::target_cache::TargetData;
use crate::firestore::model::{
    BatchId, DatabaseId, Document, DocumentKey, ListenSequenceNumber, MutationBatch, Overlay,
    ResourcePath, TargetId, Timestamp,
};
use crate::firestore::LOGGER;

/// The single row naming the client allowed to own the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryLease {
    pub owner_id: String,
    pub lease_timestamp_ms: i64,
    pub allow_tab_synchronization: bool,
}

/// Per-client row used to reference-count targets across clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub in_foreground: bool,
    pub active_target_ids: BTreeSet<TargetId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationBatchState {
    Acknowledged,
    Rejected,
}

/// How the primary finished a batch it did not write itself. The client
/// that queued the batch reads the row to resolve its commit and then
/// deletes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatchOutcome {
    pub batch_id: BatchId,
    pub state: MutationBatchState,
    /// `firestore/<code>` form of the rejection.
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub update_time_ms: i64,
}

impl MutationBatchOutcome {
    pub fn acknowledged(batch_id: BatchId, now_ms: i64) -> Self {
        Self {
            batch_id,
            state: MutationBatchState::Acknowledged,
            error_code: None,
            message: None,
            update_time_ms: now_ms,
        }
    }

    pub fn rejected(batch_id: BatchId, error: &FirestoreError, now_ms: i64) -> Self {
        Self {
            batch_id,
            state: MutationBatchState::Rejected,
            error_code: Some(error.code_str().to_string()),
            message: Some(error.message().to_string()),
            update_time_ms: now_ms,
        }
    }

    /// The commit result this outcome stands for.
    pub fn into_result(self) -> FirestoreResult<()> {
        match self.state {
            MutationBatchState::Acknowledged => Ok(()),
            MutationBatchState::Rejected => {
                let code = self
                    .error_code
                    .as_deref()
                    .and_then(FirestoreErrorCode::from_code_str)
                    .unwrap_or(FirestoreErrorCode::Unknown);
                Err(FirestoreError::new(
                    code,
                    self.message.unwrap_or_else(|| "write rejected by the backend".to_string()),
                ))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleMetadata {
    pub id: String,
    pub create_time: Timestamp,
    pub version: i32,
}

/// Data access for one logical transaction. Each group of methods maps onto
/// one logical store.
pub trait PersistenceTransaction {
    // Remote documents.
    fn get_document(&mut self, key: &DocumentKey) -> FirestoreResult<Option<Document>>;
    fn put_document(&mut self, document: &Document, byte_size: u64) -> FirestoreResult<()>;
    fn remove_document(&mut self, key: &DocumentKey) -> FirestoreResult<()>;
    /// Documents that are immediate children of `collection`.
    fn get_documents_in_collection(&mut self, collection: &ResourcePath)
        -> FirestoreResult<Vec<Document>>;
    fn get_documents_in_collection_group(&mut self, collection_id: &str)
        -> FirestoreResult<Vec<Document>>;
    fn document_cache_byte_size(&mut self) -> FirestoreResult<u64>;

    // Mutation queue, partitioned by user.
    fn get_mutation_batch(&mut self, user_id: &str, batch_id: BatchId)
        -> FirestoreResult<Option<MutationBatch>>;
    /// Every batch queued for `user_id`, in batch id order.
    fn get_all_mutation_batches(&mut self, user_id: &str) -> FirestoreResult<Vec<MutationBatch>>;
    fn put_mutation_batch(&mut self, user_id: &str, batch: &MutationBatch) -> FirestoreResult<()>;
    fn remove_mutation_batch(&mut self, user_id: &str, batch_id: BatchId) -> FirestoreResult<()>;
    fn get_last_stream_token(&mut self, user_id: &str) -> FirestoreResult<Vec<u8>>;
    fn put_mutation_outcome(&mut self, user_id: &str, outcome: &MutationBatchOutcome) -> FirestoreResult<()>;
    fn get_mutation_outcome(&mut self, user_id: &str, batch_id: BatchId)
        -> FirestoreResult<Option<MutationBatchOutcome>>;
    fn remove_mutation_outcome(&mut self, user_id: &str, batch_id: BatchId) -> FirestoreResult<()>;
    /// Drops outcomes, for every user, last updated before `update_time_ms`.
    fn remove_mutation_outcomes_before(&mut self, update_time_ms: i64) -> FirestoreResult<()>;
    fn set_last_stream_token(&mut self, user_id: &str, token: &[u8]) -> FirestoreResult<()>;

    // Document overlays, partitioned by user.
    fn get_overlay(&mut self, user_id: &str, key: &DocumentKey) -> FirestoreResult<Option<Overlay>>;
    fn put_overlay(&mut self, user_id: &str, overlay: &Overlay) -> FirestoreResult<()>;
    fn remove_overlay(&mut self, user_id: &str, key: &DocumentKey) -> FirestoreResult<()>;
    fn get_overlays_for_collection(&mut self, user_id: &str, collection: &ResourcePath)
        -> FirestoreResult<Vec<Overlay>>;
    fn get_overlays_for_collection_group(&mut self, user_id: &str, collection_id: &str)
        -> FirestoreResult<Vec<Overlay>>;

    // Targets and the target-document index.
    fn get_target(&mut self, target_id: TargetId) -> FirestoreResult<Option<TargetData>>;
    fn get_target_by_canonical_id(&mut self, canonical_id: &str)
        -> FirestoreResult<Option<TargetData>>;
    fn put_target(&mut self, target: &TargetData) -> FirestoreResult<()>;
    fn remove_target(&mut self, target_id: TargetId) -> FirestoreResult<()>;
    fn get_all_targets(&mut self) -> FirestoreResult<Vec<TargetData>>;
    fn add_matching_key(&mut self, target_id: TargetId, key: &DocumentKey) -> FirestoreResult<()>;
    fn remove_matching_key(&mut self, target_id: TargetId, key: &DocumentKey) -> FirestoreResult<()>;
    fn get_matching_keys(&mut self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>>;
    fn remove_matching_keys_for_target(&mut self, target_id: TargetId) -> FirestoreResult<()>;
    fn is_key_in_any_target(&mut self, key: &DocumentKey) -> FirestoreResult<bool>;

    // Sequence numbers for documents, consulted by garbage collection.
    fn set_document_sequence_number(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber)
        -> FirestoreResult<()>;
    fn remove_document_sequence_number(&mut self, key: &DocumentKey) -> FirestoreResult<()>;
    fn get_document_sequence_numbers(&mut self)
        -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>>;

    // Primary lease and client metadata.
    fn get_primary_lease(&mut self) -> FirestoreResult<Option<PrimaryLease>>;
    fn put_primary_lease(&mut self, lease: &PrimaryLease) -> FirestoreResult<()>;
    fn delete_primary_lease(&mut self) -> FirestoreResult<()>;
    fn get_all_client_metadata(&mut self) -> FirestoreResult<Vec<ClientMetadata>>;
    fn put_client_metadata(&mut self, metadata: &ClientMetadata) -> FirestoreResult<()>;
    fn remove_client_metadata(&mut self, client_id: &str) -> FirestoreResult<()>;

    // Named queries and bundles.
    fn get_named_query(&mut self, name: &str) -> FirestoreResult<Option<NamedQuery>>;
    fn save_named_query(&mut self, query: &NamedQuery) -> FirestoreResult<()>;
    fn get_bundle_metadata(&mut self, bundle_id: &str) -> FirestoreResult<Option<BundleMetadata>>;
    fn save_bundle_metadata(&mut self, metadata: &BundleMetadata) -> FirestoreResult<()>;

    // Globals.
    fn get_global(&mut self, key: &str) -> FirestoreResult<Option<String>>;
    fn put_global(&mut self, key: &str, value: &str) -> FirestoreResult<()>;
}

pub type TransactionBody<'a> = dyn FnMut(&mut dyn PersistenceTransaction) -> FirestoreResult<()> + 'a;

/// A durable (or in-memory) store with all-or-nothing transactions.
pub trait Persistence: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether data survives the process.
    fn is_durable(&self) -> bool;

    /// Runs `body` in one transaction. Changes are committed only when the
    /// body returns `Ok`.
    fn run_transaction_dyn(&self, label: &str, body: &mut TransactionBody<'_>) -> FirestoreResult<()>;

    fn shutdown(&self) -> FirestoreResult<()>;
}

impl dyn Persistence {
    pub fn run_transaction<T, F>(&self, label: &str, body: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut dyn PersistenceTransaction) -> FirestoreResult<T>,
    {
        let mut body = Some(body);
        let mut output = None;
        self.run_transaction_dyn(label, &mut |txn| {
            let body = body
                .take()
                .ok_or_else(|| internal_error("transaction body invoked twice"))?;
            output = Some(body(txn)?);
            Ok(())
        })?;
        output.ok_or_else(|| internal_error(format!("transaction '{label}' produced no result")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistenceMode {
    Memory,
    Sqlite { path: PathBuf },
}

/// Invoked once when durable persistence cannot be opened and the client
/// falls back to memory.
pub type PersistenceFallbackHook = Arc<dyn Fn(&crate::firestore::error::FirestoreError) + Send + Sync>;

/// Opens the configured persistence, falling back to memory on failure.
pub fn open_persistence(
    mode: &PersistenceMode,
    database_id: &DatabaseId,
    fallback_hook: Option<&PersistenceFallbackHook>,
) -> Arc<dyn Persistence> {
    match mode {
        PersistenceMode::Memory => Arc::new(MemoryPersistence::new()),
        PersistenceMode::Sqlite { path } => match SqlitePersistence::open(path, database_id.clone()) {
            Ok(persistence) => Arc::new(persistence),
            Err(err) => {
                LOGGER.warn(format!(
                    "Error opening durable persistence at {}: {err}. Falling back to memory persistence.",
                    path.display()
                ));
                if let Some(hook) = fallback_hook {
                    hook(&err);
                }
                Arc::new(MemoryPersistence::new())
            }
        },
    }
}

/// Deletes durable data for `mode`. Memory persistence has nothing to clear.
pub fn clear_persistence(mode: &PersistenceMode) -> FirestoreResult<()> {
    match mode {
        PersistenceMode::Memory => Ok(()),
        PersistenceMode::Sqlite { path } => SqlitePersistence::delete_database(path),
    }
}
