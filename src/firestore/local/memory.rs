use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::persistence::{
    BundleMetadata, ClientMetadata, MutationBatchOutcome, NamedQuery, Persistence,
    PersistenceTransaction, PrimaryLease, TransactionBody,
};
use crate::firestore::local::target_cache::TargetData;
use crate::firestore::model::{
    BatchId, Document, DocumentKey, ListenSequenceNumber, MutationBatch, Overlay, ResourcePath,
    TargetId,
};

#[derive(Clone, Default)]
struct MemoryState {
    documents: BTreeMap<DocumentKey, (Document, u64)>,
    mutations: BTreeMap<(String, BatchId), MutationBatch>,
    stream_tokens: BTreeMap<String, Vec<u8>>,
    mutation_outcomes: BTreeMap<(String, BatchId), MutationBatchOutcome>,
    overlays: BTreeMap<(String, DocumentKey), Overlay>,
    targets: BTreeMap<TargetId, TargetData>,
    target_documents: BTreeSet<(TargetId, DocumentKey)>,
    document_sequence: BTreeMap<DocumentKey, ListenSequenceNumber>,
    lease: Option<PrimaryLease>,
    clients: BTreeMap<String, ClientMetadata>,
    named_queries: BTreeMap<String, NamedQuery>,
    bundles: BTreeMap<String, BundleMetadata>,
    globals: BTreeMap<String, String>,
}

/// Non-durable persistence. Each transaction stages a copy of the state and
/// swaps it in on commit. Clones share the same state, which lets several
/// clients in one process act like tabs sharing a store.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    state: Arc<Mutex<MemoryState>>,
    shut_down: Arc<AtomicBool>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryPersistence {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn run_transaction_dyn(
        &self,
        label: &str,
        body: &mut TransactionBody<'_>,
    ) -> FirestoreResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(failed_precondition(format!(
                "transaction '{label}' attempted after persistence shutdown"
            )));
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut txn = MemoryTransaction {
            state: state.clone(),
        };
        body(&mut txn)?;
        *state = txn.state;
        Ok(())
    }

    fn shutdown(&self) -> FirestoreResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryTransaction {
    state: MemoryState,
}

impl PersistenceTransaction for MemoryTransaction {
    fn get_document(&mut self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        Ok(self.state.documents.get(key).map(|(doc, _)| doc.clone()))
    }

    fn put_document(&mut self, document: &Document, byte_size: u64) -> FirestoreResult<()> {
        self.state
            .documents
            .insert(document.key().clone(), (document.clone(), byte_size));
        Ok(())
    }

    fn remove_document(&mut self, key: &DocumentKey) -> FirestoreResult<()> {
        self.state.documents.remove(key);
        Ok(())
    }

    fn get_documents_in_collection(
        &mut self,
        collection: &ResourcePath,
    ) -> FirestoreResult<Vec<Document>> {
        Ok(self
            .state
            .documents
            .iter()
            .filter(|(key, _)| key.collection_path() == *collection)
            .map(|(_, (doc, _))| doc.clone())
            .collect())
    }

    fn get_documents_in_collection_group(
        &mut self,
        collection_id: &str,
    ) -> FirestoreResult<Vec<Document>> {
        Ok(self
            .state
            .documents
            .iter()
            .filter(|(key, _)| key.has_collection_id(collection_id))
            .map(|(_, (doc, _))| doc.clone())
            .collect())
    }

    fn document_cache_byte_size(&mut self) -> FirestoreResult<u64> {
        Ok(self.state.documents.values().map(|(_, size)| *size).sum())
    }

    fn get_mutation_batch(
        &mut self,
        user_id: &str,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self
            .state
            .mutations
            .get(&(user_id.to_string(), batch_id))
            .cloned())
    }

    fn get_all_mutation_batches(&mut self, user_id: &str) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self
            .state
            .mutations
            .range((user_id.to_string(), BatchId::MIN)..=(user_id.to_string(), BatchId::MAX))
            .map(|(_, batch)| batch.clone())
            .collect())
    }

    fn put_mutation_batch(&mut self, user_id: &str, batch: &MutationBatch) -> FirestoreResult<()> {
        self.state
            .mutations
            .insert((user_id.to_string(), batch.batch_id), batch.clone());
        Ok(())
    }

    fn remove_mutation_batch(&mut self, user_id: &str, batch_id: BatchId) -> FirestoreResult<()> {
        self.state.mutations.remove(&(user_id.to_string(), batch_id));
        Ok(())
    }

    fn get_last_stream_token(&mut self, user_id: &str) -> FirestoreResult<Vec<u8>> {
        Ok(self
            .state
            .stream_tokens
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    fn set_last_stream_token(&mut self, user_id: &str, token: &[u8]) -> FirestoreResult<()> {
        self.state
            .stream_tokens
            .insert(user_id.to_string(), token.to_vec());
        Ok(())
    }

    fn put_mutation_outcome(&mut self, user_id: &str, outcome: &MutationBatchOutcome) -> FirestoreResult<()> {
        self.state
            .mutation_outcomes
            .insert((user_id.to_string(), outcome.batch_id), outcome.clone());
        Ok(())
    }

    fn get_mutation_outcome(
        &mut self,
        user_id: &str,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatchOutcome>> {
        Ok(self
            .state
            .mutation_outcomes
            .get(&(user_id.to_string(), batch_id))
            .cloned())
    }

    fn remove_mutation_outcome(&mut self, user_id: &str, batch_id: BatchId) -> FirestoreResult<()> {
        self.state.mutation_outcomes.remove(&(user_id.to_string(), batch_id));
        Ok(())
    }

    fn remove_mutation_outcomes_before(&mut self, update_time_ms: i64) -> FirestoreResult<()> {
        self.state
            .mutation_outcomes
            .retain(|_, outcome| outcome.update_time_ms >= update_time_ms);
        Ok(())
    }

    fn get_overlay(&mut self, user_id: &str, key: &DocumentKey) -> FirestoreResult<Option<Overlay>> {
        Ok(self
            .state
            .overlays
            .get(&(user_id.to_string(), key.clone()))
            .cloned())
    }

    fn put_overlay(&mut self, user_id: &str, overlay: &Overlay) -> FirestoreResult<()> {
        self.state
            .overlays
            .insert((user_id.to_string(), overlay.key().clone()), overlay.clone());
        Ok(())
    }

    fn remove_overlay(&mut self, user_id: &str, key: &DocumentKey) -> FirestoreResult<()> {
        self.state.overlays.remove(&(user_id.to_string(), key.clone()));
        Ok(())
    }

    fn get_overlays_for_collection(
        &mut self,
        user_id: &str,
        collection: &ResourcePath,
    ) -> FirestoreResult<Vec<Overlay>> {
        Ok(self
            .state
            .overlays
            .iter()
            .filter(|((user, key), _)| user == user_id && key.collection_path() == *collection)
            .map(|(_, overlay)| overlay.clone())
            .collect())
    }

    fn get_overlays_for_collection_group(
        &mut self,
        user_id: &str,
        collection_id: &str,
    ) -> FirestoreResult<Vec<Overlay>> {
        Ok(self
            .state
            .overlays
            .iter()
            .filter(|((user, key), _)| user == user_id && key.has_collection_id(collection_id))
            .map(|(_, overlay)| overlay.clone())
            .collect())
    }

    fn get_target(&mut self, target_id: TargetId) -> FirestoreResult<Option<TargetData>> {
        Ok(self.state.targets.get(&target_id).cloned())
    }

    fn get_target_by_canonical_id(
        &mut self,
        canonical_id: &str,
    ) -> FirestoreResult<Option<TargetData>> {
        Ok(self
            .state
            .targets
            .values()
            .find(|target| target.canonical_id() == canonical_id)
            .cloned())
    }

    fn put_target(&mut self, target: &TargetData) -> FirestoreResult<()> {
        self.state.targets.insert(target.target_id, target.clone());
        Ok(())
    }

    fn remove_target(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        self.state.targets.remove(&target_id);
        Ok(())
    }

    fn get_all_targets(&mut self) -> FirestoreResult<Vec<TargetData>> {
        Ok(self.state.targets.values().cloned().collect())
    }

    fn add_matching_key(&mut self, target_id: TargetId, key: &DocumentKey) -> FirestoreResult<()> {
        self.state.target_documents.insert((target_id, key.clone()));
        Ok(())
    }

    fn remove_matching_key(&mut self, target_id: TargetId, key: &DocumentKey) -> FirestoreResult<()> {
        self.state.target_documents.remove(&(target_id, key.clone()));
        Ok(())
    }

    fn get_matching_keys(&mut self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        Ok(self
            .state
            .target_documents
            .iter()
            .filter(|(id, _)| *id == target_id)
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn remove_matching_keys_for_target(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        self.state
            .target_documents
            .retain(|(id, _)| *id != target_id);
        Ok(())
    }

    fn is_key_in_any_target(&mut self, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(self
            .state
            .target_documents
            .iter()
            .any(|(_, candidate)| candidate == key))
    }

    fn set_document_sequence_number(
        &mut self,
        key: &DocumentKey,
        sequence_number: ListenSequenceNumber,
    ) -> FirestoreResult<()> {
        self.state
            .document_sequence
            .insert(key.clone(), sequence_number);
        Ok(())
    }

    fn remove_document_sequence_number(&mut self, key: &DocumentKey) -> FirestoreResult<()> {
        self.state.document_sequence.remove(key);
        Ok(())
    }

    fn get_document_sequence_numbers(
        &mut self,
    ) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
        Ok(self
            .state
            .document_sequence
            .iter()
            .map(|(key, seq)| (key.clone(), *seq))
            .collect())
    }

    fn get_primary_lease(&mut self) -> FirestoreResult<Option<PrimaryLease>> {
        Ok(self.state.lease.clone())
    }

    fn put_primary_lease(&mut self, lease: &PrimaryLease) -> FirestoreResult<()> {
        self.state.lease = Some(lease.clone());
        Ok(())
    }

    fn delete_primary_lease(&mut self) -> FirestoreResult<()> {
        self.state.lease = None;
        Ok(())
    }

    fn get_all_client_metadata(&mut self) -> FirestoreResult<Vec<ClientMetadata>> {
        Ok(self.state.clients.values().cloned().collect())
    }

    fn put_client_metadata(&mut self, metadata: &ClientMetadata) -> FirestoreResult<()> {
        self.state
            .clients
            .insert(metadata.client_id.clone(), metadata.clone());
        Ok(())
    }

    fn remove_client_metadata(&mut self, client_id: &str) -> FirestoreResult<()> {
        self.state.clients.remove(client_id);
        Ok(())
    }

    fn get_named_query(&mut self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        Ok(self.state.named_queries.get(name).cloned())
    }

    fn save_named_query(&mut self, query: &NamedQuery) -> FirestoreResult<()> {
        self.state
            .named_queries
            .insert(query.name.clone(), query.clone());
        Ok(())
    }

    fn get_bundle_metadata(&mut self, bundle_id: &str) -> FirestoreResult<Option<BundleMetadata>> {
        Ok(self.state.bundles.get(bundle_id).cloned())
    }

    fn save_bundle_metadata(&mut self, metadata: &BundleMetadata) -> FirestoreResult<()> {
        self.state
            .bundles
            .insert(metadata.id.clone(), metadata.clone());
        Ok(())
    }

    fn get_global(&mut self, key: &str) -> FirestoreResult<Option<String>> {
        Ok(self.state.globals.get(key).cloned())
    }

    fn put_global(&mut self, key: &str, value: &str) -> FirestoreResult<()> {
        self.state
            .globals
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
