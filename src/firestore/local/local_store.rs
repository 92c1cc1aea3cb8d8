use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use crate::auth::User;
use crate::firestore::core::query::Query;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::lease::{self, LeaseCoordinator};
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::lru::{LruGarbageCollector, LruParams, LruResults};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::overlay::LocalDocumentsView;
use crate::firestore::local::persistence::{
    BundleMetadata, MutationBatchOutcome, NamedQuery, Persistence, PersistenceTransaction,
};
use crate::firestore::local::target_cache::{TargetCache, TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DatabaseId, Document, DocumentKey, DocumentMap, Mutation, MutationBatch,
    MutationBatchResult, TargetId, Timestamp,
};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::LOGGER;
use crate::platform::runtime;

/// Result of queuing a local write.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

/// Documents matching a query plus the keys the server last confirmed for
/// its target.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
    pub affected_documents: DocumentMap,
}

/// What a view reported after applying a change: documents it started or
/// stopped holding.
#[derive(Clone, Debug, Default)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseRefresh {
    pub is_primary: bool,
    pub change_counter: u64,
}

struct LocalStoreState {
    user: User,
    targets: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: HashMap<String, TargetId>,
    view_references: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
}

/// Facade over persistence. Every public operation runs in exactly one
/// persistence transaction.
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    serializer: LocalSerializer,
    garbage_collector: LruGarbageCollector,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        database_id: DatabaseId,
        lru_params: LruParams,
        user: User,
    ) -> Self {
        Self {
            persistence,
            serializer: LocalSerializer::new(database_id),
            garbage_collector: LruGarbageCollector::new(lru_params),
            state: Mutex::new(LocalStoreState {
                user,
                targets: BTreeMap::new(),
                target_ids_by_canonical_id: HashMap::new(),
                view_references: BTreeMap::new(),
            }),
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn user(&self) -> User {
        self.lock().user.clone()
    }

    /// Switches the mutation queue to `user` and returns the documents whose
    /// local view changed as a result.
    pub fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_user = self.user();
        let old_key = old_user.storage_key().to_string();
        let new_key = user.storage_key().to_string();
        let result = self.persistence.run_transaction("Handle user change", |txn| {
            let old_batches = MutationQueue::new(&mut *txn, &old_key).all_batches()?;
            let new_batches = MutationQueue::new(&mut *txn, &new_key).all_batches()?;
            let keys: BTreeSet<DocumentKey> = old_batches
                .iter()
                .chain(new_batches.iter())
                .flat_map(MutationBatch::keys)
                .collect();
            let affected_documents = LocalDocumentsView::new(&mut *txn, &new_key).get_documents(&keys)?;
            Ok(UserChangeResult {
                removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                affected_documents,
            })
        })?;
        self.lock().user = user;
        Ok(result)
    }

    /// Durably queues `mutations` as one batch together with the overlays
    /// it produces.
    pub fn write_locally(
        &self,
        mutations: Vec<Mutation>,
        local_write_time: Timestamp,
    ) -> FirestoreResult<LocalWriteResult> {
        let user_key = self.user_key();
        self.persistence.run_transaction("Locally write mutations", |txn| {
            let batch = MutationQueue::new(&mut *txn, &user_key).add_mutation_batch(local_write_time, mutations)?;
            let changes = LocalDocumentsView::new(&mut *txn, &user_key).recalculate_and_save_overlays(&batch.keys())?;
            lease::bump_change_counter(txn)?;
            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes,
            })
        })
    }

    /// Applies the server's acknowledgement to the remote cache and drops the
    /// batch. Returns the new local views of the affected documents.
    ///
    /// With `record_outcome` the acknowledgement is also stored for another
    /// client sharing the store that queued the batch.
    pub fn acknowledge_batch(
        &self,
        result: &MutationBatchResult,
        record_outcome: bool,
    ) -> FirestoreResult<DocumentMap> {
        let user_key = self.user_key();
        self.persistence.run_transaction("Acknowledge batch", |txn| {
            let batch = &result.batch;
            let keys = batch.keys();
            for key in &keys {
                let mut document = txn
                    .get_document(key)?
                    .unwrap_or_else(|| Document::new_invalid(key.clone()));
                let ack_version = result
                    .doc_versions
                    .get(key)
                    .copied()
                    .ok_or_else(|| internal_error(format!("ack for {key} carries no version")))?;
                if document.version() < ack_version {
                    batch.apply_to_remote_document(&mut document, result);
                    if document.is_valid() {
                        document.set_read_time(result.commit_version);
                        self.put_remote_document(txn, &document)?;
                    }
                }
            }
            let mut queue = MutationQueue::new(&mut *txn, &user_key);
            queue.remove_batch(batch.batch_id)?;
            queue.set_last_stream_token(&result.stream_token)?;
            if record_outcome {
                let outcome = MutationBatchOutcome::acknowledged(batch.batch_id, runtime::now_millis());
                txn.put_mutation_outcome(&user_key, &outcome)?;
            }
            let changes = LocalDocumentsView::new(&mut *txn, &user_key).recalculate_and_save_overlays(&keys)?;
            lease::bump_change_counter(txn)?;
            Ok(changes)
        })
    }

    /// Removes a batch the server rejected, rolling back its local effect.
    /// With `record_outcome` the rejection is stored for the client that
    /// queued the batch.
    pub fn reject_batch(
        &self,
        batch_id: BatchId,
        error: &FirestoreError,
        record_outcome: bool,
    ) -> FirestoreResult<DocumentMap> {
        let user_key = self.user_key();
        self.persistence.run_transaction("Reject batch", |txn| {
            let batch = MutationQueue::new(&mut *txn, &user_key).remove_batch(batch_id)?;
            if record_outcome {
                let outcome = MutationBatchOutcome::rejected(batch_id, error, runtime::now_millis());
                txn.put_mutation_outcome(&user_key, &outcome)?;
            }
            let changes =
                LocalDocumentsView::new(&mut *txn, &user_key).recalculate_and_save_overlays(&batch.keys())?;
            lease::bump_change_counter(txn)?;
            Ok(changes)
        })
    }

    /// Reads and deletes the outcome another client recorded for one of
    /// this client's batches.
    pub fn take_mutation_outcome(&self, batch_id: BatchId) -> FirestoreResult<Option<MutationBatchOutcome>> {
        let user_key = self.user_key();
        self.persistence.run_transaction("Take mutation outcome", |txn| {
            let outcome = txn.get_mutation_outcome(&user_key, batch_id)?;
            if outcome.is_some() {
                txn.remove_mutation_outcome(&user_key, batch_id)?;
            }
            Ok(outcome)
        })
    }

    pub fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let user_key = self.user_key();
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", |txn| {
                MutationQueue::new(txn, &user_key).highest_unacknowledged_batch_id()
            })
    }

    pub fn next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        let user_key = self.user_key();
        self.persistence.run_transaction("Get next mutation batch", |txn| {
            MutationQueue::new(txn, &user_key).next_mutation_batch_after(after_batch_id)
        })
    }

    pub fn has_pending_writes(&self) -> FirestoreResult<bool> {
        let user_key = self.user_key();
        self.persistence
            .run_transaction("Has pending writes", |txn| {
                MutationQueue::new(txn, &user_key).is_empty()
            })
            .map(|empty| !empty)
    }

    pub fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let user_key = self.user_key();
        self.persistence.run_transaction("Get last stream token", |txn| {
            MutationQueue::new(txn, &user_key).last_stream_token()
        })
    }

    pub fn set_last_stream_token(&self, token: &[u8]) -> FirestoreResult<()> {
        let user_key = self.user_key();
        self.persistence.run_transaction("Set last stream token", |txn| {
            MutationQueue::new(txn, &user_key).set_last_stream_token(token)
        })
    }

    pub fn last_remote_snapshot_version(&self) -> FirestoreResult<Timestamp> {
        self.persistence
            .run_transaction("Get last remote snapshot version", |txn| {
                TargetCache::new(txn).last_remote_snapshot_version()
            })
    }

    /// Folds a remote event into the cache and returns the local views of
    /// every document it touched.
    pub fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let user_key = self.user_key();
        let active: BTreeMap<TargetId, TargetData> = self.lock().targets.clone();
        let (changes, updated_targets) = self.persistence.run_transaction("Apply remote event", |txn| {
            let sequence_number = TargetCache::new(&mut *txn).next_sequence_number()?;
            let mut updated_targets = Vec::new();
            for (target_id, change) in &event.target_changes {
                let Some(old) = active.get(target_id) else {
                    continue;
                };
                let mut cache = TargetCache::new(&mut *txn);
                cache.remove_matching_keys(*target_id, &change.removed_documents, sequence_number)?;
                cache.add_matching_keys(*target_id, &change.added_documents, sequence_number)?;
                cache.add_matching_keys(*target_id, &change.modified_documents, sequence_number)?;

                let mut updated = old.clone().with_sequence_number(sequence_number);
                if event.target_mismatches.contains_key(target_id) {
                    updated = updated
                        .with_resume_token(Vec::new(), Timestamp::min())
                        .with_last_limbo_free_snapshot_version(Timestamp::min());
                } else if !change.resume_token.is_empty() {
                    updated = updated.with_resume_token(change.resume_token.clone(), event.snapshot_version);
                }
                cache.save(&updated)?;
                updated_targets.push(updated);
            }

            let mut changed_keys = BTreeSet::new();
            for (key, document) in &event.document_updates {
                let existing = txn.get_document(key)?;
                changed_keys.insert(key.clone());
                if document.is_no_document() && document.version().is_min() {
                    // Synthesized deletes from failed limbo resolution.
                    txn.remove_document(key)?;
                } else if should_update(existing.as_ref(), document) {
                    let mut document = document.clone();
                    document.set_read_time(event.snapshot_version);
                    self.put_remote_document(txn, &document)?;
                } else {
                    log::debug!(
                        "ignoring outdated watch update for {key}: current version {:?}, watch version {:?}",
                        existing.map(|doc| doc.version()),
                        document.version()
                    );
                }
                txn.set_document_sequence_number(key, sequence_number)?;
            }

            if !event.snapshot_version.is_min() {
                let mut cache = TargetCache::new(&mut *txn);
                let last = cache.last_remote_snapshot_version()?;
                if event.snapshot_version < last {
                    return Err(internal_error(format!(
                        "watch snapshot {} is older than the last remote snapshot {}",
                        event.snapshot_version, last
                    )));
                }
                cache.set_last_remote_snapshot_version(event.snapshot_version)?;
            }

            let changes = LocalDocumentsView::new(&mut *txn, &user_key).get_documents(&changed_keys)?;
            lease::bump_change_counter(txn)?;
            Ok((changes, updated_targets))
        })?;

        let mut state = self.lock();
        for target in updated_targets {
            if state.targets.contains_key(&target.target_id) {
                state.targets.insert(target.target_id, target);
            }
        }
        Ok(changes)
    }

    /// Records which documents views hold so garbage collection leaves them
    /// alone, and advances the limbo-free version of synced views.
    pub fn notify_local_view_changes(&self, changes: &[LocalViewChanges]) {
        let mut state = self.lock();
        for change in changes {
            let references = state.view_references.entry(change.target_id).or_default();
            for key in &change.removed_keys {
                references.remove(key);
            }
            references.extend(change.added_keys.iter().cloned());
            if !change.from_cache {
                if let Some(target) = state.targets.get_mut(&change.target_id) {
                    target.last_limbo_free_snapshot_version = target.snapshot_version;
                }
            }
        }
    }

    /// Returns the target for `query`, reusing the persisted one (and its
    /// resume token) when the query was listened to before.
    pub fn allocate_target(&self, query: &Query) -> FirestoreResult<TargetData> {
        let canonical_id = query.canonical_id();
        {
            let state = self.lock();
            if let Some(target) = state
                .target_ids_by_canonical_id
                .get(&canonical_id)
                .and_then(|id| state.targets.get(id))
            {
                return Ok(target.clone());
            }
        }
        let target = self.persistence.run_transaction("Allocate target", |txn| {
            let mut cache = TargetCache::new(txn);
            let sequence_number = cache.next_sequence_number()?;
            let target = match cache.get(query)? {
                Some(existing) => existing.with_sequence_number(sequence_number),
                None => {
                    let target_id = cache.allocate_target_id()?;
                    TargetData::new(query.clone(), target_id, TargetPurpose::Listen, sequence_number)
                }
            };
            cache.save(&target)?;
            Ok(target)
        })?;
        let mut state = self.lock();
        state.target_ids_by_canonical_id.insert(canonical_id, target.target_id);
        state.targets.insert(target.target_id, target.clone());
        Ok(target)
    }

    /// Registers a target allocated elsewhere, such as a limbo resolution
    /// target owned by the sync engine.
    pub fn register_target(&self, target: TargetData) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Register target", |txn| TargetCache::new(txn).save(&target))?;
        let mut state = self.lock();
        state
            .target_ids_by_canonical_id
            .entry(target.canonical_id())
            .or_insert(target.target_id);
        state.targets.insert(target.target_id, target);
        Ok(())
    }

    pub fn get_target_data(&self, query: &Query) -> FirestoreResult<Option<TargetData>> {
        let canonical_id = query.canonical_id();
        {
            let state = self.lock();
            if let Some(id) = state.target_ids_by_canonical_id.get(&canonical_id) {
                return Ok(state.targets.get(id).cloned());
            }
        }
        self.persistence
            .run_transaction("Get target data", |txn| TargetCache::new(txn).get(query))
    }

    /// Target data of an active target in this client.
    pub fn active_target_data(&self, target_id: TargetId) -> Option<TargetData> {
        self.lock().targets.get(&target_id).cloned()
    }

    pub fn active_target_ids(&self) -> BTreeSet<TargetId> {
        self.lock().targets.keys().copied().collect()
    }

    /// Stops tracking `target_id`. Persisted target data (and its resume
    /// token) is kept unless `keep_persisted_target_data` is false.
    pub fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let removed = {
            let mut state = self.lock();
            let removed = state.targets.remove(&target_id);
            if let Some(target) = &removed {
                let canonical_id = target.canonical_id();
                if state.target_ids_by_canonical_id.get(&canonical_id) == Some(&target_id) {
                    state.target_ids_by_canonical_id.remove(&canonical_id);
                }
            }
            state.view_references.remove(&target_id);
            removed
        };
        let Some(target) = removed else {
            LOGGER.debug(format!("release of unknown target {target_id} ignored"));
            return Ok(());
        };
        self.persistence.run_transaction("Release target", |txn| {
            let mut cache = TargetCache::new(txn);
            if keep_persisted_target_data {
                let sequence_number = cache.next_sequence_number()?;
                cache.save(&target.clone().with_sequence_number(sequence_number))
            } else {
                cache.remove(target_id)
            }
        })
    }

    /// Runs `query` against the local cache.
    pub fn execute_query(&self, query: &Query) -> FirestoreResult<QueryResult> {
        let user_key = self.user_key();
        let target_id = {
            let state = self.lock();
            state.target_ids_by_canonical_id.get(&query.canonical_id()).copied()
        };
        self.persistence.run_transaction("Execute query", |txn| {
            let target_id = match target_id {
                Some(id) => Some(id),
                None => TargetCache::new(&mut *txn).get(query)?.map(|target| target.target_id),
            };
            let remote_keys = match target_id {
                Some(id) => txn.get_matching_keys(id)?,
                None => BTreeSet::new(),
            };
            let documents = LocalDocumentsView::new(&mut *txn, &user_key).get_documents_matching_query(query)?;
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    pub fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.persistence
            .run_transaction("Get remote document keys", |txn| txn.get_matching_keys(target_id))
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        let user_key = self.user_key();
        self.persistence.run_transaction("Read document", |txn| {
            LocalDocumentsView::new(txn, &user_key).get_document(key)
        })
    }

    /// Evicts unreferenced data once the cache exceeds its size threshold.
    pub fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let user_key = self.user_key();
        let (mut active_targets, mut pinned) = {
            let state = self.lock();
            let pinned: BTreeSet<DocumentKey> = state.view_references.values().flatten().cloned().collect();
            (state.targets.keys().copied().collect::<BTreeSet<_>>(), pinned)
        };
        self.persistence.run_transaction("Collect garbage", |txn| {
            for batch in MutationQueue::new(&mut *txn, &user_key).all_batches()? {
                pinned.extend(batch.keys());
            }
            for client in txn.get_all_client_metadata()? {
                active_targets.extend(client.active_target_ids);
            }
            self.garbage_collector.collect(txn, &active_targets, &pinned)
        })
    }

    /// Refreshes this client's metadata row and tries to take or extend the
    /// primary lease, all in one transaction.
    pub fn refresh_lease(
        &self,
        coordinator: &LeaseCoordinator,
        now_ms: i64,
        in_foreground: bool,
    ) -> FirestoreResult<LeaseRefresh> {
        let active_targets = self.active_target_ids();
        self.persistence.run_transaction("Refresh lease", |txn| {
            coordinator.refresh_client_metadata(txn, now_ms, in_foreground, &active_targets)?;
            let is_primary = coordinator.try_acquire_or_extend(txn, now_ms)?;
            Ok(LeaseRefresh {
                is_primary,
                change_counter: lease::read_change_counter(txn)?,
            })
        })
    }

    /// Whether a client other than this one still listens to `target_id`.
    pub fn is_target_active_elsewhere(
        &self,
        coordinator: &LeaseCoordinator,
        target_id: TargetId,
        now_ms: i64,
    ) -> FirestoreResult<bool> {
        self.persistence.run_transaction("Check target use", |txn| {
            coordinator.is_target_active_elsewhere(txn, target_id, now_ms)
        })
    }

    /// Persisted target data for every target another live client listens
    /// to.
    pub fn targets_of_other_clients(
        &self,
        coordinator: &LeaseCoordinator,
        now_ms: i64,
    ) -> FirestoreResult<Vec<TargetData>> {
        self.persistence.run_transaction("Read targets of other clients", |txn| {
            let ids = coordinator.active_targets_of_other_clients(txn, now_ms)?;
            let mut cache = TargetCache::new(txn);
            let mut targets = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(target) = cache.get_by_id(id)? {
                    targets.push(target);
                }
            }
            Ok(targets)
        })
    }

    pub fn set_in_foreground(
        &self,
        coordinator: &LeaseCoordinator,
        in_foreground: bool,
        now_ms: i64,
    ) -> FirestoreResult<()> {
        self.persistence.run_transaction("Set foreground state", |txn| {
            coordinator.set_in_foreground(txn, in_foreground, now_ms)
        })
    }

    pub fn release_lease(&self, coordinator: &LeaseCoordinator) -> FirestoreResult<()> {
        self.persistence.run_transaction("Release lease", |txn| {
            coordinator.release_lease(txn)?;
            coordinator.remove_client(txn)
        })
    }

    pub fn save_named_query(&self, query: &NamedQuery) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Save named query", |txn| txn.save_named_query(query))
    }

    pub fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        self.persistence
            .run_transaction("Get named query", |txn| txn.get_named_query(name))
    }

    /// Whether the bundle `metadata` describes is already loaded at this
    /// version or newer.
    pub fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        self.persistence.run_transaction("Has newer bundle", |txn| {
            Ok(txn
                .get_bundle_metadata(&metadata.id)?
                .map(|existing| existing.create_time >= metadata.create_time)
                .unwrap_or(false))
        })
    }

    pub fn save_bundle_metadata(&self, metadata: &BundleMetadata) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Save bundle", |txn| txn.save_bundle_metadata(metadata))
    }

    pub fn change_counter(&self) -> FirestoreResult<u64> {
        self.persistence
            .run_transaction("Read change counter", |txn| lease::read_change_counter(txn))
    }

    pub fn shutdown(&self) -> FirestoreResult<()> {
        self.persistence.shutdown()
    }

    fn put_remote_document(&self, txn: &mut dyn PersistenceTransaction, document: &Document) -> FirestoreResult<()> {
        let byte_size = self.serializer.encode_document(document)?.len() as u64;
        txn.put_document(document, byte_size)
    }

    fn user_key(&self) -> String {
        self.lock().user.storage_key().to_string()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Watch updates replace the cached document when newer, or when equal in
/// version but the cached copy still reflects an unacknowledged write.
fn should_update(existing: Option<&Document>, incoming: &Document) -> bool {
    match existing {
        None => true,
        Some(existing) if !existing.is_valid() => true,
        Some(existing) => {
            incoming.version() > existing.version()
                || (incoming.version() == existing.version() && existing.has_pending_writes())
        }
    }
}
