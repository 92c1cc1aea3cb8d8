use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, Document, DocumentKey, DocumentMap, TargetId, Timestamp};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchTargetChange,
};
use crate::firestore::LOGGER;

/// Gives the aggregator read access to what the sync layer knows about a
/// target.
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the local cache holds for `target_id` as of the last applied
    /// remote event.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data of an active listen, `None` once it was removed.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterOutcome {
    Success,
    Skipped,
    FalsePositive,
}

#[derive(Default)]
struct TargetState {
    /// Outstanding watch or unwatch requests; changes for a pending target
    /// are ignored until the server acknowledges the last request.
    pending_responses: i32,
    current: bool,
    resume_token: Vec<u8>,
    has_pending_changes: bool,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }

    fn add_document_change(&mut self, key: DocumentKey, change: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, kind) in &self.document_changes {
            let bucket = match kind {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }
}

/// Folds individual watch messages into [`RemoteEvent`]s, one per consistent
/// snapshot reported by the server.
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    metadata: Arc<dyn TargetMetadataProvider>,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: DocumentMap,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId, metadata: Arc<dyn TargetMetadataProvider>) -> Self {
        Self {
            database_id,
            metadata,
            target_states: BTreeMap::new(),
            pending_document_updates: DocumentMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    /// Records that a watch or unwatch request for `target_id` was sent.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.target_states.entry(target_id).or_default().pending_responses += 1;
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange) {
        let target_ids: Vec<TargetId> = if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        };

        for target_id in target_ids {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        // Changes from before the add are stale.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id) {
                        self.reset_target(target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentChange) {
        let key = change.document.key().clone();
        for target_id in &change.updated_target_ids {
            if change.document.is_found() {
                self.add_document_to_target(*target_id, change.document.clone());
            } else {
                self.remove_document_from_target(*target_id, &key, Some(change.document.clone()));
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &key, Some(change.document.clone()));
        }
    }

    /// A delete is a document change to "missing" at the read time.
    pub fn handle_document_delete(&mut self, delete: DocumentDelete) {
        let document = Document::new_no_document(delete.key.clone(), delete.read_time);
        for target_id in &delete.removed_target_ids {
            self.remove_document_from_target(*target_id, &delete.key, Some(document.clone()));
        }
    }

    /// The document left the targets without any statement about its
    /// existence.
    pub fn handle_document_remove(&mut self, remove: DocumentRemove) {
        for target_id in &remove.removed_target_ids {
            self.remove_document_from_target(*target_id, &remove.key, None);
        }
    }

    pub fn handle_existence_filter(&mut self, filter: ExistenceFilterChange) {
        let target_id = filter.target_id;
        let expected_count = filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id) else {
            return;
        };

        if let Some(key) = target_data.target.document_key() {
            if expected_count == 0 {
                // A document target with zero results: the document is gone.
                let document = Document::new_no_document(key.clone(), Timestamp::min());
                self.remove_document_from_target(target_id, &key, Some(document));
            } else if expected_count != 1 {
                LOGGER.warn(format!(
                    "single document existence filter for target {target_id} reported {expected_count} documents"
                ));
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id);
        if current_count == expected_count as i64 {
            return;
        }

        let outcome = self.apply_bloom_filter(&filter, current_count);
        if outcome != BloomFilterOutcome::Success {
            self.reset_target(target_id);
            let purpose = if outcome == BloomFilterOutcome::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            log::debug!(
                "existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}; re-listening with {}",
                purpose.name()
            );
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    /// Builds the event for everything aggregated since the last call and
    /// resets the pending state.
    pub fn create_remote_event(&mut self, snapshot_version: Timestamp) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current {
                if let Some(key) = target_data.target.document_key() {
                    // A document query for a missing document yields an empty
                    // result; synthesize a delete so the cache learns of it.
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key)
                    {
                        let document = Document::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(document));
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id)
                    .map(|data| data.purpose == TargetPurpose::LimboResolution)
                    .unwrap_or(true)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn apply_bloom_filter(&mut self, filter: &ExistenceFilterChange, current_count: i64) -> BloomFilterOutcome {
        let Some(params) = &filter.unchanged_names else {
            return BloomFilterOutcome::Skipped;
        };
        let bloom_filter = match BloomFilter::new(params.bitmap.clone(), params.padding, params.hash_count) {
            Ok(bloom_filter) => bloom_filter,
            Err(err) => {
                LOGGER.warn(format!(
                    "applying bloom filter failed: {err}; falling back to a full re-query"
                ));
                return BloomFilterOutcome::Skipped;
            }
        };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterOutcome::Skipped;
        }
        let removed = self.filter_removed_documents(&bloom_filter, filter.target_id);
        if filter.count as i64 == current_count - removed as i64 {
            BloomFilterOutcome::Success
        } else {
            BloomFilterOutcome::FalsePositive
        }
    }

    /// Removes every cached key the filter says the server no longer has.
    fn filter_removed_documents(&mut self, bloom_filter: &BloomFilter, target_id: TargetId) -> usize {
        let mut removed = 0;
        for key in self.metadata.remote_keys_for_target(target_id) {
            let name = self.database_id.resource_name(key.path());
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    fn current_document_count_for_target(&self, target_id: TargetId) -> i64 {
        let mut count = self.metadata.remote_keys_for_target(target_id).len() as i64;
        if let Some(state) = self.target_states.get(&target_id) {
            for change in state.document_changes.values() {
                match change {
                    ChangeType::Added => count += 1,
                    ChangeType::Removed => count -= 1,
                    ChangeType::Modified => {}
                }
            }
        }
        count
    }

    fn add_document_to_target(&mut self, target_id: TargetId, document: Document) {
        if !self.is_active_target(target_id) {
            return;
        }
        let key = document.key().clone();
        let change = if self.target_contains_document(target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id).add_document_change(key.clone(), change);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<Document>,
    ) {
        if !self.is_active_target(target_id) {
            return;
        }
        let contained = self.target_contains_document(target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Never synced, so there is nothing to remove; drop any pending add.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn reset_target(&mut self, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::default());
        for key in self.metadata.remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None);
        }
    }

    fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey) -> bool {
        self.metadata.remote_keys_for_target(target_id).contains(key)
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId) -> bool {
        let active = self.metadata.target_data_for_target(target_id).is_some();
        if !active {
            log::debug!("ignoring watch change for inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(&self, target_id: TargetId) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => self.metadata.target_data_for_target(target_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::remote::watch_change::BloomFilterParams;
    use crate::firestore::value::MapValue;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestMetadata {
        targets: Mutex<BTreeMap<TargetId, TargetData>>,
        keys: Mutex<BTreeMap<TargetId, BTreeSet<DocumentKey>>>,
    }

    impl TestMetadata {
        fn with_target(self, target_id: TargetId, query: Query, purpose: TargetPurpose) -> Self {
            self.targets
                .lock()
                .unwrap()
                .insert(target_id, TargetData::new(query, target_id, purpose, 1));
            self
        }

        fn with_keys(self, target_id: TargetId, keys: &[&str]) -> Self {
            self.keys
                .lock()
                .unwrap()
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.keys.lock().unwrap().get(&target_id).cloned().unwrap_or_default()
        }

        fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.lock().unwrap().get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn database_id() -> DatabaseId {
        DatabaseId::new("p", "(default)")
    }

    fn aggregator(metadata: TestMetadata) -> WatchChangeAggregator {
        WatchChangeAggregator::new(database_id(), Arc::new(metadata))
    }

    fn found(path: &str, version: i64) -> Document {
        Document::new_found(key(path), Timestamp::new(version, 0), MapValue::empty())
    }

    fn rooms() -> Query {
        Query::collection("rooms").unwrap()
    }

    #[test]
    fn aggregates_document_changes() {
        let mut aggregator = aggregator(TestMetadata::default().with_target(2, rooms(), TargetPurpose::Listen));
        aggregator.handle_document_change(DocumentChange {
            updated_target_ids: vec![2],
            removed_target_ids: vec![],
            document: found("rooms/a", 1),
        });
        let mut current = WatchTargetChange::new(TargetChangeState::Current, vec![2]);
        current.resume_token = vec![9];
        aggregator.handle_target_change(&current);

        let event = aggregator.create_remote_event(Timestamp::new(3, 0));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![9]);
        assert_eq!(change.added_documents, BTreeSet::from([key("rooms/a")]));
        assert_eq!(event.document_updates[&key("rooms/a")].read_time(), Timestamp::new(3, 0));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn changes_for_pending_targets_are_dropped() {
        let mut aggregator = aggregator(TestMetadata::default().with_target(2, rooms(), TargetPurpose::Listen));
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(DocumentChange {
            updated_target_ids: vec![2],
            removed_target_ids: vec![],
            document: found("rooms/stale", 1),
        });
        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Added, vec![2]));
        let event = aggregator.create_remote_event(Timestamp::new(1, 0));
        assert!(event.target_changes.get(&2).map_or(true, |change| change.added_documents.is_empty()));
    }

    #[test]
    fn matching_count_is_a_no_op() {
        let metadata = TestMetadata::default()
            .with_target(2, rooms(), TargetPurpose::Listen)
            .with_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator(metadata);
        aggregator.handle_existence_filter(ExistenceFilterChange {
            target_id: 2,
            count: 2,
            unchanged_names: None,
        });
        let event = aggregator.create_remote_event(Timestamp::new(1, 0));
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn mismatch_without_bloom_resets_target() {
        let metadata = TestMetadata::default()
            .with_target(2, rooms(), TargetPurpose::Listen)
            .with_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator(metadata);
        aggregator.handle_existence_filter(ExistenceFilterChange {
            target_id: 2,
            count: 1,
            unchanged_names: None,
        });
        let event = aggregator.create_remote_event(Timestamp::new(1, 0));
        assert_eq!(event.target_mismatches[&2], TargetPurpose::ExistenceFilterMismatch);
        assert_eq!(
            event.target_changes[&2].removed_documents,
            BTreeSet::from([key("rooms/a"), key("rooms/b")])
        );
    }

    #[test]
    fn bloom_filter_removes_exactly_the_missing_keys() {
        let names = ["rooms/a", "rooms/b", "rooms/c", "rooms/d"];
        let metadata = TestMetadata::default()
            .with_target(2, rooms(), TargetPurpose::Listen)
            .with_keys(2, &names);
        let survivors: Vec<String> = ["rooms/a", "rooms/c"]
            .iter()
            .map(|path| database_id().resource_name(key(path).path()))
            .collect();
        let bitmap = BloomFilter::test_bitmap(&survivors, 64, 4);
        let mut aggregator = aggregator(metadata);
        aggregator.handle_existence_filter(ExistenceFilterChange {
            target_id: 2,
            count: 2,
            unchanged_names: Some(BloomFilterParams {
                bitmap,
                padding: 0,
                hash_count: 4,
            }),
        });
        let event = aggregator.create_remote_event(Timestamp::new(1, 0));
        assert!(event.target_mismatches.is_empty());
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents, BTreeSet::from([key("rooms/b"), key("rooms/d")]));
        assert!(change.added_documents.is_empty());
    }

    #[test]
    fn malformed_bloom_filter_falls_back_to_full_requery() {
        let metadata = TestMetadata::default()
            .with_target(2, rooms(), TargetPurpose::Listen)
            .with_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator(metadata);
        aggregator.handle_existence_filter(ExistenceFilterChange {
            target_id: 2,
            count: 1,
            unchanged_names: Some(BloomFilterParams {
                bitmap: vec![],
                padding: 0,
                hash_count: 3,
            }),
        });
        let event = aggregator.create_remote_event(Timestamp::new(1, 0));
        assert_eq!(event.target_mismatches[&2], TargetPurpose::ExistenceFilterMismatch);
    }

    #[test]
    fn limbo_only_updates_are_reported_as_resolved() {
        let limbo = Query::document(&key("rooms/x"));
        let metadata = TestMetadata::default().with_target(1, limbo, TargetPurpose::LimboResolution);
        let mut aggregator = aggregator(metadata);
        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Current, vec![1]));
        let event = aggregator.create_remote_event(Timestamp::new(5, 0));
        let document = &event.document_updates[&key("rooms/x")];
        assert!(document.is_no_document());
        assert_eq!(document.version(), Timestamp::new(5, 0));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/x")));
    }
}
