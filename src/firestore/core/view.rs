use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::model::{Document, DocumentKey, DocumentMap};
use crate::firestore::remote::online_state::OnlineState;
use crate::firestore::remote::remote_event::TargetChange;

/// Documents ordered by a query's comparator, indexed by key.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    query: Query,
    by_key: BTreeMap<DocumentKey, Document>,
    ordered: Vec<Document>,
}

impl DocumentSet {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            by_key: BTreeMap::new(),
            ordered: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.ordered.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.ordered.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.ordered.iter()
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.ordered
            .binary_search_by(|candidate| self.compare(candidate, document))
            .ok()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.by_key.keys()
    }

    pub fn insert(&mut self, document: Document) {
        self.remove(document.key());
        let position = self
            .ordered
            .binary_search_by(|candidate| self.compare(candidate, &document))
            .unwrap_or_else(|position| position);
        self.by_key.insert(document.key().clone(), document.clone());
        self.ordered.insert(position, document);
    }

    pub fn remove(&mut self, key: &DocumentKey) {
        if let Some(existing) = self.by_key.remove(key) {
            if let Ok(position) = self.ordered.binary_search_by(|candidate| self.compare(candidate, &existing)) {
                self.ordered.remove(position);
            } else {
                self.ordered.retain(|doc| doc.key() != key);
            }
        }
    }

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        self.query
            .compare_documents(left, right)
            .then_with(|| left.key().cmp(right.key()))
    }

    pub fn to_vec(&self) -> Vec<Document> {
        self.ordered.clone()
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.ordered == other.ordered
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeType {
    Removed,
    Added,
    Modified,
    /// Only the pending-write state changed.
    Metadata,
}

impl ChangeType {
    fn sort_rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

/// Collapses successive changes to one key into a single change.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };
        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Added, Metadata) => Some(DocumentViewChange {
                change_type: Added,
                document: old.document.clone(),
            }),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Metadata, Modified) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (Metadata, Removed) | (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Modified, Metadata) | (Modified, Modified) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            _ => Some(change),
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// A view's state after a batch of document changes, before it is applied.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// A limit query lost a document and must be recomputed from the cache.
    pub needs_refill: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    Local,
    Synced,
}

/// The immutable result of a view update, before listener filtering.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: Vec<Document>,
    pub old_documents: Vec<Document>,
    pub changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
}

impl ViewSnapshot {
    /// A first snapshot reporting every document as added.
    pub fn from_initial_documents(
        query: Query,
        documents: Vec<Document>,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
    ) -> Self {
        let changes = documents
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        Self {
            query,
            documents,
            old_documents: Vec::new(),
            changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: true,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Computes query results from local documents and tracks which of them the
/// backend has confirmed.
pub struct View {
    query: Query,
    current: bool,
    documents: DocumentSet,
    mutated_keys: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    synced_documents: BTreeSet<DocumentKey>,
    sync_state: Option<SyncState>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        Self {
            documents: DocumentSet::new(query.clone()),
            query,
            current: false,
            mutated_keys: BTreeSet::new(),
            limbo_documents: BTreeSet::new(),
            synced_documents,
            sync_state: None,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Keys the backend has confirmed for this view's target.
    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    /// Diffs `changed` against the current result set without mutating the
    /// view. `previous` continues an earlier computation, used when a limit
    /// query is refilled from the full local result.
    pub fn compute_doc_changes(
        &self,
        changed: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut new_set, mut change_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.document_set, previous.change_set, previous.mutated_keys),
            None => (self.documents.clone(), DocumentChangeSet::default(), self.mutated_keys.clone()),
        };
        let old_set = &self.documents;
        let limit = self.query.limit_value().map(|limit| limit as usize);
        let limit_type = self.query.limit_type();

        // Documents at the limit edge; anything sorting past them may only
        // enter the view when it has room.
        let last_doc_in_limit = match (limit, limit_type) {
            (Some(limit), LimitType::First) if old_set.len() == limit => old_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match (limit, limit_type) {
            (Some(limit), LimitType::Last) if old_set.len() == limit => old_set.first().cloned(),
            _ => None,
        };
        let mut needs_refill = false;

        for (key, document) in changed {
            let old_doc = old_set.get(key);
            let new_doc = self.query.matches(document).then_some(document);

            let old_doc_had_pending = old_doc.is_some() && self.mutated_keys.contains(key);
            let new_doc_has_pending = new_doc
                .map(|doc| doc.has_local_mutations() || (self.mutated_keys.contains(key) && doc.has_committed_mutations()))
                .unwrap_or(false);

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new.clone(),
                            });
                            change_applied = true;
                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|edge| self.query.compare_documents(new, edge) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|edge| self.query.compare_documents(new, edge) == Ordering::Less);
                            if past_last || before_first {
                                // The document moved out of the window; another
                                // one may now belong in it.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending != new_doc_has_pending {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new.clone(),
                    });
                    change_applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new) => {
                        new_set.insert(new.clone());
                        if new.has_local_mutations() {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        new_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_set.len() > limit {
                let evicted = match limit_type {
                    LimitType::First => new_set.last().cloned(),
                    LimitType::Last => new_set.first().cloned(),
                };
                let Some(evicted) = evicted else { break };
                new_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set: new_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// Commits `doc_changes` and, when the view is current, recomputes limbo
    /// documents. Returns a snapshot unless nothing observable changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.documents, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.into_changes();
        let query = &self.query;
        changes.sort_by(|left, right| {
            left.change_type
                .sort_rank()
                .cmp(&right.change_type.sort_rank())
                .then_with(|| query.compare_documents(&left.document, &right.document))
                .then_with(|| left.document.key().cmp(right.document.key()))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                documents: self.documents.to_vec(),
                old_documents: old_documents.to_vec(),
                changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
            }),
            limbo_changes,
        }
    }

    /// Going offline drops the view out of the synced state so snapshots
    /// report `from_cache`.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.documents.clone(),
                change_set: DocumentChangeSet::default(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            self.apply_changes(unchanged, false, None)
        } else {
            ViewChange::default()
        }
    }

    /// Replaces the synced keys with what another client persisted and
    /// recomputes the result from `documents`.
    pub fn synchronize_with_persisted_state(
        &mut self,
        documents: &DocumentMap,
        remote_keys: BTreeSet<DocumentKey>,
        current: bool,
        update_limbo_documents: bool,
    ) -> ViewChange {
        self.synced_documents = remote_keys;
        let mut changed = documents.clone();
        for key in self.documents.keys() {
            changed
                .entry(key.clone())
                .or_insert_with(|| Document::new_invalid(key.clone()));
        }
        let doc_changes = self.compute_doc_changes(&changed, None);
        let target_change = TargetChange {
            current,
            ..TargetChange::default()
        };
        self.apply_changes(doc_changes, update_limbo_documents, Some(&target_change))
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            debug_assert!(self.synced_documents.contains(key), "modified document {key} not synced");
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .documents
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }

    fn should_be_in_limbo(&self, document: &Document) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

/// A document acknowledged by the backend but not yet seen on the watch
/// stream keeps its local value until watch catches up.
fn should_wait_for_synced_document(old: &Document, new: &Document) -> bool {
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}
