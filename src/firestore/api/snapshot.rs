use crate::firestore::core::query::Query;
use crate::firestore::core::view::{ChangeType, DocumentSet, ViewSnapshot};
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{Document, DocumentKey, FieldPath, Timestamp};
use crate::firestore::value::{FirestoreValue, MapValue};

/// Where a snapshot's data came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// The data may be stale: the backend has not confirmed it yet.
    pub from_cache: bool,
    /// Local writes not yet acknowledged are reflected in the data.
    pub has_pending_writes: bool,
}

impl SnapshotMetadata {
    pub fn new(from_cache: bool, has_pending_writes: bool) -> Self {
        Self {
            from_cache,
            has_pending_writes,
        }
    }
}

/// One document as seen by a listener. Two snapshots are equal when they
/// describe the same key, contents and metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    data: Option<MapValue>,
    version: Timestamp,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub(crate) fn from_document(document: &Document, metadata: SnapshotMetadata) -> Self {
        Self {
            key: document.key().clone(),
            data: document.is_found().then(|| document.data()),
            version: document.version(),
            metadata,
        }
    }

    pub(crate) fn missing(key: DocumentKey, metadata: SnapshotMetadata) -> Self {
        Self {
            key,
            data: None,
            version: Timestamp::min(),
            metadata,
        }
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&MapValue> {
        self.data.as_ref()
    }

    /// Reads one field by dot-separated path.
    pub fn get(&self, field: &str) -> FirestoreResult<Option<&FirestoreValue>> {
        let path = FieldPath::from_dot_separated(field)?;
        Ok(self.data.as_ref().and_then(|data| data.get(&path)))
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    /// Last server update time, or the minimum timestamp for documents
    /// only known locally.
    pub fn version(&self) -> Timestamp {
        self.version
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

/// One change since the previous snapshot, with the document's position
/// before and after it.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub change_type: DocumentChangeType,
    pub document: DocumentSnapshot,
    /// Position in the previous snapshot; `None` for added documents.
    pub old_index: Option<usize>,
    /// Position in this snapshot; `None` for removed documents.
    pub new_index: Option<usize>,
}

/// The result of a query at one point in time.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    snapshot: ViewSnapshot,
    metadata: SnapshotMetadata,
}

impl QuerySnapshot {
    pub(crate) fn from_view_snapshot(snapshot: ViewSnapshot) -> Self {
        let metadata = SnapshotMetadata::new(snapshot.from_cache, snapshot.has_pending_writes());
        Self { snapshot, metadata }
    }

    pub fn query(&self) -> &Query {
        &self.snapshot.query
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.snapshot.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.documents.is_empty()
    }

    /// Documents in query order.
    pub fn documents(&self) -> Vec<DocumentSnapshot> {
        self.snapshot
            .documents
            .iter()
            .map(|document| self.document_snapshot(document))
            .collect()
    }

    /// Changes since the previous snapshot, in the order they apply. The
    /// first snapshot reports every document as added.
    pub fn doc_changes(&self) -> Vec<DocumentChange> {
        if self.snapshot.old_documents.is_empty() {
            return self
                .snapshot
                .changes
                .iter()
                .filter(|change| change.change_type == ChangeType::Added)
                .enumerate()
                .map(|(index, change)| DocumentChange {
                    change_type: DocumentChangeType::Added,
                    document: self.document_snapshot(&change.document),
                    old_index: None,
                    new_index: Some(index),
                })
                .collect();
        }

        let mut tracker = DocumentSet::new(self.snapshot.query.clone());
        for document in &self.snapshot.old_documents {
            tracker.insert(document.clone());
        }
        let mut changes = Vec::with_capacity(self.snapshot.changes.len());
        for change in &self.snapshot.changes {
            if self.snapshot.excludes_metadata_changes && change.change_type == ChangeType::Metadata {
                continue;
            }
            let key = change.document.key();
            let (change_type, old_index, new_index) = match change.change_type {
                ChangeType::Removed => {
                    let old_index = tracker.index_of(key);
                    tracker.remove(key);
                    (DocumentChangeType::Removed, old_index, None)
                }
                ChangeType::Added => {
                    tracker.insert(change.document.clone());
                    (DocumentChangeType::Added, None, tracker.index_of(key))
                }
                ChangeType::Modified | ChangeType::Metadata => {
                    let old_index = tracker.index_of(key);
                    tracker.insert(change.document.clone());
                    (DocumentChangeType::Modified, old_index, tracker.index_of(key))
                }
            };
            changes.push(DocumentChange {
                change_type,
                document: self.document_snapshot(&change.document),
                old_index,
                new_index,
            });
        }
        changes
    }

    fn document_snapshot(&self, document: &Document) -> DocumentSnapshot {
        let metadata = SnapshotMetadata::new(
            self.snapshot.from_cache,
            self.snapshot.mutated_keys.contains(document.key()),
        );
        DocumentSnapshot::from_document(document, metadata)
    }
}

/// Equal when both describe the same query, documents and metadata.
impl PartialEq for QuerySnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.metadata == other.metadata
            && self.snapshot.query == other.snapshot.query
            && self.snapshot.documents == other.snapshot.documents
            && self.snapshot.mutated_keys == other.snapshot.mutated_keys
    }
}

/// The single-document view of a snapshot raised for a document query.
pub(crate) fn document_snapshot_from_view(key: &DocumentKey, snapshot: &ViewSnapshot) -> DocumentSnapshot {
    let metadata = SnapshotMetadata::new(snapshot.from_cache, snapshot.mutated_keys.contains(key));
    match snapshot.documents.iter().find(|document| document.key() == key) {
        Some(document) => DocumentSnapshot::from_document(document, metadata),
        None => DocumentSnapshot::missing(key.clone(), metadata),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::firestore::core::query::OrderDirection;
    use crate::firestore::core::view::DocumentViewChange;

    fn doc(path: &str, rank: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("rank").unwrap(),
            FirestoreValue::from_integer(rank),
        );
        Document::new_found(DocumentKey::from_string(path).unwrap(), Timestamp::new(1, 0), data)
    }

    fn query() -> Query {
        Query::collection("rooms")
            .unwrap()
            .order_by(FieldPath::from_dot_separated("rank").unwrap(), OrderDirection::Ascending)
    }

    fn change(change_type: ChangeType, document: Document) -> DocumentViewChange {
        DocumentViewChange { change_type, document }
    }

    #[test]
    fn first_snapshot_reports_everything_added() {
        let docs = vec![doc("rooms/a", 1), doc("rooms/b", 2)];
        let view = ViewSnapshot::from_initial_documents(query(), docs, BTreeSet::new(), true);
        let snapshot = QuerySnapshot::from_view_snapshot(view);
        let changes = snapshot.doc_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].new_index, Some(1));
        assert!(changes.iter().all(|c| c.change_type == DocumentChangeType::Added));
        assert!(snapshot.metadata().from_cache);
    }

    #[test]
    fn indexes_track_moves_and_removals() {
        let a = doc("rooms/a", 1);
        let b = doc("rooms/b", 2);
        let c = doc("rooms/c", 3);
        let moved_a = doc("rooms/a", 4);
        let view = ViewSnapshot {
            query: query(),
            documents: vec![c.clone(), moved_a.clone()],
            old_documents: vec![a, b.clone(), c],
            changes: vec![change(ChangeType::Removed, b), change(ChangeType::Modified, moved_a)],
            mutated_keys: BTreeSet::from([DocumentKey::from_string("rooms/a").unwrap()]),
            from_cache: false,
            sync_state_changed: false,
            excludes_metadata_changes: true,
        };
        let snapshot = QuerySnapshot::from_view_snapshot(view);
        let changes = snapshot.doc_changes();
        assert_eq!(changes[0].change_type, DocumentChangeType::Removed);
        assert_eq!((changes[0].old_index, changes[0].new_index), (Some(1), None));
        assert_eq!(changes[1].change_type, DocumentChangeType::Modified);
        assert_eq!((changes[1].old_index, changes[1].new_index), (Some(0), Some(1)));
        assert!(changes[1].document.metadata().has_pending_writes);
        assert!(snapshot.metadata().has_pending_writes);
    }

    #[test]
    fn equality_ignores_change_lists() {
        let docs = vec![doc("rooms/a", 1)];
        let first = QuerySnapshot::from_view_snapshot(ViewSnapshot::from_initial_documents(
            query(),
            docs.clone(),
            BTreeSet::new(),
            false,
        ));
        let mut later = ViewSnapshot::from_initial_documents(query(), docs, BTreeSet::new(), false);
        later.changes.clear();
        assert_eq!(first, QuerySnapshot::from_view_snapshot(later));
    }

    #[test]
    fn missing_document_snapshot() {
        let key = DocumentKey::from_string("rooms/z").unwrap();
        let view = ViewSnapshot::from_initial_documents(Query::document(&key), Vec::new(), BTreeSet::new(), true);
        let snapshot = document_snapshot_from_view(&key, &view);
        assert!(!snapshot.exists());
        assert_eq!(snapshot.id(), "z");
        assert!(snapshot.get("anything").unwrap().is_none());
    }
}
