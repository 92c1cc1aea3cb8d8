use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    Document, DocumentKey, DocumentMap, FieldMask, Mutation, Overlay, Timestamp,
};

/// Applies an overlay to a remote document, producing the local view.
pub fn apply_overlay(document: &mut Document, overlay: &Overlay) {
    // Overlays never carry transforms, so the write time is irrelevant.
    overlay
        .mutation
        .apply_to_local_view(document, None, Timestamp::min());
}

/// Read access to documents as the local user sees them: the remote cache
/// with every pending write folded on top.
pub struct LocalDocumentsView<'a> {
    txn: &'a mut dyn PersistenceTransaction,
    user_id: &'a str,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(txn: &'a mut dyn PersistenceTransaction, user_id: &'a str) -> Self {
        Self { txn, user_id }
    }

    pub fn get_overlay(&mut self, key: &DocumentKey) -> FirestoreResult<Option<Overlay>> {
        self.txn.get_overlay(self.user_id, key)
    }

    pub fn get_overlays_for_collection(
        &mut self,
        collection: &crate::firestore::model::ResourcePath,
    ) -> FirestoreResult<Vec<Overlay>> {
        self.txn.get_overlays_for_collection(self.user_id, collection)
    }

    /// The local view of `key`; an invalid document when nothing is known.
    pub fn get_document(&mut self, key: &DocumentKey) -> FirestoreResult<Document> {
        let mut document = self
            .txn
            .get_document(key)?
            .unwrap_or_else(|| Document::new_invalid(key.clone()));
        if let Some(overlay) = self.get_overlay(key)? {
            apply_overlay(&mut document, &overlay);
        }
        Ok(document)
    }

    pub fn get_documents<'k, I>(&mut self, keys: I) -> FirestoreResult<DocumentMap>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut documents = DocumentMap::new();
        for key in keys {
            documents.insert(key.clone(), self.get_document(key)?);
        }
        Ok(documents)
    }

    /// Every locally known document matching `query`, unsorted and without
    /// the limit applied.
    pub fn get_documents_matching_query(&mut self, query: &Query) -> FirestoreResult<DocumentMap> {
        if let Some(key) = query.document_key() {
            let document = self.get_document(&key)?;
            let mut documents = DocumentMap::new();
            if query.matches(&document) {
                documents.insert(key, document);
            }
            return Ok(documents);
        }

        let (remote, overlays) = match query.collection_group_id() {
            Some(collection_id) => (
                self.txn.get_documents_in_collection_group(collection_id)?,
                self.txn
                    .get_overlays_for_collection_group(self.user_id, collection_id)?,
            ),
            None => (
                self.txn.get_documents_in_collection(query.path())?,
                self.txn
                    .get_overlays_for_collection(self.user_id, query.path())?,
            ),
        };

        let mut documents: DocumentMap = remote
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();
        for overlay in overlays {
            let document = documents
                .entry(overlay.key().clone())
                .or_insert_with(|| Document::new_invalid(overlay.key().clone()));
            apply_overlay(document, &overlay);
        }
        documents.retain(|_, document| query.matches(document));
        Ok(documents)
    }

    /// Recomputes the overlay of every key in `keys` by folding the queued
    /// batches that touch it, in batch order, over the remote document.
    /// Returns the resulting local views.
    pub fn recalculate_and_save_overlays(
        &mut self,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        let mut documents = DocumentMap::new();
        let mut without_remote_version = BTreeSet::new();
        for key in keys {
            let document = self
                .txn
                .get_document(key)?
                .unwrap_or_else(|| Document::new_invalid(key.clone()));
            if document.version().is_min() {
                without_remote_version.insert(key.clone());
            }
            documents.insert(key.clone(), document);
        }

        let batches = MutationQueue::new(&mut *self.txn, self.user_id).batches_affecting_keys(keys)?;
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut latest: BTreeMap<DocumentKey, (i32, Mutation)> = BTreeMap::new();
        for batch in &batches {
            let overlays =
                batch.apply_to_local_document_set(&mut documents, &mut masks, &without_remote_version);
            for (key, mutation) in overlays {
                if keys.contains(&key) {
                    latest.insert(key, (batch.batch_id, mutation));
                }
            }
        }

        for key in keys {
            match latest.remove(key) {
                Some((largest_batch_id, mutation)) => self.txn.put_overlay(
                    self.user_id,
                    &Overlay {
                        largest_batch_id,
                        mutation,
                    },
                )?,
                None => self.txn.remove_overlay(self.user_id, key)?,
            }
        }

        documents.retain(|key, _| keys.contains(key));
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory::MemoryPersistence;
    use crate::firestore::local::persistence::Persistence;
    use crate::firestore::model::{FieldPath, FieldTransform, Precondition, TransformOperation};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::sync::Arc;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut map = MapValue::empty();
        for (path, value) in entries {
            map.set(&field(path), value.clone());
        }
        map
    }

    fn increment(path: &str, by: i64) -> Mutation {
        Mutation::Patch {
            key: key(path),
            value: MapValue::empty(),
            mask: FieldMask::default(),
            precondition: Precondition::None,
            field_transforms: vec![FieldTransform::new(
                field("n"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(by)),
            )],
        }
    }

    #[test]
    fn overlay_is_left_fold_of_batches() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let document = persistence
            .run_transaction("fold", |txn| {
                txn.put_document(
                    &Document::new_found(key("c/a"), Timestamp::new(1, 0), map(&[("n", FirestoreValue::from_integer(1))])),
                    10,
                )?;
                {
                    let mut queue = MutationQueue::new(&mut *txn, "u");
                    queue.add_mutation_batch(Timestamp::new(2, 0), vec![increment("c/a", 2)])?;
                    queue.add_mutation_batch(
                        Timestamp::new(3, 0),
                        vec![Mutation::patch(
                            key("c/a"),
                            map(&[("tag", FirestoreValue::from_string("x"))]),
                            FieldMask::new([field("tag")]),
                        )],
                    )?;
                    queue.add_mutation_batch(Timestamp::new(4, 0), vec![increment("c/a", 4)])?;
                }
                let mut view = LocalDocumentsView::new(txn, "u");
                view.recalculate_and_save_overlays(&BTreeSet::from([key("c/a")]))?;
                let overlay = view.get_overlay(&key("c/a"))?;
                assert_eq!(overlay.map(|overlay| overlay.largest_batch_id), Some(3));
                view.get_document(&key("c/a"))
            })
            .unwrap();
        assert!(document.has_local_mutations());
        assert_eq!(document.field(&field("n")), Some(&FirestoreValue::from_integer(7)));
        assert_eq!(document.field(&field("tag")), Some(&FirestoreValue::from_string("x")));
    }

    #[test]
    fn removing_the_only_batch_drops_the_overlay() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let (overlay, document) = persistence
            .run_transaction("rollback", |txn| {
                let batch = MutationQueue::new(&mut *txn, "u").add_mutation_batch(
                    Timestamp::new(1, 0),
                    vec![Mutation::set(key("c/a"), map(&[("x", FirestoreValue::from_integer(1))]))],
                )?;
                let keys = BTreeSet::from([key("c/a")]);
                LocalDocumentsView::new(&mut *txn, "u").recalculate_and_save_overlays(&keys)?;
                MutationQueue::new(&mut *txn, "u").remove_batch(batch.batch_id)?;
                let mut view = LocalDocumentsView::new(txn, "u");
                view.recalculate_and_save_overlays(&keys)?;
                Ok((view.get_overlay(&key("c/a"))?, view.get_document(&key("c/a"))?))
            })
            .unwrap();
        assert!(overlay.is_none());
        assert!(!document.is_valid());
    }

    #[test]
    fn query_includes_documents_only_known_locally() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let results = persistence
            .run_transaction("query", |txn| {
                txn.put_document(
                    &Document::new_found(key("c/remote"), Timestamp::new(1, 0), map(&[("x", FirestoreValue::from_integer(1))])),
                    1,
                )?;
                MutationQueue::new(&mut *txn, "u").add_mutation_batch(
                    Timestamp::new(1, 0),
                    vec![
                        Mutation::set(key("c/local"), map(&[("x", FirestoreValue::from_integer(2))])),
                        Mutation::set(key("other/z"), MapValue::empty()),
                    ],
                )?;
                let keys = BTreeSet::from([key("c/local"), key("other/z")]);
                let mut view = LocalDocumentsView::new(txn, "u");
                view.recalculate_and_save_overlays(&keys)?;
                view.get_documents_matching_query(&Query::collection("c")?)
            })
            .unwrap();
        assert_eq!(
            results.keys().cloned().collect::<Vec<_>>(),
            vec![key("c/local"), key("c/remote")]
        );
        assert!(results[&key("c/local")].has_local_mutations());
    }
}
