use std::collections::BTreeMap;

use crate::firestore::api::operations::{self, SetOptions};
use crate::firestore::error::{invalid_argument, resource_exhausted, FirestoreResult};
use crate::firestore::model::Mutation;
use crate::firestore::value::FirestoreValue;

use super::database::Firestore;
use super::reference::DocumentReference;

const MAX_BATCH_WRITES: usize = 500;

/// Collects writes and applies them as one atomic batch.
///
/// Nothing is sent until [`commit`](Self::commit); the batch is consumed by
/// it. Local listeners see the writes as soon as the commit is queued.
#[derive(Clone, Debug)]
pub struct WriteBatch {
    firestore: Firestore,
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    pub(crate) fn new(firestore: Firestore) -> Self {
        Self {
            firestore,
            mutations: Vec::new(),
        }
    }

    /// Replaces the document, or merges into it when `options` asks for a
    /// merge.
    pub fn set(
        &mut self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
        options: Option<SetOptions>,
    ) -> FirestoreResult<&mut Self> {
        self.ensure_can_add(reference)?;
        let options = options.unwrap_or_default();
        let mutation = operations::set_mutation(reference.key().clone(), data, &options)?;
        self.mutations.push(mutation);
        Ok(self)
    }

    /// Shorthand for `set` with [`SetOptions::merge_all`].
    pub fn set_merge(
        &mut self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<&mut Self> {
        self.set(reference, data, Some(SetOptions::merge_all()))
    }

    /// Updates fields of an existing document. Keys are dot-separated field
    /// paths; the batch fails if the document does not exist.
    pub fn update(
        &mut self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<&mut Self> {
        self.ensure_can_add(reference)?;
        let mutation = operations::update_mutation(reference.key().clone(), data)?;
        self.mutations.push(mutation);
        Ok(self)
    }

    pub fn delete(&mut self, reference: &DocumentReference) -> FirestoreResult<&mut Self> {
        self.ensure_can_add(reference)?;
        self.mutations.push(Mutation::delete(reference.key().clone()));
        Ok(self)
    }

    /// Fails the whole batch unless the document exists when applied.
    pub fn verify_exists(&mut self, reference: &DocumentReference) -> FirestoreResult<&mut Self> {
        self.ensure_can_add(reference)?;
        self.mutations.push(operations::verify_mutation(reference.key().clone()));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Commits every queued write. An empty batch resolves immediately.
    pub async fn commit(self) -> FirestoreResult<()> {
        if self.mutations.is_empty() {
            return Ok(());
        }
        self.firestore.commit(self.mutations).await
    }

    fn ensure_can_add(&self, reference: &DocumentReference) -> FirestoreResult<()> {
        if self.mutations.len() >= MAX_BATCH_WRITES {
            return Err(resource_exhausted(format!(
                "a write batch holds at most {MAX_BATCH_WRITES} writes"
            )));
        }
        if reference.firestore().database_id() != self.firestore.database_id() {
            return Err(invalid_argument(
                "the document reference belongs to a different database",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::api::database::tests::offline_firestore;
    use crate::firestore::api::ListenOptions;
    use crate::firestore::api::CommitResolution;
    use crate::firestore::FirestoreSettings;

    fn field(value: i64) -> BTreeMap<String, FirestoreValue> {
        BTreeMap::from([("count".to_string(), FirestoreValue::from_integer(value))])
    }

    #[tokio::test]
    async fn empty_batch_commits_immediately() {
        let firestore = offline_firestore("empty-batch").await;
        firestore.batch().commit().await.unwrap();
        firestore.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn batch_is_applied_locally_as_one_unit() {
        let settings = FirestoreSettings::default().with_commit_resolution(CommitResolution::OnLocalWrite);
        let firestore = crate::firestore::api::database::tests::offline_firestore_with("local-batch", settings).await;
        let rooms = firestore.collection("rooms").unwrap();
        let a = rooms.doc(Some("a")).unwrap();
        let b = rooms.doc(Some("b")).unwrap();

        let mut batch = firestore.batch();
        batch.set(&a, field(1), None).unwrap();
        batch.set(&b, field(2), None).unwrap();
        batch.delete(&b).unwrap();
        assert_eq!(batch.len(), 3);
        batch.commit().await.unwrap();

        let a_snapshot = firestore.get_doc_from_cache(&a).await.unwrap();
        assert_eq!(a_snapshot.get("count").unwrap(), Some(&FirestoreValue::from_integer(1)));
        assert!(a_snapshot.metadata().has_pending_writes);
        assert!(!firestore.get_doc_from_cache(&b).await.unwrap().exists());

        let query = rooms.query();
        let (sender, receiver) = async_channel::unbounded();
        let registration = firestore
            .on_snapshot(&query, ListenOptions::default(), move |result| {
                let _ = sender.try_send(result);
            })
            .await
            .unwrap();
        let snapshot = receiver.recv().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.metadata().has_pending_writes);
        registration.remove();
        firestore.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn batch_caps_the_number_of_writes() {
        let firestore = offline_firestore("capped-batch").await;
        let rooms = firestore.collection("rooms").unwrap();
        let doc = rooms.doc(Some("a")).unwrap();
        let mut batch = firestore.batch();
        for _ in 0..MAX_BATCH_WRITES {
            batch.delete(&doc).unwrap();
        }
        let err = batch.delete(&doc).unwrap_err();
        assert_eq!(err.code_str(), "firestore/resource-exhausted");
        firestore.terminate().await.unwrap();
    }
}
