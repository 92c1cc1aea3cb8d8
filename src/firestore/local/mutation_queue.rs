use std::collections::BTreeSet;

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN};

const NEXT_BATCH_ID_PREFIX: &str = "next_batch_id/";

/// The ordered log of pending local writes for one user.
///
/// Batch ids increase monotonically per user and survive restarts, even
/// after the queue has drained.
pub struct MutationQueue<'a> {
    txn: &'a mut dyn PersistenceTransaction,
    user_id: &'a str,
}

impl<'a> MutationQueue<'a> {
    pub fn new(txn: &'a mut dyn PersistenceTransaction, user_id: &'a str) -> Self {
        Self { txn, user_id }
    }

    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let batch_id = self.next_batch_id()?;
        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        self.txn.put_mutation_batch(self.user_id, &batch)?;
        self.txn.put_global(
            &format!("{NEXT_BATCH_ID_PREFIX}{}", self.user_id),
            &(batch_id + 1).to_string(),
        )?;
        Ok(batch)
    }

    pub fn lookup_batch(&mut self, batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        self.txn.get_mutation_batch(self.user_id, batch_id)
    }

    /// The first batch with an id greater than `batch_id`.
    pub fn next_mutation_batch_after(&mut self, batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self
            .all_batches()?
            .into_iter()
            .find(|batch| batch.batch_id > batch_id))
    }

    pub fn all_batches(&mut self) -> FirestoreResult<Vec<MutationBatch>> {
        self.txn.get_all_mutation_batches(self.user_id)
    }

    pub fn batches_affecting_keys(&mut self, keys: &BTreeSet<DocumentKey>) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self
            .all_batches()?
            .into_iter()
            .filter(|batch| batch.mutations.iter().any(|mutation| keys.contains(mutation.key())))
            .collect())
    }

    pub fn remove_batch(&mut self, batch_id: BatchId) -> FirestoreResult<MutationBatch> {
        let batch = self
            .lookup_batch(batch_id)?
            .ok_or_else(|| internal_error(format!("mutation batch {batch_id} is not queued")))?;
        self.txn.remove_mutation_batch(self.user_id, batch_id)?;
        Ok(batch)
    }

    pub fn highest_unacknowledged_batch_id(&mut self) -> FirestoreResult<BatchId> {
        Ok(self
            .all_batches()?
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN))
    }

    pub fn is_empty(&mut self) -> FirestoreResult<bool> {
        Ok(self.all_batches()?.is_empty())
    }

    pub fn last_stream_token(&mut self) -> FirestoreResult<Vec<u8>> {
        self.txn.get_last_stream_token(self.user_id)
    }

    pub fn set_last_stream_token(&mut self, token: &[u8]) -> FirestoreResult<()> {
        self.txn.set_last_stream_token(self.user_id, token)
    }

    fn next_batch_id(&mut self) -> FirestoreResult<BatchId> {
        let stored = self
            .txn
            .get_global(&format!("{NEXT_BATCH_ID_PREFIX}{}", self.user_id))?
            .map(|value| {
                value
                    .parse::<BatchId>()
                    .map_err(|err| internal_error(format!("corrupt batch id counter: {err}")))
            })
            .transpose()?
            .unwrap_or(1);
        let after_queued = self.highest_unacknowledged_batch_id()?.saturating_add(1);
        Ok(stored.max(after_queued).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory::MemoryPersistence;
    use crate::firestore::local::persistence::Persistence;
    use std::sync::Arc;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn persistence() -> Arc<dyn Persistence> {
        Arc::new(MemoryPersistence::new())
    }

    #[test]
    fn batch_ids_stay_monotonic_after_drain() {
        let persistence = persistence();
        let ids = persistence
            .run_transaction("add", |txn| {
                let mut queue = MutationQueue::new(txn, "u");
                let first = queue.add_mutation_batch(Timestamp::new(1, 0), vec![Mutation::delete(key("a/1"))])?;
                queue.remove_batch(first.batch_id)?;
                let second = queue.add_mutation_batch(Timestamp::new(2, 0), vec![Mutation::delete(key("a/1"))])?;
                Ok((first.batch_id, second.batch_id))
            })
            .unwrap();
        assert_eq!(ids, (1, 2));
    }

    #[test]
    fn next_batch_after_is_fifo() {
        let persistence = persistence();
        let (next, none, highest) = persistence
            .run_transaction("scan", |txn| {
                let mut queue = MutationQueue::new(txn, "u");
                for i in 0..3 {
                    queue.add_mutation_batch(Timestamp::new(i, 0), vec![Mutation::delete(key("a/1"))])?;
                }
                Ok((
                    queue.next_mutation_batch_after(BATCH_ID_UNKNOWN)?.map(|b| b.batch_id),
                    queue.next_mutation_batch_after(3)?,
                    queue.highest_unacknowledged_batch_id()?,
                ))
            })
            .unwrap();
        assert_eq!(next, Some(1));
        assert!(none.is_none());
        assert_eq!(highest, 3);
    }

    #[test]
    fn finds_batches_by_key() {
        let persistence = persistence();
        let affecting = persistence
            .run_transaction("keys", |txn| {
                let mut queue = MutationQueue::new(txn, "u");
                queue.add_mutation_batch(Timestamp::new(1, 0), vec![Mutation::delete(key("a/1"))])?;
                queue.add_mutation_batch(Timestamp::new(2, 0), vec![Mutation::delete(key("a/2"))])?;
                queue.batches_affecting_keys(&BTreeSet::from([key("a/2")]))
            })
            .unwrap();
        assert_eq!(affecting.len(), 1);
        assert_eq!(affecting[0].batch_id, 2);
    }

    #[test]
    fn removing_unknown_batch_fails() {
        let persistence = persistence();
        assert!(persistence
            .run_transaction("rm", |txn| MutationQueue::new(txn, "u").remove_batch(7))
            .is_err());
    }
}
