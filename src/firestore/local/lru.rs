use std::collections::BTreeSet;

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, TargetId};

pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
/// Passing this as the cache size turns collection off.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;

const DEFAULT_PERCENTILE: u32 = 10;
const DEFAULT_MAX_SEQUENCE_NUMBERS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    pub cache_size_bytes: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub fn with_cache_size(cache_size_bytes: i64) -> Self {
        Self {
            cache_size_bytes,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(CACHE_SIZE_UNLIMITED)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_size_bytes != CACHE_SIZE_UNLIMITED
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: DEFAULT_PERCENTILE,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

/// Evicts the least recently used targets and the documents only they
/// referenced, once the cache grows past its threshold.
#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> LruParams {
        self.params
    }

    /// `active_targets` are never removed; `pinned_keys` (documents with
    /// pending writes or held by views) are never evicted.
    pub fn collect(
        &self,
        txn: &mut dyn PersistenceTransaction,
        active_targets: &BTreeSet<TargetId>,
        pinned_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<LruResults> {
        if !self.params.is_enabled() {
            log::debug!("garbage collection skipped; disabled");
            return Ok(LruResults::default());
        }
        let cache_size = txn.document_cache_byte_size()?;
        if (cache_size as i64) < self.params.cache_size_bytes {
            log::debug!(
                "garbage collection skipped; cache size {cache_size} is below threshold {}",
                self.params.cache_size_bytes
            );
            return Ok(LruResults::default());
        }

        let targets = txn.get_all_targets()?;
        let documents = txn.get_document_sequence_numbers()?;
        let mut sequence_numbers: Vec<ListenSequenceNumber> = targets
            .iter()
            .map(|target| target.sequence_number)
            .chain(documents.iter().map(|(_, seq)| *seq))
            .collect();
        sequence_numbers.sort_unstable();
        sequence_numbers.dedup();

        let to_collect = (self.params.percentile_to_collect as usize * sequence_numbers.len() / 100)
            .min(self.params.maximum_sequence_numbers_to_collect);
        if to_collect == 0 {
            return Ok(LruResults {
                did_run: true,
                ..LruResults::default()
            });
        }
        let upper_bound = sequence_numbers[to_collect - 1];

        let mut targets_removed = 0;
        for target in targets {
            if target.sequence_number <= upper_bound && !active_targets.contains(&target.target_id) {
                txn.remove_matching_keys_for_target(target.target_id)?;
                txn.remove_target(target.target_id)?;
                targets_removed += 1;
            }
        }

        let mut documents_removed = 0;
        for (key, sequence_number) in documents {
            if sequence_number > upper_bound || pinned_keys.contains(&key) {
                continue;
            }
            if txn.is_key_in_any_target(&key)? {
                continue;
            }
            txn.remove_document(&key)?;
            txn.remove_document_sequence_number(&key)?;
            documents_removed += 1;
        }

        log::debug!(
            "garbage collection removed {targets_removed} targets and {documents_removed} documents"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::memory::MemoryPersistence;
    use crate::firestore::local::persistence::Persistence;
    use crate::firestore::local::target_cache::{TargetData, TargetPurpose};
    use crate::firestore::model::{Document, Timestamp};
    use std::sync::Arc;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn seed(persistence: &Arc<dyn Persistence>) {
        persistence
            .run_transaction("seed", |txn| {
                for i in 0..10 {
                    let doc_key = key(&format!("c/{i}"));
                    txn.put_document(&Document::new_no_document(doc_key.clone(), Timestamp::new(1, 0)), 100)?;
                    txn.set_document_sequence_number(&doc_key, i)?;
                }
                let target = TargetData::new(Query::collection("c")?, 2, TargetPurpose::Listen, 0);
                txn.put_target(&target)?;
                txn.add_matching_key(2, &key("c/0"))
            })
            .unwrap();
    }

    #[test]
    fn disabled_collector_never_runs() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        seed(&persistence);
        let results = persistence
            .run_transaction("gc", |txn| {
                LruGarbageCollector::new(LruParams::disabled()).collect(txn, &BTreeSet::new(), &BTreeSet::new())
            })
            .unwrap();
        assert!(!results.did_run);
    }

    #[test]
    fn small_cache_is_left_alone() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        seed(&persistence);
        let results = persistence
            .run_transaction("gc", |txn| {
                LruGarbageCollector::new(LruParams::default()).collect(txn, &BTreeSet::new(), &BTreeSet::new())
            })
            .unwrap();
        assert!(!results.did_run);
    }

    #[test]
    fn evicts_oldest_unreferenced_documents() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        seed(&persistence);
        let params = LruParams {
            cache_size_bytes: 500,
            percentile_to_collect: 50,
            maximum_sequence_numbers_to_collect: 1000,
        };
        let pinned = BTreeSet::from([key("c/2")]);
        let results = persistence
            .run_transaction("gc", |txn| {
                LruGarbageCollector::new(params).collect(txn, &BTreeSet::from([2]), &pinned)
            })
            .unwrap();
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 0);
        // Sequence numbers 0..=9, half collected: upper bound 4. c/0 is in a
        // target and c/2 is pinned.
        assert_eq!(results.documents_removed, 3);
        let remaining = persistence
            .run_transaction("check", |txn| {
                Ok((txn.get_document(&key("c/0"))?, txn.get_document(&key("c/1"))?))
            })
            .unwrap();
        assert!(remaining.0.is_some());
        assert!(remaining.1.is_none());
    }
}
