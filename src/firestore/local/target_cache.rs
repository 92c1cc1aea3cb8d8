use std::collections::BTreeSet;

use crate::firestore::core::query::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, TargetId, Timestamp};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter mismatch without bloom filter help.
    ExistenceFilterMismatch,
    /// Re-listen after a mismatch the bloom filter could not explain.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

impl TargetPurpose {
    pub(crate) fn name(self) -> &'static str {
        match self {
            TargetPurpose::Listen => "listen",
            TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
            TargetPurpose::ExistenceFilterMismatchBloom => "existence-filter-mismatch-bloom",
            TargetPurpose::LimboResolution => "limbo-resolution",
        }
    }

    pub(crate) fn from_name(value: &str) -> Self {
        match value {
            "existence-filter-mismatch" => TargetPurpose::ExistenceFilterMismatch,
            "existence-filter-mismatch-bloom" => TargetPurpose::ExistenceFilterMismatchBloom,
            "limbo-resolution" => TargetPurpose::LimboResolution,
            _ => TargetPurpose::Listen,
        }
    }
}

/// Everything the client remembers about one listen target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Query,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    pub snapshot_version: Timestamp,
    /// Latest snapshot at which the target had no limbo documents.
    pub last_limbo_free_snapshot_version: Timestamp,
    pub resume_token: Vec<u8>,
    /// Number of documents expected after resuming, used by existence filters.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Query,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: Timestamp::min(),
            last_limbo_free_snapshot_version: Timestamp::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: Timestamp) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: i32) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: Timestamp) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn canonical_id(&self) -> String {
        self.target.canonical_id()
    }
}

const HIGHEST_TARGET_ID: &str = "highest_target_id";
const HIGHEST_SEQUENCE_NUMBER: &str = "highest_listen_sequence_number";
const LAST_REMOTE_SNAPSHOT_VERSION: &str = "last_remote_snapshot_version";

/// Target ids handed out by the cache are even; odd ids belong to limbo
/// resolution targets owned by the sync engine.
pub struct TargetIdGenerator {
    next: TargetId,
}

impl TargetIdGenerator {
    pub fn for_target_cache(after: TargetId) -> Self {
        let base = if after < 2 { 0 } else { after - after % 2 };
        Self { next: base + 2 }
    }

    pub fn for_sync_engine() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> TargetId {
        let id = self.next;
        self.next += 2;
        id
    }
}

/// Target bookkeeping on top of one persistence transaction.
pub struct TargetCache<'a> {
    txn: &'a mut dyn PersistenceTransaction,
}

impl<'a> TargetCache<'a> {
    pub fn new(txn: &'a mut dyn PersistenceTransaction) -> Self {
        Self { txn }
    }

    pub fn highest_target_id(&mut self) -> FirestoreResult<TargetId> {
        Ok(self.global_i64(HIGHEST_TARGET_ID)?.unwrap_or(0) as TargetId)
    }

    pub fn highest_sequence_number(&mut self) -> FirestoreResult<ListenSequenceNumber> {
        Ok(self.global_i64(HIGHEST_SEQUENCE_NUMBER)?.unwrap_or(0))
    }

    /// Allocates the next sequence number and persists it.
    pub fn next_sequence_number(&mut self) -> FirestoreResult<ListenSequenceNumber> {
        let next = self.highest_sequence_number()? + 1;
        self.txn.put_global(HIGHEST_SEQUENCE_NUMBER, &next.to_string())?;
        Ok(next)
    }

    pub fn allocate_target_id(&mut self) -> FirestoreResult<TargetId> {
        let id = TargetIdGenerator::for_target_cache(self.highest_target_id()?).next_id();
        self.txn.put_global(HIGHEST_TARGET_ID, &id.to_string())?;
        Ok(id)
    }

    pub fn last_remote_snapshot_version(&mut self) -> FirestoreResult<Timestamp> {
        match self.txn.get_global(LAST_REMOTE_SNAPSHOT_VERSION)? {
            Some(value) => parse_version(&value),
            None => Ok(Timestamp::min()),
        }
    }

    pub fn set_last_remote_snapshot_version(&mut self, version: Timestamp) -> FirestoreResult<()> {
        self.txn.put_global(
            LAST_REMOTE_SNAPSHOT_VERSION,
            &format!("{}.{:09}", version.seconds, version.nanos),
        )
    }

    pub fn get(&mut self, query: &Query) -> FirestoreResult<Option<TargetData>> {
        self.txn.get_target_by_canonical_id(&query.canonical_id())
    }

    pub fn get_by_id(&mut self, target_id: TargetId) -> FirestoreResult<Option<TargetData>> {
        self.txn.get_target(target_id)
    }

    /// Saves `target`, bumping the stored globals when it carries higher
    /// ids or sequence numbers than previously seen.
    pub fn save(&mut self, target: &TargetData) -> FirestoreResult<()> {
        self.txn.put_target(target)?;
        if target.target_id > self.highest_target_id()? && target.target_id % 2 == 0 {
            self.txn.put_global(HIGHEST_TARGET_ID, &target.target_id.to_string())?;
        }
        if target.sequence_number > self.highest_sequence_number()? {
            self.txn
                .put_global(HIGHEST_SEQUENCE_NUMBER, &target.sequence_number.to_string())?;
        }
        Ok(())
    }

    pub fn remove(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        self.txn.remove_matching_keys_for_target(target_id)?;
        self.txn.remove_target(target_id)
    }

    pub fn add_matching_keys<'k, I>(&mut self, target_id: TargetId, keys: I, sequence_number: ListenSequenceNumber) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            self.txn.add_matching_key(target_id, key)?;
            self.txn.set_document_sequence_number(key, sequence_number)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys<'k, I>(&mut self, target_id: TargetId, keys: I, sequence_number: ListenSequenceNumber) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            self.txn.remove_matching_key(target_id, key)?;
            self.txn.set_document_sequence_number(key, sequence_number)?;
        }
        Ok(())
    }

    pub fn matching_keys(&mut self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.txn.get_matching_keys(target_id)
    }

    pub fn target_count(&mut self) -> FirestoreResult<usize> {
        Ok(self.txn.get_all_targets()?.len())
    }

    fn global_i64(&mut self, key: &str) -> FirestoreResult<Option<i64>> {
        self.txn
            .get_global(key)?
            .map(|value| {
                value
                    .parse::<i64>()
                    .map_err(|err| internal_error(format!("corrupt global '{key}': {err}")))
            })
            .transpose()
    }
}

fn parse_version(value: &str) -> FirestoreResult<Timestamp> {
    let (seconds, nanos) = value
        .split_once('.')
        .ok_or_else(|| internal_error(format!("corrupt snapshot version '{value}'")))?;
    let seconds = seconds
        .parse::<i64>()
        .map_err(|err| internal_error(format!("corrupt snapshot version '{value}': {err}")))?;
    let nanos = nanos
        .parse::<i32>()
        .map_err(|err| internal_error(format!("corrupt snapshot version '{value}': {err}")))?;
    Ok(Timestamp::new(seconds, nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory::MemoryPersistence;
    use crate::firestore::local::persistence::Persistence;
    use std::sync::Arc;

    fn persistence() -> Arc<dyn Persistence> {
        Arc::new(MemoryPersistence::new())
    }

    #[test]
    fn cache_ids_are_even_and_increasing() {
        let persistence = persistence();
        let ids = persistence
            .run_transaction("alloc", |txn| {
                let mut cache = TargetCache::new(txn);
                Ok(vec![
                    cache.allocate_target_id()?,
                    cache.allocate_target_id()?,
                    cache.allocate_target_id()?,
                ])
            })
            .unwrap();
        assert_eq!(ids, vec![2, 4, 6]);
    }

    #[test]
    fn sync_engine_ids_are_odd() {
        let mut generator = TargetIdGenerator::for_sync_engine();
        assert_eq!(generator.next_id(), 1);
        assert_eq!(generator.next_id(), 3);
        assert_eq!(TargetIdGenerator::for_target_cache(7).next_id(), 8);
    }

    #[test]
    fn saves_and_finds_targets_by_query() {
        let persistence = persistence();
        let query = Query::collection("rooms").unwrap();
        persistence
            .run_transaction("save", |txn| {
                let mut cache = TargetCache::new(txn);
                let id = cache.allocate_target_id()?;
                let seq = cache.next_sequence_number()?;
                cache.save(&TargetData::new(query.clone(), id, TargetPurpose::Listen, seq))
            })
            .unwrap();
        let found = persistence
            .run_transaction("get", |txn| TargetCache::new(txn).get(&query))
            .unwrap()
            .unwrap();
        assert_eq!(found.target_id, 2);
        assert_eq!(found.sequence_number, 1);
    }

    #[test]
    fn snapshot_version_round_trips_through_globals() {
        let persistence = persistence();
        let version = Timestamp::new(12, 5);
        persistence
            .run_transaction("set", |txn| TargetCache::new(txn).set_last_remote_snapshot_version(version))
            .unwrap();
        let read = persistence
            .run_transaction("get", |txn| TargetCache::new(txn).last_remote_snapshot_version())
            .unwrap();
        assert_eq!(read, version);
    }

    #[test]
    fn purpose_names_round_trip() {
        for purpose in [
            TargetPurpose::Listen,
            TargetPurpose::ExistenceFilterMismatch,
            TargetPurpose::ExistenceFilterMismatchBloom,
            TargetPurpose::LimboResolution,
        ] {
            assert_eq!(TargetPurpose::from_name(purpose.name()), purpose);
        }
    }
}
