use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::TargetPurpose;
use crate::firestore::model::{DocumentKey, DocumentMap, TargetId, Timestamp};

/// Everything the watch stream reported up to one consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: Timestamp,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match; they must be re-listened
    /// from scratch with the given purpose.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: DocumentMap,
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }

    /// An event that only marks `target_id` current with no documents, used
    /// to resolve listens the server cannot serve, such as limbo targets
    /// for documents the cache already holds.
    pub fn synthesized_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange {
                resume_token,
                current,
                ..TargetChange::default()
            },
        );
        Self {
            snapshot_version: Timestamp::min(),
            target_changes,
            ..Self::default()
        }
    }
}

/// Per-target delta within a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn touched_documents(&self) -> impl Iterator<Item = &DocumentKey> {
        self.added_documents
            .iter()
            .chain(self.modified_documents.iter())
            .chain(self.removed_documents.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_event_only_marks_the_target() {
        let event = RemoteEvent::synthesized_for_current_change(7, true, b"tok".to_vec());
        assert!(event.snapshot_version.is_min());
        assert!(!event.is_empty());
        let change = &event.target_changes[&7];
        assert!(change.current);
        assert_eq!(change.resume_token, b"tok".to_vec());
        assert_eq!(change.touched_documents().count(), 0);
        assert!(RemoteEvent::default().is_empty());
    }
}
