use std::collections::BTreeMap;

use crate::firestore::model::{DocumentKey, FieldPath, Timestamp};
use crate::firestore::value::{FirestoreValue, MapValue};

pub type DocumentMap = BTreeMap<DocumentKey, Document>;

#[derive(Clone, Debug, PartialEq)]
pub enum DocumentContents {
    /// Placeholder for a key with no known state.
    Invalid,
    Found { data: MapValue },
    /// The document is known not to exist at `version`.
    NoDocument,
    /// Known to exist but contents are not available locally, e.g. after a
    /// patch was acknowledged without the base document being cached.
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A cached document, possibly with local mutations applied on top.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    version: Timestamp,
    read_time: Timestamp,
    create_time: Option<Timestamp>,
    contents: DocumentContents,
    state: DocumentState,
}

impl Document {
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            version: Timestamp::min(),
            read_time: Timestamp::min(),
            create_time: None,
            contents: DocumentContents::Invalid,
            state: DocumentState::Synced,
        }
    }

    pub fn new_found(key: DocumentKey, version: Timestamp, data: MapValue) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_found(version, data);
        doc
    }

    pub fn new_no_document(key: DocumentKey, version: Timestamp) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_no_document(version);
        doc
    }

    pub fn new_unknown(key: DocumentKey, version: Timestamp) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_unknown(version);
        doc
    }

    pub fn convert_to_found(&mut self, version: Timestamp, data: MapValue) -> &mut Self {
        if self.create_time.is_none() && !version.is_min() {
            self.create_time = Some(version);
        }
        self.version = version;
        self.contents = DocumentContents::Found { data };
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: Timestamp) -> &mut Self {
        self.version = version;
        self.contents = DocumentContents::NoDocument;
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown(&mut self, version: Timestamp) -> &mut Self {
        self.version = version;
        self.contents = DocumentContents::Unknown;
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasLocalMutations;
        self.version = Timestamp::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: Timestamp) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn set_create_time(&mut self, create_time: Option<Timestamp>) -> &mut Self {
        self.create_time = create_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> Timestamp {
        self.version
    }

    pub fn read_time(&self) -> Timestamp {
        self.read_time
    }

    pub fn create_time(&self) -> Option<Timestamp> {
        self.create_time
    }

    pub fn contents(&self) -> &DocumentContents {
        &self.contents
    }

    pub fn is_valid(&self) -> bool {
        self.contents != DocumentContents::Invalid
    }

    pub fn is_found(&self) -> bool {
        matches!(self.contents, DocumentContents::Found { .. })
    }

    pub fn is_no_document(&self) -> bool {
        self.contents == DocumentContents::NoDocument
    }

    pub fn is_unknown(&self) -> bool {
        self.contents == DocumentContents::Unknown
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    /// Field data. Empty unless the document is found.
    pub fn data(&self) -> MapValue {
        match &self.contents {
            DocumentContents::Found { data } => data.clone(),
            _ => MapValue::empty(),
        }
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        match &self.contents {
            DocumentContents::Found { data } => data.get(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/a").unwrap()
    }

    #[test]
    fn conversions_track_state() {
        let mut doc = Document::new_invalid(key());
        assert!(!doc.is_valid());
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("x").unwrap(), FirestoreValue::from_integer(1));
        doc.convert_to_found(Timestamp::new(5, 0), data);
        assert!(doc.is_found());
        assert_eq!(doc.create_time(), Some(Timestamp::new(5, 0)));
        doc.set_has_local_mutations();
        assert!(doc.has_local_mutations());
        assert!(doc.version().is_min());
        doc.convert_to_no_document(Timestamp::new(6, 0));
        assert!(doc.is_no_document());
        assert!(!doc.has_pending_writes());
        assert!(doc.data().is_empty());
    }

    #[test]
    fn unknown_documents_carry_committed_flag() {
        let doc = Document::new_unknown(key(), Timestamp::new(3, 0));
        assert!(doc.is_unknown());
        assert!(doc.has_committed_mutations());
    }
}
