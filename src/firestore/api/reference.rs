use std::fmt::{Display, Formatter};

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::firestore::core::query::Query;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, ResourcePath};

use super::database::Firestore;

const AUTO_ID_LENGTH: usize = 20;

#[derive(Clone, Debug)]
pub struct CollectionReference {
    firestore: Firestore,
    path: ResourcePath,
}

impl CollectionReference {
    pub(crate) fn new(firestore: Firestore, path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "'{}' is not a collection path (odd number of segments expected)",
                path.canonical_string()
            )));
        }
        Ok(Self { firestore, path })
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    /// The full resource path, e.g. `rooms/eros/messages`.
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    /// The document containing this collection, `None` at the root.
    pub fn parent(&self) -> Option<DocumentReference> {
        let parent = self.path.without_last();
        if parent.is_empty() {
            return None;
        }
        DocumentReference::new(self.firestore.clone(), parent).ok()
    }

    /// A reference to `document_id` in this collection, or to a fresh
    /// random id when `None`.
    pub fn doc(&self, document_id: Option<&str>) -> FirestoreResult<DocumentReference> {
        let id = document_id.map(str::to_owned).unwrap_or_else(generate_auto_id);
        if id.is_empty() || id.contains('/') {
            return Err(invalid_argument(format!("invalid document id '{id}'")));
        }
        DocumentReference::new(self.firestore.clone(), self.path.child([id]))
    }

    /// A query returning every document of this collection.
    pub fn query(&self) -> Query {
        Query::at_path(self.path.clone())
    }
}

impl Display for CollectionReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollectionReference({})", self.path.canonical_string())
    }
}

#[derive(Clone, Debug)]
pub struct DocumentReference {
    firestore: Firestore,
    key: DocumentKey,
}

impl DocumentReference {
    pub(crate) fn new(firestore: Firestore, path: ResourcePath) -> FirestoreResult<Self> {
        let key = DocumentKey::from_path(path)?;
        Ok(Self { firestore, key })
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn path(&self) -> &ResourcePath {
        self.key.path()
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn parent(&self) -> CollectionReference {
        CollectionReference {
            firestore: self.firestore.clone(),
            path: self.key.collection_path(),
        }
    }

    /// A subcollection of this document.
    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        let relative = ResourcePath::from_string(path)?;
        let mut segments = Vec::with_capacity(relative.len());
        for index in 0..relative.len() {
            if let Some(segment) = relative.segment(index) {
                segments.push(segment.to_owned());
            }
        }
        CollectionReference::new(self.firestore.clone(), self.key.path().child(segments))
    }

    /// The query matching exactly this document.
    pub fn query(&self) -> Query {
        Query::document(&self.key)
    }
}

impl PartialEq for DocumentReference {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.firestore.database_id() == other.firestore.database_id()
    }
}

impl Display for DocumentReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DocumentReference({})", self.key.path().canonical_string())
    }
}

fn generate_auto_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTO_ID_LENGTH)
        .map(char::from)
        .collect()
}
