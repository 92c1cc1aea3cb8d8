//! An offline-first document sync engine.
//!
//! Local writes are applied to a durable cache right away and replayed to
//! the backend in order; live queries are served from the cache and kept
//! current by a watch stream. Several clients may share one store, with a
//! lease deciding which of them owns the network.

use std::sync::LazyLock;

use crate::logger::Logger;

pub mod api;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@firebase/firestore"));

#[cfg(not(target_arch = "wasm32"))]
pub use api::connect_firestore;
pub use api::{
    get_firestore, initialize_firestore, CollectionReference, CommitResolution, DocumentChange, DocumentChangeType,
    DocumentReference, DocumentSnapshot, Firestore, FirestoreSettings, ListenOptions, ListenerRegistration,
    QuerySnapshot, SetOptions, SnapshotMetadata, WriteBatch,
};
pub use self::core::query::{Bound, FilterOperator, OrderDirection, Query};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use local::PersistenceMode;
pub use model::{DocumentKey, FieldPath, Mutation, Timestamp};
pub use remote::{InMemoryTransport, OnlineState, RetrySettings, StreamTransport};
pub use value::{FirestoreValue, MapValue};
