//! Application-facing handle: settings, references, listeners, snapshots
//! and batched writes.

mod database;
mod listener;
pub(crate) mod operations;
mod reference;
pub mod settings;
mod snapshot;
mod write_batch;

#[cfg(not(target_arch = "wasm32"))]
pub use database::connect_firestore;
pub use database::{get_firestore, initialize_firestore, Firestore, FIRESTORE_COMPONENT_NAME};
pub use listener::ListenerRegistration;
pub use operations::SetOptions;
pub use reference::{CollectionReference, DocumentReference};
pub use settings::{CommitResolution, FirestoreSettings, CACHE_SIZE_UNLIMITED};
pub use snapshot::{DocumentChange, DocumentChangeType, DocumentSnapshot, QuerySnapshot, SnapshotMetadata};
pub use write_batch::WriteBatch;

pub use crate::firestore::core::event_manager::ListenOptions;
