//! Query views, listener fan-out, the sync engine and the client that owns
//! them, all driven by one serial work queue.

pub mod async_queue;
pub mod event_manager;
pub mod firestore_client;
pub mod query;
pub mod sync_engine;
pub mod view;

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use event_manager::{EventManager, ListenOptions, QueryListener, ViewSnapshotObserver};
pub use firestore_client::FirestoreClient;
pub use query::{Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query};
pub use sync_engine::{SyncEngine, SyncEngineListener, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS};
pub use view::{ChangeType, DocumentSet, DocumentViewChange, View, ViewSnapshot};
