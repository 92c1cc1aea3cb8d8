//! Local persistence: the remote document cache, the mutation queue,
//! overlays, target metadata, LRU collection and the multi-client lease.

pub mod lease;
pub mod local_serializer;
pub mod local_store;
pub mod lru;
pub mod memory;
pub mod mutation_queue;
pub mod overlay;
pub mod persistence;
pub mod sqlite;
pub mod target_cache;

#[doc(inline)]
pub use lease::LeaseCoordinator;
#[doc(inline)]
pub use local_store::{LeaseRefresh, LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
pub use lru::{LruParams, LruResults, CACHE_SIZE_UNLIMITED, DEFAULT_CACHE_SIZE_BYTES};
pub use memory::MemoryPersistence;
pub use persistence::{
    clear_persistence, open_persistence, BundleMetadata, MutationBatchOutcome, MutationBatchState, NamedQuery,
    Persistence, PersistenceFallbackHook,
    PersistenceMode,
};
pub use sqlite::SqlitePersistence;
pub use target_cache::{TargetData, TargetIdGenerator, TargetPurpose};
