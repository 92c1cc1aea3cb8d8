use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::firestore::core::sync_engine::DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS;
use crate::firestore::error::FirestoreError;
use crate::firestore::local::{PersistenceFallbackHook, PersistenceMode, DEFAULT_CACHE_SIZE_BYTES};
use crate::firestore::remote::RetrySettings;

pub use crate::firestore::local::CACHE_SIZE_UNLIMITED;

/// When [`commit`](crate::firestore::Firestore::commit) resolves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitResolution {
    /// After the backend acknowledged the batch.
    #[default]
    OnAcknowledgement,
    /// As soon as the batch is durably queued locally.
    OnLocalWrite,
}

/// Client configuration. Start from [`Default`] and adjust with the
/// `with_*` methods.
#[derive(Clone)]
pub struct FirestoreSettings {
    pub persistence: PersistenceMode,
    /// Allow several clients to share one durable store. Only one of them
    /// talks to the backend at a time.
    pub multi_tab: bool,
    pub cache_size_bytes: i64,
    pub max_concurrent_limbo_resolutions: usize,
    pub commit_resolution: CommitResolution,
    pub stream_retry: RetrySettings,
    /// Identifies this client in the shared lease table. Generated when
    /// unset.
    pub client_id: Option<String>,
    /// Overrides the database named by the app options.
    pub database_id: Option<String>,
    pub persistence_fallback: Option<PersistenceFallbackHook>,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            persistence: PersistenceMode::Memory,
            multi_tab: false,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            commit_resolution: CommitResolution::default(),
            stream_retry: RetrySettings::default(),
            client_id: None,
            database_id: None,
            persistence_fallback: None,
        }
    }
}

impl FirestoreSettings {
    pub fn with_sqlite_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence = PersistenceMode::Sqlite { path: path.into() };
        self
    }

    pub fn with_memory_persistence(mut self) -> Self {
        self.persistence = PersistenceMode::Memory;
        self
    }

    pub fn with_multi_tab(mut self, multi_tab: bool) -> Self {
        self.multi_tab = multi_tab;
        self
    }

    /// Target size of the document cache. [`CACHE_SIZE_UNLIMITED`] turns
    /// eviction off.
    pub fn with_cache_size_bytes(mut self, cache_size_bytes: i64) -> Self {
        self.cache_size_bytes = cache_size_bytes;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max;
        self
    }

    pub fn with_commit_resolution(mut self, resolution: CommitResolution) -> Self {
        self.commit_resolution = resolution;
        self
    }

    pub fn with_stream_retry(mut self, retry: RetrySettings) -> Self {
        self.stream_retry = retry;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_database_id(mut self, database_id: impl Into<String>) -> Self {
        self.database_id = Some(database_id.into());
        self
    }

    /// Called once if the durable store cannot be opened and the client
    /// runs on memory persistence instead.
    pub fn with_persistence_fallback<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FirestoreError) + Send + Sync + 'static,
    {
        self.persistence_fallback = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for FirestoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirestoreSettings")
            .field("persistence", &self.persistence)
            .field("multi_tab", &self.multi_tab)
            .field("cache_size_bytes", &self.cache_size_bytes)
            .field("max_concurrent_limbo_resolutions", &self.max_concurrent_limbo_resolutions)
            .field("commit_resolution", &self.commit_resolution)
            .field("stream_retry", &self.stream_retry)
            .field("client_id", &self.client_id)
            .field("database_id", &self.database_id)
            .field("persistence_fallback", &self.persistence_fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let settings = FirestoreSettings::default()
            .with_sqlite_persistence("/tmp/cache.db")
            .with_multi_tab(true)
            .with_commit_resolution(CommitResolution::OnLocalWrite)
            .with_max_concurrent_limbo_resolutions(3);
        assert_eq!(
            settings.persistence,
            PersistenceMode::Sqlite {
                path: PathBuf::from("/tmp/cache.db")
            }
        );
        assert!(settings.multi_tab);
        assert_eq!(settings.commit_resolution, CommitResolution::OnLocalWrite);
        assert_eq!(settings.max_concurrent_limbo_resolutions, 3);
        assert_eq!(settings.cache_size_bytes, DEFAULT_CACHE_SIZE_BYTES);
    }
}
