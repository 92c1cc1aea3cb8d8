use std::collections::BTreeSet;

use futures::FutureExt;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKey, MutationBatchResult, TargetId};
use crate::firestore::remote::online_state::OnlineState;
use crate::firestore::remote::remote_event::RemoteEvent;

#[cfg(target_arch = "wasm32")]
pub type RemoteStoreFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// What the remote store reports back to the sync layer.
///
/// Every callback runs on the client's work queue and must not enqueue and
/// await further work on it.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot from the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend refused the listen for `target_id`.
    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend permanently rejected batch `batch_id`.
    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys the views consider synced for `target_id`; used for existence
    /// filters and expected counts.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    fn apply_online_state_change(&self, state: OnlineState);
}
