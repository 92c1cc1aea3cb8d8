use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError, Weak};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::core::async_queue::AsyncQueue;
use crate::firestore::error::{internal_error, is_permanent_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{LocalStore, TargetData};
use crate::firestore::model::{DocumentKey, MutationBatch, MutationBatchResult, MutationResult, TargetId, Timestamp, BATCH_ID_UNKNOWN};
use crate::firestore::remote::datastore::{Datastore, RetrySettings};
use crate::firestore::remote::online_state::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::firestore::remote::watch_stream::{WatchStream, WatchStreamListener};
use crate::firestore::remote::write_stream::{WriteStream, WriteStreamListener};
use crate::firestore::LOGGER;

/// Batches in flight on the write stream at once.
pub const MAX_PENDING_WRITES: usize = 10;

/// Reasons the remote store keeps its streams closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    /// Another client holds the primary lease.
    IsSecondary,
    Shutdown,
}

type ListenTargets = Arc<StdMutex<BTreeMap<TargetId, TargetData>>>;

fn targets(listen_targets: &ListenTargets) -> std::sync::MutexGuard<'_, BTreeMap<TargetId, TargetData>> {
    listen_targets.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serves the aggregator from the listen registry and the sync layer.
struct SyncerMetadataProvider {
    listen_targets: ListenTargets,
    syncer: Weak<dyn RemoteSyncer>,
}

impl TargetMetadataProvider for SyncerMetadataProvider {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer
            .upgrade()
            .map(|syncer| syncer.remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        targets(&self.listen_targets).get(&target_id).cloned()
    }
}

struct RemoteStoreState {
    watch_aggregator: Option<WatchChangeAggregator>,
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

/// Owns the watch and write streams. Tracks active listens, pipelines
/// pending writes and derives the online state.
///
/// Every method is expected to run on the client's work queue.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        local_store: Arc<LocalStore>,
        datastore: Arc<Datastore>,
        queue: AsyncQueue,
        retry: RetrySettings,
    ) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<RemoteStoreInner>| {
            let handler_target = this.clone();
            let online_state = OnlineStateTracker::new(
                queue.clone(),
                Arc::new(move |state| {
                    if let Some(syncer) = handler_target.upgrade().and_then(|inner| inner.syncer()) {
                        syncer.apply_online_state_change(state);
                    }
                }),
            );
            RemoteStoreInner {
                local_store,
                watch_stream: WatchStream::new(queue.clone(), Arc::clone(&datastore), retry.clone()),
                write_stream: WriteStream::new(queue, Arc::clone(&datastore), retry),
                datastore,
                online_state,
                syncer: OnceLock::new(),
                listen_targets: Arc::new(StdMutex::new(BTreeMap::new())),
                state: Mutex::new(RemoteStoreState {
                    watch_aggregator: None,
                    write_pipeline: VecDeque::new(),
                    // Network use waits for the client to learn it is primary.
                    offline_causes: BTreeSet::from([OfflineCause::IsSecondary]),
                }),
                this: this.clone(),
            }
        });
        Self { inner }
    }

    /// Wires the sync layer in. Must be called once, before `start`.
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        if self.inner.syncer.set(syncer).is_err() {
            LOGGER.warn("remote syncer already registered; ignoring");
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state.state()
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.state.lock().await.offline_causes.is_empty()
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.state.lock().await.offline_causes.remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await
    }

    /// Closes both streams and reports `Offline` until re-enabled.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await;
        self.inner.online_state.set(OnlineState::Offline);
        Ok(())
    }

    pub async fn shutdown(&self) {
        LOGGER.debug("remote store shutting down");
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await;
        self.inner.online_state.set(OnlineState::Unknown);
    }

    /// Only the primary client talks to the backend.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            self.inner.state.lock().await.offline_causes.remove(&OfflineCause::IsSecondary);
            self.inner.enable_network_internal().await
        } else {
            let was_allowed = {
                let mut state = self.inner.state.lock().await;
                let was_allowed = state.offline_causes.is_empty();
                state.offline_causes.insert(OfflineCause::IsSecondary);
                was_allowed
            };
            if was_allowed {
                self.inner.disable_network_internal().await;
                self.inner.online_state.set(OnlineState::Unknown);
            }
            Ok(())
        }
    }

    /// Restarts both streams so they authenticate as the new user.
    pub async fn handle_credential_change(&self) -> FirestoreResult<()> {
        if !self.can_use_network().await {
            return Ok(());
        }
        LOGGER.debug("restarting streams for new credentials");
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::CredentialChange);
        self.inner.disable_network_internal().await;
        self.inner.online_state.set(OnlineState::Unknown);
        self.inner.state.lock().await.offline_causes.remove(&OfflineCause::CredentialChange);
        self.inner.enable_network_internal().await
    }

    /// Starts watching `target`. Listening to an already watched target id
    /// is a no-op.
    pub async fn listen(&self, target: TargetData) -> FirestoreResult<()> {
        let target_id = target.target_id;
        {
            let mut listen_targets = targets(&self.inner.listen_targets);
            if listen_targets.contains_key(&target_id) {
                return Ok(());
            }
            listen_targets.insert(target_id, target.clone());
        }
        if self.inner.should_start_watch_stream().await {
            self.inner.start_watch_stream().await;
        } else if self.inner.watch_stream.is_open() {
            self.inner.send_watch_request(target).await?;
        }
        Ok(())
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let remaining = {
            let mut listen_targets = targets(&self.inner.listen_targets);
            if listen_targets.remove(&target_id).is_none() {
                return Ok(());
            }
            listen_targets.len()
        };
        if self.inner.watch_stream.is_open() {
            self.inner.send_unwatch_request(target_id).await?;
        }
        if remaining == 0 {
            if self.inner.watch_stream.is_open() {
                self.inner.watch_stream.mark_idle();
            } else if self.can_use_network().await {
                // No targets left, so nothing is known about connectivity.
                self.inner.online_state.set(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    /// Pulls queued batches into the write pipeline and sends them.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    pub fn listen_target_ids(&self) -> BTreeSet<TargetId> {
        targets(&self.inner.listen_targets).keys().copied().collect()
    }

    pub async fn pending_write_count(&self) -> usize {
        self.inner.state.lock().await.write_pipeline.len()
    }

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.inner.datastore
    }
}

struct RemoteStoreInner {
    local_store: Arc<LocalStore>,
    datastore: Arc<Datastore>,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    online_state: Arc<OnlineStateTracker>,
    syncer: OnceLock<Weak<dyn RemoteSyncer>>,
    listen_targets: ListenTargets,
    state: Mutex<RemoteStoreState>,
    this: Weak<RemoteStoreInner>,
}

impl RemoteStoreInner {
    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.syncer.get().and_then(Weak::upgrade)
    }

    fn require_syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        self.syncer()
            .ok_or_else(|| internal_error("remote store has no sync layer attached"))
    }

    async fn can_use_network(&self) -> bool {
        self.state.lock().await.offline_causes.is_empty()
    }

    async fn enable_network_internal(&self) -> FirestoreResult<()> {
        if !self.can_use_network().await {
            return Ok(());
        }
        self.write_stream
            .set_last_stream_token(self.local_store.last_stream_token()?);
        if self.should_start_watch_stream().await {
            self.start_watch_stream().await;
        } else {
            self.online_state.set(OnlineState::Unknown);
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self) {
        self.write_stream.stop();
        self.watch_stream.stop();
        let mut state = self.state.lock().await;
        state.watch_aggregator = None;
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "dropping {} in-flight batches; they stay queued locally",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
    }

    async fn should_start_watch_stream(&self) -> bool {
        self.can_use_network().await
            && !self.watch_stream.is_started()
            && !targets(&self.listen_targets).is_empty()
    }

    async fn should_start_write_stream(&self) -> bool {
        let state = self.state.lock().await;
        state.offline_causes.is_empty() && !self.write_stream.is_started() && !state.write_pipeline.is_empty()
    }

    async fn start_watch_stream(&self) {
        let Some(syncer) = self.syncer.get().cloned() else {
            LOGGER.warn("cannot start the watch stream without a sync layer");
            return;
        };
        let provider = Arc::new(SyncerMetadataProvider {
            listen_targets: Arc::clone(&self.listen_targets),
            syncer,
        });
        self.state.lock().await.watch_aggregator = Some(WatchChangeAggregator::new(
            self.datastore.serializer().database_id().clone(),
            provider,
        ));
        let listener: Weak<dyn WatchStreamListener> = self.this.clone();
        self.watch_stream.start(listener);
        self.online_state.handle_watch_stream_start();
    }

    async fn send_watch_request(&self, mut target: TargetData) -> FirestoreResult<()> {
        if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target.target_id);
        }
        let resuming = !target.resume_token.is_empty() || target.snapshot_version > Timestamp::min();
        if resuming {
            if let Some(syncer) = self.syncer() {
                let count = syncer.remote_keys_for_target(target.target_id).len();
                target = target.with_expected_count(count as i32);
            }
        }
        self.watch_stream.watch(&target).await
    }

    async fn send_unwatch_request(&self, target_id: TargetId) -> FirestoreResult<()> {
        if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id).await
    }

    async fn handle_target_error(&self, change: &WatchTargetChange, error: FirestoreError) -> FirestoreResult<()> {
        let syncer = self.require_syncer()?;
        for target_id in &change.target_ids {
            if targets(&self.listen_targets).remove(target_id).is_none() {
                continue;
            }
            if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
            syncer.reject_listen(*target_id, error.clone()).await?;
        }
        Ok(())
    }

    /// Turns everything aggregated so far into one remote event, re-listens
    /// mismatched targets and hands the event to the sync layer.
    async fn raise_watch_snapshot(&self, snapshot_version: Timestamp) -> FirestoreResult<()> {
        let event = {
            let mut state = self.state.lock().await;
            let Some(aggregator) = state.watch_aggregator.as_mut() else {
                return Ok(());
            };
            aggregator.create_remote_event(snapshot_version)
        };

        let mut relisten = Vec::new();
        {
            let mut listen_targets = targets(&self.listen_targets);
            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target) = listen_targets.get_mut(target_id) {
                    *target = target
                        .clone()
                        .with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }
            for (target_id, purpose) in &event.target_mismatches {
                let Some(target) = listen_targets.get_mut(target_id) else {
                    continue;
                };
                // The cached result is suspect; resuming would reuse it.
                *target = target
                    .clone()
                    .with_resume_token(Vec::new(), target.snapshot_version);
                relisten.push(TargetData::new(
                    target.target.clone(),
                    *target_id,
                    *purpose,
                    target.sequence_number,
                ));
            }
        }
        for target in relisten {
            self.send_unwatch_request(target.target_id).await?;
            self.send_watch_request(target).await?;
        }

        self.require_syncer()?.apply_remote_event(event).await
    }

    async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        loop {
            let last_batch_id = {
                let state = self.state.lock().await;
                if !state.offline_causes.is_empty() || state.write_pipeline.len() >= MAX_PENDING_WRITES {
                    break;
                }
                state
                    .write_pipeline
                    .back()
                    .map(|batch| batch.batch_id)
                    .unwrap_or(BATCH_ID_UNKNOWN)
            };
            let Some(batch) = self.local_store.next_mutation_batch(last_batch_id)? else {
                if self.state.lock().await.write_pipeline.is_empty() {
                    self.write_stream.mark_idle();
                }
                break;
            };
            let mutations = batch.mutations.clone();
            self.state.lock().await.write_pipeline.push_back(batch);
            if self.write_stream.is_open() && self.write_stream.handshake_complete() {
                self.write_stream.write_mutations(&mutations).await?;
            }
        }
        if self.should_start_write_stream().await {
            let listener: Weak<dyn WriteStreamListener> = self.this.clone();
            self.write_stream.start(listener);
        }
        Ok(())
    }

    async fn handle_write_error(&self, error: &FirestoreError) -> FirestoreResult<()> {
        if !error.is_permanent_write_error() {
            return Ok(());
        }
        let Some(batch) = self.state.lock().await.write_pipeline.pop_front() else {
            return Ok(());
        };
        LOGGER.warn(format!("batch {} rejected by the backend: {error}", batch.batch_id));
        // The backend is fine; only the batch was bad.
        self.write_stream.inhibit_backoff();
        self.require_syncer()?
            .reject_failed_write(batch.batch_id, error.clone())
            .await?;
        self.fill_write_pipeline().await
    }

    fn handle_handshake_error(&self, error: &FirestoreError) -> FirestoreResult<()> {
        if is_permanent_error(error.code) {
            LOGGER.debug(format!(
                "write stream handshake rejected ({error}); resetting the stream token"
            ));
            self.write_stream.set_last_stream_token(Vec::new());
            self.local_store.set_last_stream_token(&[])?;
        }
        Ok(())
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WatchStreamListener for RemoteStoreInner {
    async fn on_watch_open(&self) {
        let pending: Vec<TargetData> = targets(&self.listen_targets).values().cloned().collect();
        for target in pending {
            if let Err(err) = self.send_watch_request(target).await {
                log::warn!("failed to send watch request: {err}");
            }
        }
    }

    async fn on_watch_change(&self, change: WatchChange, snapshot_version: Timestamp) -> FirestoreResult<()> {
        // Any message proves the backend is reachable.
        self.online_state.set(OnlineState::Online);

        match change {
            WatchChange::TargetChange(target_change) => {
                if target_change.state == TargetChangeState::Removed {
                    if let Some(cause) = target_change.cause.clone() {
                        return self.handle_target_error(&target_change, cause).await;
                    }
                }
                if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
                    aggregator.handle_target_change(&target_change);
                }
            }
            WatchChange::DocumentChange(change) => {
                if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
                    aggregator.handle_document_change(change);
                }
            }
            WatchChange::DocumentDelete(delete) => {
                if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
                    aggregator.handle_document_delete(delete);
                }
            }
            WatchChange::DocumentRemove(remove) => {
                if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
                    aggregator.handle_document_remove(remove);
                }
            }
            WatchChange::ExistenceFilter(filter) => {
                if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
                    aggregator.handle_existence_filter(filter);
                }
            }
        }

        if snapshot_version > Timestamp::min() {
            let last_remote_version = self.local_store.last_remote_snapshot_version()?;
            if snapshot_version >= last_remote_version {
                self.raise_watch_snapshot(snapshot_version).await?;
            }
        }
        Ok(())
    }

    async fn on_watch_close(&self, error: Option<FirestoreError>) {
        self.state.lock().await.watch_aggregator = None;
        if self.should_start_watch_stream().await {
            if let Some(error) = &error {
                self.online_state.handle_watch_stream_failure(error);
            }
            self.start_watch_stream().await;
        } else {
            self.online_state.set(OnlineState::Unknown);
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamListener for RemoteStoreInner {
    async fn on_write_open(&self) {
        if let Err(err) = self.write_stream.write_handshake().await {
            log::warn!("failed to send write handshake: {err}");
        }
    }

    async fn on_handshake_complete(&self) -> FirestoreResult<()> {
        self.local_store
            .set_last_stream_token(&self.write_stream.last_stream_token())?;
        let pending: Vec<Vec<_>> = self
            .state
            .lock()
            .await
            .write_pipeline
            .iter()
            .map(|batch| batch.mutations.clone())
            .collect();
        for mutations in pending {
            self.write_stream.write_mutations(&mutations).await?;
        }
        Ok(())
    }

    async fn on_mutation_result(
        &self,
        commit_version: Timestamp,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        let batch = self
            .state
            .lock()
            .await
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("write acknowledged with an empty pipeline"))?;
        let result = MutationBatchResult::from(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token(),
        )?;
        self.require_syncer()?.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_close(&self, error: Option<FirestoreError>) {
        if let Some(error) = &error {
            let outcome = if self.write_stream.handshake_complete() {
                self.handle_write_error(error).await
            } else {
                self.handle_handshake_error(error)
            };
            if let Err(err) = outcome {
                LOGGER.error(format!("failed to handle write stream error: {err}"));
            }
        }
        if self.should_start_write_stream().await {
            let listener: Weak<dyn WriteStreamListener> = self.this.clone();
            self.write_stream.start(listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{EmptyCredentialsProvider, User};
    use crate::firestore::core::query::Query;
    use crate::firestore::local::{LruParams, MemoryPersistence, TargetPurpose};
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::remote_event::RemoteEvent;
    use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture};
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream};
    use crate::platform::runtime;
    use serde_json::{json, Value as JsonValue};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSyncer {
        events: StdMutex<Vec<RemoteEvent>>,
        rejected: StdMutex<Vec<TargetId>>,
        online: StdMutex<Vec<OnlineState>>,
    }

    impl RemoteSyncer for RecordingSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.events.lock().unwrap().push(event);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_listen(&self, target_id: TargetId, _error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.rejected.lock().unwrap().push(target_id);
            box_remote_store_future(async { Ok(()) })
        }

        fn apply_successful_write(&self, _result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_failed_write(
            &self,
            _batch_id: crate::firestore::model::BatchId,
            _error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async { Ok(()) })
        }

        fn remote_keys_for_target(&self, _target_id: TargetId) -> BTreeSet<DocumentKey> {
            BTreeSet::new()
        }

        fn apply_online_state_change(&self, state: OnlineState) {
            self.online.lock().unwrap().push(state);
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        remote_store: RemoteStore,
        syncer: Arc<RecordingSyncer>,
        server: MultiplexedConnection,
    }

    fn fixture() -> Fixture {
        let (client, server) = InMemoryTransport::pair();
        let database_id = DatabaseId::new("p", "(default)");
        let datastore = Arc::new(Datastore::new(
            Arc::new(MultiplexedConnection::new(client)),
            Arc::new(EmptyCredentialsProvider::new()),
            JsonProtoSerializer::new(database_id.clone()),
        ));
        let local_store = Arc::new(LocalStore::new(
            Arc::new(MemoryPersistence::new()),
            database_id,
            LruParams::disabled(),
            User::unauthenticated(),
        ));
        let queue = AsyncQueue::new();
        let remote_store = RemoteStore::new(local_store, datastore, queue.clone(), RetrySettings::default());
        let syncer = Arc::new(RecordingSyncer::default());
        let weak: Weak<dyn RemoteSyncer> = Arc::downgrade(&syncer) as Weak<dyn RemoteSyncer>;
        remote_store.set_syncer(weak);
        Fixture {
            queue,
            remote_store,
            syncer,
            server: MultiplexedConnection::new(server),
        }
    }

    async fn request(stream: &MultiplexedStream) -> JsonValue {
        let payload = runtime::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out")
            .unwrap()
            .unwrap();
        serde_json::from_slice(&payload).unwrap()
    }

    async fn settle(queue: &AsyncQueue) {
        for _ in 0..5 {
            runtime::sleep(Duration::from_millis(10)).await;
            queue.drain().await.unwrap();
        }
    }

    #[tokio::test]
    async fn secondary_clients_never_open_streams() {
        let fixture = fixture();
        let target = TargetData::new(Query::collection("rooms").unwrap(), 2, TargetPurpose::Listen, 1);
        let store = fixture.remote_store.clone();
        fixture
            .queue
            .enqueue(async move { store.listen(target).await })
            .await
            .unwrap();
        settle(&fixture.queue).await;
        let accepted = runtime::timeout(Duration::from_millis(50), fixture.server.accept()).await;
        assert!(accepted.is_none());
    }

    #[tokio::test]
    async fn global_snapshot_raises_event_and_goes_online() {
        let fixture = fixture();
        let store = fixture.remote_store.clone();
        let target = TargetData::new(Query::collection("rooms").unwrap(), 2, TargetPurpose::Listen, 1);
        fixture
            .queue
            .enqueue(async move {
                store.apply_primary_state(true).await?;
                store.listen(target).await
            })
            .await
            .unwrap();

        let stream = fixture.server.accept().await.unwrap().stream;
        let add = request(&stream).await;
        assert_eq!(add["addTarget"]["targetId"], json!(2));

        for message in [
            json!({"targetChange": {"targetChangeType": "ADD", "targetIds": [2]}}),
            json!({"targetChange": {"targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "AQI="}}),
            json!({"targetChange": {"readTime": "2024-01-01T00:00:00Z"}}),
        ] {
            stream.send(serde_json::to_vec(&message).unwrap()).await.unwrap();
        }
        settle(&fixture.queue).await;

        let events = fixture.syncer.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].target_changes[&2].current);
        assert_eq!(fixture.remote_store.online_state(), OnlineState::Online);
        let listen_targets = targets(&fixture.remote_store.inner.listen_targets);
        assert_eq!(listen_targets[&2].resume_token, vec![1, 2]);
    }

    #[tokio::test]
    async fn removed_target_with_cause_rejects_listen() {
        let fixture = fixture();
        let store = fixture.remote_store.clone();
        let target = TargetData::new(Query::collection("secret").unwrap(), 4, TargetPurpose::Listen, 1);
        fixture
            .queue
            .enqueue(async move {
                store.apply_primary_state(true).await?;
                store.listen(target).await
            })
            .await
            .unwrap();
        let stream = fixture.server.accept().await.unwrap().stream;
        let _ = request(&stream).await;
        let removal = json!({"targetChange": {
            "targetChangeType": "REMOVE",
            "targetIds": [4],
            "cause": {"code": 7, "message": "denied"}
        }});
        stream.send(serde_json::to_vec(&removal).unwrap()).await.unwrap();
        settle(&fixture.queue).await;
        assert_eq!(*fixture.syncer.rejected.lock().unwrap(), vec![4]);
        assert!(fixture.remote_store.listen_target_ids().is_empty());
    }
}
