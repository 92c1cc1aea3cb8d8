use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::auth::{CredentialsProvider, User};
use crate::firestore::api::settings::{CommitResolution, FirestoreSettings};
use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::core::event_manager::{EventManager, ListenOptions, QueryListener, ViewSnapshotObserver};
use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::error::{cancelled, failed_precondition, FirestoreResult};
use crate::firestore::local::lease::LEASE_REFRESH_INTERVAL;
use crate::firestore::local::{
    clear_persistence, open_persistence, LeaseCoordinator, LocalStore, LruParams, NamedQuery, PersistenceMode,
};
use crate::firestore::model::{DatabaseId, Document, DocumentKey, Mutation, Timestamp};
use crate::firestore::remote::{
    Datastore, JsonProtoSerializer, MultiplexedConnection, OnlineState, RemoteStore, StreamTransport,
};
use crate::firestore::LOGGER;
use crate::platform::runtime;

const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
const REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);
const CLIENT_ID_LENGTH: usize = 20;

/// Owns every engine component and runs all work on one [`AsyncQueue`].
///
/// Built by [`Firestore`](crate::firestore::Firestore); the public handle
/// forwards to it.
pub struct FirestoreClient {
    queue: AsyncQueue,
    database_id: DatabaseId,
    persistence_mode: PersistenceMode,
    commit_resolution: CommitResolution,
    credentials: Arc<dyn CredentialsProvider>,
    coordinator: LeaseCoordinator,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    event_manager: Arc<EventManager>,
    sync_engine: Arc<SyncEngine>,
    datastore: Arc<Datastore>,
    in_foreground: AtomicBool,
    terminated: AtomicBool,
    last_change_counter: Mutex<Option<u64>>,
    timers: Mutex<Vec<DelayedOperation>>,
}

impl FirestoreClient {
    /// Opens persistence, takes part in the lease election and starts the
    /// background timers. Fails when another client holds an exclusive lease
    /// on the same store.
    pub async fn start(
        settings: &FirestoreSettings,
        database_id: DatabaseId,
        credentials: Arc<dyn CredentialsProvider>,
        transport: Arc<dyn StreamTransport>,
    ) -> FirestoreResult<Arc<Self>> {
        let persistence = open_persistence(
            &settings.persistence,
            &database_id,
            settings.persistence_fallback.as_ref(),
        );
        let client_id = settings.client_id.clone().unwrap_or_else(generate_client_id);
        LOGGER.debug(format!("starting client {client_id} for {}", database_id.project_id()));

        let local_store = Arc::new(LocalStore::new(
            persistence,
            database_id.clone(),
            LruParams::with_cache_size(settings.cache_size_bytes),
            credentials.current_user(),
        ));
        let datastore = Arc::new(Datastore::new(
            Arc::new(MultiplexedConnection::new(transport)),
            Arc::clone(&credentials),
            JsonProtoSerializer::new(database_id.clone()),
        ));
        let queue = AsyncQueue::new();
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            Arc::clone(&datastore),
            queue.clone(),
            settings.stream_retry.clone(),
        );
        let coordinator = LeaseCoordinator::new(client_id, settings.multi_tab);
        let event_manager = Arc::new(EventManager::new());
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            Arc::clone(&event_manager) as Arc<dyn SyncEngineListener>,
            Some(coordinator.clone()),
            settings.max_concurrent_limbo_resolutions,
        );

        let client = Arc::new(Self {
            queue,
            database_id,
            persistence_mode: settings.persistence.clone(),
            commit_resolution: settings.commit_resolution,
            credentials,
            coordinator,
            local_store,
            remote_store,
            event_manager,
            sync_engine,
            datastore,
            in_foreground: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            last_change_counter: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
        });

        let initial = Arc::clone(&client);
        client.queue.enqueue(async move { initial.refresh_lease().await }).await?;
        client.install_credential_listener();
        client.schedule_lease_refresh();
        client.schedule_garbage_collection(INITIAL_GC_DELAY);
        Ok(client)
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn client_id(&self) -> &str {
        self.coordinator.client_id()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn online_state(&self) -> OnlineState {
        self.remote_store.online_state()
    }

    pub fn is_primary(&self) -> bool {
        self.sync_engine.is_primary()
    }

    /// Registers `observer` for `query`. The first snapshot is delivered
    /// from the cache before this returns.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: ViewSnapshotObserver,
    ) -> FirestoreResult<Arc<QueryListener>> {
        self.verify_not_terminated()?;
        let listener = QueryListener::new(query, options, observer);
        let event_manager = Arc::clone(&self.event_manager);
        let sync_engine = Arc::clone(&self.sync_engine);
        let registered = Arc::clone(&listener);
        self.queue
            .enqueue(async move {
                event_manager.listen(sync_engine.as_ref(), registered).await;
                Ok(())
            })
            .await?;
        Ok(listener)
    }

    /// Removes `listener`. Safe to call from drop glue: the work is queued,
    /// not awaited.
    pub fn unlisten(&self, listener: Arc<QueryListener>) {
        let event_manager = Arc::clone(&self.event_manager);
        let sync_engine = Arc::clone(&self.sync_engine);
        self.queue.enqueue_and_forget(async move {
            if let Err(err) = event_manager.unlisten(sync_engine.as_ref(), &listener).await {
                LOGGER.warn(format!("failed to stop listening: {err}"));
            }
        });
    }

    /// Queues `mutations` as one atomic batch. Resolves according to the
    /// configured [`CommitResolution`].
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let sync_engine = Arc::clone(&self.sync_engine);
        let (batch_id, receiver) = self
            .queue
            .enqueue(async move { sync_engine.write(mutations).await })
            .await?;
        if self.commit_resolution == CommitResolution::OnLocalWrite {
            LOGGER.debug(format!("batch {batch_id} queued; not waiting for acknowledgement"));
            return Ok(());
        }
        receiver
            .recv()
            .await
            .unwrap_or_else(|_| Err(cancelled("the client was terminated before the write completed")))
    }

    /// Resolves once every write queued so far is acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let sync_engine = Arc::clone(&self.sync_engine);
        let receiver = self
            .queue
            .enqueue(async move { sync_engine.register_pending_writes_callback() })
            .await?;
        receiver
            .recv()
            .await
            .unwrap_or_else(|_| Err(cancelled("the client was terminated before writes completed")))
    }

    /// Reads one document from the local cache, including pending writes.
    pub async fn get_document_from_cache(&self, key: DocumentKey) -> FirestoreResult<Document> {
        self.verify_not_terminated()?;
        let local_store = Arc::clone(&self.local_store);
        self.queue.enqueue(async move { local_store.read_document(&key) }).await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let remote_store = self.remote_store.clone();
        self.queue.enqueue(async move { remote_store.enable_network().await }).await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let remote_store = self.remote_store.clone();
        self.queue.enqueue(async move { remote_store.disable_network().await }).await
    }

    /// Reports whether the embedding application is visible. A background
    /// client yields the lease to a foreground one.
    pub async fn set_in_foreground(&self, in_foreground: bool) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        self.in_foreground.store(in_foreground, Ordering::SeqCst);
        let local_store = Arc::clone(&self.local_store);
        let coordinator = self.coordinator.clone();
        self.queue
            .enqueue(async move { local_store.set_in_foreground(&coordinator, in_foreground, runtime::now_millis()) })
            .await
    }

    pub async fn save_named_query(&self, name: impl Into<String>, query: Query, read_time: Timestamp) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let named = NamedQuery {
            name: name.into(),
            query,
            read_time,
        };
        let local_store = Arc::clone(&self.local_store);
        self.queue.enqueue(async move { local_store.save_named_query(&named) }).await
    }

    pub async fn get_named_query(&self, name: impl Into<String>) -> FirestoreResult<Option<NamedQuery>> {
        self.verify_not_terminated()?;
        let name = name.into();
        let local_store = Arc::clone(&self.local_store);
        self.queue.enqueue(async move { local_store.get_named_query(&name) }).await
    }

    /// Stops the streams, gives up the lease and closes persistence. Every
    /// later call fails. Idempotent.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        LOGGER.debug(format!("terminating client {}", self.client_id()));
        for timer in self.timers().drain(..) {
            timer.cancel();
        }
        self.credentials.remove_change_listener();
        let remote_store = self.remote_store.clone();
        let local_store = Arc::clone(&self.local_store);
        let datastore = Arc::clone(&self.datastore);
        let coordinator = self.coordinator.clone();
        self.queue
            .enqueue_and_initiate_shutdown(async move {
                remote_store.shutdown().await;
                datastore.terminate();
                if let Err(err) = local_store.release_lease(&coordinator) {
                    LOGGER.warn(format!("failed to release the primary lease: {err}"));
                }
                local_store.shutdown()
            })
            .await
    }

    /// Deletes the durable cache. Only allowed once terminated.
    pub fn clear_persistence(&self) -> FirestoreResult<()> {
        if !self.is_terminated() {
            return Err(failed_precondition(
                "persistence can only be cleared before the client starts or after it is terminated",
            ));
        }
        clear_persistence(&self.persistence_mode)
    }

    /// Runs a lease refresh now instead of waiting for the timer.
    pub async fn run_lease_refresh(self: &Arc<Self>) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let client = Arc::clone(self);
        self.queue.enqueue(async move { client.refresh_lease().await }).await
    }

    /// Renews the lease and this client's metadata row. A change of role is
    /// applied to the sync engine, and a moved change counter means another
    /// client wrote to the shared store.
    async fn refresh_lease(&self) -> FirestoreResult<()> {
        let in_foreground = self.in_foreground.load(Ordering::SeqCst);
        let refresh = self
            .local_store
            .refresh_lease(&self.coordinator, runtime::now_millis(), in_foreground)?;
        let was_primary = self.sync_engine.is_primary();
        self.sync_engine.apply_primary_state(refresh.is_primary).await?;

        let counter_moved = {
            let mut last = self.last_change_counter.lock().unwrap_or_else(PoisonError::into_inner);
            let moved = last.map_or(false, |previous| previous != refresh.change_counter);
            *last = Some(refresh.change_counter);
            moved
        };
        // Becoming primary already synchronizes.
        if counter_moved && (was_primary || !refresh.is_primary) {
            self.sync_engine.synchronize_with_persisted_state().await?;
        }
        Ok(())
    }

    fn schedule_lease_refresh(self: &Arc<Self>) {
        let client = Arc::downgrade(self);
        let timer = self
            .queue
            .enqueue_after_delay(TimerId::ClientMetadataRefresh, LEASE_REFRESH_INTERVAL, move || async move {
                let Some(client) = client.upgrade() else {
                    return;
                };
                if client.is_terminated() {
                    return;
                }
                if let Err(err) = client.refresh_lease().await {
                    LOGGER.warn(format!("lease refresh failed: {err}"));
                }
                client.schedule_lease_refresh();
            });
        self.track_timer(timer);
    }

    fn schedule_garbage_collection(self: &Arc<Self>, delay: Duration) {
        let client = Arc::downgrade(self);
        let timer = self
            .queue
            .enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || async move {
                let Some(client) = client.upgrade() else {
                    return;
                };
                if client.is_terminated() {
                    return;
                }
                // Secondaries leave collection to the primary.
                if client.sync_engine.is_primary() {
                    match client.local_store.collect_garbage() {
                        Ok(results) if results.did_run => LOGGER.debug(format!(
                            "garbage collection removed {} targets and {} documents",
                            results.targets_removed, results.documents_removed
                        )),
                        Ok(_) => {}
                        Err(err) => LOGGER.warn(format!("garbage collection failed: {err}")),
                    }
                }
                client.schedule_garbage_collection(REGULAR_GC_DELAY);
            });
        self.track_timer(timer);
    }

    fn install_credential_listener(self: &Arc<Self>) {
        let client: Weak<Self> = Arc::downgrade(self);
        self.credentials.set_change_listener(Arc::new(move |user: User| {
            let Some(client) = client.upgrade() else {
                return;
            };
            let sync_engine = Arc::clone(&client.sync_engine);
            client.queue.enqueue_and_forget(async move {
                if let Err(err) = sync_engine.handle_credential_change(user).await {
                    LOGGER.error(format!("failed to switch users: {err}"));
                }
            });
        }));
    }

    fn track_timer(&self, timer: DelayedOperation) {
        let mut timers = self.timers();
        timers.retain(|existing| !existing.is_cancelled() && existing.timer_id() != timer.timer_id());
        timers.push(timer);
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, Vec<DelayedOperation>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Err(failed_precondition("the client has already been terminated"));
        }
        Ok(())
    }
}

fn generate_client_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(CLIENT_ID_LENGTH)
        .collect()
}
