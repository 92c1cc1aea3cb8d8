use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;

use crate::auth::User;
use crate::firestore::core::event_manager::QueryTargetHandler;
use crate::firestore::core::query::Query;
use crate::firestore::core::view::{ChangeType, LimboDocumentChange, View, ViewSnapshot};
use crate::firestore::error::{assertion_failed, cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{LeaseCoordinator, LocalStore, LocalViewChanges, TargetData, TargetIdGenerator, TargetPurpose};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, DocumentMap, Mutation, MutationBatchResult, TargetId, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::online_state::OnlineState;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
use crate::firestore::LOGGER;
use crate::platform::runtime;

/// Default cap on limbo documents resolved at once.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Receives what the sync engine computed for the application layer.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);
    /// The target behind `query` failed; its listeners are dropped.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);
    fn on_online_state_change(&self, online_state: OnlineState);
}

/// Resolves once when the batch is acknowledged, rejected or abandoned.
pub type WriteReceiver = async_channel::Receiver<FirestoreResult<()>>;
type WriteSender = async_channel::Sender<FirestoreResult<()>>;

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the resolution target has reported the document. Needed to
    /// answer `remote_keys_for_target` for existence filters.
    received_document: bool,
}

struct SyncEngineState {
    query_views: HashMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<String>>,
    /// Targets kept open on behalf of other clients sharing the store.
    served_targets: BTreeSet<TargetId>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    limbo_document_refs: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    limbo_target_ids: TargetIdGenerator,
    mutation_callbacks: BTreeMap<BatchId, WriteSender>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteSender>>,
    online_state: OnlineState,
    is_primary: bool,
}

/// Remote listen changes decided under the state lock and carried out after
/// it is released.
#[derive(Default)]
struct RemoteActions {
    listen: Vec<TargetData>,
    unlisten: Vec<TargetId>,
}

/// Ties views to targets, tracks limbo documents and routes write results
/// to their callers.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    listener: Arc<dyn SyncEngineListener>,
    coordinator: Option<LeaseCoordinator>,
    max_concurrent_limbo_resolutions: usize,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        listener: Arc<dyn SyncEngineListener>,
        coordinator: Option<LeaseCoordinator>,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            local_store,
            remote_store,
            listener,
            coordinator,
            max_concurrent_limbo_resolutions: max_concurrent_limbo_resolutions.max(1),
            state: Mutex::new(SyncEngineState {
                query_views: HashMap::new(),
                queries_by_target: BTreeMap::new(),
                served_targets: BTreeSet::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: BTreeMap::new(),
                limbo_target_ids: TargetIdGenerator::for_sync_engine(),
                mutation_callbacks: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
                online_state: OnlineState::Unknown,
                is_primary: false,
            }),
        });
        let syncer: Weak<dyn RemoteSyncer> = Arc::downgrade(&engine) as Weak<dyn RemoteSyncer>;
        engine.remote_store.set_syncer(syncer);
        engine
    }

    pub fn is_primary(&self) -> bool {
        self.state().is_primary
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    /// Starts a view for `query` and returns its first snapshot, computed
    /// from the cache.
    pub async fn listen(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        if self.state().query_views.contains_key(&canonical_id) {
            return Err(assertion_failed(format!("query {canonical_id} is already listened to")));
        }
        let target = self.local_store.allocate_target(query)?;
        let (snapshot, actions) = {
            let mut state = self.state();
            let current = !state.is_primary && !target.snapshot_version.is_min();
            let mut actions = RemoteActions::default();
            let snapshot =
                self.initialize_view_and_compute_snapshot(&mut state, query, target.target_id, current, &mut actions)?;
            state.served_targets.remove(&target.target_id);
            (snapshot, actions)
        };
        self.remote_store.listen(target).await?;
        self.execute(actions).await?;
        Ok(snapshot)
    }

    /// Drops the view for `query`. The target is released once no query in
    /// this client uses it and the backend listen is kept while another
    /// client still needs it.
    pub async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let (target_id, actions) = {
            let mut state = self.state();
            let Some(query_view) = state.query_views.remove(&canonical_id) else {
                return Ok(());
            };
            let target_id = query_view.target_id;
            let remaining = state
                .queries_by_target
                .get_mut(&target_id)
                .map(|queries| {
                    queries.retain(|id| id != &canonical_id);
                    queries.len()
                })
                .unwrap_or(0);
            if remaining > 0 {
                return Ok(());
            }
            state.queries_by_target.remove(&target_id);
            let mut actions = RemoteActions::default();
            self.remove_limbo_refs_for_target(&mut state, target_id, &mut actions);
            (target_id, actions)
        };

        let active_elsewhere = match &self.coordinator {
            Some(coordinator) => {
                self.local_store
                    .is_target_active_elsewhere(coordinator, target_id, runtime::now_millis())?
            }
            None => false,
        };
        if active_elsewhere && self.is_primary() {
            log::debug!("target {target_id} stays open for another client");
            self.state().served_targets.insert(target_id);
        } else {
            self.local_store.release_target(target_id, true)?;
            self.remote_store.unlisten(target_id).await?;
        }
        self.execute(actions).await
    }

    /// Queues `mutations` as one batch, raises the optimistic snapshots and
    /// hands the batch to the write pipeline.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<(BatchId, WriteReceiver)> {
        let result = self.local_store.write_locally(mutations, Timestamp::now())?;
        let (sender, receiver) = async_channel::bounded(1);
        self.state().mutation_callbacks.insert(result.batch_id, sender);
        self.emit_new_snaps_and_notify_local_store(&result.changes, None).await?;
        self.remote_store.fill_write_pipeline().await?;
        Ok((result.batch_id, receiver))
    }

    /// Resolves once every batch queued so far is acknowledged or rejected.
    pub fn register_pending_writes_callback(&self) -> FirestoreResult<WriteReceiver> {
        let (sender, receiver) = async_channel::bounded(1);
        let highest = self.local_store.highest_unacknowledged_batch_id()?;
        if highest == BATCH_ID_UNKNOWN {
            let _ = sender.try_send(Ok(()));
        } else {
            self.state()
                .pending_writes_callbacks
                .entry(highest)
                .or_default()
                .push(sender);
        }
        Ok(receiver)
    }

    /// Switches to `user`'s mutation queue, re-runs the views and restarts
    /// the streams with the new credentials.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        if self.local_store.user() == user {
            return Ok(());
        }
        LOGGER.debug(format!("user changed to {user}"));
        let result = self.local_store.handle_user_change(user)?;
        {
            let mut state = self.state();
            let error = cancelled("write abandoned because the user changed");
            for (_, sender) in std::mem::take(&mut state.mutation_callbacks) {
                let _ = sender.try_send(Err(error.clone()));
            }
            for (_, senders) in std::mem::take(&mut state.pending_writes_callbacks) {
                for sender in senders {
                    let _ = sender.try_send(Err(error.clone()));
                }
            }
        }
        self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)
            .await?;
        self.remote_store.handle_credential_change().await
    }

    /// Only the primary client resolves limbo documents and talks to the
    /// backend.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        {
            let mut state = self.state();
            if state.is_primary == is_primary {
                return Ok(());
            }
            state.is_primary = is_primary;
        }
        LOGGER.debug(format!("client is now {}", if is_primary { "primary" } else { "secondary" }));
        if is_primary {
            self.remote_store.apply_primary_state(true).await?;
            self.synchronize_with_persisted_state().await
        } else {
            let actions = {
                let mut state = self.state();
                let mut actions = RemoteActions::default();
                state.enqueued_limbo_resolutions.clear();
                state.limbo_document_refs.clear();
                state.active_limbo_targets_by_key.clear();
                actions.unlisten = std::mem::take(&mut state.active_limbo_resolutions_by_target)
                    .into_keys()
                    .collect();
                actions.unlisten.extend(std::mem::take(&mut state.served_targets));
                actions
            };
            self.execute(actions).await?;
            self.remote_store.apply_primary_state(false).await
        }
    }

    /// Re-reads every view from the shared cache after another client
    /// changed it. The primary also starts serving targets other clients
    /// listen to and picks up their queued writes.
    pub async fn synchronize_with_persisted_state(&self) -> FirestoreResult<()> {
        self.resolve_finished_write_callbacks()?;

        let (snapshots, view_changes, mut actions, is_primary) = {
            let mut state = self.state();
            let is_primary = state.is_primary;
            let mut snapshots = Vec::new();
            let mut view_changes = Vec::new();
            let mut limbo_updates = Vec::new();
            for query_view in state.query_views.values_mut() {
                let result = self.local_store.execute_query(&query_view.query)?;
                let current = if is_primary {
                    query_view.view.is_current()
                } else {
                    self.local_store
                        .get_target_data(&query_view.query)?
                        .map(|target| !target.snapshot_version.is_min())
                        .unwrap_or(false)
                };
                let view_change = query_view.view.synchronize_with_persisted_state(
                    &result.documents,
                    result.remote_keys,
                    current,
                    is_primary,
                );
                limbo_updates.push((query_view.target_id, view_change.limbo_changes));
                if let Some(snapshot) = view_change.snapshot {
                    view_changes.push(local_view_changes(query_view.target_id, &snapshot));
                    snapshots.push(snapshot);
                }
            }
            let mut actions = RemoteActions::default();
            for (target_id, changes) in limbo_updates {
                self.update_tracked_limbos(&mut state, target_id, changes, &mut actions);
            }
            actions.listen.extend(self.pump_enqueued_limbo_resolutions(&mut state));
            (snapshots, view_changes, actions, is_primary)
        };
        self.listener.on_watch_change(snapshots);
        self.local_store.notify_local_view_changes(&view_changes);

        if is_primary {
            self.serve_other_clients(&mut actions)?;
        }
        self.execute(actions).await?;
        if is_primary {
            self.remote_store.fill_write_pipeline().await?;
        }
        Ok(())
    }

    /// Keys of documents waiting for, or undergoing, limbo resolution.
    pub fn limbo_documents(&self) -> (Vec<DocumentKey>, BTreeSet<DocumentKey>) {
        let state = self.state();
        (
            state.enqueued_limbo_resolutions.iter().cloned().collect(),
            state.active_limbo_targets_by_key.keys().cloned().collect(),
        )
    }

    fn serve_other_clients(&self, actions: &mut RemoteActions) -> FirestoreResult<()> {
        let Some(coordinator) = &self.coordinator else {
            return Ok(());
        };
        let others = self
            .local_store
            .targets_of_other_clients(coordinator, runtime::now_millis())?;
        let other_ids: BTreeSet<TargetId> = others.iter().map(|target| target.target_id).collect();
        let mut state = self.state();
        for target in others {
            let id = target.target_id;
            if state.queries_by_target.contains_key(&id) || state.served_targets.contains(&id) {
                continue;
            }
            state.served_targets.insert(id);
            self.local_store.register_target(target.clone())?;
            actions.listen.push(target);
        }
        let stale: Vec<TargetId> = state
            .served_targets
            .iter()
            .filter(|id| !other_ids.contains(id))
            .copied()
            .collect();
        for id in stale {
            state.served_targets.remove(&id);
            self.local_store.release_target(id, true)?;
            actions.unlisten.push(id);
        }
        Ok(())
    }

    /// Another client acknowledged or rejected batches this client wrote;
    /// anything no longer queued has finished. The primary leaves the
    /// outcome of each such batch in the store.
    fn resolve_finished_write_callbacks(&self) -> FirestoreResult<()> {
        let first_pending = self
            .local_store
            .next_mutation_batch(BATCH_ID_UNKNOWN)?
            .map(|batch| batch.batch_id);
        let finished = |batch_id: &BatchId| first_pending.map_or(true, |first| *batch_id < first);
        let (writes, waiters) = {
            let mut state = self.state();
            let done: Vec<BatchId> = state.mutation_callbacks.keys().filter(|id| finished(id)).copied().collect();
            let writes: Vec<(BatchId, WriteSender)> = done
                .into_iter()
                .filter_map(|batch_id| state.mutation_callbacks.remove(&batch_id).map(|sender| (batch_id, sender)))
                .collect();
            let done: Vec<BatchId> = state
                .pending_writes_callbacks
                .keys()
                .filter(|id| finished(id))
                .copied()
                .collect();
            let waiters: Vec<WriteSender> = done
                .into_iter()
                .flat_map(|batch_id| state.pending_writes_callbacks.remove(&batch_id).unwrap_or_default())
                .collect();
            (writes, waiters)
        };
        for (batch_id, sender) in writes {
            let outcome = match self.local_store.take_mutation_outcome(batch_id)? {
                Some(outcome) => outcome.into_result(),
                None => {
                    log::debug!("batch {batch_id} finished elsewhere without a recorded outcome");
                    Ok(())
                }
            };
            let _ = sender.try_send(outcome);
        }
        for sender in waiters {
            let _ = sender.try_send(Ok(()));
        }
        Ok(())
    }

    fn initialize_view_and_compute_snapshot(
        &self,
        state: &mut SyncEngineState,
        query: &Query,
        target_id: TargetId,
        current: bool,
        actions: &mut RemoteActions,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        let synthesized = TargetChange {
            current: current && state.online_state != OnlineState::Offline,
            ..TargetChange::default()
        };
        let view_change = view.apply_changes(doc_changes, state.is_primary, Some(&synthesized));
        self.update_tracked_limbos(state, target_id, view_change.limbo_changes, actions);

        let canonical_id = query.canonical_id();
        state.query_views.insert(
            canonical_id.clone(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        state.queries_by_target.entry(target_id).or_default().push(canonical_id);
        view_change
            .snapshot
            .ok_or_else(|| internal_error("a new view produced no initial snapshot"))
    }

    /// Recomputes every view against `changes` and raises the snapshots.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: &DocumentMap,
        event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let (snapshots, view_changes, actions) = {
            let mut state = self.state();
            let is_primary = state.is_primary;
            let mut snapshots = Vec::new();
            let mut view_changes = Vec::new();
            let mut limbo_updates = Vec::new();
            for query_view in state.query_views.values_mut() {
                let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
                if doc_changes.needs_refill {
                    let documents = self.local_store.execute_query(&query_view.query)?.documents;
                    doc_changes = query_view.view.compute_doc_changes(&documents, Some(doc_changes));
                }
                let target_change = event.and_then(|event| event.target_changes.get(&query_view.target_id));
                let view_change = query_view.view.apply_changes(doc_changes, is_primary, target_change);
                limbo_updates.push((query_view.target_id, view_change.limbo_changes));
                if let Some(snapshot) = view_change.snapshot {
                    view_changes.push(local_view_changes(query_view.target_id, &snapshot));
                    snapshots.push(snapshot);
                }
            }
            let mut actions = RemoteActions::default();
            for (target_id, changes) in limbo_updates {
                self.update_tracked_limbos(&mut state, target_id, changes, &mut actions);
            }
            actions.listen.extend(self.pump_enqueued_limbo_resolutions(&mut state));
            (snapshots, view_changes, actions)
        };
        self.listener.on_watch_change(snapshots);
        self.local_store.notify_local_view_changes(&view_changes);
        self.execute(actions).await
    }

    fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        changes: Vec<LimboDocumentChange>,
        actions: &mut RemoteActions,
    ) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state
                        .limbo_document_refs
                        .entry(key.clone())
                        .or_default()
                        .insert(target_id);
                    if !state.active_limbo_targets_by_key.contains_key(&key)
                        && !state.enqueued_limbo_resolutions.contains(&key)
                    {
                        log::debug!("new document in limbo: {key}");
                        state.enqueued_limbo_resolutions.push_back(key);
                    }
                }
                LimboDocumentChange::Removed(key) => {
                    let unreferenced = match state.limbo_document_refs.get_mut(&key) {
                        Some(targets) => {
                            targets.remove(&target_id);
                            targets.is_empty()
                        }
                        None => false,
                    };
                    if unreferenced {
                        state.limbo_document_refs.remove(&key);
                        Self::remove_limbo_target(state, &key, actions);
                    }
                }
            }
        }
    }

    fn remove_limbo_refs_for_target(&self, state: &mut SyncEngineState, target_id: TargetId, actions: &mut RemoteActions) {
        let keys: Vec<DocumentKey> = state
            .limbo_document_refs
            .iter()
            .filter(|(_, targets)| targets.contains(&target_id))
            .map(|(key, _)| key.clone())
            .collect();
        let changes = keys.into_iter().map(LimboDocumentChange::Removed).collect();
        self.update_tracked_limbos(state, target_id, changes, actions);
    }

    fn remove_limbo_target(state: &mut SyncEngineState, key: &DocumentKey, actions: &mut RemoteActions) {
        state.enqueued_limbo_resolutions.retain(|queued| queued != key);
        if let Some(target_id) = state.active_limbo_targets_by_key.remove(key) {
            state.active_limbo_resolutions_by_target.remove(&target_id);
            actions.unlisten.push(target_id);
        }
    }

    /// Starts queued limbo resolutions up to the concurrency cap, oldest
    /// first.
    fn pump_enqueued_limbo_resolutions(&self, state: &mut SyncEngineState) -> Vec<TargetData> {
        let mut started = Vec::new();
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = state.limbo_target_ids.next_id();
            state.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state.active_limbo_targets_by_key.insert(key.clone(), target_id);
            started.push(TargetData::new(
                Query::document(&key),
                target_id,
                TargetPurpose::LimboResolution,
                0,
            ));
        }
        started
    }

    async fn execute(&self, actions: RemoteActions) -> FirestoreResult<()> {
        for target_id in actions.unlisten {
            self.remote_store.unlisten(target_id).await?;
            self.local_store.release_target(target_id, false)?;
        }
        for target in actions.listen {
            if target.purpose == TargetPurpose::LimboResolution {
                self.local_store.register_target(target.clone())?;
            }
            self.remote_store.listen(target).await?;
        }
        Ok(())
    }

    async fn apply_remote_event_internal(&self, event: RemoteEvent) -> FirestoreResult<()> {
        {
            let mut state = self.state();
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                let touched = change.added_documents.len()
                    + change.modified_documents.len()
                    + change.removed_documents.len();
                if touched > 1 {
                    return Err(assertion_failed("limbo resolution matched more than one document"));
                }
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    if !resolution.received_document {
                        return Err(assertion_failed("limbo document modified before it was added"));
                    }
                } else if !change.removed_documents.is_empty() {
                    resolution.received_document = false;
                }
            }
        }
        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&event)).await
    }

    async fn reject_listen_internal(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let limbo_key = {
            let mut state = self.state();
            match state.active_limbo_resolutions_by_target.remove(&target_id) {
                Some(resolution) => {
                    state.active_limbo_targets_by_key.remove(&resolution.key);
                    Some(resolution.key)
                }
                None => None,
            }
        };

        if let Some(key) = limbo_key {
            // Treat a document we may not read as deleted.
            LOGGER.debug(format!("limbo resolution for {key} failed: {error}"));
            self.local_store.release_target(target_id, false)?;
            let started = self.pump_enqueued_limbo_resolutions(&mut self.state());
            self.execute(RemoteActions {
                listen: started,
                unlisten: Vec::new(),
            })
            .await?;
            let mut event = RemoteEvent {
                snapshot_version: Timestamp::min(),
                ..RemoteEvent::default()
            };
            event
                .document_updates
                .insert(key.clone(), Document::new_no_document(key.clone(), Timestamp::min()));
            event.resolved_limbo_documents.insert(key);
            return self.apply_remote_event_internal(event).await;
        }

        let (queries, actions) = {
            let mut state = self.state();
            let canonical_ids = state.queries_by_target.remove(&target_id).unwrap_or_default();
            let queries: Vec<Query> = canonical_ids
                .iter()
                .filter_map(|id| state.query_views.remove(id))
                .map(|query_view| query_view.query)
                .collect();
            let mut actions = RemoteActions::default();
            self.remove_limbo_refs_for_target(&mut state, target_id, &mut actions);
            (queries, actions)
        };
        self.local_store.release_target(target_id, false)?;
        for query in &queries {
            LOGGER.warn(format!("listen for {} rejected: {error}", query.canonical_id()));
            self.listener.on_watch_error(query, error.clone());
        }
        self.execute(actions).await
    }

    async fn apply_successful_write_internal(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self
            .local_store
            .acknowledge_batch(&result, self.queued_by_other_client(batch_id))?;
        self.resolve_write(batch_id, Ok(()));
        self.emit_new_snaps_and_notify_local_store(&changes, None).await
    }

    async fn reject_failed_write_internal(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self
            .local_store
            .reject_batch(batch_id, &error, self.queued_by_other_client(batch_id))?;
        self.resolve_write(batch_id, Err(error));
        self.emit_new_snaps_and_notify_local_store(&changes, None).await
    }

    /// Whether the caller waiting for `batch_id` lives in another client
    /// sharing the store.
    fn queued_by_other_client(&self, batch_id: BatchId) -> bool {
        self.coordinator
            .as_ref()
            .is_some_and(LeaseCoordinator::allows_tab_synchronization)
            && !self.state().mutation_callbacks.contains_key(&batch_id)
    }

    fn resolve_write(&self, batch_id: BatchId, outcome: FirestoreResult<()>) {
        let mut state = self.state();
        if let Some(sender) = state.mutation_callbacks.remove(&batch_id) {
            let _ = sender.try_send(outcome);
        }
        // Batches finish in order, so every waiter up to this batch is done.
        let done: Vec<BatchId> = state
            .pending_writes_callbacks
            .range(..=batch_id)
            .map(|(id, _)| *id)
            .collect();
        for id in done {
            for sender in state.pending_writes_callbacks.remove(&id).unwrap_or_default() {
                let _ = sender.try_send(Ok(()));
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..LocalViewChanges::default()
    };
    for change in &snapshot.changes {
        match change.change_type {
            ChangeType::Added => {
                changes.added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                changes.removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_remote_event_internal(event))
    }

    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_listen_internal(target_id, error))
    }

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_successful_write_internal(result))
    }

    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_failed_write_internal(batch_id, error))
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = self.state();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            return if resolution.received_document {
                BTreeSet::from([resolution.key.clone()])
            } else {
                BTreeSet::new()
            };
        }
        if let Some(queries) = state.queries_by_target.get(&target_id) {
            return queries
                .iter()
                .filter_map(|id| state.query_views.get(id))
                .flat_map(|query_view| query_view.view.synced_documents().iter().cloned())
                .collect();
        }
        drop(state);
        // Served for another client; only the cache knows its keys.
        self.local_store
            .remote_document_keys(target_id)
            .unwrap_or_default()
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        let snapshots = {
            let mut state = self.state();
            state.online_state = online_state;
            state
                .query_views
                .values_mut()
                .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
                .collect::<Vec<_>>()
        };
        self.listener.on_watch_change(snapshots);
        self.listener.on_online_state_change(online_state);
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl QueryTargetHandler for SyncEngine {
    async fn listen(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        SyncEngine::listen(self, query).await
    }

    async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        SyncEngine::unlisten(self, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::EmptyCredentialsProvider;
    use crate::firestore::core::async_queue::AsyncQueue;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::{LruParams, MemoryPersistence};
    use crate::firestore::model::{DatabaseId, FieldPath, MutationResult};
    use crate::firestore::remote::datastore::{Datastore, RetrySettings};
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::firestore::value::{FirestoreValue, MapValue};

    #[derive(Default)]
    struct RecordingListener {
        snapshots: Mutex<Vec<ViewSnapshot>>,
        errors: Mutex<Vec<FirestoreErrorCode>>,
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, _query: &Query, error: FirestoreError) {
            self.errors.lock().unwrap().push(error.code);
        }

        fn on_online_state_change(&self, _online_state: OnlineState) {}
    }

    struct Fixture {
        engine: Arc<SyncEngine>,
        local_store: Arc<LocalStore>,
        listener: Arc<RecordingListener>,
        // Keeps the fake server side of the transport alive.
        _server: Arc<InMemoryTransport>,
    }

    fn fixture(max_limbo: usize) -> Fixture {
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
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            datastore,
            AsyncQueue::new(),
            RetrySettings::default(),
        );
        let listener = Arc::new(RecordingListener::default());
        let engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store,
            listener.clone(),
            None,
            max_limbo,
        );
        Fixture {
            engine,
            local_store,
            listener,
            _server: server,
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(n: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
        map
    }

    fn found(path: &str, version: i64) -> Document {
        Document::new_found(key(path), Timestamp::new(version, 0), data(1))
    }

    fn event_for(target_id: TargetId, version: i64, docs: &[Document], current: bool) -> RemoteEvent {
        let mut event = RemoteEvent {
            snapshot_version: Timestamp::new(version, 0),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            target_id,
            TargetChange {
                current,
                resume_token: vec![version as u8],
                added_documents: docs.iter().map(|doc| doc.key().clone()).collect(),
                ..TargetChange::default()
            },
        );
        for doc in docs {
            event.document_updates.insert(doc.key().clone(), doc.clone());
        }
        event
    }

    #[tokio::test]
    async fn local_write_raises_pending_snapshot_then_ack_clears_it() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS);
        let query = Query::collection("rooms").unwrap();
        let initial = fixture.engine.listen(&query).await.unwrap();
        assert!(initial.documents.is_empty());

        let mutation = Mutation::set(key("rooms/a"), data(1));
        let (batch_id, receiver) = fixture.engine.write(vec![mutation.clone()]).await.unwrap();
        {
            let snapshots = fixture.listener.snapshots.lock().unwrap();
            let last = snapshots.last().unwrap();
            assert!(last.has_pending_writes());
            assert!(last.from_cache);
        }

        let batch = crate::firestore::model::MutationBatch::new(batch_id, Timestamp::new(1, 0), vec![mutation]);
        let result = MutationBatchResult::from(
            batch,
            Timestamp::new(5, 0),
            vec![MutationResult {
                version: Timestamp::new(5, 0),
                transform_results: Vec::new(),
            }],
            Vec::new(),
        )
        .unwrap();
        fixture.engine.apply_successful_write(result).await.unwrap();
        assert!(receiver.recv().await.unwrap().is_ok());
        let snapshots = fixture.listener.snapshots.lock().unwrap();
        assert!(!snapshots.last().unwrap().has_pending_writes());
        assert!(!fixture.local_store.has_pending_writes().unwrap());
    }

    #[tokio::test]
    async fn rejected_write_rolls_back_and_fails_the_caller() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS);
        let query = Query::collection("rooms").unwrap();
        fixture.engine.listen(&query).await.unwrap();
        let (batch_id, receiver) = fixture
            .engine
            .write(vec![Mutation::set(key("rooms/a"), data(1))])
            .await
            .unwrap();
        fixture
            .engine
            .reject_failed_write(batch_id, permission_denied("no"))
            .await
            .unwrap();
        let outcome = receiver.recv().await.unwrap();
        assert_eq!(outcome.unwrap_err().code, FirestoreErrorCode::PermissionDenied);
        let snapshots = fixture.listener.snapshots.lock().unwrap();
        assert!(snapshots.last().unwrap().documents.is_empty());
    }

    #[tokio::test]
    async fn pending_writes_callback_waits_for_queued_batches() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS);
        let idle = fixture.engine.register_pending_writes_callback().unwrap();
        assert!(idle.try_recv().unwrap().is_ok());

        let (batch_id, _receiver) = fixture
            .engine
            .write(vec![Mutation::delete(key("rooms/a"))])
            .await
            .unwrap();
        let waiting = fixture.engine.register_pending_writes_callback().unwrap();
        assert!(waiting.try_recv().is_err());
        fixture
            .engine
            .reject_failed_write(batch_id, permission_denied("no"))
            .await
            .unwrap();
        assert!(waiting.try_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn limbo_resolutions_respect_the_cap() {
        let fixture = fixture(1);
        fixture.engine.apply_primary_state(true).await.unwrap();
        let query = Query::collection("rooms").unwrap();
        fixture.engine.listen(&query).await.unwrap();
        let target_id = fixture.local_store.get_target_data(&query).unwrap().unwrap().target_id;

        // Watch reports three documents, then a later snapshot drops two of
        // them from the target without saying whether they still exist.
        let docs = [found("rooms/a", 1), found("rooms/b", 1), found("rooms/c", 1)];
        fixture.engine.apply_remote_event(event_for(target_id, 1, &docs, true)).await.unwrap();
        let mut event = RemoteEvent {
            snapshot_version: Timestamp::new(2, 0),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            target_id,
            TargetChange {
                current: true,
                removed_documents: BTreeSet::from([key("rooms/b"), key("rooms/c")]),
                ..TargetChange::default()
            },
        );
        fixture.engine.apply_remote_event(event).await.unwrap();

        let (enqueued, active) = fixture.engine.limbo_documents();
        assert_eq!(active.len(), 1);
        assert_eq!(enqueued.len(), 1);
        let limbo_target = fixture
            .engine
            .remote_store()
            .listen_target_ids()
            .into_iter()
            .find(|id| id % 2 == 1)
            .unwrap();

        // The backend refuses the first resolution: the document is treated
        // as deleted and the queued one starts.
        fixture
            .engine
            .reject_listen(limbo_target, permission_denied("no"))
            .await
            .unwrap();
        let (enqueued, active) = fixture.engine.limbo_documents();
        assert!(enqueued.is_empty());
        assert_eq!(active.len(), 1);
        let snapshots = fixture.listener.snapshots.lock().unwrap();
        assert_eq!(snapshots.last().unwrap().documents.len(), 2);
    }

    #[tokio::test]
    async fn rejected_listen_reports_error() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS);
        let query = Query::collection("secret").unwrap();
        fixture.engine.listen(&query).await.unwrap();
        let target_id = fixture.local_store.get_target_data(&query).unwrap().unwrap().target_id;
        fixture
            .engine
            .reject_listen(target_id, permission_denied("no"))
            .await
            .unwrap();
        assert_eq!(
            *fixture.listener.errors.lock().unwrap(),
            vec![FirestoreErrorCode::PermissionDenied]
        );
        assert!(fixture.engine.remote_keys_for_target(target_id).is_empty());
    }

    #[tokio::test]
    async fn user_change_cancels_outstanding_writes() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS);
        let (_, receiver) = fixture
            .engine
            .write(vec![Mutation::delete(key("rooms/a"))])
            .await
            .unwrap();
        fixture
            .engine
            .handle_credential_change(User::new("alice"))
            .await
            .unwrap();
        let outcome = receiver.recv().await.unwrap();
        assert_eq!(outcome.unwrap_err().code, FirestoreErrorCode::Cancelled);
        assert!(!fixture.local_store.has_pending_writes().unwrap());
    }
}
