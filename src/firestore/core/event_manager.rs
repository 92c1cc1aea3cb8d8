use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::SyncEngineListener;
use crate::firestore::core::view::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::online_state::OnlineState;

/// Starts and stops the shared target behind a query. Called for the first
/// listener of a query and after its last one leaves.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait QueryTargetHandler: Send + Sync {
    async fn listen(&self, query: &Query) -> FirestoreResult<ViewSnapshot>;
    async fn unlisten(&self, query: &Query) -> FirestoreResult<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots that only change `has_pending_writes` or `from_cache`.
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot while online until the backend answers.
    pub wait_for_sync_when_online: bool,
}

pub type ViewSnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

struct ListenerState {
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
    errored: bool,
}

/// One application observer attached to a query.
pub struct QueryListener {
    id: u64,
    query: Query,
    options: ListenOptions,
    observer: ViewSnapshotObserver,
    state: Mutex<ListenerState>,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: ViewSnapshotObserver) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            query,
            options,
            observer,
            state: Mutex::new(ListenerState {
                raised_initial_event: false,
                snapshot: None,
                online_state: OnlineState::Unknown,
                errored: false,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Filters `snapshot` for this listener and raises it when warranted.
    /// Returns whether the observer was called.
    pub fn on_view_snapshot(&self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let mut filtered = snapshot;
            filtered
                .changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            filtered.excludes_metadata_changes = true;
            filtered
        };

        let to_raise = {
            let mut state = self.state();
            if state.errored {
                return false;
            }
            let raise = if !state.raised_initial_event {
                if self.should_raise_initial_event(&snapshot, state.online_state) {
                    state.raised_initial_event = true;
                    Some(initial_snapshot(&snapshot))
                } else {
                    None
                }
            } else if self.should_raise_event(&snapshot, state.snapshot.as_ref()) {
                Some(snapshot.clone())
            } else {
                None
            };
            state.snapshot = Some(snapshot);
            raise
        };
        match to_raise {
            Some(snapshot) => {
                (self.observer)(Ok(snapshot));
                true
            }
            None => false,
        }
    }

    /// Delivers `error` once. Nothing is raised afterwards.
    pub fn on_error(&self, error: FirestoreError) {
        {
            let mut state = self.state();
            if state.errored {
                return;
            }
            state.errored = true;
        }
        (self.observer)(Err(error));
    }

    /// Going offline may release a first snapshot held back while waiting
    /// for the backend.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let to_raise = {
            let mut state = self.state();
            state.online_state = online_state;
            match &state.snapshot {
                Some(snapshot)
                    if !state.raised_initial_event
                        && !state.errored
                        && self.should_raise_initial_event(snapshot, online_state) =>
                {
                    let initial = initial_snapshot(snapshot);
                    state.raised_initial_event = true;
                    Some(initial)
                }
                _ => None,
            }
        };
        match to_raise {
            Some(snapshot) => {
                (self.observer)(Ok(snapshot));
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is not worth showing unless we know we are
        // offline and nothing better will arrive.
        !snapshot.documents.is_empty() || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot, previous: Option<&ViewSnapshot>) -> bool {
        if !snapshot.changes.is_empty() {
            return true;
        }
        let pending_writes_changed = previous
            .map(|previous| previous.has_pending_writes() != snapshot.has_pending_writes())
            .unwrap_or(false);
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn state(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn initial_snapshot(snapshot: &ViewSnapshot) -> ViewSnapshot {
    ViewSnapshot::from_initial_documents(
        snapshot.query.clone(),
        snapshot.documents.clone(),
        snapshot.mutated_keys.clone(),
        snapshot.from_cache,
    )
}

#[derive(Default)]
struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

struct EventManagerState {
    queries: HashMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

/// Fans view snapshots out to every listener of a query, sharing one
/// target between identical queries.
pub struct EventManager {
    state: Mutex<EventManagerState>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EventManagerState {
                queries: HashMap::new(),
                online_state: OnlineState::Unknown,
            }),
        }
    }

    /// Attaches `listener`, starting a target when it is the first one for
    /// its query. Listen failures are reported to the listener.
    pub async fn listen(&self, handler: &dyn QueryTargetHandler, listener: Arc<QueryListener>) {
        let canonical_id = listener.query().canonical_id();
        let first = {
            let mut state = self.state();
            let first = !state.queries.contains_key(&canonical_id);
            if first {
                state.queries.insert(canonical_id.clone(), QueryListenersInfo::default());
            }
            first
        };

        if first {
            match handler.listen(listener.query()).await {
                Ok(snapshot) => {
                    if let Some(info) = self.state().queries.get_mut(&canonical_id) {
                        info.view_snapshot = Some(snapshot);
                    }
                }
                Err(error) => {
                    self.state().queries.remove(&canonical_id);
                    log::debug!("listen for {canonical_id} failed: {error}");
                    listener.on_error(error);
                    return;
                }
            }
        }

        let (snapshot, online_state) = {
            let mut state = self.state();
            let online_state = state.online_state;
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return;
            };
            info.listeners.push(Arc::clone(&listener));
            (info.view_snapshot.clone(), online_state)
        };
        listener.apply_online_state_change(online_state);
        if let Some(snapshot) = snapshot {
            listener.on_view_snapshot(snapshot);
        }
    }

    /// Detaches `listener`, releasing the target after the last one.
    pub async fn unlisten(&self, handler: &dyn QueryTargetHandler, listener: &QueryListener) -> FirestoreResult<()> {
        let canonical_id = listener.query().canonical_id();
        let last = {
            let mut state = self.state();
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            let before = info.listeners.len();
            info.listeners.retain(|existing| existing.id() != listener.id());
            if info.listeners.len() == before {
                return Ok(());
            }
            let last = info.listeners.is_empty();
            if last {
                state.queries.remove(&canonical_id);
            }
            last
        };
        if last {
            handler.unlisten(listener.query()).await?;
        }
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.state()
            .queries
            .values()
            .map(|info| info.listeners.len())
            .sum()
    }

    fn state(&self) -> MutexGuard<'_, EventManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let listeners = {
                let mut state = self.state();
                let Some(info) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                    continue;
                };
                info.view_snapshot = Some(snapshot.clone());
                info.listeners.clone()
            };
            for listener in listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let removed = self.state().queries.remove(&query.canonical_id());
        if let Some(info) = removed {
            for listener in info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<Arc<QueryListener>> = {
            let mut state = self.state();
            state.online_state = online_state;
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        for listener in listeners {
            listener.apply_online_state_change(online_state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::view::DocumentViewChange;
    use crate::firestore::error::permission_denied;
    use crate::firestore::model::{Document, DocumentKey, Timestamp};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHandler {
        listens: AtomicUsize,
        unlistens: AtomicUsize,
    }

    #[async_trait]
    impl QueryTargetHandler for CountingHandler {
        async fn listen(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
            self.listens.fetch_add(1, Ordering::SeqCst);
            Ok(snapshot(query, &["rooms/a"], true))
        }

        async fn unlisten(&self, _query: &Query) -> FirestoreResult<()> {
            self.unlistens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn snapshot(query: &Query, paths: &[&str], from_cache: bool) -> ViewSnapshot {
        let documents: Vec<Document> = paths
            .iter()
            .map(|path| {
                Document::new_found(DocumentKey::from_string(path).unwrap(), Timestamp::new(1, 0), MapValue::empty())
            })
            .collect();
        let changes = documents
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        ViewSnapshot {
            query: query.clone(),
            documents,
            old_documents: Vec::new(),
            changes,
            mutated_keys: BTreeSet::new(),
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
        }
    }

    fn recording_listener(
        query: &Query,
        options: ListenOptions,
    ) -> (Arc<QueryListener>, Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = QueryListener::new(
            query.clone(),
            options,
            Arc::new(move |result| sink.lock().unwrap().push(result)),
        );
        (listener, seen)
    }

    #[tokio::test]
    async fn identical_queries_share_one_target() {
        let handler = CountingHandler::default();
        let manager = EventManager::new();
        let query = Query::collection("rooms").unwrap();
        let (first, first_seen) = recording_listener(&query, ListenOptions::default());
        let (second, second_seen) = recording_listener(&query, ListenOptions::default());

        manager.listen(&handler, Arc::clone(&first)).await;
        manager.listen(&handler, Arc::clone(&second)).await;
        assert_eq!(handler.listens.load(Ordering::SeqCst), 1);
        assert_eq!(first_seen.lock().unwrap().len(), 1);
        assert_eq!(second_seen.lock().unwrap().len(), 1);

        manager.unlisten(&handler, &first).await.unwrap();
        assert_eq!(handler.unlistens.load(Ordering::SeqCst), 0);
        manager.unlisten(&handler, &second).await.unwrap();
        assert_eq!(handler.unlistens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waits_for_sync_until_offline() {
        let handler = CountingHandler::default();
        let manager = EventManager::new();
        let query = Query::collection("rooms").unwrap();
        let options = ListenOptions {
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        };
        let (listener, seen) = recording_listener(&query, options);
        manager.listen(&handler, listener).await;
        assert!(seen.lock().unwrap().is_empty());

        manager.on_online_state_change(OnlineState::Offline);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].as_ref().unwrap().from_cache);
    }

    #[tokio::test]
    async fn metadata_only_changes_are_filtered_by_default() {
        let handler = CountingHandler::default();
        let manager = EventManager::new();
        let query = Query::collection("rooms").unwrap();
        let (plain, plain_seen) = recording_listener(&query, ListenOptions::default());
        let (meta, meta_seen) = recording_listener(
            &query,
            ListenOptions {
                include_metadata_changes: true,
                ..ListenOptions::default()
            },
        );
        manager.listen(&handler, plain).await;
        manager.listen(&handler, meta).await;

        let mut synced = snapshot(&query, &["rooms/a"], false);
        synced.changes.clear();
        manager.on_watch_change(vec![synced]);
        assert_eq!(plain_seen.lock().unwrap().len(), 1);
        assert_eq!(meta_seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn errors_are_delivered_once_and_detach() {
        let handler = CountingHandler::default();
        let manager = EventManager::new();
        let query = Query::collection("rooms").unwrap();
        let (listener, seen) = recording_listener(&query, ListenOptions::default());
        manager.listen(&handler, Arc::clone(&listener)).await;
        manager.on_watch_error(&query, permission_denied("no access"));
        manager.on_watch_change(vec![snapshot(&query, &["rooms/b"], false)]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].is_err());
        assert_eq!(manager.listener_count(), 0);
    }
}
