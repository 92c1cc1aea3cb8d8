use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::app::{App, AppOptions, APP_OPTIONS_COMPONENT};
use crate::auth::CredentialsProvider;
use crate::firestore::core::event_manager::{ListenOptions, ViewSnapshotObserver};
use crate::firestore::core::firestore_client::FirestoreClient;
use crate::firestore::core::query::Query;
use crate::firestore::core::view::ViewSnapshot;
use crate::firestore::error::{failed_precondition, internal_error, FirestoreResult};
use crate::firestore::local::NamedQuery;
use crate::firestore::model::{DatabaseId, Mutation, ResourcePath, Timestamp};
use crate::firestore::remote::{OnlineState, StreamTransport};
use crate::firestore::value::FirestoreValue;
use crate::firestore::LOGGER;

use super::listener::ListenerRegistration;
use super::operations::{self, SetOptions};
use super::reference::{CollectionReference, DocumentReference};
use super::settings::FirestoreSettings;
use super::snapshot::{document_snapshot_from_view, DocumentSnapshot, QuerySnapshot, SnapshotMetadata};
use super::write_batch::WriteBatch;

/// Name of the Firestore service inside an app's component container.
pub const FIRESTORE_COMPONENT_NAME: &str = "firestore";

/// Handle to one database. Cheap to clone; every clone drives the same
/// client.
#[derive(Clone)]
pub struct Firestore {
    inner: Arc<FirestoreInner>,
}

struct FirestoreInner {
    app_name: String,
    database_id: DatabaseId,
    client: Arc<FirestoreClient>,
}

/// Starts a Firestore client for `app` and registers it in the app's
/// container. Fails if the app already has one.
///
/// The database comes from the app options unless `settings.database_id`
/// overrides it. All backend traffic goes through `transport`.
pub async fn initialize_firestore(
    app: &App,
    settings: FirestoreSettings,
    credentials: Arc<dyn CredentialsProvider>,
    transport: Arc<dyn StreamTransport>,
) -> FirestoreResult<Firestore> {
    app.check_destroyed()
        .map_err(|err| failed_precondition(err.to_string()))?;
    let container = app.container();
    let existing = container
        .get_optional::<Firestore>(FIRESTORE_COMPONENT_NAME)
        .map_err(|err| internal_error(err.to_string()))?;
    if existing.is_some() {
        return Err(failed_precondition(format!(
            "Firestore has already been started for app '{}'",
            app.name()
        )));
    }

    let options = container
        .get::<AppOptions>(APP_OPTIONS_COMPONENT)
        .map_err(|err| internal_error(err.to_string()))?;
    let mut database_id = DatabaseId::from_options(&options)?;
    if let Some(database) = &settings.database_id {
        database_id = DatabaseId::new(database_id.project_id(), database.as_str());
    }

    let client = FirestoreClient::start(&settings, database_id.clone(), credentials, transport).await?;
    let firestore = Firestore {
        inner: Arc::new(FirestoreInner {
            app_name: app.name().to_owned(),
            database_id,
            client,
        }),
    };
    if let Err(err) = container.provide_instance(FIRESTORE_COMPONENT_NAME, Arc::new(firestore.clone())) {
        // Lost a race with a concurrent initialization.
        firestore.terminate().await?;
        return Err(failed_precondition(err.to_string()));
    }
    LOGGER.debug(format!(
        "Firestore started for app '{}' on {}/{}",
        app.name(),
        firestore.project_id(),
        firestore.database()
    ));
    Ok(firestore)
}

/// Connects to the backend at `endpoint` (`ws://` or `wss://`) and starts a
/// client for `app`.
#[cfg(not(target_arch = "wasm32"))]
pub async fn connect_firestore(
    app: &App,
    settings: FirestoreSettings,
    credentials: Arc<dyn CredentialsProvider>,
    endpoint: &str,
) -> FirestoreResult<Firestore> {
    let transport = crate::firestore::remote::WebSocketTransport::connect(endpoint).await?;
    initialize_firestore(app, settings, credentials, Arc::new(transport)).await
}

/// The client started for `app` by [`initialize_firestore`].
pub fn get_firestore(app: &App) -> FirestoreResult<Firestore> {
    app.container()
        .get_optional::<Firestore>(FIRESTORE_COMPONENT_NAME)
        .map_err(|err| internal_error(err.to_string()))?
        .map(|firestore| firestore.as_ref().clone())
        .ok_or_else(|| {
            failed_precondition(format!(
                "Firestore has not been initialized for app '{}'",
                app.name()
            ))
        })
}

impl Firestore {
    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    pub fn project_id(&self) -> &str {
        self.inner.database_id.project_id()
    }

    /// The logical database name, usually `"(default)"`.
    pub fn database(&self) -> &str {
        self.inner.database_id.database()
    }

    /// Identifies this client among others sharing the same store.
    pub fn client_id(&self) -> &str {
        self.inner.client.client_id()
    }

    /// Whether this client currently owns the network connection for the
    /// shared store.
    pub fn is_primary(&self) -> bool {
        self.inner.client.is_primary()
    }

    /// Renews the lease and picks up what other clients sharing the store
    /// changed, without waiting for the next scheduled refresh.
    pub async fn refresh_lease(&self) -> FirestoreResult<()> {
        self.inner.client.run_lease_refresh().await
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.client.online_state()
    }

    /// A collection reference for a slash-separated path such as
    /// `"users/alovelace/repos"`.
    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        CollectionReference::new(self.clone(), ResourcePath::from_string(path)?)
    }

    /// A document reference; the path must have an even number of segments.
    pub fn doc(&self, path: &str) -> FirestoreResult<DocumentReference> {
        DocumentReference::new(self.clone(), ResourcePath::from_string(path)?)
    }

    /// A query over every collection named `collection_id`, whatever its
    /// parent.
    pub fn collection_group(&self, collection_id: &str) -> FirestoreResult<Query> {
        Query::collection_group(collection_id)
    }

    /// Listens to `query`. The observer gets the cached result first, then
    /// every change. After an error it receives nothing more.
    pub async fn on_snapshot<F>(
        &self,
        query: &Query,
        options: ListenOptions,
        observer: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<QuerySnapshot>) + Send + Sync + 'static,
    {
        let observer: ViewSnapshotObserver = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
            observer(result.map(QuerySnapshot::from_view_snapshot))
        });
        self.listen(query.clone(), options, observer).await
    }

    /// Listens to a single document.
    pub async fn on_document_snapshot<F>(
        &self,
        reference: &DocumentReference,
        options: ListenOptions,
        observer: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<DocumentSnapshot>) + Send + Sync + 'static,
    {
        let key = reference.key().clone();
        let observer: ViewSnapshotObserver = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
            observer(result.map(|snapshot| document_snapshot_from_view(&key, &snapshot)))
        });
        self.listen(reference.query(), options, observer).await
    }

    async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: ViewSnapshotObserver,
    ) -> FirestoreResult<ListenerRegistration> {
        let client = &self.inner.client;
        let listener = client.listen(query, options, observer).await?;
        Ok(ListenerRegistration::new(client, listener))
    }

    /// Applies `mutations` atomically. Local listeners see them right away;
    /// the returned future resolves per the configured commit resolution.
    pub async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        self.inner.client.write(mutations).await
    }

    pub fn batch(&self) -> WriteBatch {
        WriteBatch::new(self.clone())
    }

    pub async fn set_doc(
        &self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
        options: Option<SetOptions>,
    ) -> FirestoreResult<()> {
        let options = options.unwrap_or_default();
        let mutation = operations::set_mutation(reference.key().clone(), data, &options)?;
        self.commit(vec![mutation]).await
    }

    pub async fn update_doc(
        &self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<()> {
        let mutation = operations::update_mutation(reference.key().clone(), data)?;
        self.commit(vec![mutation]).await
    }

    pub async fn delete_doc(&self, reference: &DocumentReference) -> FirestoreResult<()> {
        self.commit(vec![Mutation::delete(reference.key().clone())]).await
    }

    /// Reads a document from the local cache only, pending writes included.
    pub async fn get_doc_from_cache(&self, reference: &DocumentReference) -> FirestoreResult<DocumentSnapshot> {
        let document = self
            .inner
            .client
            .get_document_from_cache(reference.key().clone())
            .await?;
        let metadata = SnapshotMetadata::new(true, document.has_local_mutations());
        Ok(DocumentSnapshot::from_document(&document, metadata))
    }

    /// Resolves once every write issued so far is acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.inner.client.wait_for_pending_writes().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.client.enable_network().await
    }

    /// Closes the streams. Listeners are served from the cache and writes
    /// queue up until [`enable_network`](Self::enable_network).
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.client.disable_network().await
    }

    pub async fn set_in_foreground(&self, in_foreground: bool) -> FirestoreResult<()> {
        self.inner.client.set_in_foreground(in_foreground).await
    }

    pub async fn save_named_query(&self, name: &str, query: &Query, read_time: Timestamp) -> FirestoreResult<()> {
        self.inner
            .client
            .save_named_query(name, query.clone(), read_time)
            .await
    }

    /// A query previously saved under `name`, if any.
    pub async fn named_query(&self, name: &str) -> FirestoreResult<Option<Query>> {
        let named: Option<NamedQuery> = self.inner.client.get_named_query(name).await?;
        Ok(named.map(|named| named.query))
    }

    /// Shuts the client down. Pending listeners are dropped and every later
    /// call fails with `FailedPrecondition`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        self.inner.client.terminate().await
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.client.is_terminated()
    }

    /// Deletes the durable cache. Only valid after [`terminate`](Self::terminate).
    pub fn clear_persistence(&self) -> FirestoreResult<()> {
        self.inner.client.clear_persistence()
    }
}

impl fmt::Debug for Firestore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Firestore")
            .field("app", &self.inner.app_name)
            .field("database_id", &self.inner.database_id)
            .field("client_id", &self.client_id())
            .finish()
    }
}
