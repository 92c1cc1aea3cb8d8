use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::firestore::core::async_queue::AsyncQueue;
use crate::firestore::error::{failed_precondition, FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, Timestamp};
use crate::firestore::remote::datastore::{Datastore, RetrySettings, StreamKind};
use crate::firestore::remote::persistent_stream::{PersistentStream, StreamListener, StreamState};
use crate::firestore::remote::serializer::JsonProtoSerializer;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WriteStreamListener: Send + Sync + 'static {
    /// The stream is open; the listener should send the handshake.
    async fn on_write_open(&self);
    async fn on_handshake_complete(&self) -> FirestoreResult<()>;
    async fn on_mutation_result(
        &self,
        commit_version: Timestamp,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()>;
    async fn on_write_close(&self, error: Option<FirestoreError>);
}

#[derive(Default)]
struct WriteSession {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

type SharedSession = Arc<Mutex<WriteSession>>;

/// The write stream: a handshake that trades stream tokens, followed by
/// pipelined mutation batches acknowledged in order.
pub struct WriteStream {
    stream: Arc<PersistentStream>,
    serializer: JsonProtoSerializer,
    session: SharedSession,
}

impl WriteStream {
    pub fn new(queue: AsyncQueue, datastore: Arc<Datastore>, settings: RetrySettings) -> Self {
        let serializer = datastore.serializer().clone();
        Self {
            stream: PersistentStream::new(StreamKind::Write, queue, datastore, settings),
            serializer,
            session: Arc::new(Mutex::new(WriteSession::default())),
        }
    }

    pub fn start(&self, listener: Weak<dyn WriteStreamListener>) {
        session(&self.session).handshake_complete = false;
        self.stream.start(Arc::new(WriteCodec {
            serializer: self.serializer.clone(),
            session: Arc::clone(&self.session),
            listener,
        }));
    }

    pub fn stop(&self) {
        session(&self.session).handshake_complete = false;
        self.stream.stop();
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn handshake_complete(&self) -> bool {
        session(&self.session).handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        session(&self.session).last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        session(&self.session).last_stream_token = token;
    }

    pub async fn write_handshake(&self) -> FirestoreResult<()> {
        let mut request = JsonMap::new();
        request.insert("database".into(), JsonValue::String(self.serializer.database_name()));
        let token = self.last_stream_token();
        if !token.is_empty() {
            request.insert("streamToken".into(), self.serializer.encode_bytes(&token));
        }
        self.stream.send(&JsonValue::Object(request)).await
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        let token = {
            let session = session(&self.session);
            if !session.handshake_complete {
                return Err(failed_precondition("cannot write mutations before the handshake completes"));
            }
            session.last_stream_token.clone()
        };
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        let request = json!({
            "database": self.serializer.database_name(),
            "streamToken": self.serializer.encode_bytes(&token),
            "writes": writes,
        });
        self.stream.send(&request).await
    }
}

struct WriteCodec {
    serializer: JsonProtoSerializer,
    session: SharedSession,
    listener: Weak<dyn WriteStreamListener>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamListener for WriteCodec {
    async fn on_open(&self) {
        session(&self.session).handshake_complete = false;
        if let Some(listener) = self.listener.upgrade() {
            listener.on_write_open().await;
        }
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let response = self.serializer.decode_write_response(&message)?;
        let was_handshake = {
            let mut session = session(&self.session);
            session.last_stream_token = response.stream_token;
            !std::mem::replace(&mut session.handshake_complete, true)
        };
        let Some(listener) = self.listener.upgrade() else {
            return Ok(());
        };
        if was_handshake {
            // The handshake response carries no results.
            listener.on_handshake_complete().await
        } else {
            listener
                .on_mutation_result(response.commit_version, response.write_results)
                .await
        }
    }

    /// The handshake flag survives until the next open so the listener can
    /// tell a failed handshake from a failed write.
    async fn on_close(&self, error: Option<FirestoreError>) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_write_close(error).await;
        }
    }
}

fn session(session: &SharedSession) -> MutexGuard<'_, WriteSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}
