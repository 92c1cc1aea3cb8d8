#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use firestore_sync_rs::app::{App, AppOptions};
use firestore_sync_rs::auth::EmptyCredentialsProvider;
use firestore_sync_rs::firestore::remote::{InMemoryTransport, MultiplexedConnection, MultiplexedStream};
use firestore_sync_rs::firestore::{initialize_firestore, Firestore, FirestoreSettings, FirestoreValue};
use firestore_sync_rs::platform::runtime;
use serde_json::Value as JsonValue;

pub const PROJECT: &str = "sync-test";
const WAIT: Duration = Duration::from_secs(5);

/// The server end of an in-memory connection. Streams are handed out by
/// kind, whatever order the client opened them in.
pub struct FakeBackend {
    connection: MultiplexedConnection,
    parked: Vec<(String, MultiplexedStream)>,
}

impl FakeBackend {
    pub fn new(server_side: Arc<InMemoryTransport>) -> Self {
        Self {
            connection: MultiplexedConnection::new(server_side),
            parked: Vec::new(),
        }
    }

    /// Waits for the client to open a stream of `kind` (`"listen"` or
    /// `"write"`).
    pub async fn accept(&mut self, kind: &str) -> MultiplexedStream {
        if let Some(index) = self.parked.iter().position(|(parked, _)| parked == kind) {
            return self.parked.remove(index).1;
        }
        loop {
            let incoming = runtime::timeout(WAIT, self.connection.accept())
                .await
                .expect("timed out waiting for a stream")
                .expect("connection closed");
            let header: JsonValue = serde_json::from_slice(&incoming.header).unwrap();
            let opened = header["kind"].as_str().unwrap_or_default().to_string();
            if opened == kind {
                return incoming.stream;
            }
            self.parked.push((opened, incoming.stream));
        }
    }

    /// `true` if the client opens any stream within `window`.
    pub async fn receives_stream_within(&self, window: Duration) -> bool {
        !self.parked.is_empty() || runtime::timeout(window, self.connection.accept()).await.is_some()
    }
}

pub async fn request(stream: &MultiplexedStream) -> JsonValue {
    let payload = runtime::timeout(WAIT, stream.next())
        .await
        .expect("timed out waiting for a request")
        .expect("stream closed")
        .expect("stream failed");
    serde_json::from_slice(&payload).unwrap()
}

pub async fn maybe_request(stream: &MultiplexedStream, window: Duration) -> Option<JsonValue> {
    let payload = runtime::timeout(window, stream.next()).await??.ok()?;
    serde_json::from_slice(&payload).ok()
}

pub async fn reply(stream: &MultiplexedStream, message: JsonValue) {
    stream.send(serde_json::to_vec(&message).unwrap()).await.unwrap();
}

pub fn document_name(path: &str) -> String {
    format!("projects/{PROJECT}/databases/(default)/documents/{path}")
}

pub fn app(name: &str) -> App {
    App::new(
        name,
        AppOptions {
            project_id: Some(PROJECT.into()),
            ..Default::default()
        },
    )
    .unwrap()
}

pub async fn start(name: &str, settings: FirestoreSettings) -> (Firestore, FakeBackend) {
    let (client_side, server_side) = InMemoryTransport::pair();
    let firestore = initialize_firestore(
        &app(name),
        settings,
        Arc::new(EmptyCredentialsProvider::new()),
        client_side,
    )
    .await
    .unwrap();
    (firestore, FakeBackend::new(server_side))
}

pub fn fields(entries: &[(&str, i64)]) -> BTreeMap<String, FirestoreValue> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), FirestoreValue::from_integer(*value)))
        .collect()
}

/// Receives until `accept` matches, failing after a few seconds.
pub async fn wait_for<T, F>(receiver: &async_channel::Receiver<T>, mut accept: F) -> T
where
    F: FnMut(&T) -> bool,
{
    loop {
        let next = runtime::timeout(WAIT, receiver.recv())
            .await
            .expect("timed out waiting for a snapshot")
            .expect("listener channel closed");
        if accept(&next) {
            return next;
        }
    }
}
