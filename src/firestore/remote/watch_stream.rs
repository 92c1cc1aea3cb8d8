use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::firestore::core::async_queue::AsyncQueue;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{TargetId, Timestamp};
use crate::firestore::remote::datastore::{Datastore, RetrySettings, StreamKind};
use crate::firestore::remote::persistent_stream::{PersistentStream, StreamListener, StreamState};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{decode_watch_change, WatchChange};

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WatchStreamListener: Send + Sync + 'static {
    async fn on_watch_open(&self);
    /// `snapshot_version` is the read time of a global snapshot and the
    /// minimum timestamp for everything else.
    async fn on_watch_change(&self, change: WatchChange, snapshot_version: Timestamp) -> FirestoreResult<()>;
    async fn on_watch_close(&self, error: Option<FirestoreError>);
}

/// The listen stream: adds and removes targets and decodes watch changes.
pub struct WatchStream {
    stream: Arc<PersistentStream>,
    serializer: JsonProtoSerializer,
}

impl WatchStream {
    pub fn new(queue: AsyncQueue, datastore: Arc<Datastore>, settings: RetrySettings) -> Self {
        let serializer = datastore.serializer().clone();
        Self {
            stream: PersistentStream::new(StreamKind::Listen, queue, datastore, settings),
            serializer,
        }
    }

    pub fn start(&self, listener: Weak<dyn WatchStreamListener>) {
        self.stream.start(Arc::new(WatchCodec {
            serializer: self.serializer.clone(),
            listener,
        }));
    }

    pub fn stop(&self) {
        self.stream.stop();
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
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

    pub async fn watch(&self, target: &TargetData) -> FirestoreResult<()> {
        let request = encode_add_target(&self.serializer, target);
        self.stream.send(&request).await
    }

    pub async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        let request = json!({
            "database": self.serializer.database_name(),
            "removeTarget": target_id,
        });
        self.stream.send(&request).await
    }
}

fn encode_add_target(serializer: &JsonProtoSerializer, target: &TargetData) -> JsonValue {
    let mut request = JsonMap::new();
    request.insert("database".into(), JsonValue::String(serializer.database_name()));
    request.insert("addTarget".into(), serializer.encode_target(target));
    if let Some(labels) = serializer.encode_listen_labels(target.purpose) {
        request.insert("labels".into(), labels);
    }
    JsonValue::Object(request)
}

struct WatchCodec {
    serializer: JsonProtoSerializer,
    listener: Weak<dyn WatchStreamListener>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamListener for WatchCodec {
    async fn on_open(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_watch_open().await;
        }
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let Some(change) = decode_watch_change(&self.serializer, &message)? else {
            log::debug!("ignoring unrecognised watch message");
            return Ok(());
        };
        let snapshot_version = match &change {
            WatchChange::TargetChange(target_change) if target_change.is_global_snapshot() => {
                target_change.read_time
            }
            _ => Timestamp::min(),
        };
        match self.listener.upgrade() {
            Some(listener) => listener.on_watch_change(change, snapshot_version).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_watch_close(error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::DatabaseId;

    #[test]
    fn add_target_carries_labels_for_special_purposes() {
        let serializer = JsonProtoSerializer::new(DatabaseId::new("p", "(default)"));
        let query = Query::collection("rooms").unwrap();
        let target = TargetData::new(query, 2, TargetPurpose::Listen, 1);
        let request = encode_add_target(&serializer, &target);
        assert_eq!(request["database"], json!("projects/p/databases/(default)"));
        assert_eq!(request["addTarget"]["targetId"], json!(2));
        assert!(request.get("labels").is_none());

        let mismatch = target.with_purpose(TargetPurpose::ExistenceFilterMismatchBloom);
        let request = encode_add_target(&serializer, &mismatch);
        assert_eq!(
            request["labels"]["goog-listen-tags"],
            json!("existence-filter-mismatch-bloom")
        );
    }
}
