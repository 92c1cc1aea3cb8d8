//! Network side of the sync engine: the watch and write streams, the
//! aggregation of watch changes into remote events and the online state.

pub mod bloom_filter;
pub mod datastore;
pub mod online_state;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod stream;
pub mod watch_change;
pub mod watch_change_aggregator;
pub mod watch_stream;
pub mod write_stream;

pub use datastore::{Datastore, RetrySettings, StreamHeader, StreamKind};
pub use online_state::OnlineState;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use serializer::JsonProtoSerializer;
#[cfg(not(target_arch = "wasm32"))]
pub use stream::WebSocketTransport;
pub use stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamTransport};
