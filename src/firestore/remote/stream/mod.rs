use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::platform::runtime;

#[cfg(not(target_arch = "wasm32"))]
pub mod websocket;

#[cfg(not(target_arch = "wasm32"))]
pub use websocket::WebSocketTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    /// Opens a logical stream; the payload is the stream header.
    Open(Vec<u8>),
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(stream_id: StreamId, header: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open(header),
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    /// Text encoding used by message-oriented transports such as WebSocket.
    pub fn to_json(&self) -> FirestoreResult<String> {
        let wire = match &self.kind {
            FrameKind::Open(header) => WireFrame {
                stream: self.stream_id.0,
                kind: "open".into(),
                payload: Some(BASE64_STANDARD.encode(header)),
                code: None,
                message: None,
            },
            FrameKind::Data(payload) => WireFrame {
                stream: self.stream_id.0,
                kind: "data".into(),
                payload: Some(BASE64_STANDARD.encode(payload)),
                code: None,
                message: None,
            },
            FrameKind::Close => WireFrame {
                stream: self.stream_id.0,
                kind: "close".into(),
                payload: None,
                code: None,
                message: None,
            },
            FrameKind::Error(error) => WireFrame {
                stream: self.stream_id.0,
                kind: "error".into(),
                payload: None,
                code: Some(error.code.rpc_status()),
                message: Some(error.message().to_string()),
            },
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn from_json(text: &str) -> FirestoreResult<Self> {
        let wire: WireFrame = serde_json::from_str(text)
            .map_err(|err| invalid_argument(format!("malformed transport frame: {err}")))?;
        let stream_id = StreamId::new(wire.stream);
        let payload = || -> FirestoreResult<Vec<u8>> {
            BASE64_STANDARD
                .decode(wire.payload.as_deref().unwrap_or_default())
                .map_err(|err| invalid_argument(format!("malformed frame payload: {err}")))
        };
        let kind = match wire.kind.as_str() {
            "open" => FrameKind::Open(payload()?),
            "data" => FrameKind::Data(payload()?),
            "close" => FrameKind::Close,
            "error" => FrameKind::Error(FirestoreError::new(
                FirestoreErrorCode::from_rpc_status(wire.code.unwrap_or(2)),
                wire.message.clone().unwrap_or_default(),
            )),
            other => return Err(invalid_argument(format!("unknown frame kind '{other}'"))),
        };
        Ok(Self { stream_id, kind })
    }
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    stream: u32,
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamRegistry = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

/// Many logical streams over one transport.
///
/// Frames carry the sender's stream id. Streams the peer opened are tracked
/// under that id with the high bit flipped, so both sides can open streams
/// without coordination.
pub struct MultiplexedConnection {
    transport: Arc<dyn StreamTransport>,
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
    incoming: Receiver<IncomingStream>,
}

const PEER_STREAM_BIT: u32 = 1 << 31;

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (incoming_tx, incoming_rx) = async_channel::unbounded();
        let streams: StreamRegistry = Arc::new(Mutex::new(HashMap::new()));
        let manager = Self {
            transport: Arc::clone(&transport),
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams: Arc::clone(&streams),
            incoming: incoming_rx,
        };

        manager.start_outbound_loop(outbound_rx);
        manager.start_inbound_loop(streams, incoming_tx);
        manager
    }

    fn start_outbound_loop(&self, outbound_rx: Receiver<TransportFrame>) {
        let transport = Arc::clone(&self.transport);
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("multiplexed outbound loop terminated: {err:?}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(&self, streams: StreamRegistry, incoming_tx: Sender<IncomingStream>) {
        let transport = Arc::clone(&self.transport);
        let outbound = self.outbound_tx.clone();
        runtime::spawn_detached(async move {
            loop {
                let frame = match transport.next().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("multiplexed inbound loop terminated: {err:?}");
                        break;
                    }
                };
                // Ids the peer allocated are mirrored into our peer range.
                let stream_id = StreamId::new(frame.stream_id().value() ^ PEER_STREAM_BIT);
                let event = frame.kind().clone();

                if let FrameKind::Open(header) = event {
                    let (inbound_tx, inbound_rx) = async_channel::unbounded();
                    lock(&streams).insert(stream_id, inbound_tx);
                    let stream = MultiplexedStream {
                        id: stream_id,
                        outbound: outbound.clone(),
                        inbound: inbound_rx,
                        registry: MultiplexedConnectionHandle {
                            outbound_tx: outbound.clone(),
                            streams: Arc::clone(&streams),
                        },
                    };
                    if incoming_tx.send(IncomingStream { header, stream }).await.is_err() {
                        log::debug!("no acceptor for incoming stream {}", stream_id.value());
                    }
                    continue;
                }

                let maybe_sender = lock(&streams).get(&stream_id).cloned();
                let Some(sender) = maybe_sender else {
                    log::debug!("dropping frame for unknown stream {}", stream_id.value());
                    continue;
                };
                if matches!(event, FrameKind::Close | FrameKind::Error(_)) {
                    let _ = sender.send(event).await;
                    lock(&streams).remove(&stream_id);
                } else if let Err(err) = sender.send(event).await {
                    log::debug!(
                        "dropping inbound frame for closed stream {}: {:?}",
                        stream_id.value(),
                        err
                    );
                }
            }
            // Wake every open stream so readers observe the broken transport.
            let senders: Vec<_> = lock(&streams).drain().map(|(_, sender)| sender).collect();
            for sender in senders {
                let _ = sender
                    .send(FrameKind::Error(FirestoreError::new(
                        FirestoreErrorCode::Unavailable,
                        "transport closed",
                    )))
                    .await;
            }
        });
    }

    /// Opens a stream and announces it to the peer with `header`.
    pub async fn open_stream(&self, header: Vec<u8>) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst) & !PEER_STREAM_BIT);
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        lock(&self.streams).insert(stream_id, inbound_tx);
        self.outbound_tx
            .send(TransportFrame::open(stream_id, header))
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream {
            id: stream_id,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            registry: self.clone_handle(),
        })
    }

    /// Waits for the peer to open a stream.
    pub async fn accept(&self) -> FirestoreResult<IncomingStream> {
        self.incoming
            .recv()
            .await
            .map_err(|err| internal_error(format!("connection closed: {err}")))
    }

    fn clone_handle(&self) -> MultiplexedConnectionHandle {
        MultiplexedConnectionHandle {
            outbound_tx: self.outbound_tx.clone(),
            streams: Arc::clone(&self.streams),
        }
    }
}

/// A stream the peer opened, with the header it was announced with.
pub struct IncomingStream {
    pub header: Vec<u8>,
    pub stream: MultiplexedStream,
}

#[derive(Clone)]
pub struct MultiplexedConnectionHandle {
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
}

impl MultiplexedConnectionHandle {
    pub fn close_stream(&self, stream_id: StreamId) {
        if lock(&self.streams).remove(&stream_id).is_some() {
            let _ = self.outbound_tx.try_send(TransportFrame::close(stream_id));
        }
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    registry: MultiplexedConnectionHandle,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue stream frame: {err}")))
    }

    /// Next payload; `None` once the peer closed the stream.
    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open(_) => continue,
            }
        }
        None
    }

    /// Fails the stream on the peer's side with `error`.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue error frame: {err}")))?;
        lock(&self.registry.streams).remove(&self.id);
        Ok(())
    }

    pub fn close(&self) {
        self.registry.close_stream(self.id);
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.registry.close_stream(self.id);
    }
}

fn lock(streams: &StreamRegistry) -> std::sync::MutexGuard<'_, HashMap<StreamId, Sender<FrameKind>>> {
    streams.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }

    /// Severs the link in both directions, as a dropped network would.
    pub fn disconnect(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| internal_error(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| internal_error(format!("loopback transport recv failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_exchange_roundtrip() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let left_stream = left.open_stream(b"listen".to_vec()).await.expect("left stream");
        let accepted = right.accept().await.expect("accepted stream");
        assert_eq!(accepted.header, b"listen");
        let right_stream = accepted.stream;

        left_stream.send(b"hello".to_vec()).await.expect("left send");
        let payload = right_stream.next().await.expect("right recv").expect("payload");
        assert_eq!(payload, b"hello");

        right_stream.send(b"world".to_vec()).await.expect("right send");
        let payload = left_stream.next().await.expect("left recv").expect("payload");
        assert_eq!(payload, b"world");
    }

    #[tokio::test]
    async fn both_sides_can_open_streams() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let from_left = left.open_stream(Vec::new()).await.unwrap();
        let from_right = right.open_stream(Vec::new()).await.unwrap();
        let on_right = right.accept().await.unwrap().stream;
        let on_left = left.accept().await.unwrap().stream;

        from_left.send(b"l".to_vec()).await.unwrap();
        from_right.send(b"r".to_vec()).await.unwrap();
        assert_eq!(on_right.next().await.unwrap().unwrap(), b"l");
        assert_eq!(on_left.next().await.unwrap().unwrap(), b"r");
    }

    #[tokio::test]
    async fn closing_stream_notifies_peer() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let left_stream = left.open_stream(Vec::new()).await.expect("left stream");
        let right_stream = right.accept().await.expect("accept").stream;

        left_stream.close();
        assert!(right_stream.next().await.is_none());
    }

    #[tokio::test]
    async fn errors_reach_the_peer() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let left_stream = left.open_stream(Vec::new()).await.unwrap();
        let right_stream = right.accept().await.unwrap().stream;
        right_stream
            .fail(FirestoreError::new(FirestoreErrorCode::PermissionDenied, "nope"))
            .await
            .unwrap();
        let err = left_stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
    }

    #[test]
    fn frames_survive_json_encoding() {
        let frame = TransportFrame::error(
            StreamId::new(3),
            FirestoreError::new(FirestoreErrorCode::ResourceExhausted, "slow down"),
        );
        let decoded = TransportFrame::from_json(&frame.to_json().unwrap()).unwrap();
        assert_eq!(decoded.stream_id(), StreamId::new(3));
        match decoded.kind() {
            FrameKind::Error(err) => assert_eq!(err.code, FirestoreErrorCode::ResourceExhausted),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
