use std::sync::LazyLock;

use async_lock::Mutex;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::firestore::error::{invalid_argument, unavailable, FirestoreResult};
use crate::firestore::remote::stream::{StreamTransport, TransportFrame};
use crate::logger::Logger;

static WEBSOCKET_LOGGER: LazyLock<Logger> =
    LazyLock::new(|| Logger::new("@firebase/firestore/websocket"));

type TcpWebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Carries multiplexed frames as JSON text messages over one WebSocket.
pub struct WebSocketTransport {
    sink: Mutex<SplitSink<TcpWebSocket, Message>>,
    reader: Mutex<SplitStream<TcpWebSocket>>,
}

impl WebSocketTransport {
    pub async fn connect(endpoint: &str) -> FirestoreResult<Self> {
        let url = Url::parse(endpoint)
            .map_err(|err| invalid_argument(format!("invalid stream endpoint '{endpoint}': {err}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid_argument(format!(
                "stream endpoint must use ws:// or wss://, got '{}'",
                url.scheme()
            )));
        }
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| unavailable(format!("failed to connect websocket: {err}")))?;
        let (sink, reader) = stream.split();
        WEBSOCKET_LOGGER.debug(format!("connected to {url}"));
        Ok(Self {
            sink: Mutex::new(sink),
            reader: Mutex::new(reader),
        })
    }
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        let text = frame.to_json()?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|err| unavailable(format!("websocket send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => return TransportFrame::from_json(&text),
                Some(Ok(Message::Binary(payload))) => match String::from_utf8(payload) {
                    Ok(text) => return TransportFrame::from_json(&text),
                    Err(_) => {
                        WEBSOCKET_LOGGER.warn("received non-UTF8 binary frame; dropping");
                    }
                },
                // Ping and pong are answered by tungstenite.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    return Err(unavailable("websocket closed by peer"));
                }
                Some(Err(err)) => return Err(unavailable(format!("websocket receive failed: {err}"))),
            }
        }
    }
}
