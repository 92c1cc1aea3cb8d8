use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::datastore::{Datastore, RetrySettings, StreamKind};
use crate::firestore::remote::stream::MultiplexedStream;
use crate::platform::runtime;
use crate::util::backoff::ExponentialBackoff;

/// Lifecycle of a persistent stream.
///
/// `Initial -> Starting -> Open -> Healthy`. A failure moves to `Error`,
/// from which the next `start` waits out the backoff before returning to
/// `Initial`. `stop` moves any state to `Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    /// Waiting for a token and for the transport to open the stream.
    Starting,
    Open,
    /// At least one message has arrived since the stream opened.
    Healthy,
    Error,
    Stopped,
}

/// Receives stream events. Every callback runs as a job on the owning
/// [`AsyncQueue`].
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamListener: Send + Sync + 'static {
    async fn on_open(&self);
    /// An error return closes the stream with that error.
    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()>;
    /// Not called for an explicit `stop`.
    async fn on_close(&self, error: Option<FirestoreError>);
}

struct StreamCore {
    state: StreamState,
    /// Bumped on every close; callbacks from an older generation are dropped.
    generation: u64,
    backoff: ExponentialBackoff,
    stream: Option<Arc<MultiplexedStream>>,
    listener: Option<Arc<dyn StreamListener>>,
    idle_timer: Option<DelayedOperation>,
    health_timer: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
}

/// One logical watch or write stream that reconnects with backoff, closes
/// itself when idle and discards results from superseded attempts.
pub struct PersistentStream {
    kind: StreamKind,
    queue: AsyncQueue,
    datastore: Arc<Datastore>,
    settings: RetrySettings,
    core: Mutex<StreamCore>,
    this: Weak<PersistentStream>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        queue: AsyncQueue,
        datastore: Arc<Datastore>,
        settings: RetrySettings,
    ) -> Arc<Self> {
        let backoff = ExponentialBackoff::new(settings.backoff_config());
        Arc::new_cyclic(|this| Self {
            kind,
            queue,
            datastore,
            settings,
            core: Mutex::new(StreamCore {
                state: StreamState::Initial,
                generation: 0,
                backoff,
                stream: None,
                listener: None,
                idle_timer: None,
                health_timer: None,
                backoff_timer: None,
            }),
            this: this.clone(),
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.core().state
    }

    /// True from `start` until the stream is stopped or closes cleanly.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            StreamState::Starting | StreamState::Open | StreamState::Healthy | StreamState::Error
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), StreamState::Open | StreamState::Healthy)
    }

    /// Begins connecting. From `Error` this waits out the backoff first.
    pub fn start(&self, listener: Arc<dyn StreamListener>) {
        let generation = {
            let mut core = self.core();
            core.listener = Some(listener);
            match core.state {
                StreamState::Error => {
                    self.schedule_backoff(&mut core);
                    return;
                }
                StreamState::Initial | StreamState::Stopped => {}
                state => {
                    log::debug!("{} stream start ignored in state {state:?}", self.kind.label());
                    return;
                }
            }
            core.state = StreamState::Starting;
            core.generation
        };
        self.spawn_connect(generation);
    }

    /// Closes the stream without notifying the listener.
    pub fn stop(&self) {
        let stream = {
            let mut core = self.core();
            if core.state == StreamState::Stopped {
                return;
            }
            Self::cancel_timers(&mut core);
            core.generation += 1;
            core.state = StreamState::Stopped;
            core.backoff.reset();
            core.listener = None;
            core.stream.take()
        };
        if let Some(stream) = stream {
            stream.close();
        }
    }

    /// Arms the idle timer: an open stream nobody uses is closed after the
    /// idle timeout. An idle stream is not expected to hear from the
    /// backend, so the health timer stops.
    pub fn mark_idle(&self) {
        let mut core = self.core();
        if !matches!(core.state, StreamState::Open | StreamState::Healthy) || core.idle_timer.is_some() {
            return;
        }
        if let Some(timer) = core.health_timer.take() {
            timer.cancel();
        }
        let generation = core.generation;
        let this = self.this.clone();
        let timer_id = match self.kind {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        };
        core.idle_timer = Some(self.queue.enqueue_after_delay(
            timer_id,
            self.settings.idle_timeout,
            move || async move {
                if let Some(this) = this.upgrade() {
                    if this.core().generation == generation && this.is_open() {
                        log::debug!("closing idle {} stream", this.kind.label());
                        this.close(StreamState::Initial, None).await;
                    }
                }
            },
        ));
    }

    /// Sends one request. Cancels a pending idle close and expects the
    /// backend to answer within the health window.
    pub async fn send(&self, message: &JsonValue) -> FirestoreResult<()> {
        let stream = {
            let mut core = self.core();
            if let Some(timer) = core.idle_timer.take() {
                timer.cancel();
            }
            if core.health_timer.is_none() && core.stream.is_some() {
                self.arm_health_timer(&mut core);
            }
            core.stream
                .clone()
                .ok_or_else(|| internal_error(format!("{} stream is not open", self.kind.label())))?
        };
        stream.send(serde_json::to_vec(message)?).await
    }

    /// Skips the backoff for the next start, after an error that says nothing
    /// about the backend's health such as a rejected write.
    pub fn inhibit_backoff(&self) {
        let mut core = self.core();
        if core.state == StreamState::Error {
            core.state = StreamState::Initial;
        }
        core.backoff.reset();
    }

    /// Closes the stream because of `error` and notifies the listener.
    pub async fn fail(&self, error: FirestoreError) {
        self.close(StreamState::Error, Some(error)).await;
    }

    fn spawn_connect(&self, generation: u64) {
        let this = self.this.clone();
        let datastore = Arc::clone(&self.datastore);
        let queue = self.queue.clone();
        let kind = self.kind;
        runtime::spawn_detached(async move {
            let result = match datastore.fetch_token().await {
                Ok(token) => datastore.open_stream(kind, token).await,
                Err(err) => Err(err),
            };
            queue.enqueue_and_forget(async move {
                if let Some(this) = this.upgrade() {
                    this.on_connected(generation, result).await;
                }
            });
        });
    }

    async fn on_connected(&self, generation: u64, result: FirestoreResult<MultiplexedStream>) {
        if self.core().generation != generation {
            log::debug!("{} stream attempt superseded; dropping result", self.kind.label());
            return;
        }
        let stream = match result {
            Ok(stream) => Arc::new(stream),
            Err(err) => {
                self.close(StreamState::Error, Some(err)).await;
                return;
            }
        };
        let listener = {
            let mut core = self.core();
            core.state = StreamState::Open;
            core.stream = Some(Arc::clone(&stream));
            self.arm_health_timer(&mut core);
            core.listener.clone()
        };
        self.spawn_reader(generation, stream);
        if let Some(listener) = listener {
            listener.on_open().await;
        }
    }

    /// (Re)starts the window within which the backend must send something.
    /// Not armed while the stream is idle.
    fn arm_health_timer(&self, core: &mut StreamCore) {
        if let Some(timer) = core.health_timer.take() {
            timer.cancel();
        }
        if core.idle_timer.is_some() {
            return;
        }
        let generation = core.generation;
        let this = self.this.clone();
        core.health_timer = Some(self.queue.enqueue_after_delay(
            TimerId::HealthCheckTimeout,
            self.settings.health_check_timeout,
            move || async move {
                if let Some(this) = this.upgrade() {
                    this.on_health_check(generation).await;
                }
            },
        ));
    }

    async fn on_health_check(&self, generation: u64) {
        let unresponsive = {
            let mut core = self.core();
            if core.generation != generation {
                return;
            }
            core.health_timer = None;
            matches!(core.state, StreamState::Open | StreamState::Healthy) && core.idle_timer.is_none()
        };
        if unresponsive {
            log::warn!(
                "{} stream received nothing within {:?}; reconnecting",
                self.kind.label(),
                self.settings.health_check_timeout
            );
            self.close(
                StreamState::Error,
                Some(unavailable("stream did not respond within the health window")),
            )
            .await;
        }
    }

    fn spawn_reader(&self, generation: u64, stream: Arc<MultiplexedStream>) {
        let this = self.this.clone();
        let queue = self.queue.clone();
        runtime::spawn_detached(async move {
            loop {
                let next = stream.next().await;
                let finished = !matches!(next, Some(Ok(_)));
                let this = this.clone();
                queue.enqueue_and_forget(async move {
                    if let Some(this) = this.upgrade() {
                        this.on_inbound(generation, next).await;
                    }
                });
                if finished {
                    break;
                }
            }
        });
    }

    async fn on_inbound(&self, generation: u64, inbound: Option<FirestoreResult<Vec<u8>>>) {
        let listener = {
            let mut core = self.core();
            if core.generation != generation {
                return;
            }
            if matches!(inbound, Some(Ok(_))) {
                if core.state == StreamState::Open {
                    core.state = StreamState::Healthy;
                    core.backoff.reset();
                }
                if core.state == StreamState::Healthy {
                    self.arm_health_timer(&mut core);
                }
            }
            core.listener.clone()
        };
        match inbound {
            Some(Ok(payload)) => {
                let outcome = match serde_json::from_slice::<JsonValue>(&payload) {
                    Ok(message) => match listener {
                        Some(listener) => listener.on_message(message).await,
                        None => Ok(()),
                    },
                    Err(err) => Err(err.into()),
                };
                if let Err(err) = outcome {
                    log::warn!("{} stream message rejected: {err}", self.kind.label());
                    self.close(StreamState::Error, Some(err)).await;
                }
            }
            Some(Err(err)) => self.close(StreamState::Error, Some(err)).await,
            None => self.close(StreamState::Initial, None).await,
        }
    }

    async fn close(&self, final_state: StreamState, error: Option<FirestoreError>) {
        let (stream, listener) = {
            let mut core = self.core();
            Self::cancel_timers(&mut core);
            core.generation += 1;
            if final_state != StreamState::Error {
                core.backoff.reset();
            } else if let Some(error) = &error {
                match error.code {
                    FirestoreErrorCode::ResourceExhausted => {
                        log::debug!("{} stream exhausted the backend; backing off fully", self.kind.label());
                        core.backoff.reset_to_max();
                    }
                    FirestoreErrorCode::Unauthenticated if core.state != StreamState::Healthy => {
                        self.datastore.invalidate_token();
                    }
                    _ => {}
                }
            }
            core.state = final_state;
            (core.stream.take(), core.listener.clone())
        };
        if let Some(stream) = stream {
            stream.close();
        }
        if let Some(error) = &error {
            log::debug!("{} stream closed: {error}", self.kind.label());
        }
        if let Some(listener) = listener {
            listener.on_close(error).await;
        }
    }

    fn schedule_backoff(&self, core: &mut StreamCore) {
        if core.backoff_timer.is_some() {
            return;
        }
        let delay = core.backoff.next_delay();
        let generation = core.generation;
        let timer_id = match self.kind {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        };
        let this = self.this.clone();
        log::debug!("{} stream reconnecting in {delay:?}", self.kind.label());
        core.backoff_timer = Some(self.queue.enqueue_after_delay(timer_id, delay, move || async move {
            let Some(this) = this.upgrade() else {
                return;
            };
            let listener = {
                let mut core = this.core();
                core.backoff_timer = None;
                if core.generation != generation || core.state != StreamState::Error {
                    return;
                }
                core.state = StreamState::Initial;
                core.listener.clone()
            };
            if let Some(listener) = listener {
                this.start(listener);
            }
        }));
    }

    fn cancel_timers(core: &mut StreamCore) {
        for timer in [core.idle_timer.take(), core.health_timer.take(), core.backoff_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.cancel();
        }
    }

    fn core(&self) -> MutexGuard<'_, StreamCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::EmptyCredentialsProvider;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Event {
        Open,
        Message(JsonValue),
        Close(Option<FirestoreErrorCode>),
    }

    pub(crate) struct RecordingListener {
        tx: async_channel::Sender<Event>,
    }

    impl RecordingListener {
        pub(crate) fn new() -> (Arc<Self>, async_channel::Receiver<Event>) {
            let (tx, rx) = async_channel::unbounded();
            (Arc::new(Self { tx }), rx)
        }
    }

    #[async_trait]
    impl StreamListener for RecordingListener {
        async fn on_open(&self) {
            let _ = self.tx.send(Event::Open).await;
        }

        async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
            let _ = self.tx.send(Event::Message(message)).await;
            Ok(())
        }

        async fn on_close(&self, error: Option<FirestoreError>) {
            let _ = self.tx.send(Event::Close(error.map(|err| err.code))).await;
        }
    }

    pub(crate) async fn next_event(rx: &async_channel::Receiver<Event>) -> Event {
        runtime::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for stream event")
            .expect("listener dropped")
    }

    fn fixture() -> (AsyncQueue, Arc<PersistentStream>, MultiplexedConnection) {
        let (client, server) = InMemoryTransport::pair();
        let datastore = Arc::new(Datastore::new(
            Arc::new(MultiplexedConnection::new(client)),
            Arc::new(EmptyCredentialsProvider::new()),
            JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
        ));
        let queue = AsyncQueue::new();
        let stream = PersistentStream::new(
            StreamKind::Listen,
            queue.clone(),
            datastore,
            RetrySettings::default(),
        );
        (queue, stream, MultiplexedConnection::new(server))
    }

    #[tokio::test]
    async fn opens_and_becomes_healthy_on_first_message() {
        let (_queue, stream, server) = fixture();
        let (listener, events) = RecordingListener::new();
        stream.start(listener);
        assert_eq!(stream.state(), StreamState::Starting);

        let remote = server.accept().await.unwrap().stream;
        assert_eq!(next_event(&events).await, Event::Open);
        assert_eq!(stream.state(), StreamState::Open);

        remote.send(br#"{"hello":1}"#.to_vec()).await.unwrap();
        assert_eq!(next_event(&events).await, Event::Message(serde_json::json!({"hello": 1})));
        assert_eq!(stream.state(), StreamState::Healthy);
    }

    #[tokio::test]
    async fn server_error_moves_to_error_state() {
        let (_queue, stream, server) = fixture();
        let (listener, events) = RecordingListener::new();
        stream.start(listener);
        let remote = server.accept().await.unwrap().stream;
        assert_eq!(next_event(&events).await, Event::Open);

        remote
            .fail(FirestoreError::new(FirestoreErrorCode::ResourceExhausted, "quota"))
            .await
            .unwrap();
        assert_eq!(
            next_event(&events).await,
            Event::Close(Some(FirestoreErrorCode::ResourceExhausted))
        );
        assert_eq!(stream.state(), StreamState::Error);
        assert!(stream.is_started());
    }

    #[tokio::test]
    async fn idle_stream_closes_cleanly() {
        let (queue, stream, server) = fixture();
        let (listener, events) = RecordingListener::new();
        stream.start(listener);
        let _remote = server.accept().await.unwrap().stream;
        assert_eq!(next_event(&events).await, Event::Open);

        queue.enqueue(async { Ok(()) }).await.unwrap();
        stream.mark_idle();
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        queue.run_delayed_operations_now(TimerId::ListenStreamIdle);
        assert_eq!(next_event(&events).await, Event::Close(None));
        assert_eq!(stream.state(), StreamState::Initial);
    }

    #[tokio::test]
    async fn stop_discards_pending_connect() {
        let (queue, stream, server) = fixture();
        let (listener, events) = RecordingListener::new();
        stream.start(listener);
        stream.stop();
        assert_eq!(stream.state(), StreamState::Stopped);

        // The transport still sees the attempt, but the result is dropped.
        let _remote = server.accept().await.unwrap().stream;
        queue.drain().await.unwrap();
        runtime::sleep(Duration::from_millis(20)).await;
        queue.drain().await.unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn health_window_forces_reconnect() {
        let (queue, stream, server) = fixture();
        let (listener, events) = RecordingListener::new();
        stream.start(listener);
        let _remote = server.accept().await.unwrap().stream;
        assert_eq!(next_event(&events).await, Event::Open);

        queue.run_delayed_operations_now(TimerId::HealthCheckTimeout);
        assert_eq!(
            next_event(&events).await,
            Event::Close(Some(FirestoreErrorCode::Unavailable))
        );
        assert_eq!(stream.state(), StreamState::Error);
    }

    #[tokio::test]
    async fn healthy_stream_that_goes_silent_is_reopened() {
        let (queue, stream, server) = fixture();
        let (listener, events) = RecordingListener::new();
        stream.start(listener);
        let remote = server.accept().await.unwrap().stream;
        assert_eq!(next_event(&events).await, Event::Open);

        remote.send(br#"{"n":1}"#.to_vec()).await.unwrap();
        assert_eq!(next_event(&events).await, Event::Message(serde_json::json!({"n": 1})));
        assert_eq!(stream.state(), StreamState::Healthy);
        assert!(queue.contains_delayed_operation(TimerId::HealthCheckTimeout));

        // The connection stays up but nothing arrives any more.
        queue.run_delayed_operations_now(TimerId::HealthCheckTimeout);
        assert_eq!(
            next_event(&events).await,
            Event::Close(Some(FirestoreErrorCode::Unavailable))
        );
        assert_eq!(stream.state(), StreamState::Error);
    }

    #[tokio::test]
    async fn idle_stream_has_no_health_window() {
        let (queue, stream, server) = fixture();
        let (listener, events) = RecordingListener::new();
        stream.start(listener);
        let remote = server.accept().await.unwrap().stream;
        assert_eq!(next_event(&events).await, Event::Open);
        remote.send(br#"{"n":1}"#.to_vec()).await.unwrap();
        assert_eq!(next_event(&events).await, Event::Message(serde_json::json!({"n": 1})));

        stream.mark_idle();
        assert!(!queue.contains_delayed_operation(TimerId::HealthCheckTimeout));
        assert_eq!(stream.state(), StreamState::Healthy);

        // Using the stream again restarts the window.
        stream.send(&serde_json::json!({"ping": true})).await.unwrap();
        assert!(queue.contains_delayed_operation(TimerId::HealthCheckTimeout));
        assert!(!queue.contains_delayed_operation(TimerId::ListenStreamIdle));
    }
}
