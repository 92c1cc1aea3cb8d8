use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::error::FirestoreError;
use crate::firestore::LOGGER;

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// No stream has connected or failed since the last reset.
    Unknown,
    Online,
    /// Snapshots are served from the cache and flagged `from_cache`.
    Offline,
}

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

/// Consecutive watch failures tolerated before reporting `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long a watch stream may take to connect before the client reports
/// `Offline` anyway.
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    timer: Option<DelayedOperation>,
    should_warn_offline: bool,
}

/// Derives the online state from watch stream health and forwards every
/// change to a handler.
pub struct OnlineStateTracker {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    inner: Mutex<TrackerState>,
    this: Weak<OnlineStateTracker>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, handler: OnlineStateHandler) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            queue,
            handler,
            inner: Mutex::new(TrackerState {
                state: OnlineState::Unknown,
                watch_stream_failures: 0,
                timer: None,
                should_warn_offline: true,
            }),
            this: this.clone(),
        })
    }

    pub fn state(&self) -> OnlineState {
        self.inner().state
    }

    /// Called whenever the watch stream is (re)started.
    pub fn handle_watch_stream_start(&self) {
        let mut inner = self.inner();
        if inner.watch_stream_failures != 0 {
            return;
        }
        let changed = Self::set_state(&mut inner, OnlineState::Unknown);
        if inner.timer.is_none() {
            let this = self.this.clone();
            inner.timer = Some(self.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                ONLINE_STATE_TIMEOUT,
                move || async move {
                    if let Some(this) = this.upgrade() {
                        this.on_connect_timeout();
                    }
                },
            ));
        }
        drop(inner);
        if changed {
            (self.handler)(OnlineState::Unknown);
        }
    }

    /// Called when the watch stream fails. A previously online client drops
    /// back to `Unknown` first so a single hiccup does not flip the views.
    pub fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let mut inner = self.inner();
        let next = if inner.state == OnlineState::Online {
            OnlineState::Unknown
        } else {
            inner.watch_stream_failures += 1;
            if inner.watch_stream_failures < MAX_WATCH_STREAM_FAILURES {
                return;
            }
            if let Some(timer) = inner.timer.take() {
                timer.cancel();
            }
            let details = format!(
                "connection failed {} times; most recent error: {error}",
                inner.watch_stream_failures
            );
            Self::log_offline(&mut inner, &details);
            OnlineState::Offline
        };
        let changed = Self::set_state(&mut inner, next);
        drop(inner);
        if changed {
            (self.handler)(next);
        }
    }

    /// Explicit transition, used for `Online` on the first watch message and
    /// for `Offline` when the network is disabled.
    pub fn set(&self, state: OnlineState) {
        let mut inner = self.inner();
        if let Some(timer) = inner.timer.take() {
            timer.cancel();
        }
        inner.watch_stream_failures = 0;
        if state == OnlineState::Online {
            inner.should_warn_offline = false;
        }
        let changed = Self::set_state(&mut inner, state);
        drop(inner);
        if changed {
            (self.handler)(state);
        }
    }

    fn on_connect_timeout(&self) {
        let mut inner = self.inner();
        inner.timer = None;
        if inner.state != OnlineState::Unknown {
            return;
        }
        Self::log_offline(
            &mut inner,
            &format!("backend did not respond within {} seconds", ONLINE_STATE_TIMEOUT.as_secs()),
        );
        let changed = Self::set_state(&mut inner, OnlineState::Offline);
        drop(inner);
        if changed {
            (self.handler)(OnlineState::Offline);
        }
    }

    fn set_state(inner: &mut TrackerState, state: OnlineState) -> bool {
        if inner.state == state {
            return false;
        }
        inner.state = state;
        true
    }

    fn log_offline(inner: &mut TrackerState, details: &str) {
        let message = format!(
            "could not reach the backend: {details}. The client will operate in offline mode until the connection succeeds"
        );
        // Only the first transition to offline is worth a warning.
        if inner.should_warn_offline {
            LOGGER.warn(message);
            inner.should_warn_offline = false;
        } else {
            LOGGER.debug(message);
        }
    }

    fn inner(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
