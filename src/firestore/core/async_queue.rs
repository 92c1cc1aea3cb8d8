use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::platform::runtime;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Well-known delayed operations. At most one of each kind is expected to be
/// pending per owner, which lets tests fast-forward them by id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    HealthCheckTimeout,
    OnlineStateTimeout,
    ClientMetadataRefresh,
    LruGarbageCollection,
}

/// Single-consumer FIFO work queue.
///
/// Every mutation of engine state runs as a job on this queue, so jobs never
/// interleave. A job must not await another `enqueue` on the same queue;
/// use [`enqueue_and_forget`](Self::enqueue_and_forget) from inside a job.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    sender: async_channel::Sender<Job>,
    shutting_down: AtomicBool,
    next_delay_id: AtomicU64,
    delayed: Mutex<HashMap<u64, DelayedEntry>>,
}

struct DelayedEntry {
    timer_id: TimerId,
    trigger: async_channel::Sender<()>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<Job>();
        runtime::spawn_detached(async move {
            while let Ok(job) = receiver.recv().await {
                job.await;
            }
        });
        Self {
            inner: Arc::new(QueueInner {
                sender,
                shutting_down: AtomicBool::new(false),
                next_delay_id: AtomicU64::new(0),
                delayed: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Runs `operation` after every previously enqueued job and returns its
    /// result. Fails with `Cancelled` once shutdown has begun.
    pub async fn enqueue<F, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(cancelled("the operation queue has been shut down"));
        }
        self.push_with_result(operation).await
    }

    pub fn enqueue_and_forget<F>(&self, operation: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            log::debug!("dropping job enqueued after shutdown");
            return;
        }
        self.push(Box::pin(operation));
    }

    /// Enqueues the final job and rejects everything enqueued afterwards.
    /// Jobs already queued still run, in order, before `operation`.
    pub async fn enqueue_and_initiate_shutdown<F>(&self, operation: F) -> FirestoreResult<()>
    where
        F: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel_all_delayed_operations();
        let result = self.push_with_result(operation).await;
        self.inner.sender.close();
        result
    }

    /// Schedules `operation` to be enqueued once `delay` elapses.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        operation: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_delay_id.fetch_add(1, Ordering::SeqCst);
        let cancelled_flag = Arc::new(AtomicBool::new(false));
        let (trigger, fire_early) = async_channel::bounded::<()>(1);
        let handle = DelayedOperation {
            id,
            timer_id,
            cancelled: cancelled_flag.clone(),
            trigger: trigger.clone(),
            queue: Arc::downgrade(&self.inner),
        };

        if self.is_shutting_down() {
            cancelled_flag.store(true, Ordering::SeqCst);
            return handle;
        }

        self.inner
            .delayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, DelayedEntry { timer_id, trigger });

        let queue = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            // Either the delay elapses or the trigger fires; a closed trigger
            // means cancellation.
            let _ = runtime::until_cancelled(runtime::sleep(delay), fire_early.recv()).await;
            let Some(inner) = queue.upgrade() else {
                return;
            };
            inner
                .delayed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            if cancelled_flag.load(Ordering::SeqCst) || inner.shutting_down.load(Ordering::SeqCst)
            {
                return;
            }
            let job_flag = cancelled_flag.clone();
            let _ = inner.sender.try_send(Box::pin(async move {
                if !job_flag.load(Ordering::SeqCst) {
                    operation().await;
                }
            }));
        });
        handle
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .delayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|entry| entry.timer_id == timer_id)
    }

    /// Fires every pending delayed operation with `timer_id` now.
    pub fn run_delayed_operations_now(&self, timer_id: TimerId) {
        let triggers: Vec<_> = self
            .inner
            .delayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.timer_id == timer_id)
            .map(|entry| entry.trigger.clone())
            .collect();
        for trigger in triggers {
            let _ = trigger.try_send(());
        }
    }

    /// Resolves once every job enqueued before this call has finished.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.push_with_result(async { Ok(()) }).await
    }

    fn cancel_all_delayed_operations(&self) {
        let entries: Vec<_> = self
            .inner
            .delayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, entry) in entries {
            entry.trigger.close();
        }
    }

    fn push(&self, job: Job) {
        if self.inner.sender.try_send(job).is_err() {
            log::debug!("operation queue closed; job dropped");
        }
    }

    async fn push_with_result<F, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = async_channel::bounded(1);
        self.push(Box::pin(async move {
            let result = operation.await;
            let _ = result_tx.send(result).await;
        }));
        result_rx
            .recv()
            .await
            .unwrap_or_else(|_| Err(cancelled("the operation queue has been shut down")))
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a job scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
    trigger: async_channel::Sender<()>,
    queue: Weak<QueueInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running. Works even after the delay has
    /// elapsed, as long as the job has not started.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.queue.upgrade() {
            inner
                .delayed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
        self.trigger.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("timer_id", &self.timer_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[tokio::test]
    async fn runs_jobs_in_fifo_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            queue.enqueue_and_forget(async move {
                runtime::sleep(Duration::from_millis(5 - i)).await;
                log.lock().unwrap().push(i);
            });
        }
        let value = queue.enqueue(async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn cancelled_delay_never_runs() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let op = queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_millis(20), move || async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        op.cancel();
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        runtime::sleep(Duration::from_millis(50)).await;
        queue.drain().await.unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn delayed_operation_can_fire_early() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        queue.enqueue_after_delay(TimerId::ClientMetadataRefresh, Duration::from_secs(3600), move || async move {
            flag.store(true, Ordering::SeqCst);
        });
        queue.run_delayed_operations_now(TimerId::ClientMetadataRefresh);
        for _ in 0..50 {
            if ran.load(Ordering::SeqCst) {
                break;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_rejects_later_jobs() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        queue.enqueue_and_forget(async move {
            flag.store(true, Ordering::SeqCst);
        });
        queue.enqueue_and_initiate_shutdown(async { Ok(()) }).await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
        let err = queue.enqueue(async { Ok(1) }).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
    }
}
