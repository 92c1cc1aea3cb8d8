use std::future::Future;
use std::time::Duration;

use futures::future::{select, Either};

/// Spawns a task on the current tokio runtime, or on a shared background
/// runtime when called outside one.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle, Runtime};

    static BACKGROUND_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
        Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("docsync-background")
            .enable_all()
            .build()
            .expect("failed to build background tokio runtime")
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else {
        let _ = BACKGROUND_RUNTIME.spawn(future);
    }
}

pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

/// Resolves to `None` when `duration` elapses first.
pub async fn timeout<F>(duration: Duration, future: F) -> Option<F::Output>
where
    F: Future,
{
    tokio::time::timeout(duration, future).await.ok()
}

/// Runs `future` until `cancel` resolves. Returns `None` when cancelled.
pub async fn until_cancelled<F, C>(future: F, cancel: C) -> Option<F::Output>
where
    F: Future,
    C: Future,
{
    let future = Box::pin(future);
    let cancel = Box::pin(cancel);
    match select(future, cancel).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(_) => None,
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_reports_expiry() {
        let result = timeout(Duration::from_millis(5), futures::future::pending::<()>()).await;
        assert!(result.is_none());
        let result = timeout(Duration::from_millis(50), async { 7 }).await;
        assert_eq!(result, Some(7));
    }

    #[tokio::test]
    async fn cancellation_wins_race() {
        let result = until_cancelled(futures::future::pending::<()>(), async {}).await;
        assert!(result.is_none());
    }

    #[test]
    fn spawns_without_ambient_runtime() {
        let (tx, rx) = std::sync::mpsc::channel();
        spawn_detached(async move {
            let _ = tx.send(1);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }
}
