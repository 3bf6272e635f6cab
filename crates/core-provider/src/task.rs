//! In-flight render task: an awaitable completion plus a cancel token.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, oneshot};

use crate::RenderError;

/// Cloneable cancel token for one render task. Cancellation is a one-way
/// flip; the worker observes it at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct RenderControl {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl RenderControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the token. Safe to call any number of times.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is flipped.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to one in-flight rasterization. Completion is exactly-once:
/// either the worker's result or `Err(RenderError::Cancelled)`.
#[derive(Debug)]
pub struct RenderTask {
    control: RenderControl,
    completion: oneshot::Receiver<Result<(), RenderError>>,
}

impl RenderTask {
    /// Spawn the worker future. It races against the cancel token, so a
    /// task stuck in decoder work still rejects promptly on cancel.
    pub fn spawn<F, Fut>(work: F) -> RenderTask
    where
        F: FnOnce(RenderControl) -> Fut,
        Fut: Future<Output = Result<(), RenderError>> + Send + 'static,
    {
        let control = RenderControl::new();
        let (tx, rx) = oneshot::channel();
        let worker_control = control.clone();
        let fut = work(worker_control.clone());
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = fut => result,
                _ = worker_control.cancelled() => Err(RenderError::Cancelled),
            };
            let _ = tx.send(outcome);
        });
        RenderTask {
            control,
            completion: rx,
        }
    }

    /// A task that already finished with `result` (degenerate providers).
    pub fn ready(result: Result<(), RenderError>) -> RenderTask {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        RenderTask {
            control: RenderControl::new(),
            completion: rx,
        }
    }

    /// Clone of the cancel token, kept by slots so cancellation passes can
    /// kill the task while another task awaits completion.
    pub fn control(&self) -> RenderControl {
        self.control.clone()
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Await completion. A dropped worker counts as cancellation, never as
    /// success.
    pub async fn wait(self) -> Result<(), RenderError> {
        match self.completion.await {
            Ok(result) => result,
            Err(_) => Err(RenderError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_once_with_worker_result() {
        let task = RenderTask::spawn(|_ctl| async { Ok(()) });
        assert!(task.wait().await.is_ok());
    }

    #[tokio::test]
    async fn cancel_interrupts_sleeping_worker() {
        let task = RenderTask::spawn(|_ctl| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        task.cancel();
        task.cancel(); // idempotent
        let err = task.wait().await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn worker_can_observe_token_and_bail() {
        let task = RenderTask::spawn(|ctl| async move {
            ctl.cancelled().await;
            Err(RenderError::Cancelled)
        });
        let control = task.control();
        control.cancel();
        assert!(control.is_cancelled());
        assert!(task.wait().await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_completion_is_a_no_op() {
        let task = RenderTask::spawn(|_ctl| async { Ok(()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.cancel();
        // The worker won its race; the stored result stands.
        assert!(task.wait().await.is_ok());
    }
}
