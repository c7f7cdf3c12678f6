//! Delayed background tasks with a cancellation handle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to a task scheduled with [`schedule_after`].
#[derive(Debug)]
pub struct TaskHandle {
    handle: JoinHandle<()>,
    started: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Cancel the task if its delay has not elapsed yet. A task that already
    /// started runs to completion. Returns whether the task was cancelled.
    pub fn cancel(&self) -> bool {
        if self.started.load(Ordering::SeqCst) {
            return false;
        }
        self.handle.abort();
        true
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Run `task` on the tokio runtime once `delay` has elapsed.
pub fn schedule_after<F>(delay: Duration, task: F) -> TaskHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let started = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        flag.store(true, Ordering::SeqCst);
        task.await;
    });
    TaskHandle { handle, started }
}
