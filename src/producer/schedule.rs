//! Fixed-delay repeating task with explicit cancellation.

use std::ops::ControlFlow;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Runs a cycle, waits `period`, runs it again, until the cycle breaks or
/// the task is cancelled.
///
/// Each cycle runs to completion before the delay starts, so cycles of one
/// task never overlap.
pub struct RepeatingTask {
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    /// Spawn on the current tokio runtime. The first cycle runs immediately.
    pub fn spawn<F>(period: Duration, mut cycle: F) -> Self
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                if cycle().is_break() {
                    break;
                }
                tokio::time::sleep(period).await;
            }
        });
        Self { handle }
    }

    /// Stop the task. A pending delay never fires again.
    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
