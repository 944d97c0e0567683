use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// Aborts the wrapped task when dropped.
pub struct ThreadHandle(pub AbortHandle);

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Wakes the reader of a subscriber queue. A raise with nobody waiting is
/// kept for the next wait.
#[derive(Clone, Default)]
pub struct QueueSignal(Arc<Notify>);

impl QueueSignal {
    pub fn raise(&self) {
        self.0.notify_one();
    }

    /// Return when raised or after `timeout`.
    pub async fn wait(&self, timeout: Duration) {
        tokio::time::timeout(timeout, self.0.notified()).await.ok();
    }
}
