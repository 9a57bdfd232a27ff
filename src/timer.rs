//! Owned, cancellable one-shot timers.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Runs a task after a delay unless cancelled first.
///
/// The timer is owned by whoever armed it; dropping it cancels the pending
/// task, so a component's teardown cannot leave a timer behind.
#[derive(Debug)]
pub struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn start<F, Fut>(delay: Duration, on_fire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire().await;
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let timer = Timer::start(Duration::from_secs(30), move || async move {
            f.store(true, Ordering::SeqCst);
        });
        assert!(timer.is_pending());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_drop_prevent_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let mut timer = Timer::start(Duration::from_secs(1), move || async move {
            f.store(true, Ordering::SeqCst);
        });
        timer.cancel();
        assert!(!timer.is_pending());

        let f = fired.clone();
        drop(Timer::start(Duration::from_secs(1), move || async move {
            f.store(true, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
