//! Single-slot delayed task.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Holds at most one pending delayed task. Scheduling again replaces the pending one, and
/// dropping the timer cancels it.
#[derive(Debug, Default)]
pub struct SlotTimer {
    pending: Option<JoinHandle<()>>,
}

impl SlotTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, cancelling whatever was pending.
    pub fn schedule<F>(&mut self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SlotTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_task(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = SlotTimer::new();
        timer.schedule(Duration::from_millis(100), counter_task(&fired));
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = SlotTimer::new();
        timer.schedule(Duration::from_millis(100), counter_task(&fired));
        tokio::time::sleep(Duration::from_millis(80)).await;
        timer.schedule(Duration::from_millis(100), counter_task(&fired));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = SlotTimer::new();
        timer.schedule(Duration::from_millis(10), counter_task(&fired));
        timer.cancel();
        assert!(!timer.is_pending());

        let mut dropped = SlotTimer::new();
        dropped.schedule(Duration::from_millis(10), counter_task(&fired));
        drop(dropped);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
