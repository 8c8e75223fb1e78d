//! Scheduled callbacks for the session state machine.
//!
//! Timer ids are opaque integers unique for the process lifetime. Expiry
//! delivers the callback as a post onto the looper supplied at start, so
//! timer handlers run with the same serialization guarantees as everything
//! else on that component.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::looper::Looper;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Starts and cancels one-shot timers.
#[derive(Default)]
pub struct TimerManager {
    pending: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot timer. On expiry `callback` is posted onto `looper`.
    pub fn start_timer(
        self: &Arc<Self>,
        duration: Duration,
        looper: &Arc<Looper>,
        label: &'static str,
        callback: impl FnOnce() + Send + 'static,
    ) -> u64 {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let manager = Arc::clone(self);
        let looper = Arc::clone(looper);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            manager.pending.lock().unwrap().remove(&id);
            debug!(timer_id = id, label, "timer expired");
            looper.post(callback);
        });
        self.pending.lock().unwrap().insert(id, handle);
        debug!(timer_id = id, label, ?duration, "timer started");
        id
    }

    /// Cancels a pending timer. Cancelling an already-expired or unknown id
    /// is a no-op.
    pub fn cancel_timer(&self, id: u64) {
        if let Some(handle) = self.pending.lock().unwrap().remove(&id) {
            handle.abort();
            debug!(timer_id = id, "timer cancelled");
        }
    }

    /// Number of timers currently armed.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_timer_fires_on_looper() {
        let manager = Arc::new(TimerManager::new());
        let looper = Arc::new(Looper::new("timer-test"));
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        manager.start_timer(Duration::from_millis(10), &looper, "test", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_timer_does_not_fire() {
        let manager = Arc::new(TimerManager::new());
        let looper = Arc::new(Looper::new("timer-test"));
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let id = manager.start_timer(Duration::from_millis(20), &looper, "test", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        manager.cancel_timer(id);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timer_ids_are_unique() {
        let manager = Arc::new(TimerManager::new());
        let looper = Arc::new(Looper::new("timer-test"));
        let a = manager.start_timer(Duration::from_secs(60), &looper, "a", || {});
        let b = manager.start_timer(Duration::from_secs(60), &looper, "b", || {});
        assert_ne!(a, b);
        manager.cancel_timer(a);
        manager.cancel_timer(b);
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_noop() {
        let manager = Arc::new(TimerManager::new());
        manager.cancel_timer(424242);
    }
}
