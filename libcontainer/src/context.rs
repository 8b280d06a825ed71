//! A small cancellation token shared across a container's background
//! tasks (log tee, watchdog, OOM monitor all get their own handle). Plain
//! `Arc<AtomicBool>` plus a `Condvar` so a sleeping poller (the log
//! follower's backoff, the watchdog's interval) wakes immediately on
//! cancellation instead of waiting out its full sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    wake: Arc<(Mutex<()>, Condvar)>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            wake: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let (_lock, cvar) = &*self.wake;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `dur` unless cancelled first; returns `true` if the sleep
    /// was cut short by cancellation.
    pub fn sleep(&self, dur: Duration) -> bool {
        let (lock, cvar) = &*self.wake;
        let guard = lock.lock().unwrap();
        if self.is_cancelled() {
            return true;
        }
        let (_guard, timeout) = cvar.wait_timeout(guard, dur).unwrap();
        let _ = timeout;
        self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn sleep_returns_early_on_cancel() {
        let token = CancelToken::new();
        let t = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            t.cancel();
        });
        let start = Instant::now();
        let cancelled = token.sleep(Duration::from_secs(5));
        assert!(cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn already_cancelled_does_not_sleep() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        assert!(token.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
