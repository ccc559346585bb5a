//! A single cancellation signal shared by every component of a running
//! pipeline: the driver, every background receiver/sender thread,
//! the discovery beacon/finder, and the script host.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Fires the token. Idempotent.
    pub fn fire(&self) {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock().unwrap();
        *fired = true;
        cvar.notify_all();
    }

    pub fn is_fired(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Blocks until fired or `timeout` elapses. Returns true if fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let fired = lock.lock().unwrap();
        if *fired {
            return true;
        }
        let (fired, _) = cvar.wait_timeout(fired, timeout).unwrap();
        *fired
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fire_is_observed_by_another_thread() {
        let token = CancelToken::new();
        assert!(!token.is_fired());
        let t2 = token.clone();
        let handle = thread::spawn(move || {
            t2.wait_timeout(Duration::from_secs(5));
            t2.is_fired()
        });
        token.fire();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn wait_timeout_returns_false_when_not_fired() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }
}
