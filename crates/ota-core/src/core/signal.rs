use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// One-shot latch the loader task trips once launch content is decided.
#[derive(Debug, Default)]
pub(crate) struct LaunchSignal {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl LaunchSignal {
    pub(crate) fn notify(&self) {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        *ready = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until notified or `timeout` elapses; returns whether it was notified.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        let (ready, _) = self
            .cond
            .wait_timeout_while(ready, timeout, |ready| !*ready)
            .unwrap_or_else(PoisonError::into_inner);
        *ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_times_out_without_notify() {
        let signal = LaunchSignal::default();
        assert!(!signal.wait(Duration::from_millis(10)));
        assert!(!signal.is_set());
    }

    #[test]
    fn notify_releases_waiters() {
        let signal = Arc::new(LaunchSignal::default());
        let notifier = Arc::clone(&signal);
        let handle = thread::spawn(move || notifier.notify());
        assert!(signal.wait(Duration::from_secs(5)));
        handle.join().expect("notifier thread");
        assert!(signal.wait(Duration::ZERO), "stays set");
    }
}
