use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ktl_types::KtlError;

#[derive(Default)]
struct State {
    cancelled: bool,
    reason: String,
    deadline: Option<Instant>,
}

/// Cancellable context threaded through every blocking wait in the
/// pipeline.
///
/// Cancellation is sticky and carries a reason (signal, timeout, user
/// abort). Tokens are cheap to clone; all clones share state. A deadline
/// set with [`CancelToken::with_timeout`] converts into cancellation the
/// first time anything observes it expired.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<State>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self::new();
        token.inner.0.lock().unwrap().deadline = Some(Instant::now() + timeout);
        token
    }

    pub fn cancel(&self, reason: &str) {
        let (lock, cv) = &*self.inner;
        let mut st = lock.lock().unwrap();
        if !st.cancelled {
            st.cancelled = true;
            st.reason = reason.to_string();
        }
        drop(st);
        cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        let mut st = lock.lock().unwrap();
        Self::observe(&mut st)
    }

    /// Error out of the current operation if cancelled.
    pub fn check(&self) -> Result<(), KtlError> {
        let (lock, _) = &*self.inner;
        let mut st = lock.lock().unwrap();
        if Self::observe(&mut st) {
            Err(KtlError::Cancelled(st.reason.clone()))
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early on cancellation. Returns `true`
    /// when the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (lock, cv) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut st = lock.lock().unwrap();
        loop {
            if Self::observe(&mut st) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (next, _) = cv.wait_timeout(st, deadline - now).unwrap();
            st = next;
        }
    }

    fn observe(st: &mut State) -> bool {
        if !st.cancelled {
            if let Some(deadline) = st.deadline {
                if Instant::now() >= deadline {
                    st.cancelled = true;
                    st.reason = "timeout expired".to_string();
                }
            }
        }
        st.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn cancel_is_sticky_and_keeps_first_reason() {
        let token = CancelToken::new();
        token.cancel("signal");
        token.cancel("later");
        let err = token.check().unwrap_err();
        assert!(err.to_string().contains("signal"));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn deadline_converts_to_cancellation() {
        let token = CancelToken::with_timeout(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(30));
        assert!(token.is_cancelled());
        assert!(token.check().unwrap_err().to_string().contains("timeout"));
    }

    #[test]
    fn sleep_wakes_early_on_cancel() {
        let token = CancelToken::new();
        let waker = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.cancel("stop");
        });
        let slept_fully = token.sleep(Duration::from_secs(30));
        assert!(!slept_fully);
        handle.join().unwrap();
    }

    #[test]
    fn sleep_completes_when_uncancelled() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)));
    }
}
