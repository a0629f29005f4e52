//! Bounded, cancellable waiting.
//!
//! Every blocking pause in the pipeline (boot delay, shutdown wait, IP
//! discovery) goes through [`Waiter`] so that an overall timeout and the
//! build's cancellation flag are always honored and nothing busy-loops
//! against the control plane.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;

/// Shared cancellation flag threaded through the build.
///
/// Set once, observed by every wait loop within one polling interval.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate reported success.
    Done,
    /// The configured timeout elapsed first.
    TimedOut,
    /// Cancellation was requested.
    Cancelled,
}

/// A predicate poller with an overall timeout.
#[derive(Debug, Clone, Copy)]
pub struct Waiter {
    /// Overall bound on the wait.
    pub timeout: Duration,
    /// How often the predicate is evaluated.
    pub interval: Duration,
}

impl Waiter {
    /// Poll `predicate` every `interval` until it returns `true`, the
    /// timeout elapses, or `cancel` fires. Predicate errors abort the wait
    /// immediately.
    pub fn wait_until<F>(&self, cancel: &CancelToken, mut predicate: F) -> Result<WaitOutcome>
    where
        F: FnMut() -> Result<bool>,
    {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Ok(WaitOutcome::Cancelled);
            }
            if predicate()? {
                return Ok(WaitOutcome::Done);
            }
            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                return Ok(WaitOutcome::TimedOut);
            }
            let remaining = self.timeout - elapsed;
            std::thread::sleep(self.interval.min(remaining));
        }
    }
}

/// Sleep for `duration`, returning early when `cancel` fires.
pub fn interruptible_sleep(duration: Duration, cancel: &CancelToken) -> WaitOutcome {
    let waiter = Waiter {
        timeout: duration,
        interval: Duration::from_millis(100).min(duration),
    };
    // The predicate never succeeds; timing out is the normal exit.
    match waiter.wait_until(cancel, || Ok(false)) {
        Ok(WaitOutcome::Cancelled) => WaitOutcome::Cancelled,
        _ => WaitOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_success_wins() {
        let waiter = Waiter {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(1),
        };
        let mut calls = 0;
        let outcome = waiter
            .wait_until(&CancelToken::new(), || {
                calls += 1;
                Ok(calls >= 3)
            })
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Done);
        assert_eq!(calls, 3);
    }

    #[test]
    fn timeout_is_reported() {
        let waiter = Waiter {
            timeout: Duration::from_millis(20),
            interval: Duration::from_millis(5),
        };
        let outcome = waiter.wait_until(&CancelToken::new(), || Ok(false)).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn cancellation_preempts_the_predicate() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let waiter = Waiter {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(5),
        };
        let outcome = waiter.wait_until(&cancel, || Ok(false)).unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[test]
    fn predicate_errors_propagate() {
        let waiter = Waiter {
            timeout: Duration::from_secs(1),
            interval: Duration::from_millis(1),
        };
        let result = waiter.wait_until(&CancelToken::new(), || {
            Err(color_eyre::eyre::eyre!("metrics lookup failed"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn interruptible_sleep_returns_early_on_cancel() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let started = Instant::now();
        let outcome = interruptible_sleep(Duration::from_secs(10), &cancel);
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
