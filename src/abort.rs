//! Abort watchdog.
//!
//! A background timer that flips a shared [`AbortSignal`] once a deadline
//! passes, unless [`Watchdog::cancel`] wakes it first. Transfer roles never see
//! the watchdog; they only get an [`AbortChecker`] to poll at their own safe
//! points.
//!
//! ```text
//!   foreground                      watchdog thread
//!   ----------                      ---------------
//!   arm(T) ----------------------> wait_timeout_while(!cancelled, T)
//!   transfer().await                    |
//!   cancel() --- notify_one -------> woken: "finished normally"
//!                                   or
//!                                   timed out: signal.trigger()
//!   drop(watchdog) -- join ------->  exit
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// AbortSignal
// =============================================================================

/// Single-writer, many-reader abort flag. Monotonic: once triggered it stays
/// triggered.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    triggered: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Returns true only for the call that actually flipped the flag.
    fn trigger(&self) -> bool {
        !self.triggered.swap(true, Ordering::AcqRel)
    }
}

// =============================================================================
// AbortChecker
// =============================================================================

/// Capability handed to a transfer role to decide whether it should stop.
pub trait AbortChecker: Send + Sync {
    fn should_abort(&self) -> bool;
}

/// Read-only view over an [`AbortSignal`].
#[derive(Debug, Clone)]
pub struct SignalChecker {
    signal: AbortSignal,
}

impl SignalChecker {
    pub fn new(signal: AbortSignal) -> Self {
        Self { signal }
    }
}

impl AbortChecker for SignalChecker {
    fn should_abort(&self) -> bool {
        self.signal.is_triggered()
    }
}

// =============================================================================
// Watchdog
// =============================================================================

#[derive(Debug, Default)]
struct WakeState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Owned countdown that triggers its [`AbortSignal`] on expiry.
///
/// At most one background thread is started per watchdog. Dropping the
/// watchdog cancels it and joins the thread.
#[derive(Debug, Default)]
pub struct Watchdog {
    signal: AbortSignal,
    state: Arc<WakeState>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The signal this watchdog triggers.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// A fresh checker observing this watchdog's signal.
    pub fn checker(&self) -> Arc<dyn AbortChecker> {
        Arc::new(SignalChecker::new(self.signal()))
    }

    /// Whether a background thread was started.
    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Start the countdown. A non-positive timeout, a second `arm`, or a
    /// watchdog that was already cancelled leaves it inert.
    pub fn arm(&mut self, timeout_secs: i64) {
        info!(timeout_secs, "Setting up abort");
        if timeout_secs <= 0 || self.handle.is_some() {
            return;
        }
        let timeout = Duration::from_secs(timeout_secs as u64);
        let state = Arc::clone(&self.state);
        let signal = self.signal.clone();

        let spawned = thread::Builder::new()
            .name("abort-watchdog".to_string())
            .spawn(move || run_countdown(&state, &signal, timeout));

        match spawned {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => warn!("Could not start abort watchdog, abort disabled: {}", e),
        }
    }

    /// Wake the countdown early. Idempotent and never blocks on the timer.
    pub fn cancel(&self) {
        let mut cancelled = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !*cancelled {
            *cancelled = true;
            self.state.wake.notify_one();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Abort watchdog thread panicked");
            }
        }
    }
}

fn run_countdown(state: &WakeState, signal: &AbortSignal, timeout: Duration) {
    info!("Will abort in {} seconds.", timeout.as_secs());
    let guard = state
        .cancelled
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let (cancelled, _) = state
        .wake
        .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
        .unwrap_or_else(PoisonError::into_inner);

    if *cancelled {
        info!("Already finished normally, no abort.");
    } else if signal.trigger() {
        warn!("Requesting abort after {} seconds.", timeout.as_secs());
    } else {
        debug!("Abort already requested");
    }
}

/// Cancels the watchdog when dropped, so every exit path out of a transfer
/// stops the timer.
pub struct CancelOnDrop<'a> {
    watchdog: &'a Watchdog,
}

impl<'a> CancelOnDrop<'a> {
    pub fn new(watchdog: &'a Watchdog) -> Self {
        Self { watchdog }
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.watchdog.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_non_positive_timeout_is_noop() {
        for timeout in [0, -1, i64::MIN] {
            let mut watchdog = Watchdog::new();
            let checker = watchdog.checker();
            watchdog.arm(timeout);
            assert!(!watchdog.is_armed());
            thread::sleep(Duration::from_millis(20));
            assert!(!checker.should_abort());
        }
    }

    #[test]
    fn test_cancel_before_expiry_keeps_signal_clear() {
        let mut watchdog = Watchdog::new();
        let signal = watchdog.signal();
        watchdog.arm(1);
        assert!(watchdog.is_armed());
        thread::sleep(Duration::from_millis(10));
        watchdog.cancel();
        drop(watchdog);
        assert!(!signal.is_triggered());
        thread::sleep(Duration::from_millis(1200));
        assert!(!signal.is_triggered());
    }

    #[test]
    fn test_expiry_triggers_signal_once() {
        let mut watchdog = Watchdog::new();
        let checker = watchdog.checker();
        watchdog.arm(1);
        thread::sleep(Duration::from_millis(1500));
        assert!(checker.should_abort());

        // Late cancel has no effect on an expired watchdog.
        watchdog.cancel();
        watchdog.cancel();
        assert!(checker.should_abort());
        drop(watchdog);
        assert!(checker.should_abort());
    }

    #[test]
    fn test_cancel_is_idempotent_and_non_blocking() {
        let watchdog = Watchdog::new();
        let start = Instant::now();
        watchdog.cancel();
        watchdog.cancel();
        assert!(start.elapsed() < Duration::from_millis(100));

        let mut watchdog = Watchdog::new();
        watchdog.arm(30);
        let start = Instant::now();
        for _ in 0..10 {
            watchdog.cancel();
        }
        drop(watchdog);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cancel_before_arm_leaves_watchdog_inert() {
        let mut watchdog = Watchdog::new();
        let signal = watchdog.signal();
        watchdog.cancel();
        watchdog.arm(1);
        thread::sleep(Duration::from_millis(1300));
        assert!(!signal.is_triggered());
    }

    #[test]
    fn test_second_arm_is_ignored() {
        let mut watchdog = Watchdog::new();
        watchdog.arm(30);
        watchdog.arm(1);
        thread::sleep(Duration::from_millis(1300));
        assert!(!watchdog.signal().is_triggered());
    }

    #[test]
    fn test_checkers_share_one_signal() {
        let signal = AbortSignal::new();
        let a = SignalChecker::new(signal.clone());
        let b = SignalChecker::new(signal.clone());
        assert!(!a.should_abort() && !b.should_abort());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(a.should_abort() && b.should_abort());
    }

    #[test]
    fn test_cancel_on_drop_guard() {
        let mut watchdog = Watchdog::new();
        watchdog.arm(1);
        {
            let _guard = CancelOnDrop::new(&watchdog);
        }
        thread::sleep(Duration::from_millis(1300));
        assert!(!watchdog.signal().is_triggered());
    }
}
