//! Auto-reset wake-up signal used by streams and waiting threads.
//!
//! A [`FrameEvent`] is the blocking primitive behind `read_frame` and
//! `wait_for_any_stream`. It follows the flag + mutex + condvar pattern: a
//! producer calls [`FrameEvent::signal`] after delivering a frame, and one
//! waiter consumes the signal. A signal raised while nobody waits is kept
//! until the next wait, so a frame delivered between "check" and "wait" is
//! never missed.
//!
//! Closing the event wakes every waiter and makes every later wait fail with
//! [`WaitResult::Closed`]. Holders and contexts close their events on
//! teardown so nothing stays blocked on a destroyed stream.

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Outcome of waiting on a [`FrameEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The event was signaled; the signal has been consumed.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
    /// The event was closed.
    Closed,
}

#[derive(Debug, Default)]
struct State {
    signaled: bool,
    closed: bool,
}

/// Thread-safe auto-reset event.
///
/// # Poison Recovery
///
/// A panic on another thread while holding the internal lock does not make
/// the event unusable; the guard is recovered and waiting continues.
#[derive(Debug, Default)]
pub struct FrameEvent {
    state: Mutex<State>,
    cv: Condvar,
}

impl FrameEvent {
    /// Creates a new, unsignaled event.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signals the event and wakes the waiters.
    ///
    /// Repeated signals before a wait collapse into one.
    pub fn signal(&self) {
        let mut state = self.lock();
        state.signaled = true;
        self.cv.notify_all();
    }

    /// Clears a pending signal without waiting.
    pub fn reset(&self) {
        self.lock().signaled = false;
    }

    /// True if a signal is pending.
    pub fn is_signaled(&self) -> bool {
        self.lock().signaled
    }

    /// Wakes every waiter and rejects all future waits.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Blocks until signaled or closed.
    pub fn wait(&self) -> WaitResult {
        let mut state = self.lock();
        loop {
            if state.closed {
                return WaitResult::Closed;
            }
            if state.signaled {
                state.signaled = false;
                return WaitResult::Signaled;
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until signaled, closed, or `timeout` elapses.
    ///
    /// A zero timeout only consumes a signal that is already pending.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        let start = Instant::now();
        let mut state = self.lock();
        loop {
            if state.closed {
                return WaitResult::Closed;
            }
            if state.signaled {
                state.signaled = false;
                return WaitResult::Signaled;
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return WaitResult::TimedOut;
            }

            let (guard, _) = self
                .cv
                .wait_timeout(state, timeout - elapsed)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Waits with an optional budget; `None` waits forever.
    pub fn wait_for(&self, timeout: Option<Duration>) -> WaitResult {
        match timeout {
            Some(timeout) => self.wait_timeout(timeout),
            None => self.wait(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_starts_unsignaled() {
        let event = FrameEvent::new();
        assert!(!event.is_signaled());
        assert!(!event.is_closed());
    }

    #[test]
    fn test_signal_before_wait_is_kept() {
        let event = FrameEvent::new();
        event.signal();
        assert_eq!(
            event.wait_timeout(Duration::from_millis(100)),
            WaitResult::Signaled
        );
    }

    #[test]
    fn test_signal_is_auto_reset() {
        let event = FrameEvent::new();
        event.signal();
        event.signal();
        assert_eq!(event.wait(), WaitResult::Signaled);
        assert!(!event.is_signaled());
        assert_eq!(
            event.wait_timeout(Duration::from_millis(5)),
            WaitResult::TimedOut
        );
    }

    #[test]
    fn test_reset_clears_pending_signal() {
        let event = FrameEvent::new();
        event.signal();
        event.reset();
        assert_eq!(event.wait_timeout(Duration::ZERO), WaitResult::TimedOut);
    }

    #[test]
    fn test_wait_then_signal() {
        let event = Arc::new(FrameEvent::new());
        let signaler = Arc::clone(&event);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaler.signal();
        });

        assert_eq!(event.wait_timeout(Duration::from_secs(1)), WaitResult::Signaled);
        handle.join().unwrap();
    }

    #[test]
    fn test_timeout_expires() {
        let event = FrameEvent::new();
        let start = Instant::now();
        assert_eq!(
            event.wait_timeout(Duration::from_millis(20)),
            WaitResult::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_close_wakes_blocked_waiter() {
        let event = Arc::new(FrameEvent::new());
        let waiter = Arc::clone(&event);

        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(10));
        event.close();

        assert_eq!(handle.join().unwrap(), WaitResult::Closed);
        assert_eq!(event.wait_for(None), WaitResult::Closed);
    }

    #[test]
    fn test_concurrent_signal_and_wait() {
        for _ in 0..100 {
            let event = Arc::new(FrameEvent::new());
            let signaler = Arc::clone(&event);

            let handle = thread::spawn(move || signaler.signal());
            let result = event.wait_timeout(Duration::from_secs(1));
            handle.join().unwrap();

            assert_eq!(result, WaitResult::Signaled);
        }
    }
}
