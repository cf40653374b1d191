//! Blocking wait across several streams.
//!
//! Every thread that waits gets its own [`FrameEvent`], created on first use
//! and cached for the lifetime of the context. Every frame delivery signals
//! all cached events; a woken thread re-scans its streams and either returns
//! or goes back to sleep for the rest of its budget.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{
    device::{same_device, DeviceRef},
    event::{FrameEvent, WaitResult},
    stream::Stream,
    Error, Result,
};

/// Maximum number of streams a single [`crate::Context::wait_for_any_stream`]
/// call accepts.
pub const MAX_WAITED_STREAMS: usize = 50;

#[derive(Debug, Default)]
struct Waiters {
    closed: bool,
    events: HashMap<ThreadId, Arc<FrameEvent>>,
}

/// Per-thread wait events plus the wake-all fan-out.
#[derive(Debug, Default)]
pub(crate) struct WaitCoordinator {
    waiters: Mutex<Waiters>,
}

impl WaitCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The calling thread's event, created on first use.
    fn thread_event(&self) -> Result<Arc<FrameEvent>> {
        let mut waiters = self.lock();
        if waiters.closed {
            return Err(Error::ShutDown("context".into()));
        }
        let event = waiters
            .events
            .entry(thread::current().id())
            .or_insert_with(|| Arc::new(FrameEvent::new()));
        Ok(Arc::clone(event))
    }

    /// Signals every waiting thread.
    pub(crate) fn notify_all(&self) {
        let waiters = self.lock();
        for event in waiters.events.values() {
            event.signal();
        }
    }

    /// Closes every cached event, waking blocked waiters, and refuses new
    /// waits.
    pub(crate) fn shutdown(&self) {
        let events: Vec<_> = {
            let mut waiters = self.lock();
            waiters.closed = true;
            waiters.events.drain().map(|(_, event)| event).collect()
        };
        for event in events {
            event.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_events(&self) -> usize {
        self.lock().events.len()
    }

    /// Blocks until one of `streams` has a frame ready, returning its index.
    ///
    /// `None` entries are skipped. When several streams are ready the one
    /// whose pending frame has the lowest timestamp wins; ties go to the
    /// earlier entry. `timeout` of `None` waits forever.
    pub(crate) fn wait_for_any(
        &self,
        streams: &[Option<&Stream>],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        if streams.len() > MAX_WAITED_STREAMS {
            return Err(Error::NotSupported(format!(
                "cannot wait on {} streams (maximum is {MAX_WAITED_STREAMS})",
                streams.len()
            )));
        }

        let event = self.thread_event()?;

        let mut devices: Vec<&DeviceRef> = Vec::new();
        for stream in streams.iter().flatten() {
            if !devices.iter().any(|known| same_device(known, stream.device())) {
                devices.push(stream.device());
            }
        }

        let start = Instant::now();
        loop {
            let mut ready: Option<(usize, u64)> = None;
            for (index, stream) in streams.iter().enumerate() {
                let Some(stream) = stream else { continue };
                if let Some(timestamp) = stream.peek_timestamp() {
                    if ready.map_or(true, |(_, best)| timestamp < best) {
                        ready = Some((index, timestamp));
                    }
                }
            }
            if let Some((index, _)) = ready {
                return Ok(index);
            }

            for device in &devices {
                if let Err(e) = device.poke() {
                    trace!(driver = device.driver_id(), error = %e, "device poke failed");
                }
            }

            let remaining = timeout.map(|timeout| timeout.saturating_sub(start.elapsed()));
            match event.wait_for(remaining) {
                WaitResult::Signaled => {}
                WaitResult::TimedOut => {
                    let waited = streams.iter().flatten().count();
                    let timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
                    debug!(streams = waited, timeout_ms, "wait for streams timed out");
                    return Err(Error::TimedOut {
                        timeout_ms,
                        streams: waited,
                    });
                }
                WaitResult::Closed => return Err(Error::ShutDown("context".into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_cached_per_thread() {
        let coordinator = Arc::new(WaitCoordinator::new());

        let result = coordinator.wait_for_any(&[], Some(Duration::from_millis(1)));
        assert!(matches!(result, Err(Error::TimedOut { streams: 0, .. })));
        assert_eq!(coordinator.cached_events(), 1);

        // Same thread, same event
        let _ = coordinator.wait_for_any(&[None], Some(Duration::ZERO));
        assert_eq!(coordinator.cached_events(), 1);

        let other = Arc::clone(&coordinator);
        thread::spawn(move || {
            let _ = other.wait_for_any(&[], Some(Duration::ZERO));
        })
        .join()
        .unwrap();
        assert_eq!(coordinator.cached_events(), 2);
    }

    #[test]
    fn test_shutdown_drops_events_and_refuses_waits() {
        let coordinator = Arc::new(WaitCoordinator::new());
        let _ = coordinator.wait_for_any(&[], Some(Duration::ZERO));

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.wait_for_any(&[], None))
        };
        thread::sleep(Duration::from_millis(20));
        coordinator.shutdown();

        assert!(matches!(waiter.join().unwrap(), Err(Error::ShutDown(_))));
        assert_eq!(coordinator.cached_events(), 0);
        assert!(matches!(
            coordinator.wait_for_any(&[], Some(Duration::ZERO)),
            Err(Error::ShutDown(_))
        ));
    }

    #[test]
    fn test_notify_wakes_a_waiter_without_ready_streams() {
        let coordinator = Arc::new(WaitCoordinator::new());
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                let start = Instant::now();
                let result = coordinator.wait_for_any(&[], Some(Duration::from_millis(200)));
                (result, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        coordinator.notify_all();

        // Woken early, rescans, finds nothing and sleeps out the rest
        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(Error::TimedOut { timeout_ms: 200, .. })));
        assert!(elapsed >= Duration::from_millis(190));
    }
}
