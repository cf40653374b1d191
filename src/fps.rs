//! Frame rate measurement.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Sliding-window frame rate counter.
///
/// Keeps the arrival instants of the last `window` frames and reports the
/// average rate over them.
#[derive(Debug, Clone)]
pub struct FpsCounter {
    window: usize,
    arrivals: VecDeque<Instant>,
    last_report: Option<Instant>,
}

impl FpsCounter {
    /// Creates a counter averaging over `window` frames (at least two).
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            arrivals: VecDeque::with_capacity(window),
            last_report: None,
        }
    }

    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&mut self, at: Instant) {
        if self.arrivals.len() == self.window {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(at);
    }

    /// Average frames per second over the window, or 0 with fewer than two
    /// samples.
    pub fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.arrivals.front(), self.arrivals.back()) else {
            return 0.0;
        };
        let span = last.duration_since(*first).as_secs_f64();
        if self.arrivals.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        (self.arrivals.len() - 1) as f64 / span
    }

    /// True once per `interval`, used to throttle periodic rate logging.
    pub(crate) fn report_due(&mut self, interval: Duration, now: Instant) -> bool {
        match self.last_report {
            Some(last) if now.duration_since(last) < interval => false,
            _ => {
                self.last_report = Some(now);
                true
            }
        }
    }
}
