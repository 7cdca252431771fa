//! Count-based sliding window of call outcomes.
//!
//! A [`SlidingWindow`] keeps the last `capacity` [`Measurement`]s in a
//! ring that grows on demand up to its capacity. When a new measurement arrives and the window is
//! full, the oldest one is evicted and its contribution subtracted from the
//! running counters.
//!
//! # Complexity
//! - `record`, `snapshot`, `len`, `is_full` and `capacity` are **O(1)**.
//!
//! # Thread Safety
//! - No interior mutability. Callers serialize access (the circuit breaker
//!   keeps its windows under its state mutex).

use std::collections::VecDeque;
use std::time::Duration;

/// Outcome of one call as reported to a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOutcome {
    Success,
    Failure,
    /// A success that is counted as slow regardless of its duration
    Slow,
}

/// One recorded call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub failed: bool,
    pub slow: bool,
    pub duration: Duration,
}

impl Measurement {
    #[must_use]
    pub const fn new(failed: bool, slow: bool, duration: Duration) -> Self {
        Self { failed, slow, duration }
    }
}

/// Aggregated counters of a window at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub total_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    pub slow_failed_calls: u32,
    pub total_duration: Duration,
}

impl WindowSnapshot {
    pub fn successful_calls(&self) -> u32 {
        self.total_calls - self.failed_calls
    }

    /// Failure rate in percent, `0.0` for an empty window
    pub fn failure_rate(&self) -> f32 {
        percentage(self.failed_calls, self.total_calls)
    }

    /// Slow call rate in percent, `0.0` for an empty window
    pub fn slow_call_rate(&self) -> f32 {
        percentage(self.slow_calls, self.total_calls)
    }

    pub fn average_duration(&self) -> Duration {
        if self.total_calls == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.total_calls
        }
    }
}

fn percentage(part: u32, total: u32) -> f32 {
    if total == 0 {
        0.0
    } else {
        part as f32 * 100.0 / total as f32
    }
}

/// Fixed-capacity window over the most recent call outcomes
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use bulwark::resilience::{Measurement, SlidingWindow};
///
/// let mut window = SlidingWindow::new(2);
/// window.record(Measurement::new(true, false, Duration::from_millis(5)));
/// window.record(Measurement::new(false, false, Duration::from_millis(5)));
/// let snapshot = window.record(Measurement::new(false, false, Duration::from_millis(5)));
///
/// // the first (failed) call was evicted
/// assert_eq!(snapshot.total_calls, 2);
/// assert_eq!(snapshot.failed_calls, 0);
/// ```
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    buf: VecDeque<Measurement>,
    capacity: usize,
    totals: WindowSnapshot,
}

impl SlidingWindow {
    /// Creates an empty window. A capacity of zero is clamped to `1`.
    ///
    /// Storage is allocated as measurements arrive, not up front.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { buf: VecDeque::new(), capacity, totals: WindowSnapshot::default() }
    }

    /// Records a measurement, evicting the oldest when full, and returns the
    /// updated counters
    pub fn record(&mut self, measurement: Measurement) -> WindowSnapshot {
        if self.is_full() {
            if let Some(evicted) = self.buf.pop_front() {
                self.apply(evicted, false);
            }
        }
        self.buf.push_back(measurement);
        self.apply(measurement, true);
        self.totals
    }

    fn apply(&mut self, m: Measurement, add: bool) {
        let step = |counter: &mut u32, hit: bool| {
            if hit {
                *counter = if add { *counter + 1 } else { counter.saturating_sub(1) };
            }
        };
        step(&mut self.totals.total_calls, true);
        step(&mut self.totals.failed_calls, m.failed);
        step(&mut self.totals.slow_calls, m.slow);
        step(&mut self.totals.slow_failed_calls, m.slow && m.failed);
        self.totals.total_duration = if add {
            self.totals.total_duration.saturating_add(m.duration)
        } else {
            self.totals.total_duration.saturating_sub(m.duration)
        };
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        self.totals
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every measurement; capacity is retained
    pub fn clear(&mut self) {
        self.buf.clear();
        self.totals = WindowSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok() -> Measurement {
        Measurement::new(false, false, Duration::from_millis(10))
    }

    fn failed() -> Measurement {
        Measurement::new(true, false, Duration::from_millis(10))
    }

    fn slow_failed() -> Measurement {
        Measurement::new(true, true, Duration::from_secs(6))
    }

    #[test]
    fn counters_follow_records() {
        let mut window = SlidingWindow::new(4);
        window.record(ok());
        window.record(failed());
        let snap = window.record(slow_failed());

        assert_eq!(snap.total_calls, 3);
        assert_eq!(snap.failed_calls, 2);
        assert_eq!(snap.slow_calls, 1);
        assert_eq!(snap.slow_failed_calls, 1);
        assert_eq!(snap.successful_calls(), 1);
        assert!((snap.failure_rate() - 66.666_67).abs() < 0.01);
    }

    /// The window never grows past capacity and evicted outcomes stop
    /// contributing to the rates.
    #[test]
    fn eviction_subtracts_oldest() {
        let mut window = SlidingWindow::new(3);
        window.record(failed());
        window.record(failed());
        window.record(ok());
        let snap = window.record(ok());

        assert_eq!(window.len(), 3);
        assert_eq!(snap.total_calls, 3);
        assert_eq!(snap.failed_calls, 1);
        assert_eq!(snap.total_duration, Duration::from_millis(30));
    }

    #[test]
    fn empty_window_reports_zero_rates() {
        let window = SlidingWindow::new(10);
        let snap = window.snapshot();
        assert_eq!(snap.failure_rate(), 0.0);
        assert_eq!(snap.slow_call_rate(), 0.0);
        assert_eq!(snap.average_duration(), Duration::ZERO);
    }

    #[test]
    fn clear_resets_counters_but_keeps_capacity() {
        let mut window = SlidingWindow::new(2);
        window.record(failed());
        window.record(failed());
        window.clear();

        assert!(window.is_empty());
        assert_eq!(window.capacity(), 2);
        assert_eq!(window.snapshot(), WindowSnapshot::default());
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut window = SlidingWindow::new(0);
        window.record(failed());
        let snap = window.record(ok());
        assert_eq!(window.capacity(), 1);
        assert_eq!(snap.total_calls, 1);
        assert_eq!(snap.failed_calls, 0);
    }

    #[test]
    fn huge_capacity_allocates_lazily() {
        let mut window = SlidingWindow::new(u32::MAX as usize);
        let snap = window.record(failed());

        assert_eq!(window.capacity(), u32::MAX as usize);
        assert_eq!(window.len(), 1);
        assert_eq!(snap.failed_calls, 1);
        assert!(!window.is_full());
    }
}
