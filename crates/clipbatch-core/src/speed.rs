// crates/clipbatch-core/src/speed.rs
//
// Sliding-window speed estimator: "how long does one unit of work take right
// now." Single writer (the owning worker or the consumer thread), many
// readers (the adaptive scheduler polling every worker's estimate). The
// reader-visible value is a single atomic f64-as-bits so readers never take
// a lock on the hot scheduling path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One completed unit of work: `weight` events took `elapsed` time, recorded
/// at `arrival` for window eviction.
struct Event {
    weight: f64,
    elapsed: Duration,
    arrival: Instant,
}

/// A cloneable, read-only view of a [`SpeedEstimator`]'s current estimate.
///
/// The adaptive scheduler (`clipbatch-loader::scheduler`) polls every
/// worker's load speed from whatever thread is running `schedule_workers()`
/// — the worker that just finished a task, or the consumer thread via
/// `get_next_batch()`. Handing out a `SpeedHandle` per worker lets it do
/// that with a relaxed atomic load instead of a mutex, matching the single
/// writer/many readers contract in SPEC_FULL.md §5.
#[derive(Clone)]
pub struct SpeedHandle {
    bits: Arc<AtomicU64>,
}

impl SpeedHandle {
    /// Current estimate of seconds-per-event, or NaN if fewer than two
    /// events have landed in the owning estimator's window.
    pub fn duration_per_event(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Tracks a sliding window of completed work and exposes a lock-free,
/// continuously-updated `duration_per_event` estimate.
///
/// `duration_per_event()` is NaN until at least two events have landed —
/// callers (the adaptive scheduler) treat NaN as "not enough data yet, run
/// everything" per SPEC_FULL.md §4.H.
pub struct SpeedEstimator {
    window: Duration,
    events: VecDeque<Event>,
    pending_start: Option<Instant>,
    // f64 bits, read with Relaxed: approximate staleness is fine here, this
    // estimate only ever feeds a coarse worker-count decision, not a
    // correctness-critical path. Shared via Arc so a `SpeedHandle` can read
    // it from another thread without touching `self` at all.
    duration_per_event_bits: Arc<AtomicU64>,
}

impl SpeedEstimator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
            pending_start: None,
            duration_per_event_bits: Arc::new(AtomicU64::new(f64::NAN.to_bits())),
        }
    }

    /// A cloneable handle other threads can poll without locking anything.
    pub fn handle(&self) -> SpeedHandle {
        SpeedHandle {
            bits: Arc::clone(&self.duration_per_event_bits),
        }
    }

    /// Mark the beginning of a unit of work; pairs with a following
    /// `finish()` call to derive the elapsed duration automatically.
    pub fn start(&mut self) {
        self.pending_start = Some(Instant::now());
    }

    /// Mark `weight` events complete, using the elapsed time since the last
    /// `start()` call (zero if `start()` was never called).
    pub fn finish(&mut self, weight: f64) {
        let elapsed = self
            .pending_start
            .take()
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO);
        self.record(weight, elapsed);
    }

    /// Mark `weight` events complete with an explicitly supplied elapsed
    /// duration, bypassing `start()`. Used by the consumer, which needs to
    /// count blocked-waiting time toward the interval (SPEC_FULL.md §4.H:
    /// "`consume_speed.finish(...)` before waiting so time spent blocked is
    /// counted toward the next interval correctly").
    pub fn finish_since(&mut self, weight: f64, elapsed: Duration) {
        self.record(weight, elapsed);
    }

    fn record(&mut self, weight: f64, elapsed: Duration) {
        let now = Instant::now();
        self.events.push_back(Event {
            weight,
            elapsed,
            arrival: now,
        });
        while let Some(front) = self.events.front() {
            if now.duration_since(front.arrival) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }

        if self.events.len() < 2 {
            self.duration_per_event_bits
                .store(f64::NAN.to_bits(), Ordering::Relaxed);
            return;
        }

        let total_elapsed: Duration = self.events.iter().map(|e| e.elapsed).sum();
        let total_weight: f64 = self.events.iter().map(|e| e.weight).sum();
        let per_event = if total_weight > 0.0 {
            total_elapsed.as_secs_f64() / total_weight
        } else {
            f64::NAN
        };
        self.duration_per_event_bits
            .store(per_event.to_bits(), Ordering::Relaxed);
    }

    /// Current estimate of seconds-per-event, or NaN if fewer than two
    /// events have landed in the window. Safe to call concurrently with a
    /// writer calling `finish`/`finish_since`.
    pub fn duration_per_event(&self) -> f64 {
        f64::from_bits(self.duration_per_event_bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn nan_until_two_events() {
        let mut e = SpeedEstimator::new(Duration::from_secs(10));
        assert!(e.duration_per_event().is_nan());
        e.finish(1.0);
        assert!(e.duration_per_event().is_nan());
        sleep(Duration::from_millis(5));
        e.finish(1.0);
        assert!(!e.duration_per_event().is_nan());
    }

    #[test]
    fn old_events_fall_out_of_window() {
        let mut e = SpeedEstimator::new(Duration::from_millis(20));
        e.finish(1.0);
        sleep(Duration::from_millis(5));
        e.finish(1.0);
        assert!(!e.duration_per_event().is_nan());
        sleep(Duration::from_millis(40));
        e.finish(1.0);
        // the two earlier events aged out of the 20ms window, leaving just
        // this one — back below the two-event minimum, so NaN again.
        assert!(e.duration_per_event().is_nan());
        assert_eq!(e.events.len(), 1);
    }

    #[test]
    fn finish_since_counts_supplied_elapsed_not_wallclock_gap() {
        let mut e = SpeedEstimator::new(Duration::from_secs(10));
        e.finish_since(1.0, Duration::from_millis(100));
        e.finish_since(1.0, Duration::from_millis(300));
        // total elapsed 400ms over weight 2 => 200ms/event, regardless of
        // how little real wall-clock time the test itself took.
        let per_event = e.duration_per_event();
        assert!((per_event - 0.2).abs() < 0.01);
    }

    #[test]
    fn handle_reads_track_writer_without_locking() {
        let mut e = SpeedEstimator::new(Duration::from_secs(10));
        let handle = e.handle();
        assert!(handle.duration_per_event().is_nan());
        e.finish(1.0);
        sleep(Duration::from_millis(5));
        e.finish(1.0);
        assert!(!handle.duration_per_event().is_nan());
        assert_eq!(handle.duration_per_event(), e.duration_per_event());
    }
}
