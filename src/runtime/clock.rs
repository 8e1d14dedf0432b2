//! Clocks and running/paused interval accounting
//!
//! A [`TimeSpan`] is a half-open interval; a sequence of spans models
//! pause/resume, and elapsed time is the sum of all span durations with the
//! open span measured up to "now". [`SystemClock`] and [`MockClock`] share
//! the same span bookkeeping so tests observe identical semantics.
//! [`SnapshotClock`] freezes `now()` for the duration of one lifecycle call.

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Wall-clock instant used throughout the runtime
pub type Timestamp = DateTime<Utc>;

/// Half-open time interval `[started, ended)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    /// Start instant
    pub started: Timestamp,
    /// End instant, `None` while running
    pub ended: Option<Timestamp>,
}

impl TimeSpan {
    /// Open a span at `at`
    pub fn open(at: Timestamp) -> Self {
        Self {
            started: at,
            ended: None,
        }
    }

    /// A closed span
    pub fn closed(started: Timestamp, ended: Timestamp) -> Self {
        Self {
            started,
            ended: Some(ended),
        }
    }

    /// Whether the span is still running
    pub fn is_open(&self) -> bool {
        self.ended.is_none()
    }

    /// Duration, measuring an open span up to `now`
    pub fn duration(&self, now: Timestamp) -> Duration {
        let end = self.ended.unwrap_or(now);
        if end < self.started {
            Duration::zero()
        } else {
            end - self.started
        }
    }
}

/// `ms` as a [`Duration`], saturating at the largest representable span
pub fn millis(ms: u64) -> Duration {
    i64::try_from(ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .unwrap_or(Duration::MAX)
}

/// Sum of span durations; the open span (if any) is measured up to `now`
pub fn elapsed(spans: &[TimeSpan], now: Timestamp) -> Duration {
    spans
        .iter()
        .fold(Duration::zero(), |acc, span| acc + span.duration(now))
}

/// Open a new span unless one is already open. Returns the start instant in effect.
pub fn start_span(spans: &mut Vec<TimeSpan>, at: Timestamp) -> Timestamp {
    match spans.last() {
        Some(span) if span.is_open() => span.started,
        _ => {
            spans.push(TimeSpan::open(at));
            at
        }
    }
}

/// Close the open span, if any. Returns the end instant in effect.
pub fn stop_span(spans: &mut [TimeSpan], at: Timestamp) -> Timestamp {
    match spans.last_mut() {
        Some(span) if span.is_open() => {
            span.ended = Some(at.max(span.started));
            at
        }
        Some(span) => span.ended.unwrap_or(at),
        None => at,
    }
}

/// Anything that can report the current instant
pub trait TimeSource: Send + Sync {
    /// Current instant
    fn now(&self) -> Timestamp;
}

/// A stopwatch-style clock with span accounting
pub trait Clock: TimeSource {
    /// Open a span; idempotent while running. Returns the timestamp used.
    fn start(&self) -> Timestamp;

    /// Close the open span; idempotent while stopped. Returns the timestamp used.
    fn stop(&self) -> Timestamp;

    /// Whether a span is open
    fn is_running(&self) -> bool;

    /// Total running time across spans
    fn elapsed(&self) -> Duration;

    /// Copy of the recorded spans
    fn spans(&self) -> Vec<TimeSpan>;
}

#[derive(Debug, Default)]
struct SpanTracker {
    spans: Mutex<Vec<TimeSpan>>,
}

impl SpanTracker {
    fn start(&self, now: Timestamp) -> Timestamp {
        start_span(&mut self.spans.lock(), now)
    }

    fn stop(&self, now: Timestamp) -> Timestamp {
        stop_span(&mut self.spans.lock(), now)
    }

    fn is_running(&self) -> bool {
        self.spans.lock().last().is_some_and(TimeSpan::is_open)
    }

    fn elapsed(&self, now: Timestamp) -> Duration {
        elapsed(&self.spans.lock(), now)
    }

    fn snapshot(&self) -> Vec<TimeSpan> {
        self.spans.lock().clone()
    }
}

/// Clock backed by the system wall clock
#[derive(Debug, Default)]
pub struct SystemClock {
    tracker: SpanTracker,
}

impl SystemClock {
    /// Create a stopped clock
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeSource for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

impl Clock for SystemClock {
    fn start(&self) -> Timestamp {
        self.tracker.start(self.now())
    }

    fn stop(&self) -> Timestamp {
        self.tracker.stop(self.now())
    }

    fn is_running(&self) -> bool {
        self.tracker.is_running()
    }

    fn elapsed(&self) -> Duration {
        self.tracker.elapsed(self.now())
    }

    fn spans(&self) -> Vec<TimeSpan> {
        self.tracker.snapshot()
    }
}

/// Deterministic clock for tests; time only moves when told to
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<Timestamp>,
    tracker: SpanTracker,
}

impl MockClock {
    /// Create a clock frozen at `at`
    pub fn at(at: Timestamp) -> Self {
        Self {
            now: Mutex::new(at),
            tracker: SpanTracker::default(),
        }
    }

    /// Create a clock at a fixed reference instant
    pub fn new() -> Self {
        Self::at(Self::epoch())
    }

    /// Fixed reference instant used by [`MockClock::new`]
    pub fn epoch() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }

    /// Move time forward by `ms` milliseconds
    pub fn advance(&self, ms: i64) -> Timestamp {
        let mut now = self.now.lock();
        *now += Duration::milliseconds(ms);
        *now
    }

    /// Jump to an absolute instant
    pub fn set_time(&self, at: Timestamp) {
        *self.now.lock() = at;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MockClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

impl Clock for MockClock {
    fn start(&self) -> Timestamp {
        self.tracker.start(self.now())
    }

    fn stop(&self) -> Timestamp {
        self.tracker.stop(self.now())
    }

    fn is_running(&self) -> bool {
        self.tracker.is_running()
    }

    fn elapsed(&self) -> Duration {
        self.tracker.elapsed(self.now())
    }

    fn spans(&self) -> Vec<TimeSpan> {
        self.tracker.snapshot()
    }
}

/// A time source frozen at one instant
///
/// Built once per lifecycle call so the block and every child it pushes
/// during that call observe the same timestamp.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotClock {
    frozen: Timestamp,
}

impl SnapshotClock {
    /// Freeze the current instant of `source`
    pub fn capture(source: &dyn TimeSource) -> Self {
        Self {
            frozen: source.now(),
        }
    }

    /// Freeze an explicit instant
    pub fn at(frozen: Timestamp) -> Self {
        Self { frozen }
    }
}

impl TimeSource for SnapshotClock {
    fn now(&self) -> Timestamp {
        self.frozen
    }
}
