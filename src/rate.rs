//! A windowed throughput counter used by the swarm-level choking algorithm
//! (external to this crate) to rank peers by recent upload/download speed.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

struct Inner {
    /// Bytes accumulated in the current window.
    bytes: u64,
    /// When the current window started.
    window_start: Instant,
}

/// Thread-safe windowed byte counter.
///
/// `add` accumulates bytes into the current window; `rate` reports
/// bytes-per-second averaged over however much of the window has elapsed,
/// rolling over to a fresh window once the configured span has passed.
pub struct Rate {
    inner: Mutex<Inner>,
    window: Duration,
    /// A stable identity used only to break ties when two peers report the
    /// same rate, per [`RateComparator`].
    id: u64,
}

impl Rate {
    /// Creates a new, empty rate meter with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                bytes: 0,
                window_start: Instant::now(),
            }),
            window,
            id: NEXT_ID.fetch_add(1, AtomicOrdering::Relaxed),
        }
    }

    /// Atomically adds `n` bytes to the current window, rolling over to a
    /// fresh window first if the previous one has expired.
    pub fn add(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        self.roll_if_expired(&mut inner);
        inner.bytes += n as u64;
    }

    /// Returns the current rate in bytes per second, averaged over the
    /// elapsed portion of the current window.
    pub fn rate(&self) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        self.roll_if_expired(&mut inner);
        let elapsed = inner.window_start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            0.0
        } else {
            inner.bytes as f64 / elapsed
        }
    }

    /// Zeroes the counter and starts a fresh window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.bytes = 0;
        inner.window_start = Instant::now();
    }

    fn roll_if_expired(&self, inner: &mut Inner) {
        if inner.window_start.elapsed() >= self.window {
            inner.bytes = 0;
            inner.window_start = Instant::now();
        }
    }
}

impl Default for Rate {
    /// A rate meter using the spec's default 20 second window.
    fn default() -> Self {
        Self::new(Duration::from_secs(20))
    }
}

/// Orders peers by rate, ascending, breaking ties by a stable identity so
/// that the ordering used by the external choking algorithm is a strict weak
/// order even when two peers report identical rates.
pub struct RateComparator;

impl RateComparator {
    /// Compares two rate meters, ordering by current rate ascending and
    /// falling back to meter identity on a tie.
    pub fn compare(a: &Rate, b: &Rate) -> Ordering {
        a.rate()
            .partial_cmp(&b.rate())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    }
}
