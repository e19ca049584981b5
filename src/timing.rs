//! Coarse clock and the adaptive service-time estimator.
//!
//! The estimator remembers recently measured completion delays in a
//! small ring of time bins and reports their maximum, so the completion
//! timeout tracks what the server has actually been doing lately rather
//! than a static worst case.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

static SKEW: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Monotonic seconds since the first use in this process. One-second
/// granularity is all the lock timestamps need.
pub fn now_seconds() -> u64 {
    EPOCH.elapsed().as_secs() + SKEW.load(std::sync::atomic::Ordering::Relaxed)
}

/// Skews the coarse clock forward. Lets tests age locks without
/// sleeping.
#[doc(hidden)]
pub fn advance_clock(secs: u64) {
    SKEW.fetch_add(secs, std::sync::atomic::Ordering::Relaxed);
}

/// Number of history bins.
const AT_BINS: usize = 4;

/// Seconds covered by one bin.
const AT_BIN_SPAN: u64 = 150;

#[derive(Debug)]
struct AtState {
    /// Per-bin maxima of measured delays.
    bins: [u32; AT_BINS],
    /// Start of the bin currently being filled.
    bin_start: u64,
    current: u32,
}

/// Self-tuning estimate of how long a server operation takes.
#[derive(Debug)]
pub struct AdaptiveEstimate {
    state: Mutex<AtState>,
}

impl AdaptiveEstimate {
    /// Creates an estimator seeded with `initial` seconds.
    pub fn new(initial: u32) -> Self {
        AdaptiveEstimate {
            state: Mutex::new(AtState {
                bins: [initial, 0, 0, 0],
                bin_start: now_seconds(),
                current: initial,
            }),
        }
    }

    /// Current estimate in seconds.
    pub fn at_get(&self) -> u32 {
        self.state.lock().current
    }

    /// Feeds one measured delay (seconds) into the estimator.
    pub fn at_measured(&self, delay: u64) {
        let measured = delay.min(u32::MAX as u64) as u32;
        let now = now_seconds();
        let mut st = self.state.lock();

        // Rotate out bins that have aged past their span.
        let mut shift = (now.saturating_sub(st.bin_start) / AT_BIN_SPAN) as usize;
        if shift > 0 {
            shift = shift.min(AT_BINS);
            st.bins.rotate_right(shift);
            for slot in st.bins.iter_mut().take(shift) {
                *slot = 0;
            }
            st.bin_start = now;
        }

        if measured > st.bins[0] {
            st.bins[0] = measured;
        }
        st.current = st.bins.iter().copied().max().unwrap_or(measured);
    }
}
