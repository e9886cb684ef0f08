use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use quanta::Instant;
use quanta::Mock;

/// Epoch (in ms) that mock clocks start at. Aligned to a whole second so that
/// bucket arithmetic in tests is predictable.
pub const MOCK_EPOCH_MS: u64 = 1_700_000_000_000;

/// Wall clock used by every statistic and checker of an engine.
///
/// Wall time is derived from a fixed [`quanta`] anchor plus the unix time
/// observed when the anchor was taken, so reading the time never makes a
/// system call on the hot path.
#[derive(Clone, Debug)]
pub struct Clock {
    inner: quanta::Clock,
    /// A fixed point in time (TSC tick) to calculate deltas from.
    anchor: Instant,
    epoch_ns: u64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        let epoch_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self::with_clock(quanta::Clock::new(), epoch_ns)
    }

    /// A controllable clock starting at [`MOCK_EPOCH_MS`].
    pub fn mock() -> (Self, Arc<Mock>) {
        let (inner, mock) = quanta::Clock::mock();
        (Self::with_clock(inner, MOCK_EPOCH_MS * 1_000_000), mock)
    }

    pub fn with_clock(inner: quanta::Clock, epoch_ns: u64) -> Self {
        let anchor = inner.now();
        Self {
            inner,
            anchor,
            epoch_ns,
        }
    }

    #[inline]
    pub fn now_ns(&self) -> u64 {
        let now = self.inner.now();
        self.epoch_ns + now.duration_since(self.anchor).as_nanos() as u64
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.now_ns() / 1_000_000
    }
}
