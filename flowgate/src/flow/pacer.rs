use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Outcome of asking a [`Pacer`] for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Go ahead now.
    Pass,
    /// Go ahead after waiting this many nanoseconds.
    Wait(u64),
    /// The virtual queue is deeper than allowed.
    QueueFull,
}

/// Evenly spaces grants over time.
///
/// Every grant moves `last_passed` forward by the gap its batch must keep
/// from the previous one. Requests arriving early are told how long to wait,
/// as long as that wait stays within `max_queueing_ns`. All state changes are
/// CAS or fetch-add on two atomics, so concurrent callers never lose a slot.
#[derive(Debug)]
pub struct Pacer {
    last_passed_ns: AtomicI64,
    last_system_ns: AtomicI64,
    max_queueing_ns: i64,
    stat_interval_ns: i64,
}

impl Pacer {
    /// `stat_interval_ms` of 0 means a one second window.
    pub fn new(max_queueing_ms: u32, stat_interval_ms: u32) -> Self {
        let stat_interval_ns = if stat_interval_ms == 0 {
            NANOS_PER_SECOND
        } else {
            i64::from(stat_interval_ms) * 1_000_000
        };
        Self {
            last_passed_ns: AtomicI64::new(0),
            last_system_ns: AtomicI64::new(0),
            max_queueing_ns: i64::from(max_queueing_ms) * 1_000_000,
            stat_interval_ns,
        }
    }

    pub fn max_queueing_ns(&self) -> i64 {
        self.max_queueing_ns
    }

    pub fn stat_interval_ns(&self) -> i64 {
        self.stat_interval_ns
    }

    /// Nanosecond gap a batch of `acquire` must keep at `threshold` tokens
    /// per statistic interval. Saturates at `i64::MAX` for tiny thresholds.
    pub fn interval_ns(&self, acquire: u32, threshold: f64) -> i64 {
        (f64::from(acquire) / threshold * self.stat_interval_ns as f64).ceil() as i64
    }

    /// Asks for a slot for `acquire` tokens. `threshold` must be positive.
    pub fn acquire(&self, now_ns: u64, acquire: u32, threshold: f64) -> Pace {
        let now = now_ns as i64;
        let interval = self.interval_ns(acquire, threshold);

        // A recorded system time far in the future means the clock went
        // backwards; restart pacing from now.
        let last_system = self.last_system_ns.swap(now, Ordering::AcqRel);
        let last_passed = self.last_passed_ns.load(Ordering::Acquire);
        if last_system > now + NANOS_PER_SECOND
            && self
                .last_passed_ns
                .compare_exchange(last_passed, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Pace::Pass;
        }

        if last_passed.saturating_add(interval) <= now
            && self
                .last_passed_ns
                .compare_exchange(last_passed, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Pace::Pass;
        }

        let estimated = self
            .last_passed_ns
            .load(Ordering::Acquire)
            .saturating_add(interval)
            .saturating_sub(now);
        if estimated > self.max_queueing_ns {
            return Pace::QueueFull;
        }

        let queued = self
            .last_passed_ns
            .fetch_add(interval, Ordering::AcqRel)
            .saturating_add(interval);
        let estimated = queued.saturating_sub(now);
        if estimated > self.max_queueing_ns {
            self.last_passed_ns.fetch_sub(interval, Ordering::AcqRel);
            return Pace::QueueFull;
        }
        Pace::Wait(estimated.max(0) as u64)
    }
}
