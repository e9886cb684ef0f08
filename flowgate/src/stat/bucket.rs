use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use crate::stat::DEFAULT_STATISTIC_MAX_RT;
use crate::stat::MetricEvent;

/// Counters for one time slice.
#[derive(Debug)]
pub struct MetricBucket {
    counters: [AtomicI64; MetricEvent::COUNT],
    min_rt: AtomicI64,
    max_concurrency: AtomicI32,
}

impl Default for MetricBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricBucket {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicI64::new(0)),
            min_rt: AtomicI64::new(DEFAULT_STATISTIC_MAX_RT),
            max_concurrency: AtomicI32::new(0),
        }
    }

    /// Adds `count` to the counter of `event`. An `Rt` sample also lowers the
    /// bucket's minimum round trip time.
    #[inline]
    pub fn add(&self, event: MetricEvent, count: i64) {
        self.counters[event.index()].fetch_add(count, Ordering::Relaxed);
        if event == MetricEvent::Rt {
            self.min_rt.fetch_min(count, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn get(&self, event: MetricEvent) -> i64 {
        self.counters[event.index()].load(Ordering::Relaxed)
    }

    pub fn min_rt(&self) -> i64 {
        self.min_rt.load(Ordering::Relaxed)
    }

    pub fn update_concurrency(&self, concurrency: i32) {
        self.max_concurrency.fetch_max(concurrency, Ordering::Relaxed);
    }

    pub fn max_concurrency(&self) -> i32 {
        self.max_concurrency.load(Ordering::Relaxed)
    }
}

/// A bucket together with the (bucket aligned) millisecond it starts at.
///
/// A wrap is never reset in place: once its window expires the owning slot
/// is pointed at a brand new wrap.
#[derive(Debug)]
pub struct BucketWrap {
    start: u64,
    value: MetricBucket,
}

impl BucketWrap {
    pub fn new(start: u64) -> Self {
        Self {
            start,
            value: MetricBucket::new(),
        }
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn value(&self) -> &MetricBucket {
        &self.value
    }

    /// A bucket is deprecated once it falls more than `interval_ms` behind
    /// `now`. Buckets that start in the future are not live yet either.
    #[inline]
    pub fn is_deprecated(&self, now_ms: u64, interval_ms: u64) -> bool {
        match now_ms.checked_sub(self.start) {
            Some(age) => age > interval_ms,
            None => true,
        }
    }
}
