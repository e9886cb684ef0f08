use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::Error;
use crate::error::Result;
use crate::stat::BucketWrap;
use crate::stat::MetricEvent;
use crate::stat::WriteStat;

/// A fixed ring of `sample_count` buckets covering `interval_ms`.
///
/// The slot for a timestamp `t` is `t / bucket_length_ms % sample_count`.
/// Every slot holds exactly one [`BucketWrap`]; when the wall clock moves past
/// the window a slot represents, the slot is swapped to a fresh wrap. Counter
/// updates never take a lock; only rotation is serialized through a try-lock
/// whose losers yield and re-read.
#[derive(Debug)]
pub struct LeapArray {
    bucket_length_ms: u32,
    sample_count: u32,
    interval_ms: u32,
    slots: Box<[ArcSwap<BucketWrap>]>,
    update_lock: Mutex<()>,
    clock: Clock,
}

impl LeapArray {
    pub fn new(sample_count: u32, interval_ms: u32) -> Result<Self> {
        Self::with_clock(sample_count, interval_ms, Clock::new())
    }

    pub fn with_clock(sample_count: u32, interval_ms: u32, clock: Clock) -> Result<Self> {
        if sample_count == 0 || interval_ms == 0 || interval_ms % sample_count != 0 {
            return Err(Error::IllegalStatisticParams {
                sample_count,
                interval_ms,
            });
        }
        let bucket_length_ms = interval_ms / sample_count;
        let now = clock.now_ms();
        let current_idx = Self::time_idx(now, bucket_length_ms, sample_count);
        let current_start = Self::start_of(now, bucket_length_ms);

        // Every slot starts out holding the most recent window it stands for.
        let slots = (0..sample_count as usize)
            .map(|idx| {
                let behind = (current_idx + sample_count as usize - idx) % sample_count as usize;
                let start =
                    current_start.saturating_sub(behind as u64 * bucket_length_ms as u64);
                ArcSwap::from_pointee(BucketWrap::new(start))
            })
            .collect();

        Ok(Self {
            bucket_length_ms,
            sample_count,
            interval_ms,
            slots,
            update_lock: Mutex::new(()),
            clock,
        })
    }

    #[inline]
    fn time_idx(now_ms: u64, bucket_length_ms: u32, sample_count: u32) -> usize {
        ((now_ms / bucket_length_ms as u64) % sample_count as u64) as usize
    }

    #[inline]
    fn start_of(now_ms: u64, bucket_length_ms: u32) -> u64 {
        now_ms - now_ms % bucket_length_ms as u64
    }

    pub fn bucket_length_ms(&self) -> u32 {
        self.bucket_length_ms
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn current_bucket(&self) -> Result<Arc<BucketWrap>> {
        self.current_bucket_of_time(self.clock.now_ms())
    }

    /// Returns the live bucket for `now_ms`, rotating its slot if the slot
    /// still holds an older (or, after a clock jump, newer) window.
    pub fn current_bucket_of_time(&self, now_ms: u64) -> Result<Arc<BucketWrap>> {
        let idx = Self::time_idx(now_ms, self.bucket_length_ms, self.sample_count);
        let bucket_start = Self::start_of(now_ms, self.bucket_length_ms);
        let slot = &self.slots[idx];

        loop {
            let old = slot.load_full();
            if bucket_start == old.start() {
                return Ok(old);
            }

            if bucket_start > old.start() {
                if let Some(_guard) = self.update_lock.try_lock() {
                    // Somebody may have rotated the slot between our read and the lock.
                    if slot.load().start() < bucket_start {
                        slot.store(Arc::new(BucketWrap::new(bucket_start)));
                    }
                } else {
                    std::thread::yield_now();
                }
                continue;
            }

            // The clock went backwards.
            if let Some(_guard) = self.update_lock.try_lock() {
                if slot.load().start() > bucket_start {
                    tracing::warn!(
                        now_ms,
                        bucket_start = old.start(),
                        "clock moved backwards, resetting bucket"
                    );
                    slot.store(Arc::new(BucketWrap::new(bucket_start)));
                }
                continue;
            }
            if self.sample_count == 1 {
                std::thread::yield_now();
                continue;
            }
            return Err(Error::ClockBackward {
                now_ms,
                bucket_start: old.start(),
            });
        }
    }

    pub fn values(&self) -> Vec<Arc<BucketWrap>> {
        self.values_with_time(self.clock.now_ms())
    }

    /// All buckets that are still inside the window ending at `now_ms`.
    pub fn values_with_time(&self, now_ms: u64) -> Vec<Arc<BucketWrap>> {
        self.values_conditional(now_ms, |_| true)
    }

    /// Live buckets whose start satisfies `predicate`.
    pub fn values_conditional<P>(&self, now_ms: u64, predicate: P) -> Vec<Arc<BucketWrap>>
    where
        P: Fn(u64) -> bool,
    {
        self.slots
            .iter()
            .map(|slot| slot.load_full())
            .filter(|wrap| {
                !wrap.is_deprecated(now_ms, self.interval_ms as u64) && predicate(wrap.start())
            })
            .collect()
    }

    pub fn update_concurrency(&self, concurrency: i32) {
        self.update_concurrency_with_time(self.clock.now_ms(), concurrency);
    }

    pub fn update_concurrency_with_time(&self, now_ms: u64, concurrency: i32) {
        match self.current_bucket_of_time(now_ms) {
            Ok(wrap) => wrap.value().update_concurrency(concurrency),
            Err(err) => tracing::warn!(%err, "failed to update concurrency"),
        }
    }

    /// Adds to the current bucket and returns the windowed sum afterwards.
    pub fn add_and_get_sum(&self, event: MetricEvent, count: i64) -> i64 {
        let now = self.clock.now_ms();
        self.add_count_with_time(now, event, count);
        self.values_with_time(now)
            .iter()
            .map(|wrap| wrap.value().get(event))
            .sum()
    }
}

impl WriteStat for LeapArray {
    fn add_count(&self, event: MetricEvent, count: i64) {
        self.add_count_with_time(self.clock.now_ms(), event, count);
    }

    fn add_count_with_time(&self, now_ms: u64, event: MetricEvent, count: i64) {
        match self.current_bucket_of_time(now_ms) {
            Ok(wrap) => wrap.value().add(event, count),
            Err(err) => tracing::warn!(%err, ?event, count, "dropped statistic update"),
        }
    }
}
