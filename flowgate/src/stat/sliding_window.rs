use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::stat::BucketWrap;
use crate::stat::DEFAULT_STATISTIC_MAX_RT;
use crate::stat::LeapArray;
use crate::stat::MetricEvent;
use crate::stat::MetricItem;
use crate::stat::ReadStat;
use crate::stat::check_validity_for_reuse_statistic;

/// A read-only `(sample_count, interval_ms)` window over a [`LeapArray`].
///
/// The view's bucket length must be a multiple of the array's bucket length
/// and its interval must divide the array's interval.
#[derive(Debug, Clone)]
pub struct SlidingWindowMetric {
    bucket_length_ms: u32,
    sample_count: u32,
    interval_ms: u32,
    real: Arc<LeapArray>,
}

impl SlidingWindowMetric {
    pub fn new(sample_count: u32, interval_ms: u32, real: Arc<LeapArray>) -> Result<Self> {
        check_validity_for_reuse_statistic(
            sample_count,
            interval_ms,
            real.sample_count(),
            real.interval_ms(),
        )?;
        Ok(Self {
            bucket_length_ms: interval_ms / sample_count,
            sample_count,
            interval_ms,
            real,
        })
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    pub fn real(&self) -> &Arc<LeapArray> {
        &self.real
    }

    pub fn interval_sec(&self) -> f64 {
        self.interval_ms as f64 / 1000.0
    }

    /// The inclusive range of bucket starts that make up the window at `now_ms`.
    fn bucket_start_range(&self, now_ms: u64) -> (u64, u64) {
        let real_bucket_ms = self.real.bucket_length_ms() as u64;
        let end = now_ms - now_ms % real_bucket_ms;
        let start = (end + real_bucket_ms).saturating_sub(self.interval_ms as u64);
        (start, end)
    }

    fn satisfied_buckets(&self, now_ms: u64) -> Vec<Arc<BucketWrap>> {
        let (start, end) = self.bucket_start_range(now_ms);
        self.real
            .values_conditional(now_ms, |ws| ws >= start && ws <= end)
    }

    fn now(&self) -> u64 {
        self.real.clock().now_ms()
    }

    pub fn get_max_of_single_bucket(&self, event: MetricEvent) -> i64 {
        self.satisfied_buckets(self.now())
            .iter()
            .map(|w| w.value().get(event))
            .max()
            .unwrap_or(0)
    }

    pub fn max_concurrency(&self) -> i32 {
        self.satisfied_buckets(self.now())
            .iter()
            .map(|w| w.value().max_concurrency())
            .max()
            .unwrap_or(0)
    }

    /// Aggregates every live bucket accepted by `predicate` into one item per
    /// second, ordered by timestamp.
    pub fn second_metrics_on_condition<P>(&self, predicate: P) -> Vec<MetricItem>
    where
        P: Fn(u64) -> bool,
    {
        let mut seconds: BTreeMap<u64, Vec<Arc<BucketWrap>>> = BTreeMap::new();
        for wrap in self.real.values_conditional(self.now(), predicate) {
            let sec_start = wrap.start() - wrap.start() % 1000;
            seconds.entry(sec_start).or_default().push(wrap);
        }
        seconds
            .into_iter()
            .map(|(ts, wraps)| Self::metric_item_from_buckets(ts, &wraps))
            .collect()
    }

    fn metric_item_from_buckets(timestamp: u64, wraps: &[Arc<BucketWrap>]) -> MetricItem {
        let mut item = MetricItem {
            timestamp,
            ..MetricItem::default()
        };
        let mut all_rt = 0u64;
        for wrap in wraps {
            let b = wrap.value();
            let get = |event| b.get(event).max(0) as u64;
            item.pass_qps += get(MetricEvent::Pass);
            item.block_qps += get(MetricEvent::Block);
            item.complete_qps += get(MetricEvent::Complete);
            item.error_qps += get(MetricEvent::Error);
            item.blocked_by_flow += get(MetricEvent::BlockFlow);
            item.blocked_by_isolation += get(MetricEvent::BlockIsolation);
            item.blocked_by_circuit_breaking += get(MetricEvent::BlockCircuitBreaking);
            item.blocked_by_system += get(MetricEvent::BlockSystem);
            item.blocked_by_hot_spot += get(MetricEvent::BlockHotSpotParamFlow);
            item.blocked_by_mock += get(MetricEvent::BlockMock);
            item.concurrency = item.concurrency.max(b.max_concurrency().max(0) as u32);
            all_rt += get(MetricEvent::Rt);
        }
        item.avg_rt = if item.complete_qps > 0 {
            all_rt / item.complete_qps
        } else {
            all_rt
        };
        item
    }
}

impl ReadStat for SlidingWindowMetric {
    fn get_qps(&self, event: MetricEvent) -> f64 {
        self.get_sum(event) as f64 / self.interval_sec()
    }

    fn get_previous_qps(&self, event: MetricEvent) -> f64 {
        let now = self.now().saturating_sub(self.bucket_length_ms as u64);
        self.get_sum_with_time(now, event) as f64 / self.interval_sec()
    }

    fn get_sum(&self, event: MetricEvent) -> i64 {
        self.get_sum_with_time(self.now(), event)
    }

    fn get_sum_with_time(&self, now_ms: u64, event: MetricEvent) -> i64 {
        self.satisfied_buckets(now_ms)
            .iter()
            .map(|w| w.value().get(event))
            .sum()
    }

    /// Smallest round trip time in the window, never below 1.
    fn min_rt(&self) -> f64 {
        self.satisfied_buckets(self.now())
            .iter()
            .map(|w| w.value().min_rt())
            .filter(|rt| *rt < DEFAULT_STATISTIC_MAX_RT)
            .min()
            .unwrap_or(1)
            .max(1) as f64
    }

    fn avg_rt(&self) -> f64 {
        let now = self.now();
        let complete = self.get_sum_with_time(now, MetricEvent::Complete);
        if complete <= 0 {
            return 0.0;
        }
        self.get_sum_with_time(now, MetricEvent::Rt) as f64 / complete as f64
    }
}
