use std::sync::Arc;

use crate::clock::Clock;
use crate::error::Error;
use crate::error::Result;
use crate::flow::Pace;
use crate::flow::Pacer;
use crate::stat::LeapArray;
use crate::stat::MetricEvent;
use crate::stat::ReadStat;
use crate::stat::SlidingWindowMetric;
use crate::stat::WriteStat;

/// Fleet wide statistics of one resource, kept by a token server.
#[derive(Debug)]
pub struct ClusterMetric {
    metric: SlidingWindowMetric,
    pacer: Pacer,
}

impl ClusterMetric {
    pub fn new(
        sample_count: u32,
        interval_ms: u32,
        max_queueing_ms: u32,
        stat_interval_ms: u32,
        clock: Clock,
    ) -> Result<Self> {
        if sample_count == 0 || interval_ms == 0 || interval_ms % sample_count != 0 {
            return Err(Error::IllegalStatisticParams {
                sample_count,
                interval_ms,
            });
        }
        let arr = Arc::new(LeapArray::with_clock(sample_count, interval_ms, clock)?);
        Ok(Self {
            metric: SlidingWindowMetric::new(sample_count, interval_ms, arr)?,
            pacer: Pacer::new(max_queueing_ms, stat_interval_ms),
        })
    }

    /// Average per second of `event` over the window.
    pub fn get_avg(&self, event: MetricEvent) -> f64 {
        self.metric.get_qps(event)
    }

    pub fn get_sum(&self, event: MetricEvent) -> i64 {
        self.metric.get_sum(event)
    }

    pub fn add_count(&self, event: MetricEvent, count: i64) {
        self.metric.real().add_count(event, count);
    }

    /// Paces `acquire` tokens at `threshold` per statistic interval across
    /// every client of the resource.
    pub fn pace(&self, now_ns: u64, acquire: u32, threshold: f64) -> Pace {
        self.pacer.acquire(now_ns, acquire, threshold)
    }
}
