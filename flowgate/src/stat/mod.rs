//! Lock-free sliding window statistics.
//!
//! Writes land in a [`LeapArray`], a fixed ring of time buckets whose slots are
//! atomically replaced as time moves on. Reads go through a
//! [`SlidingWindowMetric`], a view that may aggregate over a coarser window
//! than the array it reads from. A [`StatNode`] ties both together for one
//! resource.

use crate::error::Error;
use crate::error::Result;

mod bucket;
mod leap_array;
mod metric_item;
mod node;
mod sliding_window;
mod slot;

pub use bucket::BucketWrap;
pub use bucket::MetricBucket;
pub use leap_array::LeapArray;
pub use metric_item::MetricItem;
pub use node::NodeRegistry;
pub use node::StatNode;
pub use node::TOTAL_INBOUND_RESOURCE_NAME;
pub use sliding_window::SlidingWindowMetric;
pub use slot::PREPARE_SLOT_ORDER;
pub use slot::ResourceNodePrepareSlot;
pub use slot::STAT_SLOT_ORDER;
pub use slot::StatisticSlot;

/// Round trip time recorded as the minimum before any request completes.
pub const DEFAULT_STATISTIC_MAX_RT: i64 = 60_000;

/// Counters kept by every bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum MetricEvent {
    Pass,
    Block,
    Complete,
    Error,
    Rt,
    Waiting,
    PassRequest,
    BlockRequest,
    BlockFlow,
    BlockIsolation,
    BlockCircuitBreaking,
    BlockSystem,
    BlockHotSpotParamFlow,
    BlockMock,
    /// Speculative passes counted by the reject checker.
    RejectPass,
}

impl MetricEvent {
    pub const COUNT: usize = 15;

    pub const ALL: [MetricEvent; Self::COUNT] = [
        MetricEvent::Pass,
        MetricEvent::Block,
        MetricEvent::Complete,
        MetricEvent::Error,
        MetricEvent::Rt,
        MetricEvent::Waiting,
        MetricEvent::PassRequest,
        MetricEvent::BlockRequest,
        MetricEvent::BlockFlow,
        MetricEvent::BlockIsolation,
        MetricEvent::BlockCircuitBreaking,
        MetricEvent::BlockSystem,
        MetricEvent::BlockHotSpotParamFlow,
        MetricEvent::BlockMock,
        MetricEvent::RejectPass,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Read side of a statistic.
pub trait ReadStat {
    fn get_qps(&self, event: MetricEvent) -> f64;
    fn get_previous_qps(&self, event: MetricEvent) -> f64;
    fn get_sum(&self, event: MetricEvent) -> i64;
    fn get_sum_with_time(&self, now_ms: u64, event: MetricEvent) -> i64;
    fn min_rt(&self) -> f64;
    fn avg_rt(&self) -> f64;
}

/// Write side of a statistic.
pub trait WriteStat {
    fn add_count(&self, event: MetricEvent, count: i64);
    fn add_count_with_time(&self, now_ms: u64, event: MetricEvent, count: i64);
}

pub trait ConcurrencyStat {
    fn current_concurrency(&self) -> i32;
    fn increase_concurrency(&self);
    fn decrease_concurrency(&self);
}

/// Checks whether a `(sample_count, interval_ms)` window can be served as a
/// view over a `(parent_sample_count, parent_interval_ms)` leap array.
pub fn check_validity_for_reuse_statistic(
    sample_count: u32,
    interval_ms: u32,
    parent_sample_count: u32,
    parent_interval_ms: u32,
) -> Result<()> {
    if interval_ms == 0 || sample_count == 0 || interval_ms % sample_count != 0 {
        return Err(Error::IllegalStatisticParams {
            sample_count,
            interval_ms,
        });
    }
    let bucket_length_ms = interval_ms / sample_count;

    if parent_interval_ms == 0
        || parent_sample_count == 0
        || parent_interval_ms % parent_sample_count != 0
    {
        return Err(Error::IllegalGlobalStatisticParams {
            sample_count: parent_sample_count,
            interval_ms: parent_interval_ms,
        });
    }
    let parent_bucket_length_ms = parent_interval_ms / parent_sample_count;

    if parent_interval_ms % interval_ms != 0 {
        return Err(Error::GlobalStatisticNonReusable);
    }
    if bucket_length_ms % parent_bucket_length_ms != 0 {
        return Err(Error::GlobalStatisticNonReusable);
    }
    Ok(())
}
