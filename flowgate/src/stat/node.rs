use std::sync::Arc;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use crate::base::ResourceType;
use crate::base::ResourceWrapper;
use crate::base::TrafficType;
use crate::clock::Clock;
use crate::config::StatConfig;
use crate::error::Result;
use crate::stat::ConcurrencyStat;
use crate::stat::LeapArray;
use crate::stat::MetricEvent;
use crate::stat::MetricItem;
use crate::stat::ReadStat;
use crate::stat::SlidingWindowMetric;
use crate::stat::WriteStat;

/// Name of the node aggregating every inbound entry.
pub const TOTAL_INBOUND_RESOURCE_NAME: &str = "__total_inbound_traffic__";

/// Statistics of one resource.
///
/// Records into a global-window [`LeapArray`] and reads through a default
/// [`SlidingWindowMetric`] over it. The concurrency counter lives outside the
/// buckets, so it survives rotation.
#[derive(Debug)]
pub struct StatNode {
    resource: String,
    classification: ResourceType,
    sample_count: u32,
    interval_ms: u32,
    concurrency: AtomicI32,
    arr: Arc<LeapArray>,
    metric: SlidingWindowMetric,
}

impl StatNode {
    pub fn new(
        resource: impl Into<String>,
        classification: ResourceType,
        config: &StatConfig,
        clock: Clock,
    ) -> Result<Self> {
        let arr = Arc::new(LeapArray::with_clock(
            config.global_sample_count_total,
            config.global_interval_ms_total,
            clock,
        )?);
        let metric = SlidingWindowMetric::new(
            config.metric_sample_count,
            config.metric_interval_ms,
            arr.clone(),
        )?;
        Ok(Self {
            resource: resource.into(),
            classification,
            sample_count: config.metric_sample_count,
            interval_ms: config.metric_interval_ms,
            concurrency: AtomicI32::new(0),
            arr,
            metric,
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn classification(&self) -> ResourceType {
        self.classification
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    pub fn clock(&self) -> &Clock {
        self.arr.clock()
    }

    /// Average per second of `event` over the default window.
    pub fn get_avg(&self, event: MetricEvent) -> f64 {
        self.metric.get_sum(event) as f64 / self.metric.interval_sec()
    }

    /// The busiest bucket of the default window, scaled to a per second rate.
    pub fn get_max_avg(&self, event: MetricEvent) -> f64 {
        (self.metric.get_max_of_single_bucket(event) * self.sample_count as i64) as f64
            / self.metric.interval_sec()
    }

    pub fn add_and_get_sum(&self, event: MetricEvent, count: i64) -> i64 {
        self.arr.add_and_get_sum(event, count)
    }

    pub fn max_concurrency(&self) -> i32 {
        self.metric.max_concurrency()
    }

    /// A new read view over this node's records.
    pub fn generate_read_stat(&self, sample_count: u32, interval_ms: u32) -> Result<SlidingWindowMetric> {
        SlidingWindowMetric::new(sample_count, interval_ms, self.arr.clone())
    }

    pub fn default_metric(&self) -> &SlidingWindowMetric {
        &self.metric
    }

    pub fn default_write_metric(&self) -> &Arc<LeapArray> {
        &self.arr
    }

    /// Per-second items of every live bucket accepted by `predicate`.
    pub fn metrics_on_condition<P>(&self, predicate: P) -> Vec<MetricItem>
    where
        P: Fn(u64) -> bool,
    {
        let mut items = self.metric.second_metrics_on_condition(predicate);
        for item in &mut items {
            item.resource = self.resource.clone();
            item.classification = self.classification as i32;
        }
        items
    }
}

impl ReadStat for StatNode {
    fn get_qps(&self, event: MetricEvent) -> f64 {
        self.metric.get_qps(event)
    }

    fn get_previous_qps(&self, event: MetricEvent) -> f64 {
        self.metric.get_previous_qps(event)
    }

    fn get_sum(&self, event: MetricEvent) -> i64 {
        self.metric.get_sum(event)
    }

    fn get_sum_with_time(&self, now_ms: u64, event: MetricEvent) -> i64 {
        self.metric.get_sum_with_time(now_ms, event)
    }

    fn min_rt(&self) -> f64 {
        self.metric.min_rt()
    }

    fn avg_rt(&self) -> f64 {
        self.metric.avg_rt()
    }
}

impl WriteStat for StatNode {
    fn add_count(&self, event: MetricEvent, count: i64) {
        self.arr.add_count(event, count);
    }

    fn add_count_with_time(&self, now_ms: u64, event: MetricEvent, count: i64) {
        self.arr.add_count_with_time(now_ms, event, count);
    }
}

impl ConcurrencyStat for StatNode {
    fn current_concurrency(&self) -> i32 {
        self.concurrency.load(Ordering::Acquire)
    }

    fn increase_concurrency(&self) {
        let current = self.concurrency.fetch_add(1, Ordering::AcqRel) + 1;
        self.arr.update_concurrency(current);
    }

    fn decrease_concurrency(&self) {
        self.concurrency.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Every resource identity and statistic node known to an engine.
#[derive(Debug)]
pub struct NodeRegistry {
    resources: DashMap<String, Arc<ResourceWrapper>>,
    nodes: DashMap<String, Arc<StatNode>>,
    inbound: Arc<StatNode>,
    config: StatConfig,
    max_resource_amount: usize,
    clock: Clock,
}

impl NodeRegistry {
    pub fn new(config: StatConfig, max_resource_amount: usize, clock: Clock) -> Result<Self> {
        let inbound = Arc::new(StatNode::new(
            TOTAL_INBOUND_RESOURCE_NAME,
            ResourceType::Common,
            &config,
            clock.clone(),
        )?);
        Ok(Self {
            resources: DashMap::new(),
            nodes: DashMap::new(),
            inbound,
            config,
            max_resource_amount,
            clock,
        })
    }

    pub fn stat_config(&self) -> &StatConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// The interned identity for `name`; the first caller fixes its classification.
    pub fn resource(
        &self,
        name: &str,
        classification: ResourceType,
        flow_type: TrafficType,
    ) -> Arc<ResourceWrapper> {
        if let Some(res) = self.resources.get(name) {
            return res.clone();
        }
        self.resources
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ResourceWrapper::new(name, classification, flow_type)))
            .clone()
    }

    pub fn inbound_node(&self) -> &Arc<StatNode> {
        &self.inbound
    }

    pub fn get(&self, name: &str) -> Option<Arc<StatNode>> {
        self.nodes.get(name).map(|n| n.clone())
    }

    /// Returns the node of `name`, creating it on first use. Once the
    /// registry is full no new nodes are created and `None` is returned.
    pub fn get_or_create(&self, name: &str, classification: ResourceType) -> Option<Arc<StatNode>> {
        if let Some(node) = self.nodes.get(name) {
            return Some(node.clone());
        }
        if self.nodes.len() >= self.max_resource_amount {
            tracing::warn!(
                resource = name,
                max = self.max_resource_amount,
                "resource amount exceeds the threshold, no statistic node created"
            );
            return None;
        }
        let created = self.nodes.entry(name.to_string()).or_try_insert_with(|| {
            StatNode::new(name, classification, &self.config, self.clock.clone()).map(Arc::new)
        });
        match created {
            Ok(node) => Some(node.clone()),
            Err(err) => {
                tracing::error!(resource = name, %err, "failed to create statistic node");
                None
            }
        }
    }

    pub fn nodes(&self) -> Vec<Arc<StatNode>> {
        self.nodes.iter().map(|n| n.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use more_asserts::assert_le;

    use super::*;

    fn node() -> (StatNode, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (
            StatNode::new("abc", ResourceType::Web, &StatConfig::default(), clock).unwrap(),
            mock,
        )
    }

    #[test]
    fn test_node_read_write() {
        let (node, mock) = node();
        node.add_count(MetricEvent::Pass, 4);
        mock.increment(Duration::from_millis(500));
        node.add_count(MetricEvent::Pass, 2);

        assert_eq!(node.get_sum(MetricEvent::Pass), 6);
        assert_eq!(node.get_qps(MetricEvent::Pass), 6.0);
        assert_eq!(node.get_avg(MetricEvent::Pass), 6.0);
        assert_eq!(node.get_max_avg(MetricEvent::Pass), 8.0);
        assert_eq!(node.add_and_get_sum(MetricEvent::Pass, 1), 7);
    }

    #[test]
    fn test_generated_read_stat_shares_records() {
        let (node, mock) = node();
        let ten_secs = node.generate_read_stat(10, 10_000).unwrap();
        for _ in 0..5 {
            node.add_count(MetricEvent::Pass, 1);
            mock.increment(Duration::from_secs(1));
        }
        assert_eq!(node.get_sum(MetricEvent::Pass), 0);
        assert_eq!(ten_secs.get_sum(MetricEvent::Pass), 5);
        assert!(node.generate_read_stat(3, 1000).is_err());
    }

    #[test]
    fn test_concurrency_is_tracked() {
        let (node, _mock) = node();
        node.increase_concurrency();
        node.increase_concurrency();
        node.increase_concurrency();
        node.decrease_concurrency();
        assert_eq!(node.current_concurrency(), 2);
        assert_eq!(node.max_concurrency(), 3);
    }

    #[test]
    fn test_metric_items_carry_identity() {
        let (node, _mock) = node();
        node.add_count(MetricEvent::Pass, 1);
        let items = node.metrics_on_condition(|_| true);
        let item = items.iter().find(|i| i.pass_qps == 1).unwrap();
        assert_eq!(item.resource, "abc");
        assert_eq!(item.classification, ResourceType::Web as i32);
    }

    #[test]
    fn test_registry_caps_resources() {
        let (clock, _mock) = Clock::mock();
        let registry = NodeRegistry::new(StatConfig::default(), 2, clock).unwrap();

        let a = registry.get_or_create("a", ResourceType::Common).unwrap();
        let again = registry.get_or_create("a", ResourceType::Common).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert!(registry.get_or_create("b", ResourceType::Common).is_some());
        assert!(registry.get_or_create("c", ResourceType::Common).is_none());
        assert_eq!(registry.len(), 2);
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn test_registry_creates_one_node_under_race() {
        let (clock, _mock) = Clock::mock();
        let registry = Arc::new(NodeRegistry::new(StatConfig::default(), 100, clock).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let node = registry.get_or_create("shared", ResourceType::Common).unwrap();
                    node.add_count(MetricEvent::Pass, 1);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_le!(registry.len(), 1);
        assert_eq!(
            registry.get("shared").unwrap().get_sum(MetricEvent::Pass),
            8
        );
    }

    #[test]
    fn test_resources_are_interned() {
        let (clock, _mock) = Clock::mock();
        let registry = NodeRegistry::new(StatConfig::default(), 100, clock).unwrap();
        let a = registry.resource("abc", ResourceType::Web, TrafficType::Inbound);
        let b = registry.resource("abc", ResourceType::Rpc, TrafficType::Outbound);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.classification(), ResourceType::Web);
    }
}
