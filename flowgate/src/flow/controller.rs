use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::info;

use crate::base::TokenResult;
use crate::clock::Clock;
use crate::error::Error;
use crate::error::Result;
use crate::flow::Calculator;
use crate::flow::Checker;
use crate::flow::Rule;
use crate::stat::LeapArray;
use crate::stat::NodeRegistry;
use crate::stat::SlidingWindowMetric;
use crate::stat::StatNode;
use crate::stat::check_validity_for_reuse_statistic;

/// The statistic a controller reads its counts from.
///
/// When the rule's window can be served from the resource node's records,
/// `write` is the node's own array and nothing extra is recorded. Otherwise
/// the controller owns an independent array that the standalone stat slot
/// feeds.
#[derive(Debug, Clone)]
pub struct StandaloneStatistic {
    reuse_resource_stat: bool,
    read: SlidingWindowMetric,
    write: Arc<LeapArray>,
}

impl StandaloneStatistic {
    /// The node's default window.
    pub fn reusing(node: &StatNode) -> Self {
        Self {
            reuse_resource_stat: true,
            read: node.default_metric().clone(),
            write: node.default_write_metric().clone(),
        }
    }

    /// A differently sized window over the node's records.
    pub fn view_of(node: &StatNode, sample_count: u32, interval_ms: u32) -> Result<Self> {
        Ok(Self {
            reuse_resource_stat: true,
            read: node.generate_read_stat(sample_count, interval_ms)?,
            write: node.default_write_metric().clone(),
        })
    }

    pub fn independent(sample_count: u32, interval_ms: u32, clock: Clock) -> Result<Self> {
        let write = Arc::new(LeapArray::with_clock(sample_count, interval_ms, clock)?);
        let read = SlidingWindowMetric::new(sample_count, interval_ms, write.clone())?;
        Ok(Self {
            reuse_resource_stat: false,
            read,
            write,
        })
    }

    pub fn reuse_resource_stat(&self) -> bool {
        self.reuse_resource_stat
    }

    pub fn read(&self) -> &SlidingWindowMetric {
        &self.read
    }

    pub fn write(&self) -> &Arc<LeapArray> {
        &self.write
    }
}

/// Builds the statistic a rule's controller checks against.
///
/// Returns `None` for rules that do not need one.
pub fn generate_stat_for(rule: &Rule, nodes: &NodeRegistry) -> Result<Option<StandaloneStatistic>> {
    if !rule.need_statistic() {
        return Ok(None);
    }
    let config = nodes.stat_config();
    let node = nodes.get_or_create(rule.stat_resource(), Default::default());
    let interval_ms = rule.stat_interval_in_ms;

    if interval_ms == 0 || interval_ms == config.metric_interval_ms {
        return match node {
            Some(node) => Ok(Some(StandaloneStatistic::reusing(&node))),
            None => StandaloneStatistic::independent(
                config.metric_sample_count,
                config.metric_interval_ms,
                nodes.clock().clone(),
            )
            .map(Some),
        };
    }

    let bucket_length_ms = config.global_bucket_length_ms();
    let sample_count = if interval_ms > config.global_interval_ms_total
        || interval_ms < bucket_length_ms
        || interval_ms % bucket_length_ms != 0
    {
        1
    } else {
        interval_ms / bucket_length_ms
    };

    match check_validity_for_reuse_statistic(
        sample_count,
        interval_ms,
        config.global_sample_count_total,
        config.global_interval_ms_total,
    ) {
        Ok(()) => match node {
            Some(node) => StandaloneStatistic::view_of(&node, sample_count, interval_ms).map(Some),
            None => StandaloneStatistic::independent(sample_count, interval_ms, nodes.clock().clone())
                .map(Some),
        },
        Err(Error::GlobalStatisticNonReusable) => {
            info!(
                resource = %rule.resource,
                interval_ms,
                sample_count,
                "rule statistic window cannot reuse the resource statistic, building an independent one"
            );
            StandaloneStatistic::independent(sample_count, interval_ms, nodes.clock().clone()).map(Some)
        }
        Err(err) => Err(err),
    }
}

/// A rule bound to the calculator, checker and statistic that enforce it.
#[derive(Debug)]
pub struct TrafficShapingController {
    rule: Arc<Rule>,
    calculator: Calculator,
    checker: Checker,
    stat: Option<StandaloneStatistic>,
    /// Until when (ms) cluster checks skip the remote token source.
    downgrade_until_ms: AtomicU64,
}

impl TrafficShapingController {
    pub fn new(
        rule: Arc<Rule>,
        calculator: Calculator,
        checker: Checker,
        stat: Option<StandaloneStatistic>,
    ) -> Self {
        Self {
            rule,
            calculator,
            checker,
            stat,
            downgrade_until_ms: AtomicU64::new(0),
        }
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn calculator(&self) -> &Calculator {
        &self.calculator
    }

    pub fn checker(&self) -> &Checker {
        &self.checker
    }

    pub fn stat(&self) -> Option<&StandaloneStatistic> {
        self.stat.as_ref()
    }

    /// Tokens the rule allows at `now_ms`.
    pub fn allowed_tokens(&self, now_ms: u64) -> f64 {
        self.calculator
            .calculate_allowed_tokens(self.stat.as_ref().map(|s| s.read()), now_ms)
    }

    /// Checks `batch_count` tokens against the local statistics. `None`
    /// means pass.
    pub fn perform_checking(&self, batch_count: u32, now_ns: u64) -> Option<TokenResult> {
        let threshold = self.allowed_tokens(now_ns / 1_000_000);
        self.checker
            .do_check(&self.rule, self.stat.as_ref(), batch_count, threshold, now_ns)
    }

    pub fn downgrade_until_ms(&self) -> u64 {
        self.downgrade_until_ms.load(Ordering::Acquire)
    }

    pub fn is_downgraded(&self, now_ms: u64) -> bool {
        now_ms < self.downgrade_until_ms()
    }

    /// Skips the remote token source until `now_ms + interval_ms`. Returns
    /// false when a concurrent caller armed it first.
    pub fn arm_downgrade(&self, now_ms: u64, interval_ms: u64) -> bool {
        let current = self.downgrade_until_ms();
        if current > now_ms {
            return false;
        }
        self.downgrade_until_ms
            .compare_exchange(current, now_ms + interval_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
