use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tracing::debug;

use crate::base::BaseSlot;
use crate::base::BlockError;
use crate::base::EntryContext;
use crate::base::RuleCheckSlot;
use crate::base::StatSlot;
use crate::base::TokenResult;
use crate::clock::Clock;
use crate::cluster::ClusterChecker;
use crate::flow::ClusterStrategy;
use crate::flow::RelationStrategy;
use crate::flow::RuleRegistry;
use crate::flow::TrafficShapingController;
use crate::stat::MetricEvent;
use crate::stat::StatNode;
use crate::stat::WriteStat;

pub const FLOW_SLOT_ORDER: u32 = 2000;
pub const STANDALONE_STAT_SLOT_ORDER: u32 = 3000;

/// Checks every flow controller of the entry's resource in rule order.
///
/// The first blocking controller ends the check. Controllers that grant
/// with a delay add it to the context's wait and the check goes on.
#[derive(Debug)]
pub struct FlowSlot {
    rules: Arc<RuleRegistry>,
    cluster: Option<Arc<ClusterChecker>>,
    clock: Clock,
    flow_wait: Counter<u64>,
}

impl FlowSlot {
    pub fn new(rules: Arc<RuleRegistry>, clock: Clock) -> Self {
        let meter = global::meter("flowgate");
        Self {
            rules,
            cluster: None,
            clock,
            flow_wait: meter
                .u64_counter("flowgate_flow_wait_total")
                .with_description("Tokens granted with a pacing delay")
                .build(),
        }
    }

    /// Enables cluster mode rules. Without a cluster checker they are
    /// checked locally.
    pub fn with_cluster(mut self, cluster: Arc<ClusterChecker>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    fn can_pass_check(
        &self,
        tc: &TrafficShapingController,
        node: Option<&Arc<StatNode>>,
        batch_count: u32,
        flag: i32,
    ) -> Option<TokenResult> {
        if let Some(cluster) = &self.cluster
            && let Some(config) = tc.rule().cluster()
            && matches!(
                config.cluster_strategy,
                ClusterStrategy::Global | ClusterStrategy::GlobalRedis
            )
        {
            return cluster.check(tc, batch_count, flag, || {
                self.check_in_local(tc, node, batch_count)
            });
        }
        self.check_in_local(tc, node, batch_count)
    }

    fn check_in_local(
        &self,
        tc: &TrafficShapingController,
        node: Option<&Arc<StatNode>>,
        batch_count: u32,
    ) -> Option<TokenResult> {
        let rule = tc.rule();
        let actual = match rule.relation_strategy {
            RelationStrategy::AssociatedResource => self.rules.nodes().get(&rule.ref_resource),
            RelationStrategy::CurrentResource => node.cloned(),
        };
        if actual.is_none() {
            debug!(resource = %rule.resource, "no statistic node for flow rule, passing");
            return None;
        }
        tc.perform_checking(batch_count, self.clock.now_ns())
    }
}

impl BaseSlot for FlowSlot {
    fn order(&self) -> u32 {
        FLOW_SLOT_ORDER
    }
}

impl RuleCheckSlot for FlowSlot {
    fn check(&self, ctx: &mut EntryContext) -> Option<TokenResult> {
        let tcs = self.rules.controllers_of(ctx.resource_name())?;
        let node = ctx.stat_node().cloned();
        let batch_count = ctx.input().batch_count;
        let flag = ctx.input().flag;

        for tc in tcs.iter() {
            if !tc.rule().matches_limit_app(ctx.from_service()) {
                continue;
            }
            let Some(result) = self.can_pass_check(tc, node.as_ref(), batch_count, flag) else {
                continue;
            };
            if result.is_blocked() {
                debug!(resource = ctx.resource_name(), "flow slot blocked");
                return Some(result);
            }
            if result.is_wait() && result.nanos_to_wait() > 0 {
                self.flow_wait.add(
                    u64::from(batch_count),
                    &[KeyValue::new("resource", ctx.resource_name().to_string())],
                );
                ctx.add_wait(result.nanos_to_wait());
            }
        }
        None
    }
}

/// Feeds the independent statistics of controllers whose window could not
/// be served from the resource node.
#[derive(Debug)]
pub struct StandaloneStatSlot {
    rules: Arc<RuleRegistry>,
}

impl StandaloneStatSlot {
    pub fn new(rules: Arc<RuleRegistry>) -> Self {
        Self { rules }
    }
}

impl BaseSlot for StandaloneStatSlot {
    fn order(&self) -> u32 {
        STANDALONE_STAT_SLOT_ORDER
    }
}

impl StatSlot for StandaloneStatSlot {
    fn on_entry_passed(&self, ctx: &EntryContext) {
        let Some(tcs) = self.rules.controllers_of(ctx.resource_name()) else {
            return;
        };
        let count = i64::from(ctx.input().batch_count);
        for tc in tcs.iter() {
            if let Some(stat) = tc.stat()
                && !stat.reuse_resource_stat()
            {
                stat.write().add_count(MetricEvent::Pass, count);
            }
        }
    }

    fn on_entry_blocked(&self, _ctx: &EntryContext, _err: &BlockError) {}

    fn on_completed(&self, _ctx: &EntryContext) {}
}
