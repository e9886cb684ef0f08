use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;

use crate::base::BaseSlot;
use crate::base::BlockError;
use crate::base::EntryContext;
use crate::base::StatPrepareSlot;
use crate::base::StatSlot;
use crate::base::TrafficType;
use crate::stat::ConcurrencyStat;
use crate::stat::MetricEvent;
use crate::stat::NodeRegistry;
use crate::stat::StatNode;
use crate::stat::WriteStat;

pub const PREPARE_SLOT_ORDER: u32 = 1000;
pub const STAT_SLOT_ORDER: u32 = 1000;

/// Attaches the resource's [`StatNode`] to the context, creating it lazily.
#[derive(Debug)]
pub struct ResourceNodePrepareSlot {
    nodes: Arc<NodeRegistry>,
}

impl ResourceNodePrepareSlot {
    pub fn new(nodes: Arc<NodeRegistry>) -> Self {
        Self { nodes }
    }
}

impl BaseSlot for ResourceNodePrepareSlot {
    fn order(&self) -> u32 {
        PREPARE_SLOT_ORDER
    }
}

impl StatPrepareSlot for ResourceNodePrepareSlot {
    fn prepare(&self, ctx: &mut EntryContext) {
        let Some(res) = ctx.resource().cloned() else {
            return;
        };
        if let Some(node) = self.nodes.get_or_create(res.name(), res.classification()) {
            ctx.set_stat_node(node);
        }
    }
}

/// Records pass, block and completion of every entry into its resource node,
/// and into the global inbound node for inbound traffic.
#[derive(Debug)]
pub struct StatisticSlot {
    nodes: Arc<NodeRegistry>,
    handled: Counter<u64>,
}

impl StatisticSlot {
    pub fn new(nodes: Arc<NodeRegistry>) -> Self {
        let meter = global::meter("flowgate");
        Self {
            nodes,
            handled: meter
                .u64_counter("flowgate_handled_total")
                .with_description("Entries handled by the slot chain")
                .build(),
        }
    }

    fn nodes_of<'a>(&'a self, ctx: &'a EntryContext) -> impl Iterator<Item = &'a Arc<StatNode>> {
        let inbound = ctx
            .resource()
            .filter(|r| r.flow_type() == TrafficType::Inbound)
            .map(|_| self.nodes.inbound_node());
        ctx.stat_node().into_iter().chain(inbound)
    }

    fn record_handled(&self, ctx: &EntryContext, result: &'static str, count: u64) {
        self.handled.add(
            count,
            &[
                KeyValue::new("resource", ctx.resource_name().to_string()),
                KeyValue::new("result", result),
            ],
        );
    }
}

impl BaseSlot for StatisticSlot {
    fn order(&self) -> u32 {
        STAT_SLOT_ORDER
    }
}

impl StatSlot for StatisticSlot {
    fn on_entry_passed(&self, ctx: &EntryContext) {
        let count = ctx.input().batch_count as i64;
        for node in self.nodes_of(ctx) {
            node.increase_concurrency();
            node.add_count(MetricEvent::Pass, count);
        }
        self.record_handled(ctx, "pass", count as u64);
    }

    fn on_entry_blocked(&self, ctx: &EntryContext, err: &BlockError) {
        let count = ctx.input().batch_count as i64;
        for node in self.nodes_of(ctx) {
            node.add_count(MetricEvent::Block, count);
            if let Some(event) = err.block_type().metric_event() {
                node.add_count(event, count);
            }
        }
        self.record_handled(ctx, "block", count as u64);
    }

    fn on_completed(&self, ctx: &EntryContext) {
        let count = ctx.input().batch_count as i64;
        let rt = ctx.rt() as i64;
        for node in self.nodes_of(ctx) {
            if ctx.error().is_some() {
                node.add_count(MetricEvent::Error, count);
            }
            node.add_count(MetricEvent::Rt, rt);
            node.add_count(MetricEvent::Complete, count);
            node.decrease_concurrency();
        }
    }
}
