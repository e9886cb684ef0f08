use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::base::BoxError;
use crate::base::ResourceWrapper;
use crate::base::TokenResult;
use crate::stat::StatNode;

/// Caller supplied input of one entry.
#[derive(Debug)]
pub struct EntryInput {
    pub batch_count: u32,
    /// `1` marks a prioritized request.
    pub flag: i32,
    pub args: Vec<String>,
    pub attachments: HashMap<String, String>,
    pub headers: HashMap<String, Vec<String>>,
    pub metadata: HashMap<String, String>,
}

impl Default for EntryInput {
    fn default() -> Self {
        Self {
            batch_count: 1,
            flag: 0,
            args: Vec::new(),
            attachments: HashMap::new(),
            headers: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

impl EntryInput {
    fn reset(&mut self) {
        self.batch_count = 1;
        self.flag = 0;
        self.args.clear();
        self.attachments.clear();
        self.headers.clear();
        self.metadata.clear();
    }
}

/// State of one in-flight call while it travels through the slot chain.
#[derive(Debug, Default)]
pub struct EntryContext {
    resource: Option<Arc<ResourceWrapper>>,
    input: EntryInput,
    start_time_ms: u64,
    rt_ms: u64,
    rule_check_result: TokenResult,
    stat_node: Option<Arc<StatNode>>,
    error: Option<BoxError>,
    from_service: Vec<String>,
    wait_nanos: u64,
    route: HashMap<String, String>,
}

impl EntryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(&self) -> Option<&Arc<ResourceWrapper>> {
        self.resource.as_ref()
    }

    pub(crate) fn set_resource(&mut self, resource: Arc<ResourceWrapper>) {
        self.resource = Some(resource);
    }

    /// Name of the bound resource, or an empty string.
    pub fn resource_name(&self) -> &str {
        self.resource.as_ref().map(|r| r.name()).unwrap_or_default()
    }

    pub fn input(&self) -> &EntryInput {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut EntryInput {
        &mut self.input
    }

    pub fn start_time(&self) -> u64 {
        self.start_time_ms
    }

    pub(crate) fn set_start_time(&mut self, now_ms: u64) {
        self.start_time_ms = now_ms;
    }

    /// Round trip time of the call, known once the entry has exited.
    pub fn rt(&self) -> u64 {
        self.rt_ms
    }

    pub(crate) fn set_rt(&mut self, rt_ms: u64) {
        self.rt_ms = rt_ms;
    }

    pub fn rule_check_result(&self) -> &TokenResult {
        &self.rule_check_result
    }

    pub fn rule_check_result_mut(&mut self) -> &mut TokenResult {
        &mut self.rule_check_result
    }

    pub fn is_blocked(&self) -> bool {
        self.rule_check_result.is_blocked()
    }

    pub fn stat_node(&self) -> Option<&Arc<StatNode>> {
        self.stat_node.as_ref()
    }

    pub fn set_stat_node(&mut self, node: Arc<StatNode>) {
        self.stat_node = Some(node);
    }

    pub fn error(&self) -> Option<&BoxError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, err: BoxError) {
        self.error = Some(err);
    }

    /// Callers this request came from; matched against a rule's `limitApp`.
    pub fn from_service(&self) -> &[String] {
        &self.from_service
    }

    pub fn from_service_mut(&mut self) -> &mut Vec<String> {
        &mut self.from_service
    }

    /// Total cooperative wait requested by checkers that granted with a delay.
    pub fn wait_nanos(&self) -> u64 {
        self.wait_nanos
    }

    pub fn add_wait(&mut self, nanos: u64) {
        self.wait_nanos = self.wait_nanos.saturating_add(nanos);
    }

    /// Routing metadata written by router slots.
    pub fn route(&self) -> &HashMap<String, String> {
        &self.route
    }

    pub fn set_route(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.route.insert(key.into(), value.into());
    }

    /// Clears every field so the context can serve another call.
    pub fn reset(&mut self) {
        self.resource = None;
        self.input.reset();
        self.start_time_ms = 0;
        self.rt_ms = 0;
        self.rule_check_result.reset_to_pass();
        self.stat_node = None;
        self.error = None;
        self.from_service.clear();
        self.wait_nanos = 0;
        self.route.clear();
    }
}

/// Bounded pool of reusable contexts.
///
/// Borrowing allocates only when the pool is empty; returning resets the
/// context and drops it if the pool is already full.
#[derive(Debug)]
pub struct ContextPool {
    idle: ArrayQueue<Box<EntryContext>>,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn get(&self) -> Box<EntryContext> {
        self.idle.pop().unwrap_or_default()
    }

    pub fn put(&self, mut ctx: Box<EntryContext>) {
        ctx.reset();
        let _ = self.idle.push(ctx);
    }

    pub fn idle(&self) -> usize {
        self.idle.len()
    }
}
