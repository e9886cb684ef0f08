use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::base::BlockError;
use crate::base::BoxError;
use crate::base::ContextPool;
use crate::base::EntryContext;
use crate::base::ResourceType;
use crate::base::RouterSlot;
use crate::base::RuleCheckSlot;
use crate::base::SlotChain;
use crate::base::StatPrepareSlot;
use crate::base::StatSlot;
use crate::base::TrafficType;
use crate::clock::Clock;
use crate::cluster::ClusterChecker;
use crate::cluster::HttpTokenClient;
use crate::cluster::TokenClient;
use crate::cluster::TokenService;
use crate::config::Config;
use crate::error::Result;
use crate::flow::FlowSlot;
use crate::flow::Rule;
use crate::flow::RuleRegistry;
use crate::flow::StandaloneStatSlot;
use crate::stat::MetricItem;
use crate::stat::NodeRegistry;
use crate::stat::ResourceNodePrepareSlot;
use crate::stat::StatisticSlot;
use crate::system_metric::MemoryProbe;
use crate::system_metric::SysinfoMemoryProbe;

/// An admission control engine.
///
/// Cloning is cheap: every clone shares the same statistics, rules and slot
/// chain.
///
/// ```rust
/// use flowgate::FlowGate;
/// use flowgate::Rule;
///
/// let gate = FlowGate::new(Default::default()).unwrap();
/// gate.load_rules(vec![Rule {
///     resource: "orders".to_string(),
///     threshold: 1.0,
///     ..Rule::default()
/// }]);
///
/// let entry = gate.entry("orders").build().unwrap();
/// assert!(gate.entry("orders").build().is_err());
/// entry.exit();
/// ```
#[derive(Clone, Debug)]
pub struct FlowGate {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    clock: Clock,
    nodes: Arc<NodeRegistry>,
    rules: Arc<RuleRegistry>,
    cluster: Arc<ClusterChecker>,
    token_service: Option<Arc<dyn TokenService>>,
    chain: SlotChain,
    pool: ContextPool,
}

impl FlowGate {
    /// An engine with the default slots, reading process memory through
    /// `sysinfo` and the wall clock.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> FlowGateBuilder {
        FlowGateBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.inner.nodes
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.inner.rules
    }

    pub fn cluster(&self) -> &Arc<ClusterChecker> {
        &self.inner.cluster
    }

    /// The token service this process serves to its peers, if any.
    pub fn token_service(&self) -> Option<&Arc<dyn TokenService>> {
        self.inner.token_service.as_ref()
    }

    /// Replaces the active flow rules. Returns `false` when they did not change.
    pub fn load_rules(&self, rules: Vec<Rule>) -> bool {
        self.inner.rules.load_rules(rules)
    }

    /// Replaces the active flow rules with a JSON array of rules.
    pub fn load_rules_json(&self, json: &str) -> Result<bool> {
        self.inner.rules.load_rules_json(json)
    }

    /// Per second statistics of every resource since `since_ms`.
    pub fn metric_items(&self, since_ms: u64) -> Vec<MetricItem> {
        let mut items: Vec<MetricItem> = self
            .inner
            .nodes
            .nodes()
            .iter()
            .flat_map(|node| node.metrics_on_condition(|start| start >= since_ms))
            .collect();
        items.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.resource.cmp(&b.resource))
        });
        items
    }

    /// Starts describing a call to `resource`.
    pub fn entry(&self, resource: impl Into<String>) -> EntryBuilder {
        EntryBuilder {
            gate: self.clone(),
            resource: resource.into(),
            resource_type: ResourceType::Common,
            traffic_type: TrafficType::Outbound,
            batch_count: 1,
            flag: 0,
            args: Vec::new(),
            attachments: HashMap::new(),
            headers: HashMap::new(),
            from_service: Vec::new(),
        }
    }
}

/// Builds a [`FlowGate`].
///
/// Slots added here join the default ones: the resource node prepare slot,
/// the statistic slot, the flow slot and the standalone statistic slot.
#[derive(Default)]
pub struct FlowGateBuilder {
    config: Config,
    clock: Option<Clock>,
    memory_probe: Option<Arc<dyn MemoryProbe>>,
    token_client: Option<Arc<dyn TokenClient>>,
    redis_client: Option<Arc<dyn TokenClient>>,
    token_service: Option<Arc<dyn TokenService>>,
    prepare_slots: Vec<Arc<dyn StatPrepareSlot>>,
    rule_check_slots: Vec<Arc<dyn RuleCheckSlot>>,
    router_slots: Vec<Arc<dyn RouterSlot>>,
    stat_slots: Vec<Arc<dyn StatSlot>>,
}

impl FlowGateBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }

    /// Replaces the HTTP client used for `Global` cluster rules.
    pub fn token_client(mut self, client: Arc<dyn TokenClient>) -> Self {
        self.token_client = Some(client);
        self
    }

    /// Serves `GlobalRedis` cluster rules.
    pub fn redis_client(mut self, client: Arc<dyn TokenClient>) -> Self {
        self.redis_client = Some(client);
        self
    }

    /// Makes this process a token server. Requests of local rules whose
    /// master is this process are answered in-process.
    pub fn token_service(mut self, service: Arc<dyn TokenService>) -> Self {
        self.token_service = Some(service);
        self
    }

    pub fn prepare_slot(mut self, slot: Arc<dyn StatPrepareSlot>) -> Self {
        self.prepare_slots.push(slot);
        self
    }

    pub fn rule_check_slot(mut self, slot: Arc<dyn RuleCheckSlot>) -> Self {
        self.rule_check_slots.push(slot);
        self
    }

    pub fn router_slot(mut self, slot: Arc<dyn RouterSlot>) -> Self {
        self.router_slots.push(slot);
        self
    }

    pub fn stat_slot(mut self, slot: Arc<dyn StatSlot>) -> Self {
        self.stat_slots.push(slot);
        self
    }

    pub fn build(self) -> Result<FlowGate> {
        let config = self.config;
        config.validate()?;
        let clock = self.clock.unwrap_or_default();

        let nodes = Arc::new(NodeRegistry::new(
            config.stat.clone(),
            config.max_resource_amount,
            clock.clone(),
        )?);
        let memory_probe = self.memory_probe.unwrap_or_else(|| {
            Arc::new(SysinfoMemoryProbe::new(
                config.memory_stat_collect_interval_ms,
                clock.clone(),
            ))
        });
        let rules = Arc::new(RuleRegistry::new(
            nodes.clone(),
            memory_probe,
            config.warm_up_cold_factor,
        ));

        let token_client = match self.token_client {
            Some(client) => client,
            None => {
                let client = HttpTokenClient::new(config.cluster.clone());
                let client = match &self.token_service {
                    Some(service) => client.with_local_service(service.clone()),
                    None => client,
                };
                Arc::new(client)
            }
        };
        let mut cluster = ClusterChecker::new(&config.cluster, config.stat.clone(), clock.clone())
            .with_token_client(token_client);
        let redis_client = match self.redis_client {
            Some(client) => Some(client),
            None => default_redis_client(&config)?,
        };
        if let Some(client) = redis_client {
            cluster = cluster.with_redis_client(client);
        }
        let cluster = Arc::new(cluster);

        let mut chain = SlotChain::new();
        chain.add_stat_prepare_slot(Arc::new(ResourceNodePrepareSlot::new(nodes.clone())));
        chain.add_stat_slot(Arc::new(StatisticSlot::new(nodes.clone())));
        chain.add_rule_check_slot(Arc::new(
            FlowSlot::new(rules.clone(), clock.clone()).with_cluster(cluster.clone()),
        ));
        chain.add_stat_slot(Arc::new(StandaloneStatSlot::new(rules.clone())));
        for slot in self.prepare_slots {
            chain.add_stat_prepare_slot(slot);
        }
        for slot in self.rule_check_slots {
            chain.add_rule_check_slot(slot);
        }
        for slot in self.router_slots {
            chain.add_router_slot(slot);
        }
        for slot in self.stat_slots {
            chain.add_stat_slot(slot);
        }

        info!(app_name = %config.app_name, ?chain, "flowgate engine started");
        Ok(FlowGate {
            inner: Arc::new(Inner {
                pool: ContextPool::new(config.context_pool_size),
                config,
                clock,
                nodes,
                rules,
                cluster,
                token_service: self.token_service,
                chain,
            }),
        })
    }
}

#[cfg(feature = "redis")]
fn default_redis_client(config: &Config) -> Result<Option<Arc<dyn TokenClient>>> {
    use crate::cluster::RedisTokenService;

    let Some(settings) = &config.redis else {
        return Ok(None);
    };
    Ok(Some(Arc::new(RedisTokenService::new(
        settings,
        config.app_name.clone(),
    )?)))
}

#[cfg(not(feature = "redis"))]
fn default_redis_client(config: &Config) -> Result<Option<Arc<dyn TokenClient>>> {
    if config.redis.is_some() {
        tracing::warn!("redis settings ignored, flowgate was built without the redis feature");
    }
    Ok(None)
}

/// Describes one call before it enters the engine.
#[derive(Debug)]
pub struct EntryBuilder {
    gate: FlowGate,
    resource: String,
    resource_type: ResourceType,
    traffic_type: TrafficType,
    batch_count: u32,
    flag: i32,
    args: Vec<String>,
    attachments: HashMap<String, String>,
    headers: HashMap<String, Vec<String>>,
    from_service: Vec<String>,
}

impl EntryBuilder {
    /// Tokens the call needs; defaults to 1.
    pub fn with_batch_count(mut self, batch_count: u32) -> Self {
        self.batch_count = batch_count;
        self
    }

    /// `1` marks a prioritized call.
    pub fn with_flag(mut self, flag: i32) -> Self {
        self.flag = flag;
        self
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn with_traffic_type(mut self, traffic_type: TrafficType) -> Self {
        self.traffic_type = traffic_type;
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Names the caller, for rules restricted with `limitApp`.
    pub fn with_from_service(mut self, service: impl Into<String>) -> Self {
        self.from_service.push(service.into());
        self
    }

    /// Runs the slot chain without waiting.
    ///
    /// A passing call comes back with the delay its pacing rules asked for;
    /// the caller should wait that long before doing the work.
    pub fn try_enter(self) -> Result<(Entry, Duration), BlockError> {
        let gate = self.gate;
        let inner = &gate.inner;
        let mut ctx = inner.pool.get();
        ctx.set_resource(
            inner
                .nodes
                .resource(&self.resource, self.resource_type, self.traffic_type),
        );
        ctx.set_start_time(inner.clock.now_ms());
        let input = ctx.input_mut();
        input.batch_count = self.batch_count;
        input.flag = self.flag;
        input.args = self.args;
        input.attachments = self.attachments;
        input.headers = self.headers;
        ctx.from_service_mut().extend(self.from_service);

        let result = inner.chain.entry(&mut ctx);
        let wait = Duration::from_nanos(ctx.wait_nanos());
        let blocked = result.block_error().cloned();
        let entry = Entry {
            gate: gate.clone(),
            ctx: Some(ctx),
        };
        match blocked {
            Some(err) => {
                drop(entry);
                Err(err)
            }
            None => Ok((entry, wait)),
        }
    }

    /// Enters, sleeping the current thread for any pacing delay.
    pub fn build(self) -> Result<Entry, BlockError> {
        let (entry, wait) = self.try_enter()?;
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        Ok(entry)
    }

    /// Enters, sleeping the task for any pacing delay.
    pub async fn build_async(self) -> Result<Entry, BlockError> {
        let (entry, wait) = self.try_enter()?;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        Ok(entry)
    }
}

/// An admitted call. Dropping it (or calling [`Entry::exit`]) completes the
/// call and records its round trip time.
#[derive(Debug)]
pub struct Entry {
    gate: FlowGate,
    ctx: Option<Box<EntryContext>>,
}

impl Entry {
    /// The call's context; only `None` while the entry is being dropped.
    pub fn context(&self) -> Option<&EntryContext> {
        self.ctx.as_deref()
    }

    /// Records that the guarded work failed.
    pub fn set_error(&mut self, err: impl Into<BoxError>) {
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.set_error(err.into());
        }
    }

    pub fn exit(self) {
        drop(self);
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        let Some(mut ctx) = self.ctx.take() else {
            return;
        };
        let inner = &self.gate.inner;
        let rt = inner.clock.now_ms().saturating_sub(ctx.start_time());
        ctx.set_rt(rt);
        inner.chain.exit(&mut ctx);
        inner.pool.put(ctx);
    }
}
