use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use crate::base::ResourceType;
use crate::clock::Clock;
use crate::config::StatConfig;
use crate::error::Error;
use crate::error::Result;
use crate::stat::MetricEvent;
use crate::stat::ReadStat;
use crate::stat::StatNode;
use crate::stat::WriteStat;

/// Caps the rate of token requests within a namespace.
#[derive(Debug)]
pub struct RequestLimiter {
    node: StatNode,
    qps_allowed: AtomicU64,
}

impl RequestLimiter {
    pub fn new(namespace: &str, qps_allowed: f64, config: &StatConfig, clock: Clock) -> Result<Self> {
        Ok(Self {
            node: StatNode::new(namespace, ResourceType::Common, config, clock)?,
            qps_allowed: AtomicU64::new(qps_allowed.to_bits()),
        })
    }

    pub fn qps(&self) -> f64 {
        self.node.get_qps(MetricEvent::Pass)
    }

    pub fn qps_allowed(&self) -> f64 {
        f64::from_bits(self.qps_allowed.load(Ordering::Acquire))
    }

    pub fn set_qps_allowed(&self, qps_allowed: f64) {
        self.qps_allowed.store(qps_allowed.to_bits(), Ordering::Release);
    }

    pub fn can_pass(&self) -> bool {
        self.qps() + 1.0 <= self.qps_allowed()
    }

    /// Counts one request if there is room for it.
    pub fn try_pass(&self) -> bool {
        if self.can_pass() {
            self.node.add_count(MetricEvent::Pass, 1);
            return true;
        }
        false
    }
}

/// Request limiters keyed by namespace, all created with the same allowance.
#[derive(Debug)]
pub struct RequestLimiterRegistry {
    limiters: DashMap<String, Arc<RequestLimiter>>,
    max_allowed_qps: AtomicU64,
    config: StatConfig,
    clock: Clock,
}

impl RequestLimiterRegistry {
    pub fn new(max_allowed_qps: f64, config: StatConfig, clock: Clock) -> Self {
        Self {
            limiters: DashMap::new(),
            max_allowed_qps: AtomicU64::new(max_allowed_qps.to_bits()),
            config,
            clock,
        }
    }

    pub fn max_allowed_qps(&self) -> f64 {
        f64::from_bits(self.max_allowed_qps.load(Ordering::Acquire))
    }

    /// The limiter of `namespace`; `None` for a blank namespace.
    pub fn get_or_create(&self, namespace: &str) -> Option<Arc<RequestLimiter>> {
        if namespace.trim().is_empty() {
            return None;
        }
        if let Some(limiter) = self.limiters.get(namespace) {
            return Some(limiter.clone());
        }
        let created = self.limiters.entry(namespace.to_string()).or_try_insert_with(|| {
            RequestLimiter::new(namespace, self.max_allowed_qps(), &self.config, self.clock.clone())
                .map(Arc::new)
        });
        match created {
            Ok(limiter) => Some(limiter.clone()),
            Err(err) => {
                tracing::error!(namespace, %err, "failed to create request limiter");
                None
            }
        }
    }

    /// Blank namespaces are not limited.
    pub fn try_pass(&self, namespace: &str) -> bool {
        self.get_or_create(namespace)
            .is_none_or(|limiter| limiter.try_pass())
    }

    pub fn current_qps(&self, namespace: &str) -> f64 {
        self.get_or_create(namespace)
            .map(|limiter| limiter.qps())
            .unwrap_or_default()
    }

    /// Applies a new allowance to every existing and future limiter.
    pub fn apply_max_qps_change(&self, max_allowed_qps: f64) -> Result<()> {
        if max_allowed_qps <= 0.0 || max_allowed_qps.is_nan() {
            return Err(Error::InvalidConfig(format!(
                "max allowed qps should be positive, got {max_allowed_qps}"
            )));
        }
        self.max_allowed_qps
            .store(max_allowed_qps.to_bits(), Ordering::Release);
        for limiter in self.limiters.iter() {
            limiter.set_qps_allowed(max_allowed_qps);
        }
        Ok(())
    }
}
