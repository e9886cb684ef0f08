use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use tracing::error;

use crate::base::TokResult;
use crate::clock::Clock;
use crate::cluster::ClusterMetric;
use crate::cluster::RequestLimiterRegistry;
use crate::config::Config;
use crate::config::StatConfig;
use crate::error::Result;
use crate::flow::ClusterStrategy;
use crate::flow::Pace;
use crate::flow::Rule;
use crate::stat::MetricEvent;

/// Grants cluster tokens.
///
/// This is what a token server runs behind its acquire-token endpoint, and
/// what a client calls in-process when it is the master itself.
pub trait TokenService: Send + Sync + std::fmt::Debug {
    /// `rule` is the JSON encoded rule, `prioritized > 0` asks for pacing
    /// instead of a plain yes or no.
    fn request_token(&self, rule: &str, acquire_count: u32, prioritized: i32) -> TokResult;
}

/// A token server keeping fleet wide statistics per resource.
#[derive(Debug)]
pub struct DefaultTokenService {
    metrics: DashMap<String, Arc<ClusterMetric>>,
    limiter: RequestLimiterRegistry,
    namespace: String,
    stat: StatConfig,
    clock: Clock,
}

impl DefaultTokenService {
    pub fn new(config: &Config, clock: Clock) -> Self {
        Self {
            metrics: DashMap::new(),
            limiter: RequestLimiterRegistry::new(
                config.cluster.max_allow_qps,
                config.stat.clone(),
                clock.clone(),
            ),
            namespace: config.cluster.namespace.clone(),
            stat: config.stat.clone(),
            clock,
        }
    }

    /// Changes how many token requests per second the server accepts.
    pub fn apply_global_max_qps_change(&self, max_allowed_qps: f64) -> Result<()> {
        self.limiter.apply_max_qps_change(max_allowed_qps)
    }

    pub fn current_qps(&self) -> f64 {
        self.limiter.current_qps(&self.namespace)
    }

    /// The statistics kept for the resource a rule is checked against.
    pub fn cluster_metric(&self, rule: &Rule) -> Option<Arc<ClusterMetric>> {
        let key = rule.stat_resource();
        if let Some(metric) = self.metrics.get(key) {
            return Some(metric.clone());
        }
        let created = self.metrics.entry(key.to_string()).or_try_insert_with(|| {
            ClusterMetric::new(
                self.stat.metric_sample_count,
                self.stat.metric_interval_ms,
                rule.max_queueing_time_ms,
                rule.stat_interval_in_ms,
                self.clock.clone(),
            )
            .map(Arc::new)
        });
        match created {
            Ok(metric) => Some(metric.clone()),
            Err(err) => {
                error!(resource = key, %err, "failed to create cluster metric");
                None
            }
        }
    }

    fn acquire(&self, rule: &Rule, acquire_count: u32, prioritized: i32) -> TokResult {
        if !self.limiter.try_pass(&self.namespace) {
            return TokResult::TOO_MANY_REQUEST;
        }
        let Some(metric) = self.cluster_metric(rule) else {
            return TokResult::FAIL;
        };
        let latest_qps = metric.get_avg(MetricEvent::Pass);
        let global_threshold = global_threshold(rule);
        let remaining = global_threshold - latest_qps - f64::from(acquire_count);
        debug!(
            resource = %rule.resource,
            latest_qps,
            remaining,
            global_threshold,
            "acquiring cluster token"
        );

        if prioritized > 0 {
            return self.acquire_paced(&metric, acquire_count, global_threshold);
        }
        if remaining >= 0.0 {
            record_pass(&metric, acquire_count);
            TokResult::OK
        } else {
            record_block(&metric, acquire_count);
            TokResult::BLOCKED
        }
    }

    fn acquire_paced(&self, metric: &ClusterMetric, acquire_count: u32, threshold: f64) -> TokResult {
        if threshold <= 0.0 {
            record_block(metric, acquire_count);
            return TokResult::BLOCKED;
        }
        match metric.pace(self.clock.now_ns(), acquire_count, threshold) {
            Pace::Pass => {
                record_pass(metric, acquire_count);
                TokResult::OK
            }
            Pace::Wait(nanos) => {
                record_pass(metric, acquire_count);
                TokResult::should_wait(nanos / 1_000_000)
            }
            Pace::QueueFull => {
                record_block(metric, acquire_count);
                TokResult::BLOCKED
            }
        }
    }
}

impl TokenService for DefaultTokenService {
    fn request_token(&self, rule: &str, acquire_count: u32, prioritized: i32) -> TokResult {
        match serde_json::from_str::<Rule>(rule) {
            Ok(rule) => self.acquire(&rule, acquire_count, prioritized),
            Err(err) => {
                debug!(%err, "bad token request");
                TokResult::BAD_REQUEST
            }
        }
    }
}

/// The fleet wide threshold of a cluster rule.
pub fn global_threshold(rule: &Rule) -> f64 {
    match &rule.cluster_config {
        Some(config) if config.cluster_strategy == ClusterStrategy::Global => config.global_threshold,
        _ => rule.threshold,
    }
}

fn record_pass(metric: &ClusterMetric, acquire_count: u32) {
    metric.add_count(MetricEvent::Pass, i64::from(acquire_count));
    metric.add_count(MetricEvent::PassRequest, 1);
}

fn record_block(metric: &ClusterMetric, acquire_count: u32) {
    metric.add_count(MetricEvent::Block, i64::from(acquire_count));
    metric.add_count(MetricEvent::BlockRequest, 1);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::base::TokResultStatus;
    use crate::flow::ClusterConfig;
    use crate::flow::ControlBehavior;
    use crate::flow::RelationStrategy;

    use super::*;

    fn service(max_allow_qps: f64) -> (DefaultTokenService, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let mut config = Config::default();
        config.cluster.max_allow_qps = max_allow_qps;
        (DefaultTokenService::new(&config, clock), mock)
    }

    fn rule_json(global_threshold: f64) -> String {
        serde_json::to_string(&Rule {
            id: "1".to_string(),
            resource: "abc".to_string(),
            threshold: 1.0,
            cluster_mode: true,
            cluster_config: Some(ClusterConfig {
                cluster_strategy: ClusterStrategy::Global,
                global_threshold,
                ..ClusterConfig::default()
            }),
            ..Rule::default()
        })
        .unwrap()
    }

    #[test]
    fn test_bad_request() {
        let (service, _mock) = service(100.0);
        assert_eq!(service.request_token("{not json", 1, 0), TokResult::BAD_REQUEST);
    }

    #[test]
    fn test_global_threshold_is_shared() {
        let (service, mock) = service(100.0);
        let rule = rule_json(3.0);
        assert_eq!(service.request_token(&rule, 2, 0), TokResult::OK);
        assert_eq!(service.request_token(&rule, 1, 0), TokResult::OK);
        assert_eq!(service.request_token(&rule, 1, 0), TokResult::BLOCKED);

        let metric = service.cluster_metric(&serde_json::from_str(&rule).unwrap()).unwrap();
        assert_eq!(metric.get_sum(MetricEvent::Pass), 3);
        assert_eq!(metric.get_sum(MetricEvent::PassRequest), 2);
        assert_eq!(metric.get_sum(MetricEvent::Block), 1);
        assert_eq!(metric.get_sum(MetricEvent::BlockRequest), 1);

        mock.increment(Duration::from_millis(1000));
        assert_eq!(service.request_token(&rule, 1, 0), TokResult::OK);
    }

    #[test]
    fn test_non_global_strategy_uses_rule_threshold() {
        let rule = Rule {
            threshold: 7.0,
            cluster_config: Some(ClusterConfig {
                cluster_strategy: ClusterStrategy::GlobalRedis,
                global_threshold: 100.0,
                ..ClusterConfig::default()
            }),
            ..Rule::default()
        };
        assert_eq!(global_threshold(&rule), 7.0);
        assert_eq!(global_threshold(&Rule { cluster_config: None, ..rule }), 7.0);
    }

    #[test]
    fn test_too_many_requests() {
        let (service, _mock) = service(2.0);
        let rule = rule_json(100.0);
        assert_eq!(service.request_token(&rule, 1, 0), TokResult::OK);
        assert_eq!(service.request_token(&rule, 1, 0), TokResult::OK);
        assert_eq!(service.request_token(&rule, 1, 0), TokResult::TOO_MANY_REQUEST);

        service.apply_global_max_qps_change(10.0).unwrap();
        assert_eq!(service.request_token(&rule, 1, 0), TokResult::OK);
    }

    #[test]
    fn test_prioritized_requests_are_paced() {
        let (service, _mock) = service(100.0);
        let mut rule: Rule = serde_json::from_str(&rule_json(10.0)).unwrap();
        rule.control_behavior = ControlBehavior::Throttling;
        rule.max_queueing_time_ms = 250;
        let rule = serde_json::to_string(&rule).unwrap();

        assert_eq!(service.request_token(&rule, 1, 1), TokResult::OK);
        let waited = service.request_token(&rule, 1, 1);
        assert_eq!(waited.status(), TokResultStatus::ShouldWait);
        assert_eq!(waited.wait_ms(), 100);
        assert_eq!(service.request_token(&rule, 1, 1).wait_ms(), 200);
        assert_eq!(service.request_token(&rule, 1, 1), TokResult::BLOCKED);
    }

    #[test]
    fn test_associated_rules_share_the_ref_metric() {
        let (service, _mock) = service(100.0);
        let associated = Rule {
            resource: "abc".to_string(),
            relation_strategy: RelationStrategy::AssociatedResource,
            ref_resource: "def".to_string(),
            ..Rule::default()
        };
        let direct = Rule {
            resource: "def".to_string(),
            ..Rule::default()
        };
        let a = service.cluster_metric(&associated).unwrap();
        let b = service.cluster_metric(&direct).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
