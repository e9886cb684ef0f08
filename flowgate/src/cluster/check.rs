use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tracing::debug;
use tracing::warn;

use crate::base::BlockType;
use crate::base::TokResultStatus;
use crate::base::TokenResult;
use crate::clock::Clock;
use crate::cluster::RequestLimiterRegistry;
use crate::cluster::TokenClient;
use crate::config::ClusterSettings;
use crate::config::StatConfig;
use crate::flow::ClusterStrategy;
use crate::flow::ControlBehavior;
use crate::flow::TrafficShapingController;

/// Checks cluster mode rules against a remote token source.
///
/// Whenever the remote path cannot give an answer (the client side request
/// budget is spent, a recent failure put the rule in downgrade, the source
/// is missing or it errors) the rule falls back to its local check, or
/// passes when it does not allow falling back.
#[derive(Debug)]
pub struct ClusterChecker {
    client_limiter: RequestLimiterRegistry,
    client_namespace: String,
    token_client: Option<Arc<dyn TokenClient>>,
    redis_client: Option<Arc<dyn TokenClient>>,
    default_downgrade_interval_ms: u64,
    clock: Clock,
    fallbacks: Counter<u64>,
}

impl ClusterChecker {
    pub fn new(settings: &ClusterSettings, stat: StatConfig, clock: Clock) -> Self {
        let meter = global::meter("flowgate");
        Self {
            client_limiter: RequestLimiterRegistry::new(
                settings.client_max_allow_qps,
                stat,
                clock.clone(),
            ),
            client_namespace: settings.client_namespace.clone(),
            token_client: None,
            redis_client: None,
            default_downgrade_interval_ms: settings.downgrade_interval_ms,
            clock,
            fallbacks: meter
                .u64_counter("flowgate_cluster_fallback_total")
                .with_description("Cluster checks answered without the remote token source")
                .build(),
        }
    }

    /// Serves rules with the `Global` strategy.
    pub fn with_token_client(mut self, client: Arc<dyn TokenClient>) -> Self {
        self.token_client = Some(client);
        self
    }

    /// Serves rules with the `GlobalRedis` strategy.
    pub fn with_redis_client(mut self, client: Arc<dyn TokenClient>) -> Self {
        self.redis_client = Some(client);
        self
    }

    pub fn client_limiter(&self) -> &RequestLimiterRegistry {
        &self.client_limiter
    }

    /// Checks `batch_count` tokens of `tc`'s rule. `local` runs the rule's
    /// local check and is only called on fallback.
    pub fn check<F>(
        &self,
        tc: &TrafficShapingController,
        batch_count: u32,
        flag: i32,
        local: F,
    ) -> Option<TokenResult>
    where
        F: FnOnce() -> Option<TokenResult>,
    {
        let rule = tc.rule();
        let Some(config) = rule.cluster() else {
            return local();
        };
        let flag = if rule.control_behavior == ControlBehavior::Throttling {
            1
        } else {
            flag
        };
        let fallback = |reason: &'static str| {
            self.fallbacks.add(
                1,
                &[
                    KeyValue::new("resource", rule.resource.clone()),
                    KeyValue::new("reason", reason),
                ],
            );
            if config.fallback_to_local_when_fail {
                local()
            } else {
                None
            }
        };

        if !self.client_limiter.try_pass(&self.client_namespace) {
            debug!(resource = %rule.resource, "cluster client request budget spent");
            return fallback("client_limited");
        }
        let now_ms = self.clock.now_ms();
        if tc.is_downgraded(now_ms) {
            return fallback("downgraded");
        }

        let client = match config.cluster_strategy {
            ClusterStrategy::GlobalRedis => self.redis_client.as_ref(),
            ClusterStrategy::Global => {
                if config.token_server_master_host.is_empty() || config.token_server_master_port <= 0 {
                    return fallback("no_master");
                }
                self.token_client.as_ref()
            }
            ClusterStrategy::AvgLocal => None,
        };
        let Some(client) = client else {
            return fallback("no_token_source");
        };

        let result = client.acquire_cluster_token(rule, batch_count, flag);
        match result.status() {
            TokResultStatus::Ok => None,
            TokResultStatus::ShouldWait => Some(TokenResult::should_wait(
                result.wait_ms().saturating_mul(1_000_000),
            )),
            TokResultStatus::Blocked => Some(TokenResult::blocked_with_cause(
                BlockType::Flow,
                "flow reject check blocked",
                rule.clone(),
                0.0,
            )),
            TokResultStatus::Fail => {
                let interval_ms = u64::try_from(config.downgrade_duration_in_ms)
                    .ok()
                    .filter(|ms| *ms > 0)
                    .unwrap_or(self.default_downgrade_interval_ms);
                if tc.arm_downgrade(now_ms, interval_ms) {
                    warn!(
                        resource = %rule.resource,
                        rule_id = %rule.id,
                        interval_ms,
                        "cluster token request failed, checking locally for a while"
                    );
                }
                fallback("failed")
            }
            TokResultStatus::NoRuleExists
            | TokResultStatus::BadRequest
            | TokResultStatus::TooManyRequest => fallback("rejected_request"),
            _ => None,
        }
    }
}
