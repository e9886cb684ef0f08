use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::base::BlockRule;
use crate::error::Error;
use crate::error::Result;

/// Longest statistic window a rule may ask for.
pub const MAX_STAT_INTERVAL_MS: u32 = 10 * 60 * 1000;

/// Declares a fieldless enum that travels as an integer in rule JSON.
macro_rules! int_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal $(| $alias:literal)*),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "i32", into = "i32")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl TryFrom<i32> for $name {
            type Error = String;

            fn try_from(value: i32) -> std::result::Result<Self, String> {
                match value {
                    $($value $(| $alias)* => Ok($name::$variant),)+
                    other => Err(format!("invalid {} {}", stringify!($name), other)),
                }
            }
        }

        impl From<$name> for i32 {
            fn from(value: $name) -> i32 {
                match value {
                    $($name::$variant => $value),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($name::$variant => f.write_str(stringify!($variant))),+
                }
            }
        }
    };
}

int_enum! {
    /// How the allowed threshold is computed.
    #[derive(Default)]
    pub enum TokenCalculateStrategy {
        #[default]
        Direct = 0,
        WarmUp = 1,
        MemoryAdaptive = 2,
    }
}

int_enum! {
    /// What happens to traffic above the threshold.
    #[derive(Default)]
    pub enum ControlBehavior {
        #[default]
        Reject = 0,
        /// Requests are paced and may have to wait in a virtual queue.
        Throttling = 1,
    }
}

int_enum! {
    /// Whose statistics the threshold is compared against.
    #[derive(Default)]
    pub enum RelationStrategy {
        #[default]
        CurrentResource = 0,
        AssociatedResource = 1,
    }
}

int_enum! {
    /// Where a cluster mode rule gets its tokens from.
    #[derive(Default)]
    pub enum ClusterStrategy {
        #[default]
        AvgLocal = 1 | 0,
        Global = 2,
        GlobalRedis = 3,
    }
}

/// Cluster settings of a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    pub flow_id: String,
    pub fallback_to_local_when_fail: bool,
    pub cluster_strategy: ClusterStrategy,
    pub resource_timeout: i64,
    pub resource_timeout_strategy: i32,
    pub client_offline_time: i64,
    /// Threshold shared by the whole fleet under [`ClusterStrategy::Global`].
    pub global_threshold: f64,
    pub token_server_strategy: i32,
    pub token_server_address: String,
    pub downgrade_duration_in_ms: i64,
    pub master_node_threshold: f64,
    pub token_server_master_host: String,
    pub token_server_master_port: i32,
}

/// A flow control rule.
///
/// Rules arrive as JSON with camelCase keys and integer enums; unknown keys
/// are ignored.
///
/// ```rust
/// use flowgate::flow::ControlBehavior;
/// use flowgate::flow::Rule;
///
/// let rules: Vec<Rule> = serde_json::from_str(
///     r#"[{"resource": "abc", "threshold": 10, "controlBehavior": 1, "maxQueueingTimeMs": 500, "owner": "ops"}]"#,
/// )
/// .unwrap();
/// assert_eq!(rules[0].control_behavior, ControlBehavior::Throttling);
/// assert_eq!(rules[0].max_queueing_time_ms, 500);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Rule {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub app: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rule_name: String,
    /// Comma separated callers the rule applies to; empty or `default`
    /// means everybody.
    pub limit_app: String,
    pub resource: String,
    pub token_calculate_strategy: TokenCalculateStrategy,
    pub control_behavior: ControlBehavior,
    /// Tokens allowed per statistic interval.
    pub threshold: f64,
    pub relation_strategy: RelationStrategy,
    pub ref_resource: String,
    pub max_queueing_time_ms: u32,
    pub warm_up_period_sec: u32,
    pub warm_up_cold_factor: u32,
    /// Statistic window of the rule; 0 means the resource's default window.
    pub stat_interval_in_ms: u32,

    pub low_mem_usage_threshold: f64,
    pub high_mem_usage_threshold: f64,
    pub mem_low_water_mark_bytes: i64,
    pub mem_high_water_mark_bytes: i64,

    pub cluster_mode: bool,
    pub cluster_config: Option<ClusterConfig>,
}

impl Rule {
    /// Compares everything that influences the controller built for a rule.
    /// Identity fields (`id`, `app`, `ruleName`) are not part of it.
    pub fn is_equals_to(&self, other: &Rule) -> bool {
        let same_local = self.resource == other.resource
            && self.relation_strategy == other.relation_strategy
            && self.ref_resource == other.ref_resource
            && self.stat_interval_in_ms == other.stat_interval_in_ms
            && self.token_calculate_strategy == other.token_calculate_strategy
            && self.control_behavior == other.control_behavior
            && (self.threshold - other.threshold).abs() < f64::EPSILON
            && self.max_queueing_time_ms == other.max_queueing_time_ms
            && self.warm_up_period_sec == other.warm_up_period_sec
            && self.warm_up_cold_factor == other.warm_up_cold_factor
            && self.low_mem_usage_threshold == other.low_mem_usage_threshold
            && self.high_mem_usage_threshold == other.high_mem_usage_threshold
            && self.mem_low_water_mark_bytes == other.mem_low_water_mark_bytes
            && self.mem_high_water_mark_bytes == other.mem_high_water_mark_bytes
            && self.limit_app == other.limit_app;
        if !same_local || self.cluster_mode != other.cluster_mode {
            return false;
        }
        !self.cluster_mode || self.cluster_config == other.cluster_config
    }

    /// Whether a controller for `other` may keep using this rule's statistic.
    pub fn is_stat_reusable(&self, other: &Rule) -> bool {
        self.resource == other.resource
            && self.relation_strategy == other.relation_strategy
            && self.ref_resource == other.ref_resource
            && self.stat_interval_in_ms == other.stat_interval_in_ms
            && self.need_statistic()
            && other.need_statistic()
    }

    pub fn need_statistic(&self) -> bool {
        self.token_calculate_strategy == TokenCalculateStrategy::WarmUp
            || self.control_behavior == ControlBehavior::Reject
    }

    /// The cluster settings, if the rule is in cluster mode and has them.
    pub fn cluster(&self) -> Option<&ClusterConfig> {
        self.cluster_config.as_ref().filter(|_| self.cluster_mode)
    }

    /// The resource whose statistics the rule is checked against.
    pub fn stat_resource(&self) -> &str {
        match self.relation_strategy {
            RelationStrategy::AssociatedResource => &self.ref_resource,
            RelationStrategy::CurrentResource => &self.resource,
        }
    }

    /// Whether the rule applies to a call coming from `from_service`.
    pub fn matches_limit_app(&self, from_service: &[String]) -> bool {
        let limit_app = self.limit_app.trim();
        if limit_app.is_empty() || limit_app.eq_ignore_ascii_case("default") {
            return true;
        }
        limit_app
            .split(',')
            .map(str::trim)
            .filter(|app| !app.is_empty())
            .any(|app| from_service.iter().any(|s| s == app))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::InvalidRule {
                rule: self.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.resource.is_empty() {
            return invalid("empty resource name");
        }
        if self.threshold < 0.0 || self.threshold.is_nan() {
            return invalid("negative threshold");
        }
        if self.relation_strategy == RelationStrategy::AssociatedResource
            && self.ref_resource.is_empty()
        {
            return invalid("refResource must be non empty when relationStrategy is AssociatedResource");
        }
        if self.token_calculate_strategy == TokenCalculateStrategy::WarmUp {
            if self.warm_up_period_sec == 0 {
                return invalid("warmUpPeriodSec must be greater than 0");
            }
            if self.warm_up_cold_factor == 1 {
                return invalid("warmUpColdFactor must be greater than 1");
            }
        }
        if self.stat_interval_in_ms > MAX_STAT_INTERVAL_MS {
            return invalid("statIntervalInMs must not exceed 10 minutes");
        }
        if self.token_calculate_strategy == TokenCalculateStrategy::MemoryAdaptive {
            if self.low_mem_usage_threshold <= 0.0 || self.high_mem_usage_threshold <= 0.0 {
                return invalid("memory usage thresholds must be positive");
            }
            if self.high_mem_usage_threshold >= self.low_mem_usage_threshold {
                return invalid("highMemUsageThreshold must be less than lowMemUsageThreshold");
            }
            if self.mem_low_water_mark_bytes <= 0 || self.mem_high_water_mark_bytes <= 0 {
                return invalid("memory water marks must be positive");
            }
            if self.mem_high_water_mark_bytes <= self.mem_low_water_mark_bytes {
                return invalid("memHighWaterMarkBytes must be greater than memLowWaterMarkBytes");
            }
        }
        Ok(())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(
                f,
                "Rule{{resource={}, tokenCalculateStrategy={}, controlBehavior={}, threshold={:.2}}}",
                self.resource, self.token_calculate_strategy, self.control_behavior, self.threshold
            ),
        }
    }
}

impl BlockRule for Rule {
    fn resource_name(&self) -> &str {
        &self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> Rule {
        Rule {
            id: "1".to_string(),
            resource: "abc".to_string(),
            threshold: 10.0,
            ..Rule::default()
        }
    }

    #[test]
    fn test_json_uses_integer_enums_and_camel_case() {
        let json = r#"{
            "id": "r1",
            "resource": "abc",
            "tokenCalculateStrategy": 2,
            "controlBehavior": 1,
            "threshold": 12.5,
            "relationStrategy": 1,
            "refResource": "def",
            "statIntervalInMs": 2000,
            "clusterMode": true,
            "clusterConfig": {"clusterStrategy": 3, "fallbackToLocalWhenFail": true, "globalThreshold": 100},
            "somethingNew": 1
        }"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.token_calculate_strategy, TokenCalculateStrategy::MemoryAdaptive);
        assert_eq!(rule.control_behavior, ControlBehavior::Throttling);
        assert_eq!(rule.relation_strategy, RelationStrategy::AssociatedResource);
        assert_eq!(rule.stat_resource(), "def");
        let cluster = rule.cluster().unwrap();
        assert_eq!(cluster.cluster_strategy, ClusterStrategy::GlobalRedis);
        assert!(cluster.fallback_to_local_when_fail);

        let back = serde_json::to_string(&rule).unwrap();
        assert!(back.contains("\"tokenCalculateStrategy\":2"));
        assert!(back.contains("\"clusterStrategy\":3"));
        assert_eq!(serde_json::from_str::<Rule>(&back).unwrap(), rule);
    }

    #[test]
    fn test_invalid_enum_value_is_rejected() {
        assert!(serde_json::from_str::<Rule>(r#"{"resource": "a", "controlBehavior": 7}"#).is_err());
    }

    #[test]
    fn test_cluster_without_config_is_local() {
        let rule = Rule {
            cluster_mode: true,
            ..rule()
        };
        assert!(rule.cluster().is_none());
    }

    #[test]
    fn test_equality_ignores_identity() {
        let a = rule();
        let b = Rule {
            id: "2".to_string(),
            rule_name: "other".to_string(),
            ..rule()
        };
        assert!(a.is_equals_to(&b));

        let c = Rule {
            threshold: 11.0,
            ..rule()
        };
        assert!(!a.is_equals_to(&c));

        let d = Rule {
            cluster_mode: true,
            cluster_config: Some(ClusterConfig::default()),
            ..rule()
        };
        assert!(!a.is_equals_to(&d));
    }

    #[test]
    fn test_stat_reuse() {
        let a = rule();
        let throttling = Rule {
            control_behavior: ControlBehavior::Throttling,
            ..rule()
        };
        let other_window = Rule {
            stat_interval_in_ms: 2000,
            ..rule()
        };
        assert!(a.is_stat_reusable(&Rule { threshold: 1.0, ..rule() }));
        assert!(!a.is_stat_reusable(&throttling));
        assert!(!a.is_stat_reusable(&other_window));
    }

    #[test]
    fn test_limit_app() {
        let from = vec!["orders".to_string()];
        assert!(rule().matches_limit_app(&from));
        let default = Rule {
            limit_app: "Default".to_string(),
            ..rule()
        };
        assert!(default.matches_limit_app(&[]));
        let limited = Rule {
            limit_app: "billing, orders".to_string(),
            ..rule()
        };
        assert!(limited.matches_limit_app(&from));
        assert!(!limited.matches_limit_app(&["users".to_string()]));
        assert!(!limited.matches_limit_app(&[]));
    }

    #[test]
    fn test_validation() {
        assert!(rule().validate().is_ok());
        let cases = [
            Rule { resource: String::new(), ..rule() },
            Rule { threshold: -1.0, ..rule() },
            Rule {
                relation_strategy: RelationStrategy::AssociatedResource,
                ..rule()
            },
            Rule {
                token_calculate_strategy: TokenCalculateStrategy::WarmUp,
                ..rule()
            },
            Rule {
                token_calculate_strategy: TokenCalculateStrategy::WarmUp,
                warm_up_period_sec: 10,
                warm_up_cold_factor: 1,
                ..rule()
            },
            Rule {
                stat_interval_in_ms: MAX_STAT_INTERVAL_MS + 1,
                ..rule()
            },
            Rule {
                token_calculate_strategy: TokenCalculateStrategy::MemoryAdaptive,
                low_mem_usage_threshold: 100.0,
                high_mem_usage_threshold: 1000.0,
                mem_low_water_mark_bytes: 1024,
                mem_high_water_mark_bytes: 2048,
                ..rule()
            },
        ];
        for case in cases {
            assert!(
                matches!(case.validate(), Err(Error::InvalidRule { .. })),
                "{case}"
            );
        }
    }
}
