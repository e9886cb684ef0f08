use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::stat;

pub const DEFAULT_APP_NAME: &str = "unknown_service";
pub const DEFAULT_WARM_UP_COLD_FACTOR: u32 = 3;
pub const DEFAULT_MEMORY_STAT_COLLECT_INTERVAL_MS: u64 = 150;
pub const DEFAULT_MAX_RESOURCE_AMOUNT: usize = 10_000;
pub const DEFAULT_CONTEXT_POOL_SIZE: usize = 1024;

/// Engine configuration.
///
/// Every field has a default, so partial documents deserialize cleanly:
///
/// ```rust
/// let config: flowgate::Config =
///     serde_json::from_str(r#"{"appName": "orders", "cluster": {"clientMaxAllowQps": 500}}"#).unwrap();
/// assert_eq!(config.app_name, "orders");
/// assert_eq!(config.cluster.client_max_allow_qps, 500.0);
/// assert_eq!(config.stat.metric_sample_count, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub app_name: String,
    pub stat: StatConfig,
    /// Upper bound on the number of distinct resources that get a statistic node.
    pub max_resource_amount: usize,
    /// Cold factor used by warm-up rules that leave it unset.
    pub warm_up_cold_factor: u32,
    /// How long a sampled process memory value stays fresh.
    pub memory_stat_collect_interval_ms: u64,
    /// Number of idle entry contexts kept for reuse.
    pub context_pool_size: usize,
    pub cluster: ClusterSettings,
    pub redis: Option<RedisSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            stat: StatConfig::default(),
            max_resource_amount: DEFAULT_MAX_RESOURCE_AMOUNT,
            warm_up_cold_factor: DEFAULT_WARM_UP_COLD_FACTOR,
            memory_stat_collect_interval_ms: DEFAULT_MEMORY_STAT_COLLECT_INTERVAL_MS,
            context_pool_size: DEFAULT_CONTEXT_POOL_SIZE,
            cluster: ClusterSettings::default(),
            redis: None,
        }
    }
}

impl Config {
    /// Checks that the statistic windows are consistent with each other.
    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            return Err(Error::InvalidConfig("empty app name".to_string()));
        }
        stat::check_validity_for_reuse_statistic(
            self.stat.metric_sample_count,
            self.stat.metric_interval_ms,
            self.stat.global_sample_count_total,
            self.stat.global_interval_ms_total,
        )?;
        if self.cluster.max_allow_qps <= 0.0 || self.cluster.client_max_allow_qps <= 0.0 {
            return Err(Error::InvalidConfig(
                "cluster qps limits must be positive".to_string(),
            ));
        }
        if self.warm_up_cold_factor <= 1 {
            return Err(Error::InvalidConfig(format!(
                "warm up cold factor must be greater than 1, got {}",
                self.warm_up_cold_factor
            )));
        }
        Ok(())
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn with_stat(mut self, stat: StatConfig) -> Self {
        self.stat = stat;
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterSettings) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_redis(mut self, redis: RedisSettings) -> Self {
        self.redis = Some(redis);
        self
    }
}

/// Windows of the per-resource statistics.
///
/// The global window is what every resource node records into; the metric
/// window is the default read view over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatConfig {
    pub global_sample_count_total: u32,
    pub global_interval_ms_total: u32,
    pub metric_sample_count: u32,
    pub metric_interval_ms: u32,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            global_sample_count_total: 20,
            global_interval_ms_total: 10_000,
            metric_sample_count: 2,
            metric_interval_ms: 1000,
        }
    }
}

impl StatConfig {
    pub fn global_bucket_length_ms(&self) -> u32 {
        self.global_interval_ms_total / self.global_sample_count_total.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterSettings {
    /// Namespace of the token server side request limiter.
    pub namespace: String,
    /// Namespace of the client side request limiter.
    pub client_namespace: String,
    /// Requests per second a token server accepts before answering `TooManyRequest`.
    pub max_allow_qps: f64,
    /// Requests per second a client sends to a token server before checking locally.
    pub client_max_allow_qps: f64,
    /// Cool-down after a remote failure during which the remote path is skipped.
    pub downgrade_interval_ms: u64,
    /// Address of this process; a master address equal to it is served in-process.
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub request_timeout_ms: u64,
    pub max_idle_per_host: usize,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            namespace: "seaNameSpace".to_string(),
            client_namespace: "seaClientNameSpace".to_string(),
            max_allow_qps: 100_000.0,
            client_max_allow_qps: 10_000.0,
            downgrade_interval_ms: 2000,
            local_host: None,
            local_port: None,
            request_timeout_ms: 3000,
            max_idle_per_host: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedisSettings {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "{Sea}".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
        assert_eq!(Config::default().stat.global_bucket_length_ms(), 500);
    }

    #[test]
    fn test_invalid_metric_window_is_rejected() {
        let config = Config::default().with_stat(StatConfig {
            metric_sample_count: 3,
            ..StatConfig::default()
        });
        assert!(matches!(
            config.validate(),
            Err(Error::IllegalStatisticParams { .. })
        ));
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = Config::default()
            .with_app_name("orders")
            .with_redis(RedisSettings::default());
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"appName\":\"orders\""));
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
