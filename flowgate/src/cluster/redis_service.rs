use redis::Client;
use redis::Script;
use tracing::debug;
use tracing::warn;

use crate::base::TokResult;
use crate::cluster::TokenClient;
use crate::cluster::client::run_blocking;
use crate::config::RedisSettings;
use crate::error::Result;
use crate::flow::Rule;

/// Adds `ARGV[2]` to the counter in `KEYS[1]` unless that would exceed
/// `ARGV[1]`. The counter lives for one second from its first increment.
const ACQUIRE_SCRIPT: &str = r#"
local resourceName = KEYS[1]
local globalThreshold = tonumber(ARGV[1])
local acquireCount = tonumber(ARGV[2])
local current = tonumber(redis.call('get', resourceName) or "0")
local ttl = tonumber(redis.call('pttl', resourceName) or "-1")
if ttl > 1000 then
    redis.call('pexpire', resourceName, 1000)
end
if current + acquireCount > globalThreshold then
    return 0
else
    redis.call('incrby', resourceName, acquireCount)
    if ttl < 0 then
        redis.call('pexpire', resourceName, 1000)
    end
    return 1
end
"#;

/// Grants tokens from a per second counter shared through Redis.
#[derive(Debug)]
pub struct RedisTokenService {
    client: Client,
    script: Script,
    key_prefix: String,
    app_name: String,
}

impl RedisTokenService {
    /// Connections are opened per request, so this does not touch the network.
    pub fn new(settings: &RedisSettings, app_name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Client::open(settings.url.as_str())?,
            script: Script::new(ACQUIRE_SCRIPT),
            key_prefix: settings.key_prefix.clone(),
            app_name: app_name.into(),
        })
    }

    pub fn counter_key(&self, rule: &Rule) -> String {
        format!(
            "{}_{}_{}_{}",
            self.key_prefix, self.app_name, rule.id, rule.resource
        )
    }

    fn acquire(&self, key: &str, global_threshold: f64, acquire_count: u32) -> Result<i64> {
        let mut con = self.client.get_connection()?;
        Ok(self
            .script
            .key(key)
            .arg(global_threshold)
            .arg(acquire_count)
            .invoke::<i64>(&mut con)?)
    }
}

impl TokenClient for RedisTokenService {
    fn acquire_cluster_token(&self, rule: &Rule, acquire_count: u32, _prioritized: i32) -> TokResult {
        if rule.id.is_empty() || acquire_count == 0 {
            return TokResult::BAD_REQUEST;
        }
        let Some(config) = rule.cluster_config.as_ref() else {
            return TokResult::BAD_REQUEST;
        };
        let key = self.counter_key(rule);
        let Some(acquired) = run_blocking(|| self.acquire(&key, config.global_threshold, acquire_count))
        else {
            warn!(key, "cannot block on a current thread runtime, skipping redis");
            return TokResult::FAIL;
        };
        match acquired {
            Ok(1) => TokResult::OK,
            Ok(granted) => {
                debug!(key, granted, "redis counter is full");
                TokResult::BLOCKED
            }
            Err(err) => {
                warn!(%err, key, "redis token request failed");
                TokResult::FAIL
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::flow::ClusterConfig;
    use crate::flow::ClusterStrategy;

    use super::*;

    fn rule() -> Rule {
        Rule {
            id: "7".to_string(),
            resource: "abc".to_string(),
            cluster_mode: true,
            cluster_config: Some(ClusterConfig {
                cluster_strategy: ClusterStrategy::GlobalRedis,
                global_threshold: 2.0,
                ..ClusterConfig::default()
            }),
            ..Rule::default()
        }
    }

    #[test]
    fn test_counter_key() {
        let service = RedisTokenService::new(&RedisSettings::default(), "orders").unwrap();
        assert_eq!(service.counter_key(&rule()), "{Sea}_orders_7_abc");
    }

    #[test]
    fn test_invalid_requests_do_not_reach_redis() {
        let service = RedisTokenService::new(&RedisSettings::default(), "orders").unwrap();
        let no_id = Rule {
            id: String::new(),
            ..rule()
        };
        assert_eq!(service.acquire_cluster_token(&no_id, 1, 0), TokResult::BAD_REQUEST);
        assert_eq!(service.acquire_cluster_token(&rule(), 0, 0), TokResult::BAD_REQUEST);
    }

    #[test]
    fn test_unreachable_redis_is_a_failure() {
        let settings = RedisSettings {
            url: "redis://127.0.0.1:1".to_string(),
            ..RedisSettings::default()
        };
        let service = RedisTokenService::new(&settings, "orders").unwrap();
        assert_eq!(service.acquire_cluster_token(&rule(), 1, 0), TokResult::FAIL);
    }
}
