use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use reqwest::blocking::Client;
use tokio::runtime::Handle;
use tokio::runtime::RuntimeFlavor;
use tracing::debug;
use tracing::warn;

use crate::base::TokResult;
use crate::cluster::TokenService;
use crate::config::ClusterSettings;
use crate::error::Error;
use crate::error::Result;
use crate::flow::Rule;

/// Path of the acquire-token endpoint on a token server.
pub const ACQUIRE_CLUSTER_TOKEN_PATH: &str = "/acquireClusterToken";

/// Asks a remote authority for cluster tokens on behalf of a rule.
pub trait TokenClient: Send + Sync + std::fmt::Debug {
    fn acquire_cluster_token(&self, rule: &Rule, acquire_count: u32, prioritized: i32) -> TokResult;
}

/// Requests tokens from the master token server of a rule over HTTP.
///
/// The request is a `GET` carrying the rule JSON, the acquire count and the
/// prioritized flag as query parameters; the reply body is a thin string.
/// When the master is this very process, the local [`TokenService`] is
/// called instead.
#[derive(Debug)]
pub struct HttpTokenClient {
    settings: ClusterSettings,
    local: Option<Arc<dyn TokenService>>,
    client: OnceLock<Client>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenQuery<'a> {
    rule: &'a str,
    acquire_count: u32,
    prioritized: i32,
}

impl HttpTokenClient {
    pub fn new(settings: ClusterSettings) -> Self {
        Self {
            settings,
            local: None,
            client: OnceLock::new(),
        }
    }

    /// The service answering requests addressed to this process.
    pub fn with_local_service(mut self, service: Arc<dyn TokenService>) -> Self {
        self.local = Some(service);
        self
    }

    fn is_local(&self, host: &str, port: i32) -> bool {
        match (&self.settings.local_host, self.settings.local_port) {
            (Some(local_host), Some(local_port)) => local_host == host && i32::from(local_port) == port,
            _ => false,
        }
    }

    fn client(&self) -> Result<&Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(self.settings.request_timeout_ms))
            .pool_max_idle_per_host(self.settings.max_idle_per_host)
            .build()?;
        Ok(self.client.get_or_init(|| client))
    }

    fn send(&self, host: &str, port: i32, query: &TokenQuery<'_>) -> Result<TokResult> {
        let query = serde_urlencoded::to_string(query).map_err(|err| Error::Transport(err.to_string()))?;
        let url = format!("http://{host}:{port}{ACQUIRE_CLUSTER_TOKEN_PATH}?{query}");
        let body = self
            .client()?
            .get(url)
            .header("Connection", "keep-alive")
            .send()?
            .error_for_status()?
            .text()?;
        TokResult::from_thin_string(&body)
    }
}

impl TokenClient for HttpTokenClient {
    fn acquire_cluster_token(&self, rule: &Rule, acquire_count: u32, prioritized: i32) -> TokResult {
        if rule.id.is_empty() || acquire_count == 0 {
            return TokResult::BAD_REQUEST;
        }
        let Some(config) = rule.cluster_config.as_ref() else {
            return TokResult::BAD_REQUEST;
        };
        let host = config.token_server_master_host.as_str();
        let port = config.token_server_master_port;
        if host.is_empty() || port <= 0 {
            return TokResult::BAD_REQUEST;
        }
        let rule_json = match serde_json::to_string(rule) {
            Ok(json) => json,
            Err(err) => {
                warn!(%err, rule_id = %rule.id, "failed to encode cluster rule");
                return TokResult::BAD_REQUEST;
            }
        };

        if let Some(local) = &self.local
            && self.is_local(host, port)
        {
            return local.request_token(&rule_json, acquire_count, prioritized);
        }

        let query = TokenQuery {
            rule: &rule_json,
            acquire_count,
            prioritized,
        };
        let Some(sent) = run_blocking(|| self.send(host, port, &query)) else {
            warn!(
                rule_id = %rule.id,
                "cannot block on a current thread runtime, skipping the token server"
            );
            return TokResult::FAIL;
        };
        match sent {
            Ok(result) => {
                debug!(rule_id = %rule.id, %result, "cluster token result");
                result
            }
            Err(err) => {
                warn!(%err, host, port, rule_id = %rule.id, acquire_count, "token request failed");
                TokResult::FAIL
            }
        }
    }
}

/// Runs blocking I/O from any context: directly outside a runtime, through
/// `block_in_place` on a multi thread runtime, and not at all on a current
/// thread runtime.
pub(crate) fn run_blocking<T>(f: impl FnOnce() -> T) -> Option<T> {
    match Handle::try_current() {
        Err(_) => Some(f()),
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Some(tokio::task::block_in_place(f))
        }
        Ok(_) => None,
    }
}
