use serde::Deserialize;
use tracing::debug;

use crate::base::TokResult;
use crate::cluster::TokenService;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcquireTokenQuery {
    rule: String,
    acquire_count: u32,
    #[serde(default)]
    prioritized: i32,
}

/// Answers one acquire-token request given its raw query string.
///
/// The reply is the thin string form of the result, ready to be used as a
/// response body by whatever HTTP server fronts the token service.
pub fn handle_acquire_token(service: &dyn TokenService, query: &str) -> String {
    match serde_urlencoded::from_str::<AcquireTokenQuery>(query) {
        Ok(q) => service
            .request_token(&q.rule, q.acquire_count, q.prioritized)
            .to_thin_string(),
        Err(err) => {
            debug!(%err, query, "malformed acquire token query");
            TokResult::BAD_REQUEST.to_thin_string()
        }
    }
}
