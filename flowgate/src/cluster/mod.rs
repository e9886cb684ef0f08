//! Cluster flow control.
//!
//! A rule in cluster mode asks a token source for permission instead of
//! counting locally: either a token server reached with [`HttpTokenClient`],
//! or a shared Redis counter (`redis` feature). A token server runs a
//! [`TokenService`], usually [`DefaultTokenService`], behind
//! [`handle_acquire_token`].

mod check;
mod client;
mod metric;
#[cfg(feature = "redis")]
mod redis_service;
mod request_limiter;
mod token_service;
mod transport;

pub use check::ClusterChecker;
pub use client::ACQUIRE_CLUSTER_TOKEN_PATH;
pub use client::HttpTokenClient;
pub use client::TokenClient;
pub use metric::ClusterMetric;
#[cfg(feature = "redis")]
pub use redis_service::RedisTokenService;
pub use request_limiter::RequestLimiter;
pub use request_limiter::RequestLimiterRegistry;
pub use token_service::DefaultTokenService;
pub use token_service::TokenService;
pub use token_service::global_threshold;
pub use transport::handle_acquire_token;
