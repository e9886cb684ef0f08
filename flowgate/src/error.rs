/// Errors produced while building statistics, loading rules or talking to a
/// token server.
///
/// Admission decisions are never reported through this type: a blocked call
/// surfaces as a [`BlockError`](crate::BlockError).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// `sampleCount` is zero or does not divide `intervalMs`.
    #[error("invalid sampleCount={sample_count} and intervalMs={interval_ms}")]
    IllegalStatisticParams { sample_count: u32, interval_ms: u32 },

    /// The global (parent) statistic parameters are themselves invalid.
    #[error("invalid global sampleCount={sample_count} and intervalMs={interval_ms}")]
    IllegalGlobalStatisticParams { sample_count: u32, interval_ms: u32 },

    /// A window cannot be expressed as a view over the global statistic.
    #[error("the parameters sampleCount and intervalMs mismatch for reusing between resource statistic and global statistic")]
    GlobalStatisticNonReusable,

    /// The wall clock went backwards behind the start of a live bucket.
    #[error("provided time {now_ms} is already behind bucket start {bucket_start}")]
    ClockBackward { now_ms: u64, bucket_start: u64 },

    #[error("invalid flow rule {rule}: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to decode json: {0}")]
    Json(String),

    #[error("invalid token result string {0:?}")]
    InvalidThinString(String),

    #[error("invalid metric line {0:?}")]
    InvalidMetricLine(String),

    /// Communication with a remote token server failed.
    #[error("token server transport failure: {0}")]
    Transport(String),

    #[error("redis failure: {0}")]
    Redis(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
