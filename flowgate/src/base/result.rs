use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::stat::MetricEvent;

/// The subsystem that blocked a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Unknown,
    Flow,
    Isolation,
    CircuitBreaking,
    System,
    HotSpotParamFlow,
    Mock,
}

impl BlockType {
    /// The per-cause counter recorded next to `Block`.
    pub fn metric_event(self) -> Option<MetricEvent> {
        match self {
            BlockType::Unknown => None,
            BlockType::Flow => Some(MetricEvent::BlockFlow),
            BlockType::Isolation => Some(MetricEvent::BlockIsolation),
            BlockType::CircuitBreaking => Some(MetricEvent::BlockCircuitBreaking),
            BlockType::System => Some(MetricEvent::BlockSystem),
            BlockType::HotSpotParamFlow => Some(MetricEvent::BlockHotSpotParamFlow),
            BlockType::Mock => Some(MetricEvent::BlockMock),
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockType::Unknown => "Unknown",
            BlockType::Flow => "FlowControl",
            BlockType::Isolation => "Isolation",
            BlockType::CircuitBreaking => "CircuitBreaking",
            BlockType::System => "System",
            BlockType::HotSpotParamFlow => "HotSpotParamFlow",
            BlockType::Mock => "Mock",
        };
        f.write_str(name)
    }
}

/// A rule that can be reported as the cause of a block.
pub trait BlockRule: fmt::Debug + fmt::Display + Send + Sync {
    fn resource_name(&self) -> &str;
}

/// Returned to the caller of a blocked entry.
///
/// Being blocked is an admission decision, not a failure: the error carries
/// enough context (resource, rule, cause) for the caller to pick a fallback.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{block_type} blocked on resource {resource:?}: {message}")]
pub struct BlockError {
    block_type: BlockType,
    message: String,
    resource: String,
    rule: Option<Arc<dyn BlockRule>>,
    snapshot_value: Option<f64>,
}

impl BlockError {
    pub fn new(block_type: BlockType, message: impl Into<String>) -> Self {
        Self {
            block_type,
            message: message.into(),
            resource: String::new(),
            rule: None,
            snapshot_value: None,
        }
    }

    pub fn with_rule(mut self, rule: Arc<dyn BlockRule>) -> Self {
        if self.resource.is_empty() {
            self.resource = rule.resource_name().to_string();
        }
        self.rule = Some(rule);
        self
    }

    pub fn with_snapshot_value(mut self, value: f64) -> Self {
        self.snapshot_value = Some(value);
        self
    }

    pub(crate) fn set_resource(&mut self, resource: &str) {
        if self.resource.is_empty() {
            self.resource = resource.to_string();
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn triggered_rule(&self) -> Option<&Arc<dyn BlockRule>> {
        self.rule.as_ref()
    }

    /// The statistic value that tripped the rule, if the checker reported one.
    pub fn snapshot_value(&self) -> Option<f64> {
        self.snapshot_value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Pass,
    Blocked,
    ShouldWait,
    /// The chain failed internally; the call is let through.
    Fail,
}

/// Verdict of a rule check, and of the whole chain.
#[derive(Debug, Clone)]
pub struct TokenResult {
    status: ResultStatus,
    block_err: Option<BlockError>,
    nanos_to_wait: u64,
}

impl Default for TokenResult {
    fn default() -> Self {
        Self::pass()
    }
}

impl TokenResult {
    pub const fn pass() -> Self {
        Self {
            status: ResultStatus::Pass,
            block_err: None,
            nanos_to_wait: 0,
        }
    }

    pub fn blocked(err: BlockError) -> Self {
        Self {
            status: ResultStatus::Blocked,
            block_err: Some(err),
            nanos_to_wait: 0,
        }
    }

    pub fn blocked_with_cause(
        block_type: BlockType,
        message: impl Into<String>,
        rule: Arc<dyn BlockRule>,
        snapshot_value: f64,
    ) -> Self {
        Self::blocked(
            BlockError::new(block_type, message)
                .with_rule(rule)
                .with_snapshot_value(snapshot_value),
        )
    }

    pub const fn should_wait(nanos_to_wait: u64) -> Self {
        Self {
            status: ResultStatus::ShouldWait,
            block_err: None,
            nanos_to_wait,
        }
    }

    pub const fn fail() -> Self {
        Self {
            status: ResultStatus::Fail,
            block_err: None,
            nanos_to_wait: 0,
        }
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn is_pass(&self) -> bool {
        self.status == ResultStatus::Pass
    }

    pub fn is_blocked(&self) -> bool {
        self.status == ResultStatus::Blocked
    }

    pub fn is_wait(&self) -> bool {
        self.status == ResultStatus::ShouldWait
    }

    pub fn block_error(&self) -> Option<&BlockError> {
        self.block_err.as_ref()
    }

    pub(crate) fn block_error_mut(&mut self) -> Option<&mut BlockError> {
        self.block_err.as_mut()
    }

    pub fn nanos_to_wait(&self) -> u64 {
        self.nanos_to_wait
    }

    pub fn wait(&self) -> Duration {
        Duration::from_nanos(self.nanos_to_wait)
    }

    pub fn reset_to_pass(&mut self) {
        self.status = ResultStatus::Pass;
        self.block_err = None;
        self.nanos_to_wait = 0;
    }

    pub fn reset_to_blocked(&mut self, err: BlockError) {
        self.status = ResultStatus::Blocked;
        self.block_err = Some(err);
        self.nanos_to_wait = 0;
    }
}

impl fmt::Display for TokenResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.block_err {
            Some(err) => write!(f, "TokenResult{{status={:?}, blockErr={}}}", self.status, err),
            None => write!(
                f,
                "TokenResult{{status={:?}, nanosToWait={}}}",
                self.status, self.nanos_to_wait
            ),
        }
    }
}
