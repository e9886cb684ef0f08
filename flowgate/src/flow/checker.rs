use std::sync::Arc;

use crate::base::BlockType;
use crate::base::TokenResult;
use crate::flow::Pace;
use crate::flow::Pacer;
use crate::flow::Rule;
use crate::flow::StandaloneStatistic;
use crate::stat::MetricEvent;
use crate::stat::ReadStat;
use crate::stat::WriteStat;

/// Turns an allowed threshold into a verdict. `None` means pass.
#[derive(Debug)]
pub enum Checker {
    Reject(RejectChecker),
    Throttling(ThrottlingChecker),
}

impl Checker {
    pub fn do_check(
        &self,
        rule: &Arc<Rule>,
        stat: Option<&StandaloneStatistic>,
        batch_count: u32,
        threshold: f64,
        now_ns: u64,
    ) -> Option<TokenResult> {
        match self {
            Checker::Reject(c) => {
                c.do_check(rule, stat, batch_count, threshold, now_ns / 1_000_000)
            }
            Checker::Throttling(c) => c.do_check(rule, batch_count, threshold, now_ns),
        }
    }
}

/// Blocks once the window already holds `threshold` tokens.
///
/// The batch is counted optimistically and rolled back when the re-read sum
/// overshoots, so concurrent callers cannot jointly exceed the threshold.
/// Every read and write uses the same `now_ms`, so a rollback always lands in
/// the bucket that took the increment.
#[derive(Debug, Default)]
pub struct RejectChecker;

impl RejectChecker {
    pub fn new() -> Self {
        Self
    }

    fn do_check(
        &self,
        rule: &Arc<Rule>,
        stat: Option<&StandaloneStatistic>,
        batch_count: u32,
        threshold: f64,
        now_ms: u64,
    ) -> Option<TokenResult> {
        let stat = stat?;
        let cur = stat.read().get_sum_with_time(now_ms, MetricEvent::RejectPass) as f64;
        if cur > threshold {
            return Some(blocked(rule, cur));
        }
        let batch = i64::from(batch_count);
        stat.write()
            .add_count_with_time(now_ms, MetricEvent::RejectPass, batch);
        let after = stat.read().get_sum_with_time(now_ms, MetricEvent::RejectPass) as f64;
        if after > threshold {
            stat.write()
                .add_count_with_time(now_ms, MetricEvent::RejectPass, -batch);
            return Some(blocked(rule, after));
        }
        None
    }
}

fn blocked(rule: &Arc<Rule>, snapshot: f64) -> TokenResult {
    TokenResult::blocked_with_cause(
        BlockType::Flow,
        "flow reject check blocked",
        rule.clone(),
        snapshot,
    )
}

/// Paces requests through a [`Pacer`], queueing up to the rule's
/// `maxQueueingTimeMs`.
#[derive(Debug)]
pub struct ThrottlingChecker {
    pacer: Pacer,
}

impl ThrottlingChecker {
    pub fn new(max_queueing_ms: u32, stat_interval_ms: u32) -> Self {
        Self {
            pacer: Pacer::new(max_queueing_ms, stat_interval_ms),
        }
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    fn do_check(&self, rule: &Arc<Rule>, batch_count: u32, threshold: f64, now_ns: u64) -> Option<TokenResult> {
        if batch_count == 0 {
            return None;
        }
        if threshold <= 0.0 {
            return Some(TokenResult::blocked_with_cause(
                BlockType::Flow,
                "flow throttling check blocked, threshold is <= 0.0",
                rule.clone(),
                threshold,
            ));
        }
        match self.pacer.acquire(now_ns, batch_count, threshold) {
            Pace::Pass => None,
            Pace::Wait(nanos) => Some(TokenResult::should_wait(nanos)),
            Pace::QueueFull => Some(TokenResult::blocked_with_cause(
                BlockType::Flow,
                "flow throttling check blocked, estimated queueing time exceeds max queueing time",
                rule.clone(),
                threshold,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::clock::Clock;
    use crate::clock::MOCK_EPOCH_MS;
    use crate::config::StatConfig;
    use crate::flow::ControlBehavior;
    use crate::stat::StatNode;

    use super::*;

    const NS_PER_MS: u64 = 1_000_000;

    fn rule() -> Arc<Rule> {
        Arc::new(Rule {
            resource: "abc".to_string(),
            threshold: 2.0,
            ..Rule::default()
        })
    }

    fn throttling_rule() -> Arc<Rule> {
        Arc::new(Rule {
            control_behavior: ControlBehavior::Throttling,
            ..(*rule()).clone()
        })
    }

    #[test]
    fn test_reject_blocks_over_threshold() {
        let (clock, mock) = Clock::mock();
        let node = StatNode::new("abc", Default::default(), &StatConfig::default(), clock.clone()).unwrap();
        let stat = StandaloneStatistic::reusing(&node);
        let checker = Checker::Reject(RejectChecker::new());
        let rule = rule();

        assert!(checker.do_check(&rule, Some(&stat), 1, 2.0, clock.now_ns()).is_none());
        assert!(checker.do_check(&rule, Some(&stat), 1, 2.0, clock.now_ns()).is_none());
        let result = checker.do_check(&rule, Some(&stat), 1, 2.0, clock.now_ns()).unwrap();
        assert!(result.is_blocked());
        let err = result.block_error().unwrap();
        assert_eq!(err.block_type(), BlockType::Flow);
        // The count that tripped the rule, including the rejected batch.
        assert_eq!(err.snapshot_value(), Some(3.0));
        assert_eq!(err.triggered_rule().unwrap().resource_name(), "abc");
        // The rejected batch was rolled back.
        assert_eq!(stat.read().get_sum(MetricEvent::RejectPass), 2);

        mock.increment(Duration::from_millis(1000));
        assert!(checker.do_check(&rule, Some(&stat), 1, 2.0, clock.now_ns()).is_none());
    }

    #[test]
    fn test_reject_batch_larger_than_room() {
        let (clock, _mock) = Clock::mock();
        let node = StatNode::new("abc", Default::default(), &StatConfig::default(), clock.clone()).unwrap();
        let stat = StandaloneStatistic::reusing(&node);
        let checker = Checker::Reject(RejectChecker::new());
        let now = clock.now_ns();
        assert!(checker.do_check(&rule(), Some(&stat), 1, 2.0, now).is_none());
        assert!(checker.do_check(&rule(), Some(&stat), 2, 2.0, now).unwrap().is_blocked());
        assert!(checker.do_check(&rule(), Some(&stat), 1, 2.0, now).is_none());
    }

    #[test]
    fn test_reject_counts_at_the_given_time() {
        let (clock, _mock) = Clock::mock();
        let node = StatNode::new("abc", Default::default(), &StatConfig::default(), clock).unwrap();
        let stat = StandaloneStatistic::reusing(&node);
        let checker = Checker::Reject(RejectChecker::new());
        let rule = rule();
        // The last millisecond of the [500, 1000) bucket, while the clock
        // itself still reads the epoch.
        let edge_ms = MOCK_EPOCH_MS + 999;

        for _ in 0..2 {
            assert!(checker.do_check(&rule, Some(&stat), 1, 2.0, edge_ms * NS_PER_MS).is_none());
        }
        assert!(checker.do_check(&rule, Some(&stat), 1, 2.0, edge_ms * NS_PER_MS).unwrap().is_blocked());
        assert_eq!(stat.read().get_sum_with_time(edge_ms, MetricEvent::RejectPass), 2);

        // The rollback landed in the same bucket as the increment: the next
        // bucket starts empty and the window holds exactly the admitted two.
        let next_ms = edge_ms + 1;
        let next = stat.write().current_bucket_of_time(next_ms).unwrap();
        assert_eq!(next.value().get(MetricEvent::RejectPass), 0);
        assert_eq!(stat.read().get_sum_with_time(next_ms, MetricEvent::RejectPass), 2);
        assert!(checker.do_check(&rule, Some(&stat), 1, 2.0, next_ms * NS_PER_MS).unwrap().is_blocked());

        // Once the edge bucket leaves the window, exactly two more pass.
        let later_ms = edge_ms + 501;
        assert_eq!(stat.read().get_sum_with_time(later_ms, MetricEvent::RejectPass), 0);
        for _ in 0..2 {
            assert!(checker.do_check(&rule, Some(&stat), 1, 2.0, later_ms * NS_PER_MS).is_none());
        }
        assert!(checker.do_check(&rule, Some(&stat), 1, 2.0, later_ms * NS_PER_MS).unwrap().is_blocked());
    }

    #[test]
    fn test_reject_without_statistic_passes() {
        let checker = Checker::Reject(RejectChecker::new());
        assert!(checker.do_check(&rule(), None, 100, 2.0, 0).is_none());
    }

    #[test]
    fn test_throttling() {
        let rule = throttling_rule();
        let checker = Checker::Throttling(ThrottlingChecker::new(500, 1000));
        let now = 1_000_000_000_000;
        assert!(checker.do_check(&rule, None, 0, 2.0, now).is_none());
        assert!(checker.do_check(&rule, None, 1, 0.0, now).unwrap().is_blocked());

        assert!(checker.do_check(&rule, None, 1, 2.0, now).is_none());
        let wait = checker.do_check(&rule, None, 1, 2.0, now).unwrap();
        assert!(wait.is_wait());
        assert_eq!(wait.nanos_to_wait(), 500_000_000);
        assert!(checker.do_check(&rule, None, 1, 2.0, now).unwrap().is_blocked());
    }

    #[test]
    fn test_throttling_batch_above_threshold_is_queued() {
        let rule = throttling_rule();
        let checker = Checker::Throttling(ThrottlingChecker::new(5000, 1000));
        let now = 1_000_000_000_000;
        assert!(checker.do_check(&rule, None, 1, 2.0, now).is_none());
        let wait = checker.do_check(&rule, None, 3, 2.0, now).unwrap();
        assert!(wait.is_wait());
        assert_eq!(wait.nanos_to_wait(), 1_500_000_000);
    }

    #[test]
    fn test_throttling_threshold_below_one() {
        let rule = throttling_rule();
        let checker = Checker::Throttling(ThrottlingChecker::new(0, 1000));
        let now = 1_000_000_000_000;
        // One request every two seconds.
        assert!(checker.do_check(&rule, None, 1, 0.5, now).is_none());
        assert!(checker.do_check(&rule, None, 1, 0.5, now).unwrap().is_blocked());
        assert!(checker.do_check(&rule, None, 1, 0.5, now + 2_000_000_000).is_none());
    }

    #[test]
    fn test_throttling_tiny_threshold_does_not_overflow() {
        let rule = throttling_rule();
        let checker = Checker::Throttling(ThrottlingChecker::new(1000, 1000));
        let now = 1_000_000_000_000;
        assert!(checker.do_check(&rule, None, 1, 2.0, now).is_none());
        assert!(checker.do_check(&rule, None, 1, 1e-30, now).unwrap().is_blocked());
    }
}
