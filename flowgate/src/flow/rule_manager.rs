use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Gauge;
use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::flow::Calculator;
use crate::flow::Checker;
use crate::flow::ControlBehavior;
use crate::flow::DirectCalculator;
use crate::flow::MemoryAdaptiveCalculator;
use crate::flow::RejectChecker;
use crate::flow::Rule;
use crate::flow::StandaloneStatistic;
use crate::flow::ThrottlingChecker;
use crate::flow::TokenCalculateStrategy;
use crate::flow::TrafficShapingController;
use crate::flow::WarmUpCalculator;
use crate::flow::generate_stat_for;
use crate::stat::NodeRegistry;
use crate::system_metric::MemoryProbe;

type Controllers = Arc<[Arc<TrafficShapingController>]>;

/// An immutable view of the active rules.
#[derive(Debug, Default)]
struct RuleSnapshot {
    rules: Vec<Arc<Rule>>,
    by_resource: HashMap<String, Controllers>,
    by_id: HashMap<String, Arc<TrafficShapingController>>,
}

/// Owns the active flow rules and the controllers enforcing them.
///
/// Readers load the current snapshot without locking. Updates build a
/// complete new snapshot under `update_lock` and swap it in, so a reader
/// sees either the old rule set or the new one.
#[derive(Debug)]
pub struct RuleRegistry {
    snapshot: ArcSwap<RuleSnapshot>,
    update_lock: Mutex<()>,
    nodes: Arc<NodeRegistry>,
    memory_probe: Arc<dyn MemoryProbe>,
    default_cold_factor: u32,
    threshold_gauge: Gauge<f64>,
}

impl RuleRegistry {
    pub fn new(nodes: Arc<NodeRegistry>, memory_probe: Arc<dyn MemoryProbe>, default_cold_factor: u32) -> Self {
        let meter = global::meter("flowgate");
        Self {
            snapshot: ArcSwap::from_pointee(RuleSnapshot::default()),
            update_lock: Mutex::new(()),
            nodes,
            memory_probe,
            default_cold_factor,
            threshold_gauge: meter
                .f64_gauge("flowgate_resource_flow_threshold")
                .with_description("Threshold of the flow rules loaded for a resource")
                .build(),
        }
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    /// Replaces the active rules. Invalid rules are skipped. Returns false
    /// when `rules` equals the active set and nothing was changed.
    pub fn load_rules(&self, rules: Vec<Rule>) -> bool {
        let _guard = self.update_lock.lock();
        let current = self.snapshot.load_full();
        if current.rules.len() == rules.len()
            && current.rules.iter().zip(&rules).all(|(a, b)| **a == *b)
        {
            debug!(count = rules.len(), "flow rules are unchanged, skipping load");
            return false;
        }

        let mut grouped: HashMap<String, Vec<Arc<Rule>>> = HashMap::new();
        let mut valid = Vec::with_capacity(rules.len());
        for rule in rules {
            if let Err(err) = rule.validate() {
                warn!(%err, "ignoring invalid flow rule");
                continue;
            }
            let rule = Arc::new(rule);
            grouped
                .entry(rule.resource.clone())
                .or_default()
                .push(rule.clone());
            valid.push(rule);
        }

        let mut next = RuleSnapshot {
            rules: valid,
            ..RuleSnapshot::default()
        };
        for (resource, rules) in grouped {
            let old = current
                .by_resource
                .get(&resource)
                .map(|tcs| tcs.to_vec())
                .unwrap_or_default();
            let built = self.build_resource_controllers(&resource, rules, old);
            for (rule, tc) in &built {
                if !rule.id.is_empty() {
                    next.by_id.insert(rule.id.clone(), tc.clone());
                }
                self.threshold_gauge.record(
                    rule.threshold,
                    &[KeyValue::new("resource", resource.clone())],
                );
            }
            if !built.is_empty() {
                let controllers: Controllers = built.into_iter().map(|(_, tc)| tc).collect();
                next.by_resource.insert(resource, controllers);
            }
        }
        info!(
            rules = next.rules.len(),
            resources = next.by_resource.len(),
            "flow rules loaded"
        );
        self.snapshot.store(Arc::new(next));
        true
    }

    /// Parses a JSON array of rules and loads it.
    pub fn load_rules_json(&self, json: &str) -> Result<bool> {
        let rules: Vec<Rule> = serde_json::from_str(json)?;
        Ok(self.load_rules(rules))
    }

    pub fn clear_rules(&self) {
        self.load_rules(Vec::new());
    }

    /// All active (valid) rules.
    pub fn get_rules(&self) -> Vec<Rule> {
        self.snapshot.load().rules.iter().map(|r| (**r).clone()).collect()
    }

    pub fn get_rules_of_resource(&self, resource: &str) -> Vec<Rule> {
        self.controllers_of(resource)
            .map(|tcs| tcs.iter().map(|tc| (**tc.rule()).clone()).collect())
            .unwrap_or_default()
    }

    /// The controllers guarding `resource`, in rule order.
    pub fn controllers_of(&self, resource: &str) -> Option<Controllers> {
        self.snapshot.load().by_resource.get(resource).cloned()
    }

    pub fn controller_by_id(&self, id: &str) -> Option<Arc<TrafficShapingController>> {
        self.snapshot.load().by_id.get(id).cloned()
    }

    fn build_resource_controllers(
        &self,
        resource: &str,
        rules: Vec<Arc<Rule>>,
        mut old: Vec<Arc<TrafficShapingController>>,
    ) -> Vec<(Arc<Rule>, Arc<TrafficShapingController>)> {
        let mut controllers = Vec::with_capacity(rules.len());
        for rule in rules {
            let mut equal = None;
            let mut reusable = None;
            for (idx, tc) in old.iter().enumerate() {
                if tc.rule().is_equals_to(&rule) {
                    equal = Some(idx);
                    break;
                }
                if reusable.is_none() && tc.rule().is_stat_reusable(&rule) {
                    reusable = Some(idx);
                }
            }

            if let Some(idx) = equal {
                debug!(resource, rule = %rule, "reusing unchanged flow controller");
                controllers.push((rule, old.remove(idx)));
                continue;
            }

            let reused_stat = reusable.and_then(|idx| old.remove(idx).stat().cloned());
            match self.build_controller(rule.clone(), reused_stat) {
                Ok(tc) => controllers.push((rule, Arc::new(tc))),
                Err(err) => error!(resource, rule = %rule, %err, "failed to build flow controller"),
            }
        }
        controllers
    }

    fn build_controller(
        &self,
        rule: Arc<Rule>,
        reused_stat: Option<StandaloneStatistic>,
    ) -> Result<TrafficShapingController> {
        let calculator = match rule.token_calculate_strategy {
            TokenCalculateStrategy::Direct => Calculator::Direct(DirectCalculator::new(rule.threshold)),
            TokenCalculateStrategy::WarmUp => {
                Calculator::WarmUp(WarmUpCalculator::new(&rule, self.default_cold_factor))
            }
            TokenCalculateStrategy::MemoryAdaptive => Calculator::MemoryAdaptive(
                MemoryAdaptiveCalculator::new(&rule, self.memory_probe.clone()),
            ),
        };
        let checker = match rule.control_behavior {
            ControlBehavior::Reject => Checker::Reject(RejectChecker::new()),
            ControlBehavior::Throttling => Checker::Throttling(ThrottlingChecker::new(
                rule.max_queueing_time_ms,
                rule.stat_interval_in_ms,
            )),
        };
        let stat = match reused_stat {
            Some(stat) => Some(stat),
            None => generate_stat_for(&rule, &self.nodes)?,
        };
        Ok(TrafficShapingController::new(rule, calculator, checker, stat))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::clock::Clock;
    use crate::config::StatConfig;
    use crate::system_metric::FixedMemoryProbe;

    use super::*;

    fn registry() -> RuleRegistry {
        let (clock, _mock) = Clock::mock();
        let nodes = Arc::new(NodeRegistry::new(StatConfig::default(), 100, clock).unwrap());
        RuleRegistry::new(nodes, Arc::new(FixedMemoryProbe::new(None)), 3)
    }

    fn rule(id: &str, resource: &str, threshold: f64) -> Rule {
        Rule {
            id: id.to_string(),
            resource: resource.to_string(),
            threshold,
            ..Rule::default()
        }
    }

    #[test]
    fn test_load_and_query() {
        let registry = registry();
        assert!(registry.load_rules(vec![
            rule("1", "abc", 10.0),
            rule("2", "abc", 20.0),
            rule("3", "def", 5.0),
        ]));
        assert_eq!(registry.get_rules().len(), 3);
        assert_eq!(registry.get_rules_of_resource("abc").len(), 2);
        assert_eq!(registry.controllers_of("def").unwrap().len(), 1);
        assert!(registry.controllers_of("xyz").is_none());
        assert_eq!(registry.controller_by_id("2").unwrap().rule().threshold, 20.0);
    }

    #[test]
    fn test_invalid_rules_are_skipped() {
        let registry = registry();
        assert!(registry.load_rules(vec![rule("1", "", 10.0), rule("2", "abc", -1.0), rule("3", "abc", 1.0)]));
        assert_eq!(registry.get_rules(), vec![rule("3", "abc", 1.0)]);
    }

    #[test]
    fn test_unchanged_rules_are_not_reloaded() {
        let registry = registry();
        assert!(registry.load_rules(vec![rule("1", "abc", 10.0)]));
        assert!(!registry.load_rules(vec![rule("1", "abc", 10.0)]));
    }

    #[test]
    fn test_equal_rule_keeps_controller() {
        let registry = registry();
        registry.load_rules(vec![rule("1", "abc", 10.0)]);
        let before = registry.controller_by_id("1").unwrap();
        // Only the identity changed.
        registry.load_rules(vec![Rule {
            rule_name: "renamed".to_string(),
            ..rule("1", "abc", 10.0)
        }]);
        let after = registry.controller_by_id("1").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_changed_rule_reuses_statistic() {
        let registry = registry();
        let windowed = |threshold| Rule {
            stat_interval_in_ms: 3000,
            ..rule("1", "abc", threshold)
        };
        registry.load_rules(vec![windowed(10.0)]);
        let before = registry.controller_by_id("1").unwrap();
        assert!(!before.stat().unwrap().reuse_resource_stat());

        registry.load_rules(vec![windowed(20.0)]);
        let after = registry.controller_by_id("1").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.rule().threshold, 20.0);
        assert!(Arc::ptr_eq(
            before.stat().unwrap().write(),
            after.stat().unwrap().write()
        ));
    }

    #[test]
    fn test_builds_the_right_controller() {
        let registry = registry();
        registry.load_rules(vec![
            Rule {
                control_behavior: ControlBehavior::Throttling,
                max_queueing_time_ms: 500,
                ..rule("1", "abc", 10.0)
            },
            Rule {
                token_calculate_strategy: TokenCalculateStrategy::WarmUp,
                warm_up_period_sec: 10,
                ..rule("2", "abc", 10.0)
            },
        ]);
        let throttling = registry.controller_by_id("1").unwrap();
        assert!(matches!(throttling.checker(), Checker::Throttling(_)));
        assert!(throttling.stat().is_none());
        let warm_up = registry.controller_by_id("2").unwrap();
        assert!(matches!(warm_up.calculator(), Calculator::WarmUp(_)));
        assert!(warm_up.stat().unwrap().reuse_resource_stat());
    }

    #[test]
    fn test_load_json_and_clear() {
        let registry = registry();
        assert!(
            registry
                .load_rules_json(r#"[{"id": "a", "resource": "abc", "threshold": 1}]"#)
                .unwrap()
        );
        assert_eq!(registry.get_rules_of_resource("abc")[0].id, "a");
        assert!(registry.load_rules_json("[{").is_err());
        assert_eq!(registry.get_rules().len(), 1);

        registry.clear_rules();
        assert!(registry.get_rules().is_empty());
        assert!(registry.controller_by_id("a").is_none());
    }

    #[test]
    fn test_readers_see_whole_rule_sets() {
        let registry = Arc::new(registry());
        let set = |threshold| vec![rule("1", "abc", threshold), rule("2", "abc", threshold)];
        registry.load_rules(set(1.0));

        let reader = {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    let tcs = registry.controllers_of("abc").unwrap();
                    assert_eq!(tcs.len(), 2);
                    assert_eq!(tcs[0].rule().threshold, tcs[1].rule().threshold);
                }
            })
        };
        for i in 0..200 {
            registry.load_rules(set(i as f64 + 2.0));
        }
        reader.join().unwrap();
    }
}
