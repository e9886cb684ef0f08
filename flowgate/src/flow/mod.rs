//! Flow control: rules, the controllers enforcing them and the slots that
//! run them on every entry.
//!
//! Each [`Rule`] becomes a [`TrafficShapingController`] pairing a
//! [`Calculator`] (how many tokens are allowed right now) with a [`Checker`]
//! (what to do with a request once that number is known). The
//! [`RuleRegistry`] owns the active controllers and swaps them atomically on
//! every load.

mod calculator;
mod checker;
mod controller;
mod pacer;
mod rule;
mod rule_manager;
mod slot;

pub use calculator::Calculator;
pub use calculator::DirectCalculator;
pub use calculator::MemoryAdaptiveCalculator;
pub use calculator::WarmUpCalculator;
pub use checker::Checker;
pub use checker::RejectChecker;
pub use checker::ThrottlingChecker;
pub use controller::StandaloneStatistic;
pub use controller::TrafficShapingController;
pub use controller::generate_stat_for;
pub use pacer::Pace;
pub use pacer::Pacer;
pub use rule::ClusterConfig;
pub use rule::ClusterStrategy;
pub use rule::ControlBehavior;
pub use rule::MAX_STAT_INTERVAL_MS;
pub use rule::RelationStrategy;
pub use rule::Rule;
pub use rule::TokenCalculateStrategy;
pub use rule_manager::RuleRegistry;
pub use slot::FLOW_SLOT_ORDER;
pub use slot::FlowSlot;
pub use slot::STANDALONE_STAT_SLOT_ORDER;
pub use slot::StandaloneStatSlot;
