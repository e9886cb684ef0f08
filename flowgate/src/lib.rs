//! # flowgate
//!
//! `flowgate` is an in-process admission control engine. Every guarded call
//! enters a named resource, travels through a chain of slots that keep
//! statistics and check flow rules, and either passes (possibly after a
//! pacing delay) or is blocked with a structured [`BlockError`].
//!
//! ## Core Philosophy
//!
//! Statistics live in lock-free ring buffers of time buckets. Counting a call
//! is an atomic add, reading a window is a scan over a handful of buckets,
//! and rotating a bucket is guarded by a try-lock that never blocks a caller.
//! Rule sets are immutable snapshots swapped atomically, so checks never wait
//! for a reload.
//!
//! ## Key Concepts
//!
//! * **Resource**: a named unit of work, with its own [`StatNode`].
//! * **Flow rule**: a [`Rule`] pairs a threshold calculation (direct, warm
//!   up, memory adaptive) with a control behaviour (reject, or throttle into
//!   an evenly paced queue).
//! * **Cluster mode**: a rule may take its tokens from a token server or a
//!   shared Redis counter, falling back to the local check when that fails.
//!
//! ## Example
//!
//! ```rust
//! use flowgate::FlowGate;
//!
//! let gate = FlowGate::new(Default::default()).unwrap();
//! gate.load_rules_json(r#"[{"resource": "orders", "threshold": 100}]"#)
//!     .unwrap();
//!
//! match gate.entry("orders").build() {
//!     Ok(entry) => {
//!         // Do the work, then leave.
//!         entry.exit();
//!     }
//!     Err(blocked) => eprintln!("{blocked}"),
//! }
//! ```

mod api;
pub mod base;
mod clock;
pub mod cluster;
mod config;
mod error;
pub mod flow;
pub mod stat;
pub mod system_metric;

#[cfg(test)]
mod tests;

pub use api::Entry;
pub use api::EntryBuilder;
pub use api::FlowGate;
pub use api::FlowGateBuilder;
pub use base::BlockError;
pub use base::BlockType;
pub use base::EntryContext;
pub use base::ResourceType;
pub use base::TokenResult;
pub use base::TrafficType;
pub use clock::Clock;
pub use clock::MOCK_EPOCH_MS;
pub use config::ClusterSettings;
pub use config::Config;
pub use config::RedisSettings;
pub use config::StatConfig;
pub use error::Error;
pub use error::Result;
pub use flow::Rule;
pub use stat::MetricItem;
pub use stat::StatNode;
