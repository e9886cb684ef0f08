use std::sync::Arc;
use std::sync::Barrier;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use more_asserts::assert_ge;
use more_asserts::assert_le;

use super::*;
use crate::base::TokResult;
use crate::cluster::DefaultTokenService;
use crate::cluster::TokenClient;
use crate::flow::ClusterConfig;
use crate::flow::ClusterStrategy;
use crate::flow::ControlBehavior;
use crate::flow::TokenCalculateStrategy;
use crate::stat::MetricEvent;
use crate::stat::ReadStat;
use crate::system_metric::FixedMemoryProbe;

fn gate() -> (FlowGate, Arc<quanta::Mock>) {
    let (clock, mock) = Clock::mock();
    let gate = FlowGate::builder()
        .clock(clock)
        .memory_probe(Arc::new(FixedMemoryProbe::new(None)))
        .build()
        .unwrap();
    (gate, mock)
}

fn rule(resource: &str, threshold: f64) -> Rule {
    Rule {
        resource: resource.to_string(),
        threshold,
        ..Rule::default()
    }
}

#[test]
fn test_reject_scenario() {
    let (gate, mock) = gate();
    gate.load_rules(vec![Rule {
        stat_interval_in_ms: 1000,
        ..rule("abc", 2.0)
    }]);

    let first = gate.entry("abc").build().unwrap();
    let second = gate.entry("abc").build().unwrap();
    let err = gate.entry("abc").build().unwrap_err();
    assert_eq!(err.block_type(), BlockType::Flow);
    assert_eq!(err.snapshot_value(), Some(3.0));
    first.exit();
    second.exit();

    mock.increment(Duration::from_millis(1000));
    assert!(gate.entry("abc").build().is_ok());
}

#[test]
fn test_throttling_without_queue() {
    let (gate, _mock) = gate();
    gate.load_rules(vec![Rule {
        control_behavior: ControlBehavior::Throttling,
        max_queueing_time_ms: 0,
        ..rule("abc", 1.0)
    }]);

    let (_entry, wait) = gate.entry("abc").try_enter().unwrap();
    assert_eq!(wait, Duration::ZERO);
    assert!(gate.entry("abc").try_enter().is_err());
}

#[test]
fn test_throttling_below_one_per_second() {
    let (gate, mock) = gate();
    gate.load_rules(vec![Rule {
        control_behavior: ControlBehavior::Throttling,
        max_queueing_time_ms: 0,
        ..rule("abc", 0.5)
    }]);

    let (entry, wait) = gate.entry("abc").try_enter().unwrap();
    assert_eq!(wait, Duration::ZERO);
    entry.exit();
    assert!(gate.entry("abc").try_enter().is_err());

    mock.increment(Duration::from_millis(2000));
    assert!(gate.entry("abc").try_enter().is_ok());
}

#[test]
fn test_throttling_queues_batch_above_threshold() {
    let (gate, _mock) = gate();
    gate.load_rules(vec![Rule {
        control_behavior: ControlBehavior::Throttling,
        max_queueing_time_ms: 5000,
        ..rule("abc", 2.0)
    }]);

    gate.entry("abc").try_enter().unwrap().0.exit();
    let (entry, wait) = gate.entry("abc").with_batch_count(3).try_enter().unwrap();
    assert_eq!(wait, Duration::from_millis(1500));
    entry.exit();
}

#[test]
fn test_pacing_spacing() {
    let (gate, mock) = gate();
    gate.load_rules(vec![Rule {
        control_behavior: ControlBehavior::Throttling,
        max_queueing_time_ms: 10_000,
        ..rule("abc", 10.0)
    }]);

    let start = gate.clock().now_ns();
    let mut grants = Vec::new();
    for _ in 0..5 {
        let (entry, wait) = gate.entry("abc").try_enter().unwrap();
        grants.push(gate.clock().now_ns() + wait.as_nanos() as u64 - start);
        entry.exit();
        mock.increment(Duration::from_millis(10));
    }
    for pair in grants.windows(2) {
        assert_ge!(pair[1] - pair[0], 100_000_000);
    }
    assert_eq!(grants[0], 0);
    assert_eq!(grants[4], 400_000_000);
}

#[test]
fn test_concurrent_reject_admits_at_most_threshold() {
    let (gate, _mock) = gate();
    gate.load_rules(vec![rule("abc", 10.0)]);
    let threads = 32;
    let barrier = Arc::new(Barrier::new(threads));
    let passed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let gate = gate.clone();
            let barrier = barrier.clone();
            let passed = passed.clone();
            thread::spawn(move || {
                barrier.wait();
                if let Ok(entry) = gate.entry("abc").build() {
                    passed.fetch_add(1, Ordering::SeqCst);
                    entry.exit();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let passed = passed.load(Ordering::SeqCst);
    assert_le!(passed, 10);
    let node = gate.nodes().get("abc").unwrap();
    assert_le!(node.get_sum(MetricEvent::RejectPass), 10);
    assert_eq!(node.get_sum(MetricEvent::Pass), passed as i64);
    assert_eq!(
        node.get_sum(MetricEvent::Block),
        (threads - passed) as i64
    );
}

#[test]
fn test_warm_up_starts_cold() {
    let (gate, _mock) = gate();
    gate.load_rules(vec![Rule {
        token_calculate_strategy: TokenCalculateStrategy::WarmUp,
        warm_up_period_sec: 10,
        warm_up_cold_factor: 3,
        ..rule("abc", 30.0)
    }]);
    let admitted = (0..30)
        .filter(|_| gate.entry("abc").build().map(Entry::exit).is_ok())
        .count();
    // A cold system allows about threshold / coldFactor.
    assert_ge!(admitted, 9);
    assert_le!(admitted, 10);
}

#[test]
fn test_memory_adaptive_threshold() {
    let (clock, _mock) = Clock::mock();
    let gate = FlowGate::builder()
        .clock(clock)
        .memory_probe(Arc::new(FixedMemoryProbe::new(Some(228))))
        .build()
        .unwrap();
    gate.load_rules(vec![Rule {
        token_calculate_strategy: TokenCalculateStrategy::MemoryAdaptive,
        low_mem_usage_threshold: 4.0,
        high_mem_usage_threshold: 1.0,
        mem_low_water_mark_bytes: 100,
        mem_high_water_mark_bytes: 356,
        ..rule("abc", 0.0)
    }]);
    // Half way between the water marks the threshold is 2.5.
    let admitted = (0..10)
        .filter(|_| gate.entry("abc").build().map(Entry::exit).is_ok())
        .count();
    assert_eq!(admitted, 2);
}

#[derive(Debug)]
struct Scripted {
    answer: TokResult,
    calls: AtomicUsize,
}

impl TokenClient for Scripted {
    fn acquire_cluster_token(&self, _rule: &Rule, _acquire_count: u32, _prioritized: i32) -> TokResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

fn cluster_rule(threshold: f64, global_threshold: f64, port: i32) -> Rule {
    Rule {
        id: "c1".to_string(),
        cluster_mode: true,
        cluster_config: Some(ClusterConfig {
            cluster_strategy: ClusterStrategy::Global,
            fallback_to_local_when_fail: true,
            global_threshold,
            token_server_master_host: "127.0.0.1".to_string(),
            token_server_master_port: port,
            ..ClusterConfig::default()
        }),
        ..rule("abc", threshold)
    }
}

#[test]
fn test_cluster_failure_falls_back_and_downgrades() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (clock, mock) = Clock::mock();
    let client = Arc::new(Scripted {
        answer: TokResult::FAIL,
        calls: AtomicUsize::new(0),
    });
    let gate = FlowGate::builder()
        .clock(clock)
        .memory_probe(Arc::new(FixedMemoryProbe::new(None)))
        .token_client(client.clone())
        .build()
        .unwrap();
    gate.load_rules(vec![cluster_rule(1.0, 100.0, 8719)]);

    // The failed request is checked locally.
    assert!(gate.entry("abc").build().is_ok());
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    // Within the downgrade window the remote path is skipped entirely.
    assert!(gate.entry("abc").build().is_err());
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);

    mock.increment(Duration::from_millis(2000));
    assert!(gate.entry("abc").build().is_ok());
    assert_eq!(client.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cluster_tokens_from_in_process_server() {
    let (clock, _mock) = Clock::mock();
    let mut config = Config::default();
    config.cluster.local_host = Some("127.0.0.1".to_string());
    config.cluster.local_port = Some(8719);
    let service = Arc::new(DefaultTokenService::new(&config, clock.clone()));
    let gate = FlowGate::builder()
        .config(config)
        .clock(clock)
        .memory_probe(Arc::new(FixedMemoryProbe::new(None)))
        .token_service(service.clone())
        .build()
        .unwrap();
    // The local threshold alone would allow far more.
    gate.load_rules(vec![cluster_rule(100.0, 2.0, 8719)]);

    assert!(gate.entry("abc").build().is_ok());
    assert!(gate.entry("abc").build().is_ok());
    let err = gate.entry("abc").build().unwrap_err();
    assert_eq!(err.block_type(), BlockType::Flow);
    assert_eq!(err.message(), "flow reject check blocked");

    let metric = service
        .cluster_metric(&cluster_rule(100.0, 2.0, 8719))
        .unwrap();
    assert_eq!(metric.get_sum(MetricEvent::Pass), 2);
    assert_eq!(metric.get_sum(MetricEvent::Block), 1);
}

#[test]
fn test_rules_reload_keeps_statistics() {
    let (gate, _mock) = gate();
    assert!(gate.load_rules(vec![rule("abc", 2.0)]));
    gate.entry("abc").build().unwrap().exit();
    assert!(!gate.load_rules(vec![rule("abc", 2.0)]));

    // A new threshold rebuilds the controller on the same statistic.
    assert!(gate.load_rules(vec![rule("abc", 1.0)]));
    assert!(gate.entry("abc").build().is_err());
    assert_eq!(gate.rules().get_rules(), vec![rule("abc", 1.0)]);
}

#[tokio::test]
async fn test_async_entry_waits_for_its_turn() {
    tokio::time::pause();
    let (gate, _mock) = gate();
    gate.load_rules(vec![Rule {
        control_behavior: ControlBehavior::Throttling,
        max_queueing_time_ms: 1000,
        ..rule("abc", 10.0)
    }]);

    gate.entry("abc").build_async().await.unwrap().exit();
    let before = tokio::time::Instant::now();
    gate.entry("abc").build_async().await.unwrap().exit();
    assert_ge!(before.elapsed(), Duration::from_millis(100));
}
