use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;

use flowgate::FlowGate;
use flowgate::Rule;
use flowgate::flow::ControlBehavior;
use flowgate::stat::LeapArray;
use flowgate::stat::MetricEvent;
use flowgate::stat::ReadStat;
use flowgate::stat::SlidingWindowMetric;
use flowgate::stat::WriteStat;

fn gate(rules: Vec<Rule>) -> FlowGate {
    let gate = FlowGate::new(Default::default()).unwrap();
    gate.load_rules(rules);
    gate
}

fn bench_entry(group_name: &str, c: &mut Criterion, gate: FlowGate) {
    let mut group = c.benchmark_group(group_name);

    group.bench_function("single-threaded", |b| {
        b.iter(|| {
            if let Ok(entry) = black_box(&gate).entry("bench").try_enter() {
                entry.0.exit();
            }
        })
    });

    for threads in [2, 4, 8].iter() {
        let num_threads = *threads;
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}-threads", num_threads)),
            &num_threads,
            |b, &n| {
                b.iter_custom(|iters| {
                    let barrier = Arc::new(Barrier::new(n + 1));
                    let mut handles = Vec::with_capacity(n);

                    for _ in 0..n {
                        let g = gate.clone();
                        let bar = Arc::clone(&barrier);
                        let iters_per_thread = iters / n as u64;

                        handles.push(thread::spawn(move || {
                            bar.wait();
                            for _ in 0..iters_per_thread {
                                if let Ok(entry) = black_box(&g).entry("bench").try_enter() {
                                    entry.0.exit();
                                }
                            }
                        }));
                    }

                    barrier.wait();
                    let start = Instant::now();

                    for handle in handles {
                        let _ = handle.join();
                    }

                    start.elapsed()
                });
            },
        );
    }
    group.finish();
}

fn bench_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("LeapArray");
    let arr = Arc::new(LeapArray::new(20, 10_000).unwrap());
    let metric = SlidingWindowMetric::new(2, 1000, arr.clone()).unwrap();

    group.bench_function("add_count", |b| {
        b.iter(|| arr.add_count(black_box(MetricEvent::Pass), 1))
    });
    group.bench_function("get_qps", |b| {
        b.iter(|| black_box(metric.get_qps(MetricEvent::Pass)))
    });
    group.finish();
}

fn run_all_benches(c: &mut Criterion) {
    let threshold = 1e12;
    let rule = |behavior| Rule {
        resource: "bench".to_string(),
        threshold,
        control_behavior: behavior,
        ..Rule::default()
    };

    bench_entry("NoRules", c, gate(Vec::new()));
    bench_entry("Reject", c, gate(vec![rule(ControlBehavior::Reject)]));
    bench_entry("Throttling", c, gate(vec![rule(ControlBehavior::Throttling)]));
    bench_window(c);
}

criterion_group!(benches, run_all_benches);
criterion_main!(benches);
