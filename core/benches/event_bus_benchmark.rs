/// EventBus and SpeechLane benchmarks using Criterion
///
/// Run with: cargo bench --bench event_bus_benchmark
///
/// Benchmarks cover:
/// - Emit throughput with a single handler
/// - Fan-out to many handlers
/// - Emit with no subscribers
/// - Lane enqueue-to-completion for trivial jobs
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use loom_tts::event::{names, EventBus};
use loom_tts::{LaneConfig, SpeechJob, SpeechLane};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Benchmark: single handler emit throughput
fn bench_single_handler(c: &mut Criterion) {
    let mut group = c.benchmark_group("eventbus_single_handler");

    for event_count in [100u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*event_count));
        group.bench_with_input(
            BenchmarkId::from_parameter(event_count),
            event_count,
            |b, &count| {
                let bus = EventBus::new();
                let received = Arc::new(AtomicU64::new(0));
                let r = received.clone();
                let _sub = bus.on(names::TTS_PLAY_END, move |_| {
                    r.fetch_add(1, Ordering::Relaxed);
                });

                b.iter(|| {
                    for i in 0..count {
                        bus.emit(
                            names::TTS_PLAY_END,
                            json!({ "jobId": i, "success": true }),
                        );
                    }
                    black_box(received.load(Ordering::Relaxed))
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: fan-out to N handlers on one event
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("eventbus_fan_out");

    for handlers in [1usize, 10, 50].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(handlers),
            handlers,
            |b, &handlers| {
                let bus = EventBus::new();
                let received = Arc::new(AtomicU64::new(0));
                let subs: Vec<_> = (0..handlers)
                    .map(|_| {
                        let r = received.clone();
                        bus.on(names::TTS_QUEUE_ADD, move |_| {
                            r.fetch_add(1, Ordering::Relaxed);
                        })
                    })
                    .collect();

                b.iter(|| black_box(bus.emit(names::TTS_QUEUE_ADD, json!({ "queueLength": 1 }))));
                drop(subs);
            },
        );
    }

    group.finish();
}

/// Benchmark: emit on an event nobody listens to
fn bench_unobserved_emit(c: &mut Criterion) {
    let bus = EventBus::new();
    c.bench_function("eventbus_unobserved_emit", |b| {
        b.iter(|| black_box(bus.emit(names::TTS_ALERT, json!({}))))
    });
}

/// Benchmark: lane round trip for jobs that complete immediately
fn bench_lane_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let lane = SpeechLane::new(EventBus::new(), LaneConfig::default());

    let mut group = c.benchmark_group("lane_round_trip");
    for job_count in [10u64, 100].iter() {
        group.throughput(Throughput::Elements(*job_count));
        group.bench_with_input(
            BenchmarkId::from_parameter(job_count),
            job_count,
            |b, &count| {
                b.iter(|| {
                    rt.block_on(async {
                        let tickets: Vec<_> = (0..count)
                            .filter_map(|i| {
                                lane.enqueue(SpeechJob::new(format!("job {}", i), |_| async {
                                    Ok(())
                                }))
                            })
                            .collect();
                        for ticket in tickets {
                            black_box(ticket.outcome().await);
                        }
                    })
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_single_handler,
    bench_fan_out,
    bench_unobserved_emit,
    bench_lane_round_trip
);

criterion_main!(benches);
