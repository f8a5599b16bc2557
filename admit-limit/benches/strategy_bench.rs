use std::hint::black_box;
use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::Throughput;
use criterion::criterion_group;
use criterion::criterion_main;

use admit_limit::SlidingWindow;
use admit_limit::Strategy;
use admit_limit::TokenBucket;

// A period short enough that the sliding log keeps pruning itself while the bench runs.
const PERIOD: Duration = Duration::from_millis(1);
const ROOMY: usize = 1_000_000;

fn limiters(capacity: usize) -> Vec<(&'static str, Box<dyn Strategy + Send + Sync>)> {
    let capacity = NonZeroUsize::new(capacity).unwrap();
    let window: Box<dyn Strategy + Send + Sync> = Box::new(SlidingWindow::new(capacity, PERIOD));
    let bucket: Box<dyn Strategy + Send + Sync> =
        Box::new(TokenBucket::new(capacity, capacity, PERIOD));
    vec![("sliding_window", window), ("token_bucket", bucket)]
}

/// Admissions of `n` permits at once, with room to spare.
fn bench_permits(c: &mut Criterion) {
    let mut group = c.benchmark_group("Admit Permits");

    for (name, limiter) in limiters(ROOMY) {
        for permits in [1usize, 8, 64] {
            group.throughput(Throughput::Elements(permits as u64));
            group.bench_with_input(BenchmarkId::new(name, permits), &permits, |b, &n| {
                b.iter(|| black_box(limiter.try_acquire(black_box(n))))
            });
        }
    }
    group.finish();
}

/// The overloaded path: every call is refused and computes a retry hint.
fn bench_rejection(c: &mut Criterion) {
    let mut group = c.benchmark_group("Saturated");
    let long = Duration::from_secs(3600);
    let capacity = NonZeroUsize::new(1_000).unwrap();

    let window = SlidingWindow::new(capacity, long);
    while window.try_acquire(1).is_continue() {}
    let bucket = TokenBucket::new(capacity, NonZeroUsize::MIN, long);
    while bucket.try_acquire(1).is_continue() {}

    let saturated: [(&str, &dyn Strategy); 2] = [
        ("sliding_window", &window as &dyn Strategy),
        ("token_bucket", &bucket as &dyn Strategy),
    ];
    for (name, limiter) in saturated {
        group.bench_function(BenchmarkId::new("refused", name), |b| {
            b.iter(|| black_box(limiter.try_acquire(1)).is_break())
        });
        group.bench_function(BenchmarkId::new("retry_after", name), |b| {
            b.iter(|| black_box(limiter.retry_after()))
        });
    }

    // The hint for a multi-permit request walks further into the log.
    group.bench_function("window_guard/retry_after_for_500", |b| {
        b.iter(|| black_box(window.lock().retry_after_for(black_box(500))))
    });
    group.finish();
}

/// Check-then-record through one guard, with every thread fighting for the same window.
fn bench_guard_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("Guard Contention");
    let window = SlidingWindow::new(NonZeroUsize::new(ROOMY).unwrap(), PERIOD);

    for threads in [1usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &n| {
            b.iter_custom(|iters| {
                let per_thread = (iters / n as u64).max(1);
                let start = Instant::now();
                thread::scope(|scope| {
                    for _ in 0..n {
                        scope.spawn(|| {
                            for _ in 0..per_thread {
                                let mut guard = window.lock();
                                if guard.can_process() {
                                    guard.record();
                                }
                            }
                        });
                    }
                });
                start.elapsed()
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_permits,
    bench_rejection,
    bench_guard_contention
);
criterion_main!(benches);
