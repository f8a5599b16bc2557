use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use admit_limit::SlidingWindow;
use admit_limit::Strategy;
use admit_limit::TokenBucket;
use criterion::BenchmarkGroup;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::measurement::WallTime;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::service_fn;
use tower::util::BoxCloneSyncService;
use tower_admit::AdmissionConfig;
use tower_admit::AdmissionCoordinator;
use tower_admit::AdmissionLayer;
use tower_admit::Submission;
use tower_admit::WorkItem;

// --- HELPERS & TYPES ---

type BenchService = BoxCloneSyncService<WorkItem<u64>, Submission<u64>, BoxError>;

async fn noop_handler(req: u64) -> Result<u64, BoxError> {
    Ok(req)
}

fn admission(limiter: Arc<dyn Strategy + Send + Sync>, config: AdmissionConfig) -> BenchService {
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(AdmissionLayer::new(limiter, config))
            .service(service_fn(noop_handler)),
    )
}

/// Single-call overhead
fn bench_overhead(
    group: &mut BenchmarkGroup<WallTime>,
    rt: &tokio::runtime::Runtime,
    id: &str,
    svc: BenchService,
) {
    group.bench_function(id, |b| {
        b.to_async(rt).iter(|| {
            let mut s = svc.clone();
            async move {
                let res = s.ready().await.unwrap().call(WorkItem::new(7)).await;
                black_box(res)
            }
        });
    });
}

/// Burst/contention
fn bench_burst(
    group: &mut BenchmarkGroup<WallTime>,
    rt: &tokio::runtime::Runtime,
    id: &str,
    svc: BenchService,
    burst_size: usize,
) {
    group.bench_function(id, |b| {
        b.to_async(rt).iter(|| {
            let s = svc.clone();
            async move {
                let mut futures = FuturesUnordered::new();
                for n in 0..burst_size {
                    let mut local_svc = s.clone();
                    futures.push(async move {
                        let item = WorkItem::new(n as u64).with_priority((n % 5) as i32);
                        local_svc.ready().await.unwrap().call(item).await
                    });
                }
                while let Some(res) = futures.next().await {
                    let _ = black_box(res);
                }
            }
        });
    });
}

// --- MAIN BENCHMARK ---

fn bench_admission(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(8)
        .enable_all()
        .build()
        .unwrap();

    let period = Duration::from_millis(1);
    let burst_size = 1000;

    // Huge limits so we measure the bookkeeping, not the deferrals.
    let sliding: Arc<dyn Strategy + Send + Sync> = Arc::new(SlidingWindow::new(
        NonZeroUsize::new(100_000_000).unwrap(),
        period,
    ));
    let bucket: Arc<dyn Strategy + Send + Sync> = Arc::new(TokenBucket::new(
        NonZeroUsize::new(100_000_000).unwrap(),
        NonZeroUsize::new(100_000).unwrap(),
        period,
    ));
    // One admission per hour: everything after the first call is deferred, then rejected
    // once the pool is full.
    let saturated: Arc<dyn Strategy + Send + Sync> = Arc::new(SlidingWindow::new(
        NonZeroUsize::MIN,
        Duration::from_secs(3600),
    ));

    let scenarios: Vec<(&str, BenchService)> = vec![
        (
            "admit_sliding",
            admission(sliding, AdmissionConfig::default()),
        ),
        ("admit_bucket", admission(bucket, AdmissionConfig::default())),
        (
            "saturated_sliding",
            admission(
                saturated,
                AdmissionConfig::default().with_pool_capacity(10_000),
            ),
        ),
    ];

    let mut group = c.benchmark_group("Admission Overhead");
    for (id, svc) in &scenarios {
        bench_overhead(&mut group, &rt, id, svc.clone());
    }
    group.finish();

    let mut group = c.benchmark_group("Admission Burst");
    group.throughput(criterion::Throughput::Elements(burst_size as u64));
    for (id, svc) in &scenarios {
        bench_burst(&mut group, &rt, id, svc.clone(), burst_size);
    }
    group.finish();
}

fn bench_pool_lookups(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    // Fill a pool with deferred work, then measure the read paths.
    let limiter = Arc::new(SlidingWindow::new(
        NonZeroUsize::MIN,
        Duration::from_secs(3600),
    ));
    let coordinator = AdmissionCoordinator::new(
        limiter,
        service_fn(noop_handler),
        AdmissionConfig::default().with_pool_capacity(1_000),
    );
    let ids: Vec<_> = rt.block_on(async {
        let mut ids = Vec::new();
        for n in 0..1_000u64 {
            let item = WorkItem::new(n).with_priority((n % 7) as i32);
            if let Ok(Submission::Deferred(handle)) = coordinator.submit(item).await {
                ids.push(handle.id);
            }
        }
        ids
    });
    let middle = ids[ids.len() / 2].clone();

    let mut group = c.benchmark_group("Pool Lookups");
    group.bench_function("status", |b| {
        b.iter(|| black_box(coordinator.status(middle.as_str())))
    });
    group.bench_function("retry_still_pending", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(coordinator.retry(middle.as_str()).await) })
    });
    group.finish();
}

criterion_group!(benches, bench_admission, bench_pool_lookups);
criterion_main!(benches);
