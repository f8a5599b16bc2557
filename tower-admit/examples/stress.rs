use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use clap::ValueEnum;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use quanta::Clock;
use tower::BoxError;
use tower::service_fn;
use tower_admit::AdmissionConfig;
use tower_admit::AdmissionCoordinator;
use tower_admit::AdmitError;
use tower_admit::PollPolicy;
use tower_admit::PromotionMode;
use tower_admit::Submission;
use tower_admit::WorkItem;
use tower_admit::poll_until_complete;
use tower_admit::spawn_promoter;
use tower_admit::telemetry::LogConfig;
use tower_admit::telemetry::LogFormat;
use tower_admit::telemetry::init_logging;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Promotion {
    Poll,
    Push,
}

/// Fire a burst of work at a coordinator and watch it drain.
#[derive(Debug, Parser)]
struct Args {
    /// Requests admitted per window
    #[arg(long, default_value_t = 10)]
    limit: usize,
    /// Window length, e.g. `1s` or `500ms`
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    window: Duration,
    /// Requests in the burst
    #[arg(long, default_value_t = 50)]
    requests: usize,
    /// Deferred entries the pool may hold
    #[arg(long, default_value_t = 30)]
    pool: usize,
    #[arg(long, value_enum, default_value_t = Promotion::Poll)]
    promotion: Promotion,
    /// How long a client keeps polling before giving up
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    give_up: Duration,
    #[arg(long, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    init_logging(&LogConfig {
        format: args.log_format,
        level: "warn".to_string(),
    })?;

    let promotion = match args.promotion {
        Promotion::Poll => PromotionMode::Poll,
        Promotion::Push => PromotionMode::Push,
    };
    let config = AdmissionConfig::default()
        .with_limiter(args.limit, args.window)
        .with_pool_capacity(args.pool)
        .with_promotion(promotion);
    config.validate()?;

    // 1. Setup the limiter and the coordinator
    let limiter = config.limiter.build(Clock::new())?;
    let processor = service_fn(|n: usize| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, BoxError>(format!("request {n} done"))
    });
    let coordinator = Arc::new(AdmissionCoordinator::new(limiter, processor, config));
    let promoter = matches!(args.promotion, Promotion::Push)
        .then(|| spawn_promoter(Arc::clone(&coordinator)));

    let policy = PollPolicy {
        give_up_after: args.give_up,
        min_interval: Duration::from_millis(50),
    };

    println!(
        "🚀 Firing {} requests at {} per {:?} (pool of {}, {:?} promotion)...",
        args.requests, args.limit, args.window, args.pool, args.promotion
    );

    // 2. Fire the burst
    let start = Instant::now();
    let mut tasks = FuturesUnordered::new();
    for n in 0..args.requests {
        let coordinator = Arc::clone(&coordinator);
        tasks.push(async move {
            match coordinator.submit(WorkItem::new(n)).await? {
                Submission::Immediate(msg) => Ok::<_, AdmitError>((n, msg, true)),
                Submission::Deferred(handle) => {
                    println!(
                        "⏳ Request {n}: deferred as {} at position {}, retry in {}s",
                        handle.id,
                        handle.queue_position,
                        handle.retry_after_secs()
                    );
                    let msg = poll_until_complete(&coordinator, &handle.id, policy).await?;
                    Ok((n, msg, false))
                }
            }
        });
    }

    let mut completed = 0;
    let mut rejected = 0;
    while let Some(result) = tasks.next().await {
        match result {
            Ok((n, msg, true)) => {
                completed += 1;
                println!("✅ Request {n}: {msg} (immediately)");
            }
            Ok((n, msg, false)) => {
                completed += 1;
                println!("🔁 Request {n}: {msg} after {:?}", start.elapsed());
            }
            Err(AdmitError::PoolFull) => {
                rejected += 1;
                println!("❌ Rejected: pool full");
            }
            Err(err) => {
                rejected += 1;
                println!("❌ Failed: {err}");
            }
        }
    }

    println!(
        "🏁 {completed} completed, {rejected} rejected in {:?}",
        start.elapsed()
    );

    if let Some(promoter) = promoter {
        promoter.shutdown().await;
    }
    Ok(())
}
