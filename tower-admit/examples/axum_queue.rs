use std::sync::Arc;
use std::time::Duration;

use admit_limit::Strategy;
use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use quanta::Clock;
use serde::Deserialize;
use tokio::time::sleep;
use tower::BoxError;
use tower::service_fn;
use tower::util::BoxCloneSyncService;
use tower_admit::AdmissionConfig;
use tower_admit::AdmissionCoordinator;
use tower_admit::AdmitError;
use tower_admit::PromotionMode;
use tower_admit::RetryOutcome;
use tower_admit::StatusSnapshot;
use tower_admit::Submission;
use tower_admit::WorkItem;
use tower_admit::spawn_promoter;
use tower_admit::spawn_sweeper;
use tower_admit::telemetry::LogConfig;
use tower_admit::telemetry::init_logging;

type Processor = BoxCloneSyncService<String, String, BoxError>;
type AppCoordinator = AdmissionCoordinator<dyn Strategy + Send + Sync, Processor, String, String>;

#[derive(Deserialize)]
struct SubmitParams {
    priority: Option<i32>,
    client: Option<String>,
}

async fn shout(text: String) -> Result<String, BoxError> {
    // Simulate a slow backend
    sleep(Duration::from_millis(100)).await;
    Ok(text.to_uppercase())
}

async fn submit(
    State(coordinator): State<Arc<AppCoordinator>>,
    Query(params): Query<SubmitParams>,
    body: String,
) -> Result<Submission<String>, AdmitError> {
    let mut item = WorkItem::new(body).with_priority(params.priority.unwrap_or(0));
    if let Some(client) = params.client {
        item = item.with_client(client);
    }
    coordinator.submit(item).await
}

async fn status(
    State(coordinator): State<Arc<AppCoordinator>>,
    Path(id): Path<String>,
) -> StatusSnapshot<String> {
    coordinator.status(&id)
}

async fn retry(
    State(coordinator): State<Arc<AppCoordinator>>,
    Path(id): Path<String>,
) -> Result<Response, AdmitError> {
    let response = match coordinator.retry(&id).await? {
        RetryOutcome::Completed(data) => StatusSnapshot::Completed(data).into_response(),
        RetryOutcome::Failed(error) => StatusSnapshot::<String>::Failed(error).into_response(),
        RetryOutcome::StillPending { retry_after, .. } => {
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            (
                StatusCode::ACCEPTED,
                [(header::RETRY_AFTER, secs.to_string())],
            )
                .into_response()
        }
    };
    Ok(response)
}

async fn cancel(
    State(coordinator): State<Arc<AppCoordinator>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AdmitError> {
    coordinator.cancel(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health(State(coordinator): State<Arc<AppCoordinator>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "queue_length": coordinator.queue_length(),
        "is_full": coordinator.is_full(),
        "retry_after_seconds": coordinator.retry_after_secs(),
        "load": coordinator.current_load(),
    }))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_logging(&LogConfig::default())?;

    // 1. Load configuration: a TOML file if given, else 2 requests per minute
    let config = match std::env::args().nth(1) {
        Some(path) => AdmissionConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => AdmissionConfig::default(),
    };

    // 2. Build the coordinator around the configured limiter
    let limiter = config.limiter.build(Clock::new())?;
    let push = config.promotion == PromotionMode::Push;
    let coordinator: Arc<AppCoordinator> = Arc::new(AdmissionCoordinator::new(
        limiter,
        BoxCloneSyncService::new(service_fn(shout)),
        config,
    ));

    // 3. Background tasks
    let sweeper = spawn_sweeper(Arc::clone(&coordinator));
    let promoter = push.then(|| spawn_promoter(Arc::clone(&coordinator)));

    // 4. Build the Router
    let app = Router::new()
        .route("/work", post(submit))
        .route("/work/{id}", get(status).delete(cancel))
        .route("/work/{id}/retry", post(retry))
        .route("/health", get(health))
        .with_state(coordinator);

    // 5. Serve
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    println!("📡 Listening on http://127.0.0.1:3000");
    println!("   curl -i -X POST 'localhost:3000/work?priority=5' -d hello");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(promoter) = promoter {
        promoter.shutdown().await;
    }
    sweeper.shutdown().await;
    Ok(())
}
