// Axum server with bucketq in front of an expensive "render" handler.
//
// Run: cargo run --bin axum_simple
// Try: for i in $(seq 20); do curl -s -H 'X-Forwarded-For: 10.0.0.1' http://127.0.0.1:3000/ & done
//      curl -H 'X-Forwarded-For: 10.0.0.2' -H 'X-User-Id: alice' http://127.0.0.1:3000/
//      curl http://127.0.0.1:3000/api/queue

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json, Router,
    error_handling::HandleErrorLayer,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use bucketq_async::bucketq_core::prometheus::render_stats;
use bucketq_tower::{
    AsyncBucketQueue, BucketError, BucketQueueBuilder, BucketSlot, HeaderRecordExtractor,
    QueueStateEntry, QueueStats,
};
use serde_json::json;
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AdminState {
    queue: AsyncBucketQueue<BucketSlot>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bucket_layer = BucketQueueBuilder::new()
        .with_max_in_flight(3)
        .with_queue_timeout(Duration::from_secs(10))
        .build(HeaderRecordExtractor::new());
    let admin = AdminState {
        queue: bucket_layer.queue().clone(),
    };

    let rendered = Router::new()
        .route("/", get(render_page))
        .route("/posts", get(render_page))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_queue_error))
                .layer(bucket_layer),
        );

    let app = Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/queue", get(queue_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(admin)
        .merge(rendered);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    info!(addr = %listener.local_addr()?, "server running");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn render_page() -> &'static str {
    // Stand-in for an expensive server-side render.
    tokio::time::sleep(Duration::from_millis(300)).await;
    "rendered page\n"
}

async fn stats_handler(State(state): State<AdminState>) -> Json<QueueStats> {
    Json(state.queue.stats())
}

async fn queue_handler(State(state): State<AdminState>) -> Json<Vec<QueueStateEntry>> {
    Json(state.queue.snapshot())
}

async fn metrics_handler(State(state): State<AdminState>) -> String {
    render_stats(&state.queue.stats(), "bucketq")
}

async fn handle_queue_error(err: BucketError<Infallible>) -> Response {
    match err {
        BucketError::Rejected(rejection) => (
            StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::TOO_MANY_REQUESTS),
            Json(json!({ "error": rejection.code, "message": rejection.message })),
        )
            .into_response(),
        BucketError::Closed | BucketError::PermitDropped => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Service temporarily unavailable" })),
        )
            .into_response(),
        BucketError::Service(never) => match never {},
    }
}
