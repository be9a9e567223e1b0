mod api;
mod config;
mod models;
mod providers;
mod scheduler;

use std::sync::Arc;

use axum::{routing::get, Router};
use chrono::Utc;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use api::AppState;
use config::Config;
use providers::stib::StibClient;
use scheduler::RefreshScheduler;

#[derive(OpenApi)]
#[openapi(
    info(title = "STIB Arrival Monitor", version = "0.1.0"),
    paths(
        api::stops::list_stops,
        api::stops::get_stop,
        api::health::health_check,
    ),
    components(schemas(
        api::ErrorResponse,
        api::stops::StopListResponse,
        api::health::HealthResponse,
        scheduler::StopView,
        models::Passage,
        models::ArrivingIn,
        models::LineKind,
    )),
    tags(
        (name = "stops", description = "Real-time arrival estimates for monitored stops"),
        (name = "health", description = "Service health check")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    tracing::info!(stops = config.stops.len(), lang = %config.lang, "Loaded configuration");

    // Build CORS layer based on config
    let cors_layer = if config.cors_permissive {
        tracing::warn!("CORS: Permissive mode explicitly enabled (all origins allowed) - DO NOT USE IN PRODUCTION");
        CorsLayer::permissive()
    } else if !config.cors_origins.is_empty() {
        tracing::info!(origins = ?config.cors_origins, "CORS: Restricting to configured origins");
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([axum::http::Method::GET, axum::http::Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    } else {
        panic!("CORS configuration error: Either set 'cors_origins' with allowed origins, or set 'cors_permissive: true' for development");
    };

    // Create broadcast channel for API request diagnostics (capacity 100)
    let (api_requests_tx, _) = broadcast::channel(100);

    let client = StibClient::with_max_concurrent(
        &config,
        api_requests_tx.clone(),
        config.scheduler.max_concurrent_requests,
    )
    .expect("Failed to build STIB client");

    let scheduler = Arc::new(RefreshScheduler::from_config(&config, client));

    // Fail startup unless every stop completes its first fetch, with a
    // bounded retry before giving up
    let max_retries = config.scheduler.startup_retries;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match scheduler.initialize(Utc::now()).await {
            Ok(_) => {
                tracing::info!(stops = scheduler.stop_count(), "All stops initialized");
                break;
            }
            Err(e) => {
                if attempt >= max_retries {
                    tracing::error!(error = %e, attempts = attempt, "Startup failed after max retries");
                    std::process::exit(1);
                }
                let wait_secs = 30 * attempt;
                tracing::error!(error = %e, attempt, wait_secs, "Initial poll incomplete, retrying...");
                tokio::time::sleep(tokio::time::Duration::from_secs(wait_secs as u64)).await;
            }
        }
    }

    // Spawn the poll loop
    let poll_scheduler = scheduler.clone();
    let poll_interval_secs = config.scheduler.poll_interval_secs;
    tokio::spawn(async move {
        tracing::info!(poll_interval_secs, "Starting poll loop");
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(poll_interval_secs));
        // Skip the first tick which fires immediately (initialize already polled)
        interval.tick().await;

        loop {
            interval.tick().await;
            poll_scheduler.poll(Utc::now()).await;
        }
    });

    let state = AppState {
        stops: Arc::new(scheduler.handles()),
        updates_tx: scheduler.updates_sender(),
        requests_tx: api_requests_tx,
    };

    // Build the app
    let app = Router::new()
        .route("/", get(root))
        .nest("/api", api::router(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    // Start server
    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000")
        .await
        .expect("Failed to bind to port 3000");

    tracing::info!("Server running on http://localhost:3000");
    tracing::info!("Swagger UI: http://localhost:3000/swagger-ui");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

async fn root() -> &'static str {
    "STIB Arrival Monitor"
}
