use anyhow::Context;
use axum::{
    routing::{delete, get, patch, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_phone_leads::adapter::BackendAdapter;
use rust_phone_leads::config::Config;
use rust_phone_leads::handlers::{self, AppState};
use rust_phone_leads::service::DashboardService;
use rust_phone_leads::store::{LeadStore, RtdbStore};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Main entry point for the application.
///
/// Wires the store client, the backend adapter and the dashboard service,
/// then serves the HTTP API until ctrl-c.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_phone_leads=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let settings = config.adapter_settings();

    let store: Arc<dyn LeadStore> = Arc::new(
        RtdbStore::new(
            &config.store_url,
            config.store_auth.clone(),
            settings.write_timeout,
        )
        .context("Failed to build store client")?,
    );
    tracing::info!("Lead store client initialized");

    let adapter = Arc::new(BackendAdapter::new(store, settings));
    let (dashboard, service_task) = DashboardService::spawn(adapter);

    let app_state = Arc::new(AppState {
        dashboard: dashboard.clone(),
        config: config.clone(),
    });

    // Configure rate limiter: 20 requests/second per IP, burst of 40
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(40)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let api_routes = Router::new()
        .route("/api/v1/leads", get(handlers::list_leads))
        .route("/api/v1/leads/facets", get(handlers::get_facets))
        .route("/api/v1/stats", get(handlers::get_stats))
        .route("/api/v1/filters", patch(handlers::update_filters))
        .route("/api/v1/filters/sort/toggle", post(handlers::toggle_sort))
        .route("/api/v1/leads/:id/notes", put(handlers::update_notes))
        .route("/api/v1/leads/:id/called", post(handlers::mark_called))
        .route("/api/v1/leads/:id", delete(handlers::delete_lead))
        .route("/api/v1/feed/retry", post(handlers::retry_feed))
        .layer(
            ServiceBuilder::new()
                // Notes are the largest payload
                .layer(RequestBodyLimitLayer::new(64 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(api_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    dashboard
        .shutdown()
        .await
        .context("Dashboard shutdown failed")?;
    if tokio::time::timeout(Duration::from_secs(5), service_task)
        .await
        .is_err()
    {
        tracing::warn!("Dashboard service did not stop within 5s");
    }

    tracing::info!("Server stopped");
    Ok(())
}
