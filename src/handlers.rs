use crate::config::Config;
use crate::engine::{DashboardState, FilterUpdate};
use crate::errors::{AppError, ResultExt};
use crate::filter::Facets;
use crate::models::LeadId;
use crate::service::DashboardHandle;
use crate::stats::DashboardStats;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Front door to the dashboard service.
    pub dashboard: DashboardHandle,
    /// Application configuration.
    pub config: Config,
}

#[derive(Debug, Deserialize)]
pub struct NotesRequest {
    #[serde(default)]
    pub notes: String,
}

fn parse_id(raw: &str) -> Result<LeadId, AppError> {
    LeadId::parse(raw)
}

/// Health check endpoint. Reports which store the feed is bound to.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-phone-leads",
            "version": env!("CARGO_PKG_VERSION"),
            "store": state.config.store_host()
        })),
    )
}

/// GET /api/v1/leads
///
/// Current view with facets, controls and feed status.
pub async fn list_leads(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DashboardState>, AppError> {
    let dashboard = state.dashboard.state().await?;
    tracing::debug!(
        "GET /leads - {} of {} shown",
        dashboard.shown,
        dashboard.total
    );
    Ok(Json(dashboard))
}

/// GET /api/v1/leads/facets
pub async fn get_facets(State(state): State<Arc<AppState>>) -> Result<Json<Facets>, AppError> {
    Ok(Json(state.dashboard.facets().await?))
}

/// GET /api/v1/stats
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DashboardStats>, AppError> {
    Ok(Json(state.dashboard.stats().await?))
}

/// PATCH /api/v1/filters
///
/// Any subset of `min_score`, `city`, `business_type`, `called`, `sort_order`.
pub async fn update_filters(
    State(state): State<Arc<AppState>>,
    Json(update): Json<FilterUpdate>,
) -> Result<Json<DashboardState>, AppError> {
    tracing::info!("PATCH /filters - {:?}", update);
    let dashboard = state.dashboard.update_filter(update).await?;
    Ok(Json(dashboard))
}

/// POST /api/v1/filters/sort/toggle
pub async fn toggle_sort(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DashboardState>, AppError> {
    Ok(Json(state.dashboard.toggle_sort().await?))
}

/// PUT /api/v1/leads/:id/notes
///
/// An empty `notes` string clears the notes.
pub async fn update_notes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<NotesRequest>,
) -> Result<Json<DashboardState>, AppError> {
    let id = parse_id(&id)?;
    tracing::info!("PUT /leads/{}/notes", id);

    let dashboard = state
        .dashboard
        .update_notes(id.clone(), payload.notes)
        .await
        .with_context(|| format!("Updating notes of lead {}", id))?;
    Ok(Json(dashboard))
}

/// POST /api/v1/leads/:id/called
pub async fn mark_called(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DashboardState>, AppError> {
    let id = parse_id(&id)?;
    tracing::info!("POST /leads/{}/called", id);

    let dashboard = state
        .dashboard
        .mark_called(id.clone())
        .await
        .with_context(|| format!("Marking lead {} called", id))?;
    Ok(Json(dashboard))
}

/// DELETE /api/v1/leads/:id
pub async fn delete_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DashboardState>, AppError> {
    let id = parse_id(&id)?;
    tracing::info!("DELETE /leads/{}", id);

    let dashboard = state
        .dashboard
        .delete_lead(id.clone())
        .await
        .with_context(|| format!("Deleting lead {}", id))?;
    Ok(Json(dashboard))
}

/// POST /api/v1/feed/retry
///
/// Reconnects the live feed now instead of waiting out the backoff.
pub async fn retry_feed(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    state.dashboard.retry_feed()?;
    tracing::info!("POST /feed/retry - reconnect requested");
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "retrying" }))))
}
