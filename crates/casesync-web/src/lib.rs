//! Axum trigger surface: one route per region plus a region index.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use casesync_core::Region;
use casesync_pipeline::{RegionRegistry, SyncPipeline, SyncSettings};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "casesync-web";

const COMPLETED_MESSAGE: &str = "Synchronization completed.";

pub struct AppState {
    pub pipeline: SyncPipeline,
    pub registry: RegionRegistry,
}

impl AppState {
    pub fn new(pipeline: SyncPipeline, registry: RegionRegistry) -> Self {
        Self { pipeline, registry }
    }
}

#[derive(Debug, Clone, Serialize)]
struct RegionIndexRow {
    region: &'static str,
    state: &'static str,
    enabled: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/sync/{region}", get(sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CASESYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let settings = SyncSettings::from_env();
    let registry = RegionRegistry::load(&settings.registry_path)?;
    let pipeline = SyncPipeline::new(settings)?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(pipeline, registry))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let rows: Vec<RegionIndexRow> = state
        .registry
        .regions
        .iter()
        .map(|config| RegionIndexRow {
            region: config.region.slug(),
            state: config.region.state_name(),
            enabled: config.enabled,
        })
        .collect();
    Json(rows).into_response()
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(slug): AxumPath<String>,
) -> Response {
    let Some(region) = Region::from_slug(&slug) else {
        return (StatusCode::NOT_FOUND, format!("unknown region: {slug}")).into_response();
    };
    let Some(config) = state.registry.region(region).filter(|c| c.enabled) else {
        return (
            StatusCode::NOT_FOUND,
            format!("region not configured: {slug}"),
        )
            .into_response();
    };

    match state.pipeline.run_region(config).await {
        Ok(_summary) => (StatusCode::OK, COMPLETED_MESSAGE).into_response(),
        Err(err) => {
            error!(region = region.slug(), error = %err, "synchronization failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}
