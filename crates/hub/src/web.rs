use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::notify::CurrentLink;
use crate::state::SharedState;
use crate::store::{StatusStore, StorageError};

#[derive(Clone)]
pub struct AppState {
    pub state: SharedState,
    pub store: Arc<dyn StatusStore>,
    pub link: Arc<CurrentLink>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/subjects/{id}", get(api_subject))
        .with_state(app)
}

/// Storage failures surface as 503 so pollers retry.
struct ApiError(StorageError);

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "status query failed");
        (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string()).into_response()
    }
}

async fn api_status(State(app): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let subjects = app.store.list_status().await?;
    let transport = app.link.get().map(|t| t.stats());
    let st = app.state.read().await;
    Ok(Json(st.to_status(subjects, transport)))
}

async fn api_subject(State(app): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    Ok(match app.store.load_status(&id).await? {
        Some(record) => Json(record).into_response(),
        None => (StatusCode::NOT_FOUND, format!("unknown subject '{id}'")).into_response(),
    })
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(addr: SocketAddr, app: AppState) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!(%addr, "status api listening");

    axum::serve(listener, router(app)).await.context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
