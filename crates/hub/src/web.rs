use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::command::{CommandDispatcher, CommandError};
use crate::dashboard::{self, now_unix};
use crate::db::{Db, DeleteOutcome, StoreError};
use crate::decision::DecisionEngine;
use crate::liveness::LivenessDetector;
use crate::state::SharedState;

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

// ---------------------------------------------------------------------------
// State & errors
// ---------------------------------------------------------------------------

/// Everything a handler needs, built once in main.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub shared: SharedState,
    pub liveness: LivenessDetector,
    pub engine: DecisionEngine,
    pub dispatcher: CommandDispatcher,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        let body = Json(json!({ "status": "error", "message": message }));
        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!("store error: {e}");
        Self::Internal(e.to_string())
    }
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Validation(_) => Self::BadRequest("action must be ON or OFF".into()),
            CommandError::Publish(_) => {
                warn!("command not delivered: {e}");
                Self::Unavailable(e.to_string())
            }
        }
    }
}

// Malformed requests get the same JSON envelope as every other error.

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(e: PathRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/dashboard", get(get_dashboard))
        .route("/history", get(get_history))
        .route("/history/{id}", delete(delete_history))
        .route("/control", post(post_control))
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> impl IntoResponse {
    let stored = match state.db.count_readings().await {
        Ok(n) => Some(n),
        Err(e) => {
            warn!("count_readings failed: {e}");
            None
        }
    };
    let st = state.shared.read().await;
    Json(st.to_status(stored, state.engine.has_classifier()))
}

async fn get_dashboard(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let latest = state.db.latest_reading().await?;
    let view = dashboard::assemble(latest.as_ref(), now_unix(), &state.liveness, &state.engine);
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<i64>,
}

async fn get_history(
    State(state): State<AppState>,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let rows = state.db.recent_readings(limit).await?;
    Ok(Json(json!({ "status": "success", "data": rows })))
}

async fn delete_history(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    match state.db.delete_reading(id).await? {
        DeleteOutcome::Deleted => {
            info!(id, "reading deleted");
            Ok(Json(json!({ "status": "success", "message": format!("reading {id} deleted") })))
        }
        DeleteOutcome::NotFound => Err(ApiError::NotFound(format!("reading {id} not found"))),
    }
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    action: String,
}

async fn post_control(
    State(state): State<AppState>,
    req: Result<Json<ControlRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = req?;
    let ack = state.dispatcher.dispatch(&req.action).await?;
    Ok(Json(ack))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
