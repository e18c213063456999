use crate::build_log::LogDelta;
use crate::constants::REPORT_INDEX_LIMIT;
use crate::error::ReportError;
use crate::report::{CreatedReport, ReportRequest};
use crate::server::store::ReportStore;
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod store;

pub struct AppState {
    pub store: ReportStore,
}

impl IntoResponse for ReportError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReportError::NotFound { .. } => StatusCode::NOT_FOUND,
            ReportError::Finished { .. } => StatusCode::CONFLICT,
            ReportError::Serialization(_) => StatusCode::BAD_REQUEST,
            ReportError::Storage(_) | ReportError::Transport { .. } => {
                tracing::error!(error = %self, "Report request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/report/", post(create_report))
        .route("/report/:id/", post(update_report).get(get_report))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(addr: SocketAddr, data_dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&data_dir)?;
    let store = ReportStore::new(&data_dir.join("reports.db"))?;
    let app = build_router(Arc::new(AppState { store }));

    tracing::info!(%addr, data_dir = %data_dir.display(), "Build report server listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

async fn index(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ReportError> {
    let reports = state.store.list(REPORT_INDEX_LIMIT)?;
    let live = state.store.live()?;
    Ok(Json(serde_json::json!({ "reports": reports, "live": live })))
}

async fn create_report(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReportRequest>,
) -> Result<impl IntoResponse, ReportError> {
    let id = state.store.create(&request)?;
    tracing::info!(id, command = %request.command, host = %request.host.name, "Report created");
    Ok((StatusCode::CREATED, Json(CreatedReport { id })))
}

async fn update_report(
    Path(id): Path<u64>,
    State(state): State<Arc<AppState>>,
    Json(delta): Json<LogDelta>,
) -> Result<impl IntoResponse, ReportError> {
    if state.store.apply_delta(id, &delta)? {
        tracing::info!(id, "Report finished");
    }
    Ok(StatusCode::OK)
}

async fn get_report(
    Path(id): Path<u64>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ReportError> {
    Ok(Json(state.store.get(id)?))
}
