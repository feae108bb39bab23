//! CSV download HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Service banner with links to the other endpoints |
//! | `GET`  | `/get-all-csv` | Every registered day file, plus the latest one |
//! | `GET`  | `/get-csv/{file}` | Download `{file}.csv` if it is registered |
//! | `GET`  | `/get-last-csv` | Download the day file currently being written |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! An unregistered day answers `404` with the plain-text body
//! `Not Found File CSV with date: {file}`. Registry or file read failures
//! answer `500` with
//!
//! ```json
//! { "error": { "code": "internal", "message": "..." } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser dashboards can
//! fetch the listings directly.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_TYPE, HOST},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::models::{file_name_for, RegistryEntry};
use crate::registry::Registry;
use crate::sink::csv_path;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<dyn Registry>,
    output_dir: Arc<PathBuf>,
    /// Key of the day file the pipeline is writing, published by the pipeline.
    current: watch::Receiver<Option<String>>,
}

impl AppState {
    pub fn new(
        registry: Arc<dyn Registry>,
        output_dir: impl Into<PathBuf>,
        current: watch::Receiver<Option<String>>,
    ) -> Self {
        Self {
            registry,
            output_dir: Arc::new(output_dir.into()),
            current,
        }
    }

    fn current_key(&self) -> String {
        self.current.borrow().clone().unwrap_or_default()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/get-all-csv", get(handle_all_csv))
        .route("/get-csv/{file}", get(handle_get_csv))
        .route("/get-last-csv", get(handle_last_csv))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serves the download API on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "download server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Constructs a 500 error and logs the cause.
fn internal(err: anyhow::Error) -> AppError {
    error!(error = %format!("{:#}", err), "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: format!("{:#}", err),
    }
}

fn not_found_csv(file: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        format!("Not Found File CSV with date: {}", file),
    )
        .into_response()
}

// ============ GET / ============

#[derive(Serialize)]
struct RootResponse {
    message: String,
    endpoints: Endpoints,
}

#[derive(Serialize)]
struct Endpoints {
    #[serde(rename = "getAllCSV")]
    get_all_csv: String,
    #[serde(rename = "getUniqueCSV")]
    get_unique_csv: String,
    #[serde(rename = "getLastCSV")]
    get_last_csv: String,
}

/// Handler for `GET /`. Links are built from the request's `Host` header.
async fn handle_root(State(state): State<AppState>, headers: HeaderMap) -> Json<RootResponse> {
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");

    Json(RootResponse {
        message: "Server online".to_string(),
        endpoints: Endpoints {
            get_all_csv: format!("http://{}/get-all-csv", host),
            get_unique_csv: format!("http://{}/get-csv/{}", host, state.current_key()),
            get_last_csv: format!("http://{}/get-last-csv", host),
        },
    })
}

// ============ GET /get-all-csv ============

#[derive(Serialize)]
struct AllCsvResponse {
    latest: Option<RegistryEntry>,
    list: Vec<RegistryEntry>,
}

async fn handle_all_csv(State(state): State<AppState>) -> Result<Json<AllCsvResponse>, AppError> {
    let list = state.registry.list_all().await.map_err(internal)?;
    Ok(Json(AllCsvResponse {
        latest: list.last().cloned(),
        list,
    }))
}

// ============ GET /get-csv/{file} and /get-last-csv ============

async fn handle_get_csv(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, AppError> {
    serve_csv(&state, &file).await
}

async fn handle_last_csv(State(state): State<AppState>) -> Result<Response, AppError> {
    let file = state.current_key();
    serve_csv(&state, &file).await
}

/// Streams the CSV as an attachment if `file` is a registered day key.
async fn serve_csv(state: &AppState, file: &str) -> Result<Response, AppError> {
    let registered = state.registry.exists(file).await.map_err(internal)?;
    if !registered {
        return Ok(not_found_csv(file));
    }

    let path = csv_path(&state.output_dir, file);
    let csv = tokio::fs::File::open(&path)
        .await
        .map_err(|e| internal(anyhow::anyhow!("Failed to open {}: {}", path.display(), e)))?;
    let body = Body::from_stream(ReaderStream::new(csv));

    let headers = [
        (CONTENT_TYPE, "text/csv".to_string()),
        (
            CONTENT_DISPOSITION,
            format!("attachment; filename={}", file_name_for(file)),
        ),
    ];
    Ok((StatusCode::OK, headers, body).into_response())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
