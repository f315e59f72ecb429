//! HTTP endpoints
//!
//! Routes map one-to-one onto engine operations; errors carry the status
//! code from the shared taxonomy.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use dealership_core::{Error, HealthStatus, IngestRequest, QueryRequest, SourceType};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Upload cap for multipart ingestion (100 MiB)
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;
const ALLOWED_UPLOAD_EXTENSIONS: [&str; 6] = ["pdf", "txt", "csv", "json", "docx", "md"];

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(query))
        .route("/ingest", post(ingest))
        .route("/ingest/file", post(ingest_file))
        .route("/namespace/:namespace", delete(clear_namespace))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map engine errors onto HTTP responses
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({ "detail": self.0.to_string() }));
        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.engine.process_query(request).await?;
    Ok(Json(response))
}

async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.engine.ingest(request).await?;
    Ok(Json(response))
}

/// Multipart upload: the file is staged to disk and run through the
/// file ingestion path.
async fn ingest_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(Error::Validation(format!("invalid multipart body: {e}"))))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError(Error::Validation("missing file name".to_string())))?;

        let extension = file_name
            .rsplit('.')
            .next()
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !ALLOWED_UPLOAD_EXTENSIONS.contains(&extension.as_str()) {
            return Err(ApiError(Error::Validation(format!(
                "unsupported file type .{extension}"
            ))));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError(Error::Validation(format!("failed to read upload: {e}"))))?;

        let staging = tempfile::Builder::new()
            .suffix(&format!(".{extension}"))
            .tempfile()
            .map_err(|e| ApiError(Error::Internal(format!("failed to stage upload: {e}"))))?;
        tokio::fs::write(staging.path(), &bytes)
            .await
            .map_err(|e| ApiError(Error::Internal(format!("failed to stage upload: {e}"))))?;

        let request = IngestRequest {
            source_type: SourceType::File,
            source_identifier: Some(staging.path().display().to_string()),
            content: None,
            metadata: [("original_filename".to_string(), json!(file_name))]
                .into_iter()
                .collect(),
            namespace: None,
        };

        let response = state.engine.ingest(request).await?;
        return Ok(Json(response));
    }

    Err(ApiError(Error::Validation(
        "multipart body had no `file` field".to_string(),
    )))
}

async fn clear_namespace(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.clear_namespace(&namespace).await?;
    Ok(Json(json!({ "success": true, "namespace": namespace })))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.engine.health().await;
    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}

/// Prometheus scrape endpoint: recorder output plus breaker gauges
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.prometheus.render();
    body.push('\n');
    body.push_str(&state.engine.breaker_metrics());
    body.push('\n');
    body
}
