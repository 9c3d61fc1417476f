// Copyright 2024 The Tempstash Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempstash_config::server::ServiceConfig;
use tempstash_error::{make_err, make_input_err, Code, Error};
use tempstash_util::buf_channel::make_buf_channel_pair;
use tempstash_util::file_record::{FileRecord, SearchFilter, UploadedFile};
use tower_http::trace::TraceLayer;
use tracing::{event, Level};

use crate::catalog::CatalogService;
use crate::ingest::IngestPipeline;
use crate::reaper::{ReapOutcome, Reaper};
use crate::url_fetcher::UrlFetcher;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogService>,
    pub ingest: Arc<IngestPipeline>,
    pub reaper: Arc<Reaper>,
    pub url_fetcher: Arc<UrlFetcher>,
    pub config: Arc<ServiceConfig>,
}

/// Handler-level error carrying the taxonomy [`Error`]. The response body
/// is rewritten by [`error_envelope`] so it also names the request path
/// and method.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        let mut response = status.into_response();
        response.extensions_mut().insert(self.0);
        response
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    status_code: u16,
    timestamp: DateTime<Utc>,
    path: String,
    method: String,
    message: String,
    error: String,
}

/// Middleware that turns an [`ApiError`] left in the response extensions
/// into the contractual JSON error envelope.
async fn error_envelope(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    let Some(err) = response.extensions().get::<Error>().cloned() else {
        return response;
    };
    let status = response.status();
    event!(Level::WARN, %method, %path, ?err, "Request failed");
    let body = ErrorBody {
        status_code: status.as_u16(),
        timestamp: Utc::now(),
        path,
        method,
        message: err.message_string(),
        error: status.canonical_reason().unwrap_or("Error").to_string(),
    };
    (status, Json(body)).into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileResponse {
    id: String,
    original_name: String,
    mime_type: String,
    size: u64,
    uploaded_at: DateTime<Utc>,
    ttl_mins: u64,
    expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<BTreeMap<String, Value>>,
    hash: String,
    is_expired: bool,
    time_remaining_mins: i64,
}

impl FileResponse {
    fn from_record(record: &FileRecord) -> Self {
        let now = Utc::now();
        FileResponse {
            id: record.id.clone(),
            original_name: record.original_name.clone(),
            mime_type: record.mime_type.clone(),
            size: record.size,
            uploaded_at: record.uploaded_at,
            ttl_mins: record.ttl_seconds / 60,
            expires_at: record.expires_at,
            metadata: if record.metadata.is_empty() {
                None
            } else {
                Some(record.metadata.clone())
            },
            hash: record.hash.clone(),
            is_expired: record.is_expired(now),
            time_remaining_mins: record.time_remaining_mins(now),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file: FileResponse,
    download_url: String,
    download_path: String,
    info_url: String,
    delete_url: String,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    file: FileResponse,
    download_url: String,
    delete_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    file_id: String,
    message: String,
    deleted_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExistsResponse {
    exists: bool,
    file_id: String,
    is_expired: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    files: Vec<FileResponse>,
    total: u64,
    pagination: Pagination,
}

#[derive(Serialize)]
struct Pagination {
    limit: usize,
    offset: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    stats: tempstash_util::file_record::StoreStats,
    generated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadByUrlRequest {
    url: String,
    ttl_mins: Option<u64>,
    metadata: Option<BTreeMap<String, Value>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SearchQuery {
    mime_type: Option<String>,
    min_size: Option<u64>,
    max_size: Option<u64>,
    uploaded_after: Option<DateTime<Utc>>,
    uploaded_before: Option<DateTime<Utc>>,
    expired_only: Option<bool>,
    limit: Option<usize>,
    offset: Option<usize>,
}

const DEFAULT_SEARCH_LIMIT: usize = 100;

pub fn make_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/files", post(upload_files).get(search_files))
        .route("/files/url", post(upload_from_url))
        .route("/files/stats", get(file_stats))
        .route("/files/:id", get(file_info).delete(delete_file))
        .route("/files/:id/exists", get(file_exists))
        .route("/maintenance/run", post(run_maintenance))
        .route("/cleanup/run", post(run_maintenance));
    let service = Router::new()
        .nest("/api/v1", api)
        .route("/download/:id", get(download_file))
        .route("/health", get(health));
    let service = match normalized_base_path(&state.config) {
        Some(base) => Router::new().nest(&base, service),
        None => service,
    };
    // Multipart parsing buffers per-field internally, so the transport
    // limit must cover the configured cap; the ingest counter enforces the
    // exact cap on payload bytes.
    let body_limit = usize::try_from(state.config.limits.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(1024 * 1024);
    service
        .layer(middleware::from_fn(error_envelope))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

fn normalized_base_path(config: &ServiceConfig) -> Option<String> {
    let base = config.base_path.as_deref()?.trim_matches('/');
    if base.is_empty() {
        return None;
    }
    Some(format!("/{base}"))
}

fn download_path(state: &AppState, id: &str) -> String {
    let base = normalized_base_path(&state.config).unwrap_or_default();
    format!("{base}/download/{id}")
}

fn absolute_download_url(state: &AppState, id: &str) -> String {
    let path = download_path(state, id);
    match state.config.download_base_url.as_deref() {
        Some(base) => format!("{}{path}", base.trim_end_matches('/')),
        None => path,
    }
}

fn info_path(state: &AppState, id: &str) -> String {
    let base = normalized_base_path(&state.config).unwrap_or_default();
    format!("{base}/api/v1/files/{id}")
}

fn build_upload_response(state: &AppState, record: &FileRecord) -> UploadResponse {
    UploadResponse {
        file: FileResponse::from_record(record),
        download_url: absolute_download_url(state, &record.id),
        download_path: download_path(state, &record.id),
        info_url: info_path(state, &record.id),
        delete_url: info_path(state, &record.id),
        message: "File uploaded successfully".to_string(),
    }
}

async fn upload_files(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));
    if is_multipart {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError(make_input_err!("Invalid multipart body: {e}")))?;
        upload_multipart(state, multipart).await
    } else {
        upload_raw(state, request).await
    }
}

/// Multipart uploads: `file` fields are ingested as they stream in, so
/// `ttlMins`/`metadata` only affect files that follow them in field order.
async fn upload_multipart(state: AppState, mut multipart: Multipart) -> Result<Response, ApiError> {
    let mut ttl_seconds = state.config.limits.default_ttl_seconds;
    let mut metadata: Option<BTreeMap<String, Value>> = None;
    let mut uploads: Vec<UploadResponse> = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(make_input_err!("Invalid multipart body: {e}")))?
    {
        match field.name() {
            Some("ttlMins") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError(make_input_err!("Invalid ttlMins field: {e}")))?;
                let mins = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| ApiError(make_input_err!("Invalid ttlMins value '{text}': {e}")))?;
                ttl_seconds = mins * 60;
            }
            Some("metadata") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError(make_input_err!("Invalid metadata field: {e}")))?;
                metadata = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| ApiError(make_input_err!("metadata must be a JSON object: {e}")))?,
                );
            }
            Some("file") => {
                let original_name = field
                    .file_name()
                    .filter(|name| !name.is_empty())
                    .unwrap_or("file")
                    .to_string();
                let declared_mime = field.content_type().map(str::to_string);

                let (mut tx, rx) = make_buf_channel_pair();
                let uploaded = UploadedFile {
                    original_name,
                    declared_mime,
                    size_hint: None,
                    reader: rx,
                };
                let ingest_fut = state.ingest.upload_file(uploaded, ttl_seconds, metadata.clone());
                let pump_fut = async {
                    while let Some(chunk) = field
                        .chunk()
                        .await
                        .map_err(|e| make_input_err!("Failed to read multipart chunk: {e}"))?
                    {
                        if chunk.is_empty() {
                            continue;
                        }
                        tx.send(chunk).await?;
                    }
                    tx.send_eof()?;
                    Result::<(), Error>::Ok(())
                };
                let (ingest_result, pump_result) = tokio::join!(ingest_fut, pump_fut);
                // The pump only fails when the ingest already gave up, so
                // the ingest error is the one worth reporting.
                let record = ingest_result.map_err(ApiError)?;
                let _ = pump_result;
                uploads.push(build_upload_response(&state, &record));
            }
            _ => {}
        }
    }

    if uploads.is_empty() {
        return Err(ApiError(make_input_err!(
            "Multipart body did not contain a 'file' field"
        )));
    }
    let response = match uploads.len() {
        1 => Json(uploads.swap_remove(0)).into_response(),
        _ => Json(uploads).into_response(),
    };
    Ok((StatusCode::CREATED, response).into_response())
}

/// Raw-body uploads carry their facts in headers: `x-file-name`,
/// `content-type`, `x-ttl-mins`, `x-metadata`.
async fn upload_raw(state: AppState, request: Request) -> Result<Response, ApiError> {
    let headers = request.headers().clone();
    let original_name = headers
        .get("x-file-name")
        .and_then(|value| value.to_str().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or("file")
        .to_string();
    let declared_mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let ttl_seconds = match headers.get("x-ttl-mins").and_then(|v| v.to_str().ok()) {
        Some(raw) => {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| ApiError(make_input_err!("Invalid x-ttl-mins value '{raw}': {e}")))?
                * 60
        }
        None => state.config.limits.default_ttl_seconds,
    };
    let metadata = match headers.get("x-metadata").and_then(|v| v.to_str().ok()) {
        Some(raw) => Some(
            serde_json::from_str(raw)
                .map_err(|e| ApiError(make_input_err!("x-metadata must be a JSON object: {e}")))?,
        ),
        None => None,
    };
    let size_hint = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|length| *length > 0);

    let (mut tx, rx) = make_buf_channel_pair();
    let uploaded = UploadedFile {
        original_name,
        declared_mime,
        size_hint,
        reader: rx,
    };
    let body_stream = request
        .into_body()
        .into_data_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let ingest_fut = state.ingest.upload_file(uploaded, ttl_seconds, metadata);
    let pump_fut = tx.forward(body_stream, true);
    let (ingest_result, pump_result) = tokio::join!(ingest_fut, pump_fut);
    let record = ingest_result.map_err(ApiError)?;
    let _ = pump_result;

    Ok((
        StatusCode::CREATED,
        Json(build_upload_response(&state, &record)),
    )
        .into_response())
}

async fn upload_from_url(
    State(state): State<AppState>,
    Json(body): Json<UploadByUrlRequest>,
) -> Result<Response, ApiError> {
    let ttl_seconds = body
        .ttl_mins
        .map(|mins| mins * 60)
        .unwrap_or(state.config.limits.default_ttl_seconds);
    let uploaded = state.url_fetcher.fetch(&body.url).await.map_err(ApiError)?;
    let record = state
        .ingest
        .upload_file(uploaded, ttl_seconds, body.metadata)
        .await
        .map_err(ApiError)?;
    Ok((
        StatusCode::CREATED,
        Json(build_upload_response(&state, &record)),
    )
        .into_response())
}

async fn file_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InfoResponse>, ApiError> {
    let record = state.catalog.get_info(&id).await?;
    Ok(Json(InfoResponse {
        file: FileResponse::from_record(&record),
        download_url: absolute_download_url(&state, &record.id),
        delete_url: info_path(&state, &record.id),
    }))
}

async fn search_files(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let filter = SearchFilter {
        mime_type: query.mime_type,
        min_size: query.min_size,
        max_size: query.max_size,
        uploaded_after: query.uploaded_after,
        uploaded_before: query.uploaded_before,
        expired_only: query.expired_only.unwrap_or(false),
        limit: Some(limit),
        offset: Some(offset),
    };
    let results = state.catalog.search(&filter).await?;
    Ok(Json(ListResponse {
        files: results.records.iter().map(FileResponse::from_record).collect(),
        total: results.total,
        pagination: Pagination { limit, offset },
    }))
}

async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted_at = state.catalog.delete(&id).await?;
    Ok(Json(DeleteResponse {
        file_id: id,
        message: "File deleted successfully".to_string(),
        deleted_at,
    }))
}

async fn file_exists(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExistsResponse>, ApiError> {
    let existence = state.catalog.existence(&id).await?;
    Ok(Json(ExistsResponse {
        exists: existence.exists,
        file_id: id,
        is_expired: existence.is_expired,
    }))
}

async fn file_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.catalog.stats().await?;
    Ok(Json(StatsResponse {
        stats,
        generated_at: Utc::now(),
    }))
}

async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (record, stream) = state.catalog.open_stream(&id).await?;
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, record.mime_type)
        .header(header::CONTENT_LENGTH, record.size)
        .header(
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate",
        )
        .body(Body::from_stream(stream))
        .map_err(|e| {
            ApiError(make_err!(
                Code::Internal,
                "Failed to build download response: {e}"
            ))
        })?;
    Ok(response)
}

/// Runs a cleanup batch synchronously: the request is held until the
/// batch completes. A run already in flight reports as skipped.
async fn run_maintenance(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let outcome = state.reaper.run_once().await?;
    let message = match outcome {
        ReapOutcome::Completed(summary) => format!(
            "Cleanup completed: {} files deleted, {} bytes freed",
            summary.deleted, summary.freed_bytes
        ),
        ReapOutcome::Skipped => "Cleanup already running, skipped".to_string(),
    };
    Ok(Json(serde_json::json!({
        "success": true,
        "message": message,
    })))
}

async fn health(State(state): State<AppState>) -> Response {
    if state.catalog.healthy().await {
        Json(serde_json::json!({ "status": "ok" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable" })),
        )
            .into_response()
    }
}
