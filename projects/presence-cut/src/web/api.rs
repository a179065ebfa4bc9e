use crate::error::{ErrorKind, PipelineError};
use crate::pipeline::orchestrator::PipelineResult;
use crate::pipeline::sampler::SamplerConfig;
use crate::pipeline::segments::RemovedSpan;
use crate::run_context::resolve_artifact;
use crate::web::AppState;
use axum::body::Body;
use axum::extract::{Multipart, Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("file not found")]
    NotFound,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Pipeline(e) => match e.kind() {
                ErrorKind::Config | ErrorKind::NoSubject | ErrorKind::NoSubjectInWindow => {
                    StatusCode::BAD_REQUEST
                }
                ErrorKind::Source => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::Cancelled => StatusCode::GATEWAY_TIMEOUT,
                ErrorKind::Detection | ErrorKind::Splice | ErrorKind::Internal => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        Self::Pipeline(e.into())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    kind: ErrorKind,
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            ApiError::NotFound => (
                status,
                Json(serde_json::json!({ "error": "file not found" })),
            )
                .into_response(),
            ApiError::BadRequest(detail) => (
                status,
                Json(ErrorResponse {
                    kind: ErrorKind::Config,
                    detail,
                }),
            )
                .into_response(),
            ApiError::Pipeline(e) => {
                if e.is_validation() {
                    info!("Rejected upload: {}", e);
                } else {
                    tracing::error!("Request failed: {}", e);
                }
                (
                    status,
                    Json(ErrorResponse {
                        kind: e.kind(),
                        detail: e.to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ProcessResponse {
    pub result_video: String,
    pub removed_segments: Vec<RemovedSpan>,
    pub duration: f64,
    pub presence: Vec<bool>,
}

impl From<PipelineResult> for ProcessResponse {
    fn from(result: PipelineResult) -> Self {
        Self {
            result_video: format!("/download/{}", result.artifact.name),
            removed_segments: result.removed_segments,
            duration: result.duration,
            presence: result.presence,
        }
    }
}

/// Extension kept for the stored upload; anything unusual becomes `mp4`.
fn sanitized_extension(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| std::path::Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "mp4".to_string())
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid value for {}: {:?}", name, value)))
}

/// `POST /process_video/`: multipart upload of `file` plus optional
/// `min_area_ratio`, `max_area_ratio` and `skip_frames`.
pub async fn process_video_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<ProcessResponse>, ApiError> {
    let mut config = SamplerConfig::default();
    let mut upload: Option<tempfile::NamedTempFile> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                // Stored under a generated name; the client's path is never used
                let tmp = tempfile::Builder::new()
                    .prefix("upload-")
                    .suffix(&format!(".{}", sanitized_extension(field.file_name())))
                    .tempfile_in(&state.upload_root)?;
                let mut file = tokio::fs::File::from_std(tmp.reopen()?);
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?
                {
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                upload = Some(tmp);
            }
            "min_area_ratio" | "max_area_ratio" | "skip_frames" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                match name.as_str() {
                    "min_area_ratio" => config.min_area_ratio = parse_field(&name, &value)?,
                    "max_area_ratio" => config.max_area_ratio = parse_field(&name, &value)?,
                    _ => config.stride = parse_field(&name, &value)?,
                }
            }
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }

    let upload = upload.ok_or_else(|| ApiError::bad_request("missing multipart field 'file'"))?;
    config.validate()?;

    let (ctx, run_state) = state.engine.prepare(None)?;
    info!(
        "Run {}: processing upload {} (stride {}, window [{}, {}])",
        ctx.run_id,
        upload.path().display(),
        config.stride,
        config.min_area_ratio,
        config.max_area_ratio
    );

    let result = state
        .engine
        .process(ctx, run_state, upload.path().to_path_buf(), config)
        .await;
    drop(upload);

    Ok(Json(ProcessResponse::from(result?)))
}

/// `GET /download/:filename`: a previously published artifact.
pub async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let path = resolve_artifact(&state.engine.args().results_root, &filename)
        .ok_or(ApiError::NotFound)?;

    let mut response = ServeFile::new(&path)
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {})
        .map(Body::new);

    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename)) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
