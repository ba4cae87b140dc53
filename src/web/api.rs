use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use super::WebState;
use crate::core::certificate::CertificateDocument;
use crate::core::error::WipeError;
use crate::core::ledger::ExternalCertificate;
use crate::core::orchestrator;

/// Error body: `{"error": <message>, "code": <identifier>}`.
#[derive(Debug)]
pub enum ApiError {
    Wipe(WipeError),
    Internal(anyhow::Error),
}

impl From<WipeError> for ApiError {
    fn from(err: WipeError) -> Self {
        Self::Wipe(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

pub fn status_for(err: &WipeError) -> StatusCode {
    match err {
        WipeError::DeviceNotFound(_) | WipeError::JobNotFound(_) | WipeError::CertificateNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        WipeError::DeviceBusy(_)
        | WipeError::InvalidDevice { .. }
        | WipeError::Cancelled { .. }
        | WipeError::DuplicateCertificate(_) => {
            StatusCode::CONFLICT
        }
        WipeError::DeviceNotWipeable(_)
        | WipeError::UnknownMethod { .. }
        | WipeError::EmptySelection
        | WipeError::CertificateRejected { .. } => {
            StatusCode::BAD_REQUEST
        }
        WipeError::HardwareIo { .. } | WipeError::ChainIntegrity { .. } | WipeError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        WipeError::ConnectionLost(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            Self::Wipe(err) => {
                if !err.is_rejection() {
                    warn!(code = err.code(), error = %err, "Request failed");
                }
                (status_for(&err), err.to_string(), err.code())
            }
            Self::Internal(err) => {
                error!(error = %format!("{:#}", err), "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err), "internal_error")
            }
        };
        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn list_drives(State(state): State<WebState>) -> impl IntoResponse {
    Json(state.ctx.registry.list().await)
}

pub async fn get_drive(State(state): State<WebState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ctx.registry.get(&id).await?))
}

pub async fn rearm_drive(State(state): State<WebState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ctx.coordinator.rearm_device(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct WipeBody {
    #[serde(default, alias = "wipe_method")]
    pub method: Option<String>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
}

pub async fn wipe_drive(
    State(state): State<WebState>,
    Path(device_id): Path<String>,
    body: Option<Json<WipeBody>>,
) -> ApiResult<impl IntoResponse> {
    let method = body.and_then(|Json(b)| b.method);
    let job_id = state
        .ctx
        .coordinator
        .start_device_wipe(&device_id, method.as_deref())
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            job_id,
            device_id: Some(device_id),
        }),
    ))
}

pub async fn rescan(State(state): State<WebState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(orchestrator::rescan(&state.ctx).await?))
}

pub async fn device_history(State(state): State<WebState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(orchestrator::device_history(&state.ctx, &id).await?))
}

pub async fn device_statistics(State(state): State<WebState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(orchestrator::statistics(&state.ctx).await?))
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub device_ids: Vec<String>,
    #[serde(default, alias = "wipe_method")]
    pub method: Option<String>,
}

pub async fn submit_job(
    State(state): State<WebState>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<impl IntoResponse> {
    let job_id = state
        .ctx
        .coordinator
        .submit_job(&body.device_ids, body.method.as_deref())
        .await?;

    Ok((StatusCode::ACCEPTED, Json(Accepted { job_id, device_id: None })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<WebState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ctx.coordinator.list_jobs(query.limit.unwrap_or(50)).await?))
}

pub async fn get_job(State(state): State<WebState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ctx.coordinator.get_job(&id).await?))
}

pub async fn cancel_job(State(state): State<WebState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ctx.coordinator.cancel_job(&id).await?))
}

pub async fn job_history(State(state): State<WebState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ctx.coordinator.history(&id).await?))
}

/// The whole ledger; a broken chain is an error, never a partial listing.
pub async fn blockchain(State(state): State<WebState>) -> ApiResult<impl IntoResponse> {
    let chain = state.ctx.ledger.get_chain().await?;
    let status = state.ctx.ledger.status().await?;
    Ok(Json(json!({ "status": status, "chain": chain })))
}

pub async fn verify_certificate(
    State(state): State<WebState>,
    Path(certificate_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ctx.ledger.verify(&certificate_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CodeBody {
    pub code: String,
}

pub async fn verify_code(State(state): State<WebState>, Json(body): Json<CodeBody>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ctx.ledger.verify_code(&body.code).await?))
}

pub async fn upload_certificate(
    State(state): State<WebState>,
    Json(upload): Json<ExternalCertificate>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state.ctx.ledger.submit_external(upload).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(Debug, Deserialize)]
pub struct SyncBody {
    pub certificates: Vec<ExternalCertificate>,
}

pub async fn sync_certificates(State(state): State<WebState>, Json(body): Json<SyncBody>) -> impl IntoResponse {
    Json(state.ctx.ledger.sync_external(body.certificates).await)
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub format: Option<String>,
}

pub async fn download_certificate(
    State(state): State<WebState>,
    Path(device_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let document = CertificateDocument::for_device(&state.ctx.ledger, &device_id).await?;

    let (content_type, file_name, body) = match query.format.as_deref() {
        Some("text") | Some("txt") => (
            "text/plain; charset=utf-8",
            document.file_name("txt"),
            document.render_text(),
        ),
        _ => (
            "application/json",
            document.file_name("json"),
            serde_json::to_string_pretty(&document).map_err(anyhow::Error::from)?,
        ),
    };

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        body,
    )
        .into_response())
}
