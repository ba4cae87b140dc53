//! RPC method dispatch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use crate::context::AppContext;
use crate::core::certificate::CertificateDocument;
use crate::core::error::WipeError;
use crate::core::ledger::ExternalCertificate;
use crate::core::orchestrator;
use crate::core::sanitizer::SanitizerBackend;

use super::protocol::{Request, Response};

const DEFAULT_JOB_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub devices: usize,
    pub active_jobs: usize,
    pub certificates: u64,
    pub chain_valid: bool,
    pub rpc_bind: String,
    pub http_bind: String,
    pub simulation: bool,
    pub backend: SanitizerBackend,
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
struct SubmitParams {
    device_ids: Vec<String>,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Deserialize)]
struct CertificateParams {
    certificate_id: String,
}

#[derive(Deserialize)]
struct CodeParams {
    code: String,
}

#[derive(Deserialize)]
struct DeviceParams {
    device_id: String,
    /// `"text"` returns the printable rendering instead of the document.
    #[serde(default)]
    format: Option<String>,
}

#[derive(Deserialize, Default)]
struct ListParams {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submitted {
    pub job_id: String,
}

pub struct MethodHandler {
    ctx: AppContext,
    start_time: Instant,
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id).await,
            "devices.list" => Response::success(id, self.ctx.registry.list().await),
            "devices.get" => match parse::<IdParams>(params) {
                Ok(p) => respond(id, self.ctx.registry.get(&p.id).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "devices.rearm" => match parse::<IdParams>(params) {
                Ok(p) => respond(id, self.ctx.coordinator.rearm_device(&p.id).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "devices.history" => match parse::<IdParams>(params) {
                Ok(p) => respond(id, orchestrator::device_history(&self.ctx, &p.id).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "devices.statistics" => respond(id, orchestrator::statistics(&self.ctx).await),
            "devices.rescan" => match orchestrator::rescan(&self.ctx).await {
                Ok(report) => Response::success(id, report),
                Err(e) => Response::internal_error(id, format!("{:#}", e)),
            },
            "jobs.submit" => match parse::<SubmitParams>(params) {
                Ok(p) => respond(
                    id,
                    self.ctx
                        .coordinator
                        .submit_job(&p.device_ids, p.method.as_deref())
                        .await
                        .map(|job_id| Submitted { job_id }),
                ),
                Err(e) => Response::invalid_params(id, e),
            },
            "jobs.get" => match parse::<IdParams>(params) {
                Ok(p) => respond(id, self.ctx.coordinator.get_job(&p.id).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "jobs.list" => match parse_optional::<ListParams>(params) {
                Ok(p) => respond(
                    id,
                    self.ctx
                        .coordinator
                        .list_jobs(p.limit.unwrap_or(DEFAULT_JOB_LIMIT))
                        .await,
                ),
                Err(e) => Response::invalid_params(id, e),
            },
            "jobs.cancel" => match parse::<IdParams>(params) {
                Ok(p) => respond(id, self.ctx.coordinator.cancel_job(&p.id).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "jobs.history" => match parse::<IdParams>(params) {
                Ok(p) => respond(id, self.ctx.coordinator.history(&p.id).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "ledger.chain" => respond(id, self.ctx.ledger.get_chain().await),
            "ledger.status" => respond(id, self.ctx.ledger.status().await),
            "ledger.upload" => match parse::<ExternalCertificate>(params) {
                Ok(upload) => respond(id, self.ctx.ledger.submit_external(upload).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "ledger.verify" => match parse::<CertificateParams>(params) {
                Ok(p) => respond(id, self.ctx.ledger.verify(&p.certificate_id).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "ledger.verify_code" => match parse::<CodeParams>(params) {
                Ok(p) => respond(id, self.ctx.ledger.verify_code(&p.code).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "certificates.latest" => match parse::<DeviceParams>(params) {
                Ok(p) => {
                    let document = CertificateDocument::for_device(&self.ctx.ledger, &p.device_id).await;
                    match p.format.as_deref() {
                        Some("text") => respond(id, document.map(|d| d.render_text())),
                        _ => respond(id, document),
                    }
                }
                Err(e) => Response::invalid_params(id, e),
            },
            _ => Response::method_not_found(id, &request.method),
        }
    }

    async fn daemon_status(&self, id: Value) -> Response {
        let ledger = match self.ctx.ledger.status().await {
            Ok(status) => status,
            Err(e) => return Response::wipe_error(id, &e),
        };

        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.start_time.elapsed().as_secs(),
                devices: self.ctx.registry.len().await,
                active_jobs: self.ctx.coordinator.active_jobs().await,
                certificates: ledger.total_certificates,
                chain_valid: ledger.chain_valid,
                rpc_bind: self.ctx.config.rpc_bind.clone(),
                http_bind: self.ctx.config.http_bind.clone(),
                simulation: self.ctx.config.simulation,
                backend: self.ctx.config.effective_backend(),
            },
        )
    }
}

fn respond<T: Serialize>(id: Value, result: Result<T, WipeError>) -> Response {
    match result {
        Ok(value) => Response::success(id, value),
        Err(e) => Response::wipe_error(id, &e),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| e.to_string())
}

fn parse_optional<T: DeserializeOwned + Default>(params: Value) -> Result<T, String> {
    if params.is_null() {
        return Ok(T::default());
    }
    parse(params)
}
