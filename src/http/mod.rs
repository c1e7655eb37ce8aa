//! Convenience HTTP endpoint.
//!
//! `POST /run-code` runs one job synchronously on this host, bypassing the
//! shared store. Code comes from a multipart `file` upload or a `code` field
//! (multipart, JSON or urlencoded form). `GET /api/hosts` lists the hosts
//! currently advertising resources.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::resources::{GpuInfo, HostResourceRecord};
use crate::sandbox::{ResourceLimits, SandboxExecutor};
use crate::store::SharedState;

#[derive(Clone)]
pub struct HttpState {
    pub executor: SandboxExecutor,
    pub state: SharedState,
    /// Limits for every job run through `/run-code`
    pub limits: ResourceLimits,
    /// Age after which an advertised host is reported stale
    pub host_ttl: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct RunCodeForm {
    code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunCodeResponse {
    pub output: String,
}

#[derive(Serialize)]
struct HostResponse {
    host_id: String,
    cpu_count: u32,
    ram_bytes: u64,
    gpu_list: Vec<GpuInfo>,
    observed_at: String,
    stale: bool,
}

impl HostResponse {
    fn from_record(record: HostResourceRecord, ttl: Duration) -> Self {
        let stale = record.is_stale(Utc::now(), ttl);
        Self {
            host_id: record.host_id,
            cpu_count: record.cpu_count,
            ram_bytes: record.ram_bytes,
            gpu_list: record.gpu_list,
            observed_at: record.observed_at.to_rfc3339(),
            stale,
        }
    }
}

pub fn router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/run-code", post(run_code_handler))
        .route("/api/hosts", get(list_hosts_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the endpoint until `shutdown` is cancelled.
pub async fn run_http(addr: SocketAddr, state: HttpState, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting HTTP endpoint");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP endpoint");
            return;
        }
    };

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    if let Err(e) = result {
        tracing::error!(error = %e, "HTTP endpoint failed");
    }
}

fn reply(status: StatusCode, output: impl Into<String>) -> (StatusCode, Json<RunCodeResponse>) {
    (
        status,
        Json(RunCodeResponse {
            output: output.into(),
        }),
    )
}

async fn run_code_handler(State(state): State<HttpState>, request: Request) -> impl IntoResponse {
    let code = match extract_code(request).await {
        Ok(Some(code)) => code,
        Ok(None) => return reply(StatusCode::BAD_REQUEST, "No code provided"),
        Err(message) => return reply(StatusCode::BAD_REQUEST, message),
    };

    let result = state.executor.execute(&code, state.limits).await;

    match result.error {
        None => reply(StatusCode::OK, result.output),
        Some(message) => {
            tracing::error!(error = %message, "Error during /run-code execution");
            reply(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }
}

/// Pull the code out of a multipart, JSON or urlencoded body. An uploaded
/// `file` wins over a `code` field. Empty code counts as none.
async fn extract_code(request: Request) -> Result<Option<String>, String> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let code = if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| e.body_text())?;

        let mut file = None;
        let mut field_code = None;
        while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
            let name = field.name().map(str::to_owned);
            match name.as_deref() {
                Some("file") => file = Some(field.text().await.map_err(|e| e.body_text())?),
                Some("code") => field_code = Some(field.text().await.map_err(|e| e.body_text())?),
                _ => {}
            }
        }
        file.filter(|f| !f.is_empty()).or(field_code)
    } else if content_type.starts_with("application/json") {
        let Json(form) = Json::<RunCodeForm>::from_request(request, &())
            .await
            .map_err(|e| e.body_text())?;
        form.code
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(form) = Form::<RunCodeForm>::from_request(request, &())
            .await
            .map_err(|e| e.body_text())?;
        form.code
    } else {
        None
    };

    Ok(code.filter(|c| !c.is_empty()))
}

async fn list_hosts_handler(State(state): State<HttpState>) -> impl IntoResponse {
    match state.state.list_resources().await {
        Ok(records) => {
            let hosts: Vec<HostResponse> = records
                .into_iter()
                .map(|record| HostResponse::from_record(record, state.host_ttl))
                .collect();
            (StatusCode::OK, Json(serde_json::json!(hosts)))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}
