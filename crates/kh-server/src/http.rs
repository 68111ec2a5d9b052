//! HTTP/WebSocket surface (§6): the axum router, one handler per route,
//! and the WebSocket control-channel loop that bridges a connected agent's
//! socket to the scheduler actor.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use kh_db::{agents, artifacts, claim_codes, devices, jobs, DbError, DbPool};
use kh_ids::{AgentId, ArtifactDigest, HashlistId, JobId};
use kh_protocol::http::{
    AttackSpec, CaBundle, DeviceKindDto, HealthResponse, JobView, RegisterError, RegisterRequest,
    RegisterResponse, SubmitJobRequest, SubmitJobResponse,
};
use kh_protocol::Frame;
use kh_security::secret;
use kh_store::{ByteRange, FileStore};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::aggregator::{self, Potfile};
use crate::credential_issuer::ClientCredentialIssuer;
use crate::error::{Result, ServerError};
use crate::registry::AgentRegistry;
use crate::scheduler::SchedulerHandle;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub registry: Arc<AgentRegistry>,
    pub scheduler: SchedulerHandle,
    pub store: Arc<FileStore>,
    pub potfile: Arc<Potfile>,
    pub credential_issuer: Arc<dyn ClientCredentialIssuer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/healthz", get(healthz))
        .route("/api/agent/register", post(register_agent))
        .route("/api/agent/channel", get(agent_channel))
        .route("/api/artifacts/:digest", get(get_artifact))
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/:id", get(get_job).post(job_action))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ---------------------------------------------------------------------
// POST /api/agent/register
// ---------------------------------------------------------------------

async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    let now = Utc::now();
    let api_key = secret::generate_secret();
    let api_key_hash = secret::hash_secret(&api_key);
    let display_name = format!("agent ({})", req.hardware.agent_version);

    let redemption = match claim_codes::redeem(&state.pool, &req.claim_code, &api_key_hash, &display_name, now).await {
        Ok(r) => r,
        Err(DbError::Conflict(reason)) => {
            let status = if reason == "code_invalid_or_revoked" {
                StatusCode::UNAUTHORIZED
            } else {
                StatusCode::CONFLICT
            };
            return (status, Json(RegisterError { reason })).into_response();
        }
        Err(e) => return ServerError::from(e).into_response(),
    };

    let db_devices: Vec<devices::Device> = req
        .hardware
        .devices
        .iter()
        .map(|d| devices::Device {
            agent_id: redemption.agent_id,
            device_index: d.device_index,
            name: d.name.clone(),
            kind: device_kind_dto_to_db(d.kind),
            enabled: d.enabled,
        })
        .collect();
    if let Err(e) = devices::upsert_report(&state.pool, redemption.agent_id, &db_devices).await {
        return ServerError::from(e).into_response();
    }

    info!(agent_id = %redemption.agent_id, "agent enrolled");

    let ca_bundle: CaBundle = state.credential_issuer.issue(redemption.agent_id);
    Json(RegisterResponse {
        agent_id: redemption.agent_id,
        api_key,
        ca_bundle,
    })
    .into_response()
}

fn device_kind_dto_to_db(kind: DeviceKindDto) -> devices::DeviceKind {
    match kind {
        DeviceKindDto::Cpu => devices::DeviceKind::Cpu,
        DeviceKindDto::GpuNvidia => devices::DeviceKind::GpuNvidia,
        DeviceKindDto::GpuAmd => devices::DeviceKind::GpuAmd,
        DeviceKindDto::GpuIntel => devices::DeviceKind::GpuIntel,
    }
}

fn device_kind_dto_as_str(kind: DeviceKindDto) -> &'static str {
    match kind {
        DeviceKindDto::Cpu => "cpu",
        DeviceKindDto::GpuNvidia => "gpu-nvidia",
        DeviceKindDto::GpuAmd => "gpu-amd",
        DeviceKindDto::GpuIntel => "gpu-intel",
    }
}

// ---------------------------------------------------------------------
// GET /api/agent/channel (WebSocket upgrade)
// ---------------------------------------------------------------------

/// The channel requires a valid client credential whose subject matches a
/// known agent_id and an Authorization header carrying the api-key; both
/// must validate (§4.2). Client-cert subject matching belongs to the injected
/// TLS layer (Non-goal, §1); this boundary validates the `X-Agent-Id` /
/// `Authorization: Bearer <api_key>` half, which is the part this core
/// owns.
async fn authenticate_agent(pool: &DbPool, headers: &HeaderMap) -> Result<AgentId> {
    let agent_id: AgentId = headers
        .get("x-agent-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(AgentId::new)
        .ok_or_else(|| ServerError::AuthFailure("missing or invalid X-Agent-Id".into()))?;

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ServerError::AuthFailure("missing Authorization header".into()))?;

    let agent = agents::get(pool, agent_id)
        .await
        .map_err(|_| ServerError::AuthFailure("unknown agent".into()))?;

    if !secret::verify_secret(presented, &agent.api_key_hash) {
        return Err(ServerError::AuthFailure("api key mismatch".into()));
    }

    Ok(agent_id)
}

async fn agent_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let agent_id = match authenticate_agent(&state.pool, &headers).await {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, agent_id))
}

async fn handle_agent_socket(socket: WebSocket, state: AppState, agent_id: AgentId) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Frame>();

    state.registry.connect(agent_id, tx, Utc::now()).await;
    state.scheduler.agent_connected(agent_id);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(text) = frame.to_json() else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match Frame::from_json(&text) {
                Ok(frame) => state.scheduler.agent_frame(agent_id, frame),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "malformed control frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "control channel read error");
                break;
            }
        }
    }

    state.registry.disconnect(agent_id).await;
    state.scheduler.agent_disconnected(agent_id);
    writer.abort();
}

// ---------------------------------------------------------------------
// GET /api/artifacts/{digest} (Range-capable)
// ---------------------------------------------------------------------

async fn get_artifact(
    State(state): State<AppState>,
    Path(digest_str): Path<String>,
    headers: HeaderMap,
) -> Response {
    let digest = match ArtifactDigest::from_hex(digest_str) {
        Ok(d) => d,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let artifact = match artifacts::get(&state.pool, &digest).await {
        Ok(a) => a,
        Err(e) => return ServerError::from(e).into_response(),
    };

    let kind = artifact_kind_to_store(artifact.kind);
    let range = match headers.get(axum::http::header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(raw) => match parse_range_header(raw) {
            Some(r) => Some(r),
            None => return StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        },
        None => None,
    };

    let ranged = match state.store.read_range(kind, &digest, range).await {
        Ok(r) => r,
        Err(kh_store::FileStoreError::NotFound(_)) => return StatusCode::NOT_FOUND.into_response(),
        Err(kh_store::FileStoreError::InvalidRange) => {
            return StatusCode::RANGE_NOT_SATISFIABLE.into_response()
        }
        Err(e) => {
            warn!(error = %e, "artifact read failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let is_partial = range.is_some();
    let mut response = if is_partial {
        let end = ranged.range_start + ranged.data.len() as u64;
        (
            StatusCode::PARTIAL_CONTENT,
            [(
                axum::http::header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", ranged.range_start, end.saturating_sub(1), ranged.total_size),
            )],
            ranged.data,
        )
            .into_response()
    } else {
        (StatusCode::OK, ranged.data).into_response()
    };
    response
        .headers_mut()
        .insert(axum::http::header::ACCEPT_RANGES, "bytes".parse().unwrap());
    response
}

fn artifact_kind_to_store(kind: artifacts::ArtifactKind) -> kh_store::ArtifactKind {
    match kind {
        artifacts::ArtifactKind::Binary => kh_store::ArtifactKind::Binary,
        artifacts::ArtifactKind::Wordlist => kh_store::ArtifactKind::Wordlist,
        artifacts::ArtifactKind::Rule => kh_store::ArtifactKind::Rule,
        artifacts::ArtifactKind::Hashlist => kh_store::ArtifactKind::Hashlist,
    }
}

/// Parse a single-range `Range: bytes=start-[end]` header (§4.6, §6). Only
/// the one-range form is supported; multi-range requests are rejected by
/// the caller falling back to `RANGE_NOT_SATISFIABLE`.
fn parse_range_header(raw: &str) -> Option<ByteRange> {
    let spec = raw.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;
    let start: u64 = start_str.trim().parse().ok()?;
    let end = if end_str.trim().is_empty() {
        None
    } else {
        Some(end_str.trim().parse().ok()?)
    };
    Some(ByteRange { start, end })
}

// ---------------------------------------------------------------------
// POST /api/jobs
// ---------------------------------------------------------------------

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> Response {
    let attack_spec_value = match serde_json::to_value(&req.attack_spec) {
        Ok(v) => v,
        Err(e) => return ServerError::from(kh_protocol::ProtocolError::from(e)).into_response(),
    };
    let device_kinds: Vec<String> = req
        .device_kinds
        .iter()
        .map(|k| device_kind_dto_as_str(*k).to_string())
        .collect();

    let result = state
        .scheduler
        .submit_job(
            HashlistId::new(req.hashlist_id),
            attack_spec_value,
            req.keyspace_total,
            req.priority,
            device_kinds,
            None,
        )
        .await;

    match result {
        Ok(job_id) => Json(SubmitJobResponse { job_id }).into_response(),
        Err(e) => e.into_response(),
    }
}

// ---------------------------------------------------------------------
// GET /api/jobs/{id}, POST /api/jobs/{id}:cancel
// ---------------------------------------------------------------------

async fn get_job(State(state): State<AppState>, Path(raw_id): Path<String>) -> Response {
    let job_id = match parse_job_id(&raw_id) {
        Some(id) => id,
        None => return StatusCode::BAD_REQUEST.into_response(),
    };

    let job = match jobs::get(&state.pool, job_id).await {
        Ok(j) => j,
        Err(e) => return ServerError::from(e).into_response(),
    };
    let task_rollup = match aggregator::task_rollup(&state.pool, job_id).await {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    Json(JobView {
        job_id: job.id,
        hashlist_id: job.hashlist_id.as_u64(),
        status: job_status_as_str(job.status).to_string(),
        priority: job.priority,
        created_at: job.created_at,
        task_rollup,
    })
    .into_response()
}

/// `POST /api/jobs/{id}:cancel` — the colon-suffixed action verb from §6
/// doesn't map onto axum's path-segment capture syntax, so the whole
/// `{id}:cancel` segment is captured as one string and split here.
async fn job_action(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let Some((id_part, action)) = raw.split_once(':') else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if action != "cancel" {
        return StatusCode::NOT_FOUND.into_response();
    }
    let job_id = match parse_job_id(id_part) {
        Some(id) => id,
        None => return StatusCode::BAD_REQUEST.into_response(),
    };

    match state.scheduler.cancel_job(job_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => e.into_response(),
    }
}

fn parse_job_id(raw: &str) -> Option<JobId> {
    raw.split(':').next()?.parse::<u64>().ok().map(JobId::new)
}

fn job_status_as_str(status: jobs::JobStatus) -> &'static str {
    match status {
        jobs::JobStatus::Queued => "queued",
        jobs::JobStatus::Running => "running",
        jobs::JobStatus::Paused => "paused",
        jobs::JobStatus::Completed => "completed",
        jobs::JobStatus::Failed => "failed",
        jobs::JobStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_parses_open_ended_and_bounded_forms() {
        let bounded = parse_range_header("bytes=0-99").unwrap();
        assert_eq!(bounded.start, 0);
        assert_eq!(bounded.end, Some(99));

        let open = parse_range_header("bytes=100-").unwrap();
        assert_eq!(open.start, 100);
        assert_eq!(open.end, None);

        assert!(parse_range_header("bytes=0-10,20-30").is_none());
        assert!(parse_range_header("not-bytes=0-10").is_none());
    }

    #[test]
    fn job_action_segment_splits_id_from_verb() {
        assert_eq!(parse_job_id("42:cancel"), Some(JobId::new(42)));
        assert_eq!(parse_job_id("42"), Some(JobId::new(42)));
        assert_eq!(parse_job_id("not-a-number"), None);
    }
}
