//! HTTP surface DTOs (§6), shared between `kh-server`'s route handlers and
//! `kh-agent`'s enrollment client / any future CLI client.

use chrono::{DateTime, Utc};
use kh_ids::{AgentId, JobId};
use serde::{Deserialize, Serialize};

/// `POST /api/agent/register` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub claim_code: String,
    pub hardware: HardwareReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareReport {
    pub agent_version: String,
    pub devices: Vec<DeviceReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device_index: i64,
    pub name: String,
    pub kind: DeviceKindDto,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKindDto {
    Cpu,
    GpuNvidia,
    GpuAmd,
    GpuIntel,
}

/// `POST /api/agent/register` success response (200). The api-key is
/// returned exactly once (§4.1): the server stores only its hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: AgentId,
    pub api_key: String,
    pub ca_bundle: CaBundle,
}

/// The client credential bundle produced by the external TLS provider,
/// keyed on `agent_id` (§4.1). This crate only carries the shape; issuance
/// itself is outside the core (Non-goals, §1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaBundle {
    pub client_cert_pem: String,
    pub client_key_pem: String,
    pub ca_cert_pem: String,
}

/// `POST /api/agent/register` failure body (401/409).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterError {
    pub reason: String,
}

/// `POST /api/jobs` request body.
///
/// `keyspace_total` is supplied by the submitting client, which already
/// knows the attack's total keyspace `K` from having sized it locally
/// (the same number a `hashcat --keyspace` dry run reports) -- the
/// planner (§4.3) needs `K` up front to produce task ranges and has no
/// way to derive it from `attack_spec` alone without running hashcat
/// itself, which is server-side out of scope (§1 Non-goals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub hashlist_id: u64,
    pub attack_spec: AttackSpec,
    pub keyspace_total: u64,
    #[serde(default)]
    pub priority: i64,
    pub device_kinds: Vec<DeviceKindDto>,
}

/// How to explore the keyspace (GLOSSARY: "Attack spec").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AttackSpec {
    Straight {
        wordlist_digests: Vec<String>,
        rule_digests: Vec<String>,
    },
    Mask {
        mask: String,
    },
    Hybrid {
        wordlist_digests: Vec<String>,
        mask: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

/// `GET /api/jobs/{id}` response: job plus a task rollup (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub hashlist_id: u64,
    pub status: String,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub task_rollup: TaskRollup,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskRollup {
    pub total: u64,
    pub pending: u64,
    pub assigned: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub keyspace_total: u64,
    pub keyspace_processed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
