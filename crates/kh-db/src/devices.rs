//! Per-agent compute devices (§3).

use kh_ids::AgentId;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{DbError, Result};
use crate::pool::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Cpu,
    GpuNvidia,
    GpuAmd,
    GpuIntel,
}

impl DeviceKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::GpuNvidia => "gpu-nvidia",
            Self::GpuAmd => "gpu-amd",
            Self::GpuIntel => "gpu-intel",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "cpu" => Self::Cpu,
            "gpu-nvidia" => Self::GpuNvidia,
            "gpu-amd" => Self::GpuAmd,
            "gpu-intel" => Self::GpuIntel,
            other => return Err(DbError::invalid_input(format!("unknown device kind: {other}"))),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct DeviceRow {
    agent_id: i64,
    device_index: i64,
    name: String,
    kind: String,
    enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub agent_id: AgentId,
    pub device_index: i64,
    pub name: String,
    pub kind: DeviceKind,
    pub enabled: bool,
}

impl TryFrom<DeviceRow> for Device {
    type Error = DbError;

    fn try_from(row: DeviceRow) -> Result<Self> {
        Ok(Self {
            agent_id: AgentId::new(row.agent_id as u64),
            device_index: row.device_index,
            name: row.name,
            kind: DeviceKind::parse(&row.kind)?,
            enabled: row.enabled,
        })
    }
}

/// Replace an agent's full device report (device_report frame, §4.2). This
/// is the standard shape hardware enumeration arrives in: a complete
/// snapshot per heartbeat/reconnect, not incremental deltas, so an upsert
/// per device plus stale-row deletion is the simplest correct model.
pub async fn upsert_report(pool: &DbPool, agent_id: AgentId, devices: &[Device]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM devices WHERE agent_id = ?")
        .bind(agent_id.as_u64() as i64)
        .execute(&mut *tx)
        .await?;

    for device in devices {
        sqlx::query(
            "INSERT INTO devices (agent_id, device_index, name, kind, enabled) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(agent_id.as_u64() as i64)
        .bind(device.device_index)
        .bind(&device.name)
        .bind(device.kind.as_str())
        .bind(device.enabled)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn list_for_agent(pool: &DbPool, agent_id: AgentId) -> Result<Vec<Device>> {
    let rows: Vec<DeviceRow> =
        sqlx::query_as("SELECT * FROM devices WHERE agent_id = ? ORDER BY device_index")
            .bind(agent_id.as_u64() as i64)
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(Device::try_from).collect()
}

pub async fn set_enabled(
    pool: &DbPool,
    agent_id: AgentId,
    device_index: i64,
    enabled: bool,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE devices SET enabled = ? WHERE agent_id = ? AND device_index = ?",
    )
    .bind(enabled)
    .bind(agent_id.as_u64() as i64)
    .bind(device_index)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found(format!(
            "device {device_index} on agent {agent_id}"
        )));
    }
    Ok(())
}

/// Whether `agent_id` has at least one enabled device of the given kind
/// (scheduler eligibility, §4.4).
pub async fn has_enabled_device_of_kind(
    pool: &DbPool,
    agent_id: AgentId,
    kind: DeviceKind,
) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM devices WHERE agent_id = ? AND kind = ? AND enabled = 1",
    )
    .bind(agent_id.as_u64() as i64)
    .bind(kind.as_str())
    .fetch_one(pool)
    .await?;
    Ok(row.0 > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents;
    use crate::pool::{create_pool, DbConfig};
    use chrono::Utc;

    async fn seed_agent(pool: &DbPool) -> AgentId {
        sqlx::query(
            "INSERT INTO claim_codes (code, continuous, created_at) VALUES ('c', 1, datetime('now'))",
        )
        .execute(pool)
        .await
        .unwrap();
        agents::insert(pool, "hash", "agent", 1, Utc::now()).await.unwrap()
    }

    #[tokio::test]
    async fn device_report_replaces_prior_snapshot() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        let agent_id = seed_agent(&pool).await;

        upsert_report(
            &pool,
            agent_id,
            &[Device {
                agent_id,
                device_index: 0,
                name: "CPU".into(),
                kind: DeviceKind::Cpu,
                enabled: true,
            }],
        )
        .await
        .unwrap();

        upsert_report(
            &pool,
            agent_id,
            &[Device {
                agent_id,
                device_index: 0,
                name: "RTX 4090".into(),
                kind: DeviceKind::GpuNvidia,
                enabled: true,
            }],
        )
        .await
        .unwrap();

        let devices = list_for_agent(&pool, agent_id).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].kind, DeviceKind::GpuNvidia);
    }

    #[tokio::test]
    async fn disabled_device_is_not_eligible() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        let agent_id = seed_agent(&pool).await;
        upsert_report(
            &pool,
            agent_id,
            &[Device {
                agent_id,
                device_index: 0,
                name: "CPU".into(),
                kind: DeviceKind::Cpu,
                enabled: true,
            }],
        )
        .await
        .unwrap();

        set_enabled(&pool, agent_id, 0, false).await.unwrap();
        assert!(!has_enabled_device_of_kind(&pool, agent_id, DeviceKind::Cpu)
            .await
            .unwrap());
    }
}
