//! `POST /api/agent/register` client and local hardware enumeration (§4.1).

use kh_protocol::http::{DeviceKindDto, DeviceReport, HardwareReport, RegisterRequest, RegisterResponse};
use kh_security::credentials::AgentCredentials;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("registration rejected ({status}): {reason}")]
    Rejected { status: u16, reason: String },
}

/// Enumerate local compute devices for `device_report`/enrollment hardware
/// reporting. Real GPU discovery (nvidia-smi/rocm-smi parsing) is the kind
/// of environment-specific probing left to deployment scripts; this
/// always reports a CPU device and adds a GPU
/// entry only when the corresponding vendor tool is on `PATH`.
pub fn enumerate_devices() -> Vec<DeviceReport> {
    let mut devices = vec![DeviceReport {
        device_index: 0,
        name: "CPU".to_string(),
        kind: DeviceKindDto::Cpu,
        enabled: true,
    }];

    if which_on_path("nvidia-smi") {
        devices.push(DeviceReport {
            device_index: devices.len() as i64,
            name: "GPU (NVIDIA)".to_string(),
            kind: DeviceKindDto::GpuNvidia,
            enabled: true,
        });
    }
    if which_on_path("rocm-smi") {
        devices.push(DeviceReport {
            device_index: devices.len() as i64,
            name: "GPU (AMD)".to_string(),
            kind: DeviceKindDto::GpuAmd,
            enabled: true,
        });
    }

    devices
}

fn which_on_path(bin: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file())
        })
        .unwrap_or(false)
}

pub async fn register(
    server_url: &str,
    claim_code: &str,
    agent_version: &str,
) -> Result<AgentCredentials, EnrollmentError> {
    let client = reqwest::Client::new();
    let request = RegisterRequest {
        claim_code: claim_code.to_string(),
        hardware: HardwareReport {
            agent_version: agent_version.to_string(),
            devices: enumerate_devices(),
        },
    };

    let response = client
        .post(format!("{server_url}/api/agent/register"))
        .json(&request)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let reason = response
            .json::<kh_protocol::http::RegisterError>()
            .await
            .map(|e| e.reason)
            .unwrap_or_else(|_| "unknown".to_string());
        return Err(EnrollmentError::Rejected {
            status: status.as_u16(),
            reason,
        });
    }

    let body: RegisterResponse = response.json().await?;
    Ok(AgentCredentials {
        agent_id: body.agent_id.as_u64(),
        api_key: body.api_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_reports_a_cpu_device_first() {
        let devices = enumerate_devices();
        assert_eq!(devices[0].device_index, 0);
        assert_eq!(devices[0].kind, DeviceKindDto::Cpu);
        assert!(devices[0].enabled);
    }

    #[test]
    fn device_indices_are_contiguous() {
        let devices = enumerate_devices();
        for (i, device) in devices.iter().enumerate() {
            assert_eq!(device.device_index, i as i64);
        }
    }
}
