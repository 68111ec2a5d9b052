//! KrakenHashes compute agent.
//!
//! Enrolls against a control-plane server with a claim code, then runs a
//! single long-lived control channel (§4.2) that receives task assignments,
//! supervises the hashcat subprocess (§4.4 consumer side), syncs artifacts
//! on demand (§4.6), and buffers critical messages across disconnects
//! (§4.7).

pub mod agent;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod enrollment;
pub mod file_sync;
pub mod hashcat;

pub use agent::Agent;
pub use config::AgentArgs;

use kh_security::credentials::{read_credentials, write_credentials, AgentCredentials};

/// Load persisted credentials, or redeem `args.claim_code` and persist the
/// result, then run the agent forever. Shared by the `krakenhashes-agent`
/// binary and the `kh-launcher` unified binary.
pub async fn run(args: AgentArgs) -> anyhow::Result<()> {
    let config_dir = args.resolved_config_dir();
    let credentials = load_or_enroll(&args, &config_dir).await?;

    tracing::info!(agent_id = credentials.agent_id, server_url = %args.server_url, "starting krakenhashes-agent");

    let mut agent = Agent::new(&args, credentials).await?;
    agent.run().await
}

async fn load_or_enroll(
    args: &AgentArgs,
    config_dir: &std::path::Path,
) -> anyhow::Result<AgentCredentials> {
    match read_credentials(config_dir) {
        Ok(creds) => {
            tracing::info!(agent_id = creds.agent_id, "loaded existing agent credentials");
            Ok(creds)
        }
        Err(_) => {
            let claim_code = args
                .claim_code
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("no agent.key found and no --claim-code provided"))?;

            tracing::info!("no existing credentials, redeeming claim code");
            let creds =
                enrollment::register(&args.server_url, claim_code, env!("CARGO_PKG_VERSION")).await?;
            write_credentials(config_dir, &creds)?;
            tracing::info!(agent_id = creds.agent_id, "enrollment complete, credentials saved");
            Ok(creds)
        }
    }
}
