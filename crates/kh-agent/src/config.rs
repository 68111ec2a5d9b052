//! Agent configuration, loaded from CLI flags with environment-variable
//! fallbacks (same `clap(env)` convention as `kh-server`, §6).

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "krakenhashes-agent", about = "KrakenHashes compute agent")]
pub struct AgentArgs {
    /// Base URL of the control-plane server, e.g. `http://127.0.0.1:7878`.
    #[arg(long, env = "KH_SERVER_URL", default_value = "http://127.0.0.1:7878")]
    pub server_url: String,

    /// Directory holding `agent.key` and the message buffer (§4.7, §6).
    #[arg(long, env = "KH_AGENT_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Local content-addressed artifact cache (§4.6).
    #[arg(long, env = "KH_AGENT_DATA_DIR", default_value = "./agent-data")]
    pub data_dir: PathBuf,

    /// One-time enrollment voucher. Only needed on first run; ignored once
    /// `agent.key` already exists.
    #[arg(long, env = "KH_CLAIM_CODE")]
    pub claim_code: Option<String>,

    /// Path to the hashcat binary invoked as a subprocess (Non-goal: this
    /// core does not reimplement hashcat, only supervises it).
    #[arg(long, env = "KH_HASHCAT_PATH", default_value = "hashcat")]
    pub hashcat_path: PathBuf,

    #[arg(long, env = "KH_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, env = "KH_AGENT_RETENTION_DAYS", default_value_t = kh_protocol::defaults::DEFAULT_RETENTION_DAYS)]
    pub retention_days: u64,
}

impl AgentArgs {
    /// Defaults to `~/.krakenhashes/agent` when unset, matching the
    /// `krakenhashes_home()` convention in `kh-logging`.
    pub fn resolved_config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(|| {
            kh_logging::krakenhashes_home().join("agent")
        })
    }
}
