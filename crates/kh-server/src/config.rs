//! Server configuration, loaded from CLI flags with environment-variable
//! fallbacks (`clap(env)`, §6 "Ambient configuration").

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kh_protocol::defaults;

#[derive(Parser, Debug, Clone)]
#[command(name = "krakenhashes-server", about = "KrakenHashes control plane")]
pub struct ServerArgs {
    /// HTTP/WebSocket bind address.
    #[arg(long, env = "KH_BIND_ADDR", default_value = defaults::DEFAULT_SERVER_BIND_ADDR)]
    pub bind_addr: String,

    /// SQLite database URL (`sqlite:<path>?mode=rwc` or `sqlite::memory:`).
    #[arg(long, env = "KH_DATABASE_URL", default_value = defaults::DEFAULT_DATABASE_URL)]
    pub database_url: String,

    /// Root directory for the content-addressed artifact store and potfile
    /// (§6: `binaries/`, `wordlists/`, `rules/`, `hashlists/`, `potfile`).
    #[arg(long, env = "KH_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// TLS mode for the client-credential boundary (external collaborator,
    /// §1 Non-goals): `disabled`, `required`, or `mutual`.
    #[arg(long, env = "KH_TLS_MODE", default_value = "disabled")]
    pub tls_mode: TlsMode,

    /// `verbose` tracing-filter override; otherwise `RUST_LOG` applies.
    #[arg(long, env = "KH_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, env = "KH_HEARTBEAT_INTERVAL_SECS", default_value_t = defaults::DEFAULT_HEARTBEAT_INTERVAL.as_secs())]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "KH_MISSED_HEARTBEATS", default_value_t = defaults::DEFAULT_MISSED_HEARTBEATS)]
    pub missed_heartbeats: u32,

    #[arg(long, env = "KH_ACCEPT_TIMEOUT_SECS", default_value_t = defaults::DEFAULT_ACCEPT_TIMEOUT.as_secs())]
    pub accept_timeout_secs: u64,

    #[arg(long, env = "KH_PROGRESS_TIMEOUT_SECS", default_value_t = defaults::DEFAULT_PROGRESS_TIMEOUT.as_secs())]
    pub progress_timeout_secs: u64,

    #[arg(long, env = "KH_MAX_ATTEMPTS", default_value_t = defaults::DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum TlsMode {
    Disabled,
    Required,
    Mutual,
}

impl std::str::FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "required" => Ok(Self::Required),
            "mutual" => Ok(Self::Mutual),
            other => Err(format!("unknown tls mode: {other}")),
        }
    }
}

/// Timing parameters threaded through the scheduler (§4.1, §4.4), pulled
/// out of the raw CLI args into `Duration`s once at startup.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerTiming {
    pub heartbeat_interval: Duration,
    pub missed_heartbeats: u32,
    pub accept_timeout: Duration,
    pub progress_timeout: Duration,
    pub max_attempts: i64,
}

impl From<&ServerArgs> for SchedulerTiming {
    fn from(args: &ServerArgs) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
            missed_heartbeats: args.missed_heartbeats,
            accept_timeout: Duration::from_secs(args.accept_timeout_secs),
            progress_timeout: Duration::from_secs(args.progress_timeout_secs),
            max_attempts: args.max_attempts,
        }
    }
}
