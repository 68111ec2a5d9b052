//! KrakenHashes compute agent binary.
//!
//! Usage:
//!     krakenhashes-agent --server-url http://127.0.0.1:7878 --claim-code <code>
//!
//! On first run, `--claim-code` redeems a voucher and persists the issued
//! credentials to `agent.key` (§4.1, §6) inside the resolved config
//! directory; subsequent runs reuse that file and the flag is ignored.

use clap::Parser;
use kh_agent::AgentArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = AgentArgs::parse();

    if let Some(level) = &args.log_level {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", level);
        }
    }
    kh_logging::init_logging(kh_logging::LogConfig {
        app_name: "kh-agent",
        verbose: args.log_level.is_some(),
        tui_mode: false,
    })?;

    kh_agent::run(args).await
}
