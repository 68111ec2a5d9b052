//! KrakenHashes control plane binary.
//!
//! Usage:
//!     krakenhashes-server --bind-addr 0.0.0.0:7878 --database-url sqlite://krakenhashes.db?mode=rwc

use clap::Parser;
use kh_server::config::ServerArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    if let Some(level) = &args.log_level {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", level);
        }
    }
    kh_logging::init_logging(kh_logging::LogConfig {
        app_name: "kh-server",
        verbose: args.log_level.is_some(),
        tui_mode: false,
    })?;

    kh_server::run(args).await
}
