//! Unified KrakenHashes launcher: a single binary exposing the control
//! plane and the compute agent as subcommands, sharing one logging
//! initialization path and per-subcommand config structs.

use clap::{Parser, Subcommand};
use kh_agent::AgentArgs;
use kh_server::config::ServerArgs;

#[derive(Parser, Debug)]
#[command(name = "krakenhashes", about = "KrakenHashes distributed hash-cracking orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control-plane server (agent registry, scheduler, HTTP/WS API).
    Server(ServerArgs),
    /// Run a compute agent (enrollment, control channel, hashcat supervision).
    Agent(AgentArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (app_name, log_level) = match &cli.command {
        Command::Server(args) => ("kh-server", args.log_level.clone()),
        Command::Agent(args) => ("kh-agent", args.log_level.clone()),
    };

    if let Some(level) = &log_level {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", level);
        }
    }
    kh_logging::init_logging(kh_logging::LogConfig {
        app_name,
        verbose: log_level.is_some(),
        tui_mode: false,
    })?;

    match cli.command {
        Command::Server(args) => kh_server::run(args).await,
        Command::Agent(args) => kh_agent::run(args).await,
    }
}
