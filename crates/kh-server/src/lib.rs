//! KrakenHashes orchestration server: agent enrollment, the bidirectional
//! control channel, the job scheduler, and the content-addressed artifact
//! store, wired together behind an HTTP/WebSocket surface.

use std::sync::Arc;

use kh_db::DbConfig;
use tokio::net::TcpListener;

pub mod aggregator;
pub mod config;
pub mod credential_issuer;
pub mod error;
pub mod http;
pub mod planner;
pub mod registry;
pub mod scheduler;

pub use config::{SchedulerTiming, ServerArgs, TlsMode};
pub use credential_issuer::{ClientCredentialIssuer, NullCredentialIssuer};
pub use error::{Result, ServerError};
pub use http::{router, AppState};
pub use registry::AgentRegistry;
pub use scheduler::SchedulerHandle;

/// Build and serve the control plane until the listener is torn down.
/// Shared by `krakenhashes-server` and the `kh-launcher` unified binary
/// (§6 CLI surface) so both construct identical state.
pub async fn run(args: ServerArgs) -> anyhow::Result<()> {
    tracing::info!(bind_addr = %args.bind_addr, database_url = %args.database_url, "starting krakenhashes-server");

    tokio::fs::create_dir_all(&args.data_dir).await?;

    let pool = kh_db::create_pool(DbConfig {
        url: args.database_url.clone(),
        max_connections: 5,
    })
    .await?;

    let store = Arc::new(kh_store::FileStore::open(args.data_dir.clone()).await?);
    let registry = AgentRegistry::new();
    let potfile = Arc::new(aggregator::Potfile::open(&args.data_dir).await?);
    let timing = SchedulerTiming::from(&args);
    let scheduler_handle = scheduler::spawn(pool.clone(), registry.clone(), potfile.clone(), timing);

    let state = AppState {
        pool,
        registry,
        scheduler: scheduler_handle,
        store,
        potfile,
        credential_issuer: Arc::new(NullCredentialIssuer),
    };

    let app = router(state);
    let listener = TcpListener::bind(&args.bind_addr).await?;
    tracing::info!(bind_addr = %args.bind_addr, "listening");

    axum::serve(listener, app).await?;
    Ok(())
}
