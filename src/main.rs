//! Emergency call engine server binary
//!
//! Runs the REST API and escalation engine with configuration taken from
//! the environment:
//!
//! - `CALL_ENGINE_BIND` — API bind address (default `127.0.0.1:8080`)
//! - `CALL_ENGINE_DB` — SQLite path; overrides the configured default
//!   (`call_engine.db`); `:memory:` runs without a file

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use emergency_call_engine::config::CallEngineConfig;
use emergency_call_engine::server::CallEngineServerBuilder;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("emergency_call_engine=info")),
        )
        .init();

    let mut config = CallEngineConfig::default();
    if let Ok(bind) = std::env::var("CALL_ENGINE_BIND") {
        config.general.api_bind_addr = bind;
    }
    let db_path = std::env::var("CALL_ENGINE_DB")
        .unwrap_or_else(|_| config.database.database_path.clone());

    let mut server = CallEngineServerBuilder::new()
        .with_config(config)
        .with_database_path(db_path)
        .build()
        .await?;

    server.start().await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            server.stop().await?;
        }
    }
    Ok(())
}
