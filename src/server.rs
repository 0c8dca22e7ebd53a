//! Server lifecycle management
//!
//! [`CallEngineServer`] wraps the engine with the REST API listener and a
//! periodic monitoring task, handling startup, runtime and graceful
//! shutdown. Built through [`CallEngineServerBuilder`]:
//!
//! ```rust,no_run
//! use emergency_call_engine::config::CallEngineConfig;
//! use emergency_call_engine::server::CallEngineServerBuilder;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = CallEngineServerBuilder::new()
//!     .with_config(CallEngineConfig::default())
//!     .with_in_memory_database()
//!     .build()
//!     .await?;
//!
//! server.start().await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{error, info};

use crate::api::create_router;
use crate::config::CallEngineConfig;
use crate::error::{CallEngineError, Result};
use crate::notify::NotificationDispatcher;
use crate::orchestrator::CallEngine;

/// A complete emergency call server: engine, REST API and monitoring.
pub struct CallEngineServer {
    engine: Arc<CallEngine>,
    config: CallEngineConfig,
    api_handle: Option<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
}

impl CallEngineServer {
    /// Create a server with the given configuration and database path
    /// (`None` selects an in-memory database).
    pub async fn new(config: CallEngineConfig, db_path: Option<String>) -> Result<Self> {
        let engine = CallEngine::new(config.clone(), db_path).await?;
        Ok(Self {
            engine,
            config,
            api_handle: None,
            monitor_handle: None,
        })
    }

    async fn with_dispatcher(
        config: CallEngineConfig,
        db_path: Option<String>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Result<Self> {
        let engine = CallEngine::with_dispatcher(config.clone(), db_path, dispatcher).await?;
        Ok(Self {
            engine,
            config,
            api_handle: None,
            monitor_handle: None,
        })
    }

    /// Bind the REST API and start the periodic monitor.
    pub async fn start(&mut self) -> Result<()> {
        let bind_addr = self.config.general.api_bind_addr.clone();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| {
                CallEngineError::Configuration(format!("Failed to bind {}: {}", bind_addr, e))
            })?;
        let router = create_router(self.engine.clone());

        let api_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("API server exited: {}", e);
            }
        });
        self.api_handle = Some(api_handle);
        info!("✅ REST API listening on {}", bind_addr);

        let engine = self.engine.clone();
        self.monitor_handle = Some(tokio::spawn(async move {
            Self::monitor_loop(engine).await;
        }));

        Ok(())
    }

    /// Stop the API listener, the monitor and all outstanding timers.
    pub async fn stop(&mut self) -> Result<()> {
        info!("🛑 Stopping call engine server...");

        if let Some(handle) = self.monitor_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = self.api_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.engine.shutdown();

        info!("✅ Call engine server stopped");
        Ok(())
    }

    /// Run the server indefinitely, logging a status line each minute.
    pub async fn run(&self) -> Result<()> {
        info!(
            "📞 Emergency call engine running on {} (domain {})",
            self.config.general.api_bind_addr, self.config.general.domain
        );

        loop {
            sleep(Duration::from_secs(60)).await;
            match self.engine.get_stats().await {
                Ok(stats) => info!(
                    "📊 Stats - ringing: {}, active: {}, escalated: {}, eligible readers: {}",
                    stats.ringing_calls,
                    stats.active_calls,
                    stats.escalated_calls,
                    stats.readers.eligible_readers
                ),
                Err(e) => error!("Failed to collect stats: {}", e),
            }
        }
    }

    pub fn engine(&self) -> &Arc<CallEngine> {
        &self.engine
    }

    async fn monitor_loop(engine: Arc<CallEngine>) {
        let retention = Duration::from_secs(engine.config().general.terminal_retention_secs);
        let mut interval = interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            engine.evict_terminal_sessions(retention).await;
            match engine.get_stats().await {
                Ok(stats) => {
                    if stats.ringing_calls + stats.escalated_calls + stats.active_calls > 0 {
                        info!(
                            "📊 Sessions: {} ringing, {} escalated, {} active ({} total); \
                             readers: {}/{} eligible",
                            stats.ringing_calls,
                            stats.escalated_calls,
                            stats.active_calls,
                            stats.total_sessions,
                            stats.readers.eligible_readers,
                            stats.readers.total_readers
                        );
                    }
                }
                Err(e) => error!("Monitor failed to collect stats: {}", e),
            }
        }
    }
}

/// Builder for [`CallEngineServer`] with a fluent API
pub struct CallEngineServerBuilder {
    config: Option<CallEngineConfig>,
    db_path: Option<String>,
    dispatcher: Option<Arc<dyn NotificationDispatcher>>,
}

impl CallEngineServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            db_path: None,
            dispatcher: None,
        }
    }

    pub fn with_config(mut self, config: CallEngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_database_path(mut self, path: String) -> Self {
        self.db_path = Some(path);
        self
    }

    pub fn with_in_memory_database(mut self) -> Self {
        self.db_path = None;
        self
    }

    /// Replace the default logging dispatcher with a real delivery adapter.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub async fn build(self) -> Result<CallEngineServer> {
        let config = self.config.ok_or_else(|| {
            CallEngineError::Configuration("Configuration not provided".to_string())
        })?;

        match self.dispatcher {
            Some(dispatcher) => {
                CallEngineServer::with_dispatcher(config, self.db_path, dispatcher).await
            }
            None => CallEngineServer::new(config, self.db_path).await,
        }
    }
}

impl Default for CallEngineServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
