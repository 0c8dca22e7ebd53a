//! # Emergency Call Engine
//!
//! Escalation and reader-matching engine for emergency calls: a client in
//! crisis requests a call, the engine reserves an available reader, alerts
//! them, and escalates through the reader pool on timeout until someone
//! answers or the session is handed to human administrators.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            REST API (axum)              │
//! ├─────────────────────────────────────────┤
//! │              CallEngine                 │
//! │  matcher │ scheduler │ notify │ audit   │
//! ├─────────────────────────────────────────┤
//! │      ReaderRegistry │ SQLite (sqlx)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The [`orchestrator::CallEngine`] is the sole writer of session state.
//! Reader capacity is reserved and released through atomic conditional
//! updates in the storage layer, so concurrent emergencies can never
//! over-commit a reader. Ring timeouts are cancellable per-session timers
//! on tokio's monotonic clock; notification delivery is best-effort and
//! never blocks a state transition.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use emergency_call_engine::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let engine = CallEngine::new(CallEngineConfig::default(), None).await?;
//!
//! engine
//!     .registry()
//!     .upsert_presence(&ReaderId("reader-1".into()), true, true, 1, None)
//!     .await?;
//!
//! let session = engine
//!     .create_call(ClientId("client-1".into()), CallType::Voice, true, None)
//!     .await?;
//! println!("session {} is {}", session.session_id, session.status);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod audit;
pub mod config;
pub mod database;
pub mod error;
pub mod escalation;
pub mod matcher;
pub mod notify;
pub mod orchestrator;
pub mod prelude;
pub mod reader;
pub mod server;
pub mod session;

pub use config::CallEngineConfig;
pub use error::{CallEngineError, Result};
pub use orchestrator::{CallEngine, EngineStats};
pub use server::{CallEngineServer, CallEngineServerBuilder};
