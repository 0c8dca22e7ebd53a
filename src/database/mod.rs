//! Async persistence layer backed by sqlx/SQLite
//!
//! All operations are naturally async and Send-safe. The reader reservation
//! is exposed as an atomic conditional `UPDATE` (optimistic concurrency),
//! never a read-then-write; see [`readers`].

pub mod audit;
pub mod escalations;
pub mod readers;
pub mod sessions;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::error::Result;

/// Shared database handle for the call engine
#[derive(Clone)]
pub struct CallEngineDatabase {
    pool: SqlitePool,
}

impl CallEngineDatabase {
    /// Connect and create the schema. `None` selects an in-memory database
    /// (used by tests and demos, mirroring the `:memory:` convention).
    pub async fn new(db_path: Option<String>) -> Result<Self> {
        let url = match db_path.as_deref() {
            None | Some(":memory:") => "sqlite::memory:".to_string(),
            Some(path) => format!("sqlite://{}?mode=rwc", path),
        };

        // A single connection keeps the in-memory database alive and gives
        // SQLite one writer; the engine serializes per-session anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        info!("Call engine database ready ({})", url);
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS readers (
                reader_id TEXT PRIMARY KEY,
                is_online INTEGER NOT NULL DEFAULT 0,
                is_available_for_emergency INTEGER NOT NULL DEFAULT 0,
                max_concurrent_calls INTEGER NOT NULL DEFAULT 1,
                current_call_count INTEGER NOT NULL DEFAULT 0,
                last_seen TEXT NOT NULL,
                status_message TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS call_sessions (
                session_id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                reader_id TEXT,
                call_type TEXT NOT NULL,
                is_emergency INTEGER NOT NULL,
                status TEXT NOT NULL,
                escalation_level INTEGER NOT NULL DEFAULT 1,
                initiated_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                scheduled_duration_secs INTEGER,
                actual_duration_secs INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS escalations (
                escalation_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                previous_escalation_id TEXT,
                escalated_from TEXT,
                escalated_to TEXT,
                reason TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                priority_level INTEGER NOT NULL,
                escalated_at TEXT NOT NULL,
                resolved_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                event TEXT NOT NULL,
                detail TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_escalations_session
             ON escalations (session_id, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_session
             ON audit_log (session_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let db = CallEngineDatabase::new(None).await.unwrap();
        db.init_schema().await.unwrap();

        let readers = db.list_eligible_readers().await.unwrap();
        assert!(readers.is_empty());
    }
}
