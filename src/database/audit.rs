//! Append-only audit persistence
//!
//! Rows are inserted once and never updated or deleted.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::CallEngineDatabase;
use crate::error::Result;
use crate::session::SessionId;

#[derive(FromRow, Debug, Clone)]
pub struct AuditRow {
    pub session_id: String,
    pub seq: i64,
    pub event: String,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl CallEngineDatabase {
    pub async fn insert_audit_entry(
        &self,
        session_id: &SessionId,
        seq: u64,
        event: &str,
        detail: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (session_id, seq, event, detail, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session_id.as_str())
        .bind(seq as i64)
        .bind(event)
        .bind(detail)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn audit_entries_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<AuditRow>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT session_id, seq, event, detail, recorded_at
             FROM audit_log
             WHERE session_id = ?1
             ORDER BY seq ASC",
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
