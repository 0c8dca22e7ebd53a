//! Call session persistence
//!
//! The in-memory engine is the source of truth for live sessions; every
//! transition is written through here before it becomes observable, so a
//! storage failure aborts the transition with no partial mutation.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::CallEngineDatabase;
use crate::error::Result;
use crate::reader::ReaderId;
use crate::session::{CallSession, CallStatus, CallType, ClientId, SessionId};

#[derive(FromRow, Debug, Clone)]
pub struct SessionRow {
    pub session_id: String,
    pub client_id: String,
    pub reader_id: Option<String>,
    pub call_type: String,
    pub is_emergency: bool,
    pub status: String,
    pub escalation_level: i64,
    pub initiated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub scheduled_duration_secs: Option<i64>,
    pub actual_duration_secs: Option<i64>,
}

impl SessionRow {
    pub fn into_session(self) -> Option<CallSession> {
        Some(CallSession {
            session_id: SessionId(self.session_id),
            client_id: ClientId(self.client_id),
            assigned_reader: self.reader_id.map(ReaderId),
            call_type: CallType::parse(&self.call_type)?,
            is_emergency: self.is_emergency,
            status: CallStatus::parse(&self.status)?,
            escalation_level: self.escalation_level.max(1) as u32,
            initiated_at: self.initiated_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            scheduled_duration_secs: self.scheduled_duration_secs,
            actual_duration_secs: self.actual_duration_secs,
            tried_readers: Default::default(),
        })
    }
}

impl CallEngineDatabase {
    pub async fn insert_session(&self, session: &CallSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_sessions
                (session_id, client_id, reader_id, call_type, is_emergency,
                 status, escalation_level, initiated_at, started_at, ended_at,
                 scheduled_duration_secs, actual_duration_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(session.session_id.as_str())
        .bind(session.client_id.0.as_str())
        .bind(session.assigned_reader.as_ref().map(|r| r.as_str().to_string()))
        .bind(session.call_type.as_str())
        .bind(session.is_emergency)
        .bind(session.status.as_str())
        .bind(session.escalation_level as i64)
        .bind(session.initiated_at)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.scheduled_duration_secs)
        .bind(session.actual_duration_secs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write the full mutable surface of a session. Called under the
    /// session lock, so last-write-wins is safe here.
    pub async fn update_session(&self, session: &CallSession) -> Result<()> {
        sqlx::query(
            "UPDATE call_sessions SET
                reader_id = ?2,
                status = ?3,
                escalation_level = ?4,
                started_at = ?5,
                ended_at = ?6,
                actual_duration_secs = ?7
             WHERE session_id = ?1",
        )
        .bind(session.session_id.as_str())
        .bind(session.assigned_reader.as_ref().map(|r| r.as_str().to_string()))
        .bind(session.status.as_str())
        .bind(session.escalation_level as i64)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.actual_duration_secs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_session_row(&self, session_id: &SessionId) -> Result<Option<SessionRow>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT session_id, client_id, reader_id, call_type, is_emergency,
                    status, escalation_level, initiated_at, started_at, ended_at,
                    scheduled_duration_secs, actual_duration_secs
             FROM call_sessions WHERE session_id = ?1",
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}
