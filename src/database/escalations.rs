//! Escalation record persistence
//!
//! Records form a strict tree: each row points at exactly one session and
//! optionally one predecessor record. There is no back-reference from the
//! session; the active record is derived by querying the most recent
//! unresolved row.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::CallEngineDatabase;
use crate::error::Result;
use crate::escalation::{EscalationKind, EscalationReason, EscalationRecord, EscalationStatus};
use crate::reader::ReaderId;
use crate::session::SessionId;

#[derive(FromRow, Debug, Clone)]
pub struct EscalationRow {
    pub escalation_id: String,
    pub session_id: String,
    pub previous_escalation_id: Option<String>,
    pub escalated_from: Option<String>,
    pub escalated_to: Option<String>,
    pub reason: String,
    pub kind: String,
    pub status: String,
    pub priority_level: i64,
    pub escalated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscalationRow {
    pub fn into_record(self) -> Option<EscalationRecord> {
        Some(EscalationRecord {
            escalation_id: self.escalation_id,
            session_id: SessionId(self.session_id),
            previous_escalation_id: self.previous_escalation_id,
            escalated_from: self.escalated_from.map(ReaderId),
            escalated_to: self.escalated_to.map(ReaderId),
            reason: EscalationReason::parse(&self.reason)?,
            kind: EscalationKind::parse(&self.kind)?,
            status: EscalationStatus::parse(&self.status)?,
            priority_level: self.priority_level.clamp(1, 5) as u32,
            escalated_at: self.escalated_at,
            resolved_at: self.resolved_at,
        })
    }
}

impl CallEngineDatabase {
    pub async fn insert_escalation(&self, record: &EscalationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO escalations
                (escalation_id, session_id, previous_escalation_id,
                 escalated_from, escalated_to, reason, kind, status,
                 priority_level, escalated_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(record.escalation_id.as_str())
        .bind(record.session_id.as_str())
        .bind(record.previous_escalation_id.as_deref())
        .bind(record.escalated_from.as_ref().map(|r| r.as_str().to_string()))
        .bind(record.escalated_to.as_ref().map(|r| r.as_str().to_string()))
        .bind(record.reason.as_str())
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(record.priority_level as i64)
        .bind(record.escalated_at)
        .bind(record.resolved_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the reader assigned for a pending escalation.
    pub async fn assign_escalation(
        &self,
        escalation_id: &str,
        escalated_to: &ReaderId,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE escalations SET escalated_to = ?2, status = 'assigned'
             WHERE escalation_id = ?1",
        )
        .bind(escalation_id)
        .bind(escalated_to.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close out whatever unresolved record the session currently has.
    /// Keeps the at-most-one-unresolved-record invariant when a new
    /// escalation supersedes the prior one.
    pub async fn close_unresolved_escalations(
        &self,
        session_id: &SessionId,
        status: EscalationStatus,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE escalations SET status = ?2, resolved_at = ?3
             WHERE session_id = ?1 AND status IN ('pending', 'assigned')",
        )
        .bind(session_id.as_str())
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// The session's active (unresolved) escalation, newest first.
    pub async fn unresolved_escalation(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<EscalationRecord>> {
        let row: Option<EscalationRow> = sqlx::query_as(
            "SELECT escalation_id, session_id, previous_escalation_id,
                    escalated_from, escalated_to, reason, kind, status,
                    priority_level, escalated_at, resolved_at
             FROM escalations
             WHERE session_id = ?1 AND status IN ('pending', 'assigned')
             ORDER BY escalated_at DESC
             LIMIT 1",
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(EscalationRow::into_record))
    }

    /// Full escalation chain for a session, oldest first.
    pub async fn escalations_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<EscalationRecord>> {
        let rows: Vec<EscalationRow> = sqlx::query_as(
            "SELECT escalation_id, session_id, previous_escalation_id,
                    escalated_from, escalated_to, reason, kind, status,
                    priority_level, escalated_at, resolved_at
             FROM escalations
             WHERE session_id = ?1
             ORDER BY escalated_at ASC",
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(EscalationRow::into_record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn at_most_one_unresolved_record_per_session() {
        let db = CallEngineDatabase::new(None).await.unwrap();
        let session_id = SessionId::new();

        let first = EscalationRecord::new(
            session_id.clone(),
            None,
            Some(ReaderId("r1".to_string())),
            EscalationReason::Timeout,
            EscalationKind::Auto,
            3,
        );
        db.insert_escalation(&first).await.unwrap();

        // Superseding escalation cancels the prior record before insert
        let closed = db
            .close_unresolved_escalations(&session_id, EscalationStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(closed, 1);

        let second = EscalationRecord::new(
            session_id.clone(),
            Some(first.escalation_id.clone()),
            None,
            EscalationReason::ReaderOffline,
            EscalationKind::Auto,
            4,
        );
        db.insert_escalation(&second).await.unwrap();

        let unresolved = db.unresolved_escalation(&session_id).await.unwrap().unwrap();
        assert_eq!(unresolved.escalation_id, second.escalation_id);
        assert_eq!(
            unresolved.previous_escalation_id.as_deref(),
            Some(first.escalation_id.as_str())
        );

        let chain = db.escalations_for_session(&session_id).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].status, EscalationStatus::Cancelled);
    }

    #[tokio::test]
    async fn assignment_marks_record_assigned() {
        let db = CallEngineDatabase::new(None).await.unwrap();
        let session_id = SessionId::new();
        let record = EscalationRecord::new(
            session_id.clone(),
            None,
            None,
            EscalationReason::Manual,
            EscalationKind::Manual,
            5,
        );
        db.insert_escalation(&record).await.unwrap();
        db.assign_escalation(&record.escalation_id, &ReaderId("r2".to_string()))
            .await
            .unwrap();

        let loaded = db.unresolved_escalation(&session_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, EscalationStatus::Assigned);
        assert_eq!(loaded.escalated_to, Some(ReaderId("r2".to_string())));
    }
}
