//! Reader availability persistence
//!
//! `reserve_reader` and `release_reader` are single conditional UPDATE
//! statements so capacity can never be overbooked even when several match
//! attempts race on the same reader.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::debug;

use super::CallEngineDatabase;
use crate::error::Result;
use crate::reader::{ReaderAvailability, ReaderId};

#[derive(FromRow, Debug, Clone)]
pub struct ReaderRow {
    pub reader_id: String,
    pub is_online: bool,
    pub is_available_for_emergency: bool,
    pub max_concurrent_calls: i64,
    pub current_call_count: i64,
    pub last_seen: DateTime<Utc>,
    pub status_message: Option<String>,
}

impl From<ReaderRow> for ReaderAvailability {
    fn from(row: ReaderRow) -> Self {
        ReaderAvailability {
            reader_id: ReaderId(row.reader_id),
            is_online: row.is_online,
            is_available_for_emergency: row.is_available_for_emergency,
            max_concurrent_calls: row.max_concurrent_calls.max(1) as u32,
            current_call_count: row.current_call_count.max(0) as u32,
            last_seen: row.last_seen,
            status_message: row.status_message,
        }
    }
}

impl CallEngineDatabase {
    /// Insert or refresh a reader's presence row. Also bumps `last_seen`,
    /// so the heartbeat path reuses this statement.
    pub async fn upsert_reader(
        &self,
        reader_id: &ReaderId,
        is_online: bool,
        is_available_for_emergency: bool,
        max_concurrent_calls: u32,
        status_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO readers
                (reader_id, is_online, is_available_for_emergency,
                 max_concurrent_calls, current_call_count, last_seen, status_message)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)
             ON CONFLICT(reader_id) DO UPDATE SET
                is_online = excluded.is_online,
                is_available_for_emergency = excluded.is_available_for_emergency,
                max_concurrent_calls = excluded.max_concurrent_calls,
                last_seen = excluded.last_seen,
                status_message = excluded.status_message",
        )
        .bind(reader_id.as_str())
        .bind(is_online)
        .bind(is_available_for_emergency)
        .bind(max_concurrent_calls as i64)
        .bind(Utc::now())
        .bind(status_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Atomically claim one unit of call capacity.
    ///
    /// Returns `false` when the reader is offline, unavailable, at capacity
    /// or unknown — a contention loss, not an error.
    pub async fn reserve_reader(&self, reader_id: &ReaderId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE readers
             SET current_call_count = current_call_count + 1
             WHERE reader_id = ?1
               AND is_online = 1
               AND is_available_for_emergency = 1
               AND current_call_count < max_concurrent_calls",
        )
        .bind(reader_id.as_str())
        .execute(&self.pool)
        .await?;

        let reserved = result.rows_affected() > 0;
        if reserved {
            debug!("Reader {} reserved", reader_id);
        }
        Ok(reserved)
    }

    /// Atomically give back one unit of call capacity, floored at zero.
    ///
    /// Returns `false` when there was nothing to release (double release).
    pub async fn release_reader(&self, reader_id: &ReaderId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE readers
             SET current_call_count = current_call_count - 1
             WHERE reader_id = ?1 AND current_call_count > 0",
        )
        .bind(reader_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Readers a new emergency may be routed to, least-loaded first and
    /// most-recently-seen breaking ties.
    pub async fn list_eligible_readers(&self) -> Result<Vec<ReaderAvailability>> {
        let rows: Vec<ReaderRow> = sqlx::query_as(
            "SELECT reader_id, is_online, is_available_for_emergency,
                    max_concurrent_calls, current_call_count, last_seen, status_message
             FROM readers
             WHERE is_online = 1
               AND is_available_for_emergency = 1
               AND current_call_count < max_concurrent_calls
             ORDER BY current_call_count ASC, last_seen DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn get_reader(&self, reader_id: &ReaderId) -> Result<Option<ReaderAvailability>> {
        let row: Option<ReaderRow> = sqlx::query_as(
            "SELECT reader_id, is_online, is_available_for_emergency,
                    max_concurrent_calls, current_call_count, last_seen, status_message
             FROM readers WHERE reader_id = ?1",
        )
        .bind(reader_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Readers are never hard-deleted, only marked offline.
    pub async fn mark_reader_offline(&self, reader_id: &ReaderId) -> Result<()> {
        sqlx::query("UPDATE readers SET is_online = 0, last_seen = ?2 WHERE reader_id = ?1")
            .bind(reader_id.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Aggregate counts for monitoring.
    pub async fn reader_counts(&self) -> Result<(i64, i64, i64)> {
        let row: (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*),
                    COALESCE(SUM(is_online), 0),
                    COALESCE(SUM(CASE WHEN is_online = 1
                                       AND is_available_for_emergency = 1
                                       AND current_call_count < max_concurrent_calls
                                  THEN 1 ELSE 0 END), 0)
             FROM readers",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> CallEngineDatabase {
        CallEngineDatabase::new(None).await.unwrap()
    }

    #[tokio::test]
    async fn reserve_respects_capacity() {
        let db = db().await;
        let r1 = ReaderId("r1".to_string());
        db.upsert_reader(&r1, true, true, 1, None).await.unwrap();

        assert!(db.reserve_reader(&r1).await.unwrap());
        // Second reservation loses: capacity 1 is already claimed
        assert!(!db.reserve_reader(&r1).await.unwrap());

        assert!(db.release_reader(&r1).await.unwrap());
        assert!(db.reserve_reader(&r1).await.unwrap());
    }

    #[tokio::test]
    async fn reserve_unknown_reader_is_contention_loss() {
        let db = db().await;
        assert!(!db.reserve_reader(&ReaderId("ghost".to_string())).await.unwrap());
    }

    #[tokio::test]
    async fn release_floors_at_zero() {
        let db = db().await;
        let r1 = ReaderId("r1".to_string());
        db.upsert_reader(&r1, true, true, 2, None).await.unwrap();

        assert!(!db.release_reader(&r1).await.unwrap());
        let reader = db.get_reader(&r1).await.unwrap().unwrap();
        assert_eq!(reader.current_call_count, 0);
    }

    #[tokio::test]
    async fn eligible_readers_ordered_least_loaded_first() {
        let db = db().await;
        let busy = ReaderId("busy".to_string());
        let idle = ReaderId("idle".to_string());
        db.upsert_reader(&busy, true, true, 3, None).await.unwrap();
        db.upsert_reader(&idle, true, true, 3, None).await.unwrap();
        db.reserve_reader(&busy).await.unwrap();

        let eligible = db.list_eligible_readers().await.unwrap();
        assert_eq!(eligible.len(), 2);
        assert_eq!(eligible[0].reader_id, idle);
        assert_eq!(eligible[1].reader_id, busy);
    }

    #[tokio::test]
    async fn offline_readers_are_not_eligible() {
        let db = db().await;
        let r1 = ReaderId("r1".to_string());
        db.upsert_reader(&r1, true, true, 1, None).await.unwrap();
        db.mark_reader_offline(&r1).await.unwrap();

        assert!(db.list_eligible_readers().await.unwrap().is_empty());
        assert!(!db.reserve_reader(&r1).await.unwrap());
        // Still present, just offline
        assert!(db.get_reader(&r1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn upsert_preserves_outstanding_reservations() {
        let db = db().await;
        let r1 = ReaderId("r1".to_string());
        db.upsert_reader(&r1, true, true, 2, None).await.unwrap();
        db.reserve_reader(&r1).await.unwrap();

        // Heartbeat re-upsert must not reset the call count
        db.upsert_reader(&r1, true, true, 2, Some("on shift")).await.unwrap();
        let reader = db.get_reader(&r1).await.unwrap().unwrap();
        assert_eq!(reader.current_call_count, 1);
        assert_eq!(reader.status_message.as_deref(), Some("on shift"));
    }
}
