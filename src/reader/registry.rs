//! Reader registry
//!
//! Tracks online/available/on-call state per reader on top of the storage
//! layer's atomic counters. The registry is the single shared mutable
//! resource in the engine; `reserve`/`release` never read-then-write.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::database::CallEngineDatabase;
use crate::error::{CallEngineError, Result};
use crate::reader::{ReaderAvailability, ReaderId};
use std::collections::HashSet;

#[derive(Clone)]
pub struct ReaderRegistry {
    db: CallEngineDatabase,
}

/// Aggregate reader counts for monitoring
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReaderStats {
    pub total_readers: u64,
    pub online_readers: u64,
    pub eligible_readers: u64,
}

impl ReaderRegistry {
    pub fn new(db: CallEngineDatabase) -> Self {
        Self { db }
    }

    /// Report (or refresh) a reader's presence. Idempotent; doubles as the
    /// heartbeat since it bumps `last_seen`.
    pub async fn upsert_presence(
        &self,
        reader_id: &ReaderId,
        is_online: bool,
        emergency_available: bool,
        max_concurrent: u32,
        status_message: Option<&str>,
    ) -> Result<()> {
        if max_concurrent < 1 {
            return Err(CallEngineError::Validation(format!(
                "max_concurrent_calls must be >= 1, got {} for reader {}",
                max_concurrent, reader_id
            )));
        }

        self.db
            .upsert_reader(
                reader_id,
                is_online,
                emergency_available,
                max_concurrent,
                status_message,
            )
            .await?;

        debug!(
            "Presence upsert for reader {}: online={} emergency={} capacity={}",
            reader_id, is_online, emergency_available, max_concurrent
        );
        Ok(())
    }

    /// Atomically claim one unit of the reader's capacity. `false` means
    /// the reservation lost a race or the reader is no longer eligible —
    /// an expected outcome under concurrent emergencies, not an error.
    pub async fn reserve(&self, reader_id: &ReaderId) -> Result<bool> {
        self.db.reserve_reader(reader_id).await
    }

    /// Give back one unit of capacity. Double-release is tolerated: it
    /// logs a warning and the counter stays floored at zero.
    pub async fn release(&self, reader_id: &ReaderId) -> Result<()> {
        let released = self.db.release_reader(reader_id).await?;
        if released {
            debug!("Reader {} released", reader_id);
        } else {
            warn!(
                "Release for reader {} with no outstanding reservation",
                reader_id
            );
        }
        Ok(())
    }

    /// Candidate readers for a new emergency, least-loaded first with the
    /// most-recently-active reader breaking ties, minus `excluding`.
    pub async fn list_eligible(
        &self,
        excluding: &HashSet<ReaderId>,
    ) -> Result<Vec<ReaderAvailability>> {
        let eligible = self.db.list_eligible_readers().await?;
        Ok(eligible
            .into_iter()
            .filter(|r| !excluding.contains(&r.reader_id))
            .collect())
    }

    pub async fn get(&self, reader_id: &ReaderId) -> Result<Option<ReaderAvailability>> {
        self.db.get_reader(reader_id).await
    }

    /// Readers are never deleted, only taken off the eligible pool.
    pub async fn mark_offline(&self, reader_id: &ReaderId) -> Result<()> {
        self.db.mark_reader_offline(reader_id).await?;
        info!("Reader {} marked offline", reader_id);
        Ok(())
    }

    pub async fn stats(&self) -> Result<ReaderStats> {
        let (total, online, eligible) = self.db.reader_counts().await?;
        Ok(ReaderStats {
            total_readers: total.max(0) as u64,
            online_readers: online.max(0) as u64,
            eligible_readers: eligible.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> ReaderRegistry {
        ReaderRegistry::new(CallEngineDatabase::new(None).await.unwrap())
    }

    #[tokio::test]
    async fn rejects_non_positive_capacity() {
        let registry = registry().await;
        let err = registry
            .upsert_presence(&ReaderId("r1".to_string()), true, true, 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallEngineError::Validation(_)));
    }

    #[tokio::test]
    async fn double_release_is_tolerated() {
        let registry = registry().await;
        let r1 = ReaderId("r1".to_string());
        registry
            .upsert_presence(&r1, true, true, 1, None)
            .await
            .unwrap();
        assert!(registry.reserve(&r1).await.unwrap());
        registry.release(&r1).await.unwrap();
        // Second release logs a warning but does not fail or go negative
        registry.release(&r1).await.unwrap();
        let reader = registry.get(&r1).await.unwrap().unwrap();
        assert_eq!(reader.current_call_count, 0);
    }

    #[tokio::test]
    async fn exclusion_set_is_honored() {
        let registry = registry().await;
        let r1 = ReaderId("r1".to_string());
        let r2 = ReaderId("r2".to_string());
        registry.upsert_presence(&r1, true, true, 1, None).await.unwrap();
        registry.upsert_presence(&r2, true, true, 1, None).await.unwrap();

        let mut excluding = HashSet::new();
        excluding.insert(r1.clone());
        let eligible = registry.list_eligible(&excluding).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].reader_id, r2);
    }

    #[tokio::test]
    async fn count_never_exceeds_capacity_under_racing_reservations() {
        let registry = registry().await;
        let r1 = ReaderId("r1".to_string());
        registry.upsert_presence(&r1, true, true, 2, None).await.unwrap();

        let mut wins = 0;
        for _ in 0..5 {
            if registry.reserve(&r1).await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 2);
        let reader = registry.get(&r1).await.unwrap().unwrap();
        assert_eq!(reader.current_call_count, reader.max_concurrent_calls);
    }
}
