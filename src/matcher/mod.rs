//! Emergency matcher
//!
//! Selects the best eligible reader for an emergency request. The heuristic
//! is deliberately simple — first eligible, least loaded — because
//! emergencies have no skill dimension; correctness under concurrent bursts
//! matters more, hence the reserve-with-retry walk instead of a single
//! read-then-write.

use std::collections::HashSet;
use tracing::{debug, info};

use crate::error::{CallEngineError, Result};
use crate::reader::{ReaderId, ReaderRegistry};

/// Outcome of one match attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// A reader was found and one unit of its capacity reserved
    Assigned(ReaderId),
    /// The eligible pool is exhausted; the caller escalates or retries
    NoReaderAvailable,
}

/// Transient storage errors during a single reservation attempt are
/// retried locally this many times before propagating.
const RESERVE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct Matcher {
    registry: ReaderRegistry,
}

impl Matcher {
    pub fn new(registry: ReaderRegistry) -> Self {
        Self { registry }
    }

    /// Walk eligible candidates in order, attempting to reserve each until
    /// one succeeds. A failed `reserve` means another matcher won the race
    /// for that candidate; the walk simply moves on.
    pub async fn find_and_reserve(&self, excluding: &HashSet<ReaderId>) -> Result<MatchOutcome> {
        let candidates = self.registry.list_eligible(excluding).await?;
        debug!(
            "Match attempt: {} candidates ({} excluded)",
            candidates.len(),
            excluding.len()
        );

        for candidate in candidates {
            if self.try_reserve(&candidate.reader_id).await? {
                info!(
                    "Matched reader {} (load {}/{})",
                    candidate.reader_id,
                    candidate.current_call_count + 1,
                    candidate.max_concurrent_calls
                );
                return Ok(MatchOutcome::Assigned(candidate.reader_id));
            }
        }

        Ok(MatchOutcome::NoReaderAvailable)
    }

    async fn try_reserve(&self, reader_id: &ReaderId) -> Result<bool> {
        let mut last_err: Option<CallEngineError> = None;
        for _ in 0..RESERVE_ATTEMPTS {
            match self.registry.reserve(reader_id).await {
                Ok(won) => return Ok(won),
                Err(e) => {
                    debug!("Reservation attempt for {} errored: {}", reader_id, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            CallEngineError::Validation("reservation retry loop exited without error".to_string())
        }))
    }

    /// Give a reader's capacity unit back when the session ends or is
    /// reassigned away from it.
    pub async fn release(&self, reader_id: &ReaderId) -> Result<()> {
        self.registry.release(reader_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::CallEngineDatabase;

    async fn matcher() -> (Matcher, ReaderRegistry) {
        let registry = ReaderRegistry::new(CallEngineDatabase::new(None).await.unwrap());
        (Matcher::new(registry.clone()), registry)
    }

    #[tokio::test]
    async fn empty_pool_yields_no_reader() {
        let (matcher, _) = matcher().await;
        let outcome = matcher.find_and_reserve(&HashSet::new()).await.unwrap();
        assert_eq!(outcome, MatchOutcome::NoReaderAvailable);
    }

    #[tokio::test]
    async fn prefers_least_loaded_reader() {
        let (matcher, registry) = matcher().await;
        let busy = ReaderId("busy".to_string());
        let idle = ReaderId("idle".to_string());
        registry.upsert_presence(&busy, true, true, 3, None).await.unwrap();
        registry.upsert_presence(&idle, true, true, 3, None).await.unwrap();
        registry.reserve(&busy).await.unwrap();

        let outcome = matcher.find_and_reserve(&HashSet::new()).await.unwrap();
        assert_eq!(outcome, MatchOutcome::Assigned(idle));
    }

    #[tokio::test]
    async fn exhausts_pool_when_all_excluded() {
        let (matcher, registry) = matcher().await;
        let r1 = ReaderId("r1".to_string());
        registry.upsert_presence(&r1, true, true, 1, None).await.unwrap();

        let mut tried = HashSet::new();
        tried.insert(r1.clone());
        let outcome = matcher.find_and_reserve(&tried).await.unwrap();
        assert_eq!(outcome, MatchOutcome::NoReaderAvailable);
    }

    #[tokio::test]
    async fn reservation_actually_consumes_capacity() {
        let (matcher, registry) = matcher().await;
        let r1 = ReaderId("r1".to_string());
        registry.upsert_presence(&r1, true, true, 1, None).await.unwrap();

        assert_eq!(
            matcher.find_and_reserve(&HashSet::new()).await.unwrap(),
            MatchOutcome::Assigned(r1.clone())
        );
        // Capacity 1 is consumed; the next match finds nothing
        assert_eq!(
            matcher.find_and_reserve(&HashSet::new()).await.unwrap(),
            MatchOutcome::NoReaderAvailable
        );

        matcher.release(&r1).await.unwrap();
        assert_eq!(
            matcher.find_and_reserve(&HashSet::new()).await.unwrap(),
            MatchOutcome::Assigned(r1)
        );
    }
}
