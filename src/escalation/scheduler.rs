//! Escalation scheduler
//!
//! An arena of cancellable one-shot timers keyed by session id: each
//! session arms at most one timer, arming again replaces the prior timer,
//! and a fire races safely against `answer` because the engine re-checks
//! session state under the session lock before acting.
//!
//! Timers run on tokio's monotonic clock, so wall-clock skew can neither
//! hasten nor delay an escalation.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::session::SessionId;

pub struct EscalationScheduler {
    timers: Arc<DashMap<SessionId, (u64, JoinHandle<()>)>>,
    generation: AtomicU64,
}

impl EscalationScheduler {
    pub fn new() -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Arm a one-shot timer for the session, replacing any prior timer.
    /// `on_fire` runs after `timeout` unless the timer is cancelled first;
    /// it is responsible for re-checking session state.
    pub fn arm<F>(&self, session_id: SessionId, timeout: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timers = Arc::clone(&self.timers);
        let timer_key = session_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Drop our own arena entry unless a newer timer replaced it
            timers.remove_if(&timer_key, |_, (g, _)| *g == generation);
            on_fire.await;
        });

        debug!(
            "Armed timer for session {} ({} ms)",
            session_id,
            timeout.as_millis()
        );
        if let Some((_, prior)) = self.timers.insert(session_id, (generation, handle)) {
            prior.abort();
        }
    }

    /// Cancel the session's timer if one is armed; no-op otherwise.
    pub fn cancel(&self, session_id: &SessionId) {
        if let Some((_, (_, handle))) = self.timers.remove(session_id) {
            handle.abort();
            debug!("Cancelled timer for session {}", session_id);
        }
    }

    /// Abort every outstanding timer (server shutdown).
    pub fn shutdown(&self) {
        for entry in self.timers.iter() {
            entry.value().1.abort();
        }
        self.timers.clear();
    }

    #[cfg(test)]
    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for EscalationScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_timeout() {
        let scheduler = EscalationScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);

        scheduler.arm(SessionId::new(), Duration::from_secs(30), async move {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let scheduler = EscalationScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let session_id = SessionId::new();

        scheduler.arm(session_id.clone(), Duration::from_secs(30), async move {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel(&session_id);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_prior_timer() {
        let scheduler = EscalationScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let session_id = SessionId::new();

        let first = Arc::clone(&fired);
        scheduler.arm(session_id.clone(), Duration::from_secs(10), async move {
            first.fetch_add(10, Ordering::SeqCst);
        });
        let second = Arc::clone(&fired);
        scheduler.arm(session_id.clone(), Duration::from_secs(30), async move {
            second.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.armed_count(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        // Only the replacement fired
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_without_armed_timer_is_noop() {
        let scheduler = EscalationScheduler::new();
        scheduler.cancel(&SessionId::new());
    }
}
