//! Engine construction, lookup and monitoring

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::audit::{AuditEntry, AuditLog};
use crate::config::CallEngineConfig;
use crate::database::CallEngineDatabase;
use crate::error::{CallEngineError, Result};
use crate::escalation::{EscalationReason, EscalationRules, EscalationScheduler};
use crate::matcher::Matcher;
use crate::notify::{NotificationDispatcher, TracingDispatcher};
use crate::reader::{ReaderRegistry, ReaderStats};
use crate::session::{CallSession, CallStatus, SessionId};

/// Central coordinator for emergency call handling
pub struct CallEngine {
    config: CallEngineConfig,
    db: CallEngineDatabase,
    registry: ReaderRegistry,
    matcher: Matcher,
    scheduler: EscalationScheduler,
    rules: EscalationRules,
    audit: AuditLog,
    dispatcher: Arc<dyn NotificationDispatcher>,
    /// Live sessions; the per-session mutex serializes transitions
    sessions: DashMap<SessionId, Arc<Mutex<CallSession>>>,
}

/// Snapshot of engine activity for monitoring
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineStats {
    pub total_sessions: usize,
    pub pending_calls: usize,
    pub ringing_calls: usize,
    pub escalated_calls: usize,
    pub active_calls: usize,
    pub ended_calls: usize,
    pub failed_calls: usize,
    pub readers: ReaderStats,
}

impl CallEngine {
    /// Create the engine with the given configuration and database path
    /// (`None` selects an in-memory database) and the default logging
    /// notification dispatcher.
    pub async fn new(config: CallEngineConfig, db_path: Option<String>) -> Result<Arc<Self>> {
        Self::with_dispatcher(config, db_path, Arc::new(TracingDispatcher)).await
    }

    /// Create the engine with an explicit notification dispatcher.
    pub async fn with_dispatcher(
        config: CallEngineConfig,
        db_path: Option<String>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Result<Arc<Self>> {
        let db = CallEngineDatabase::new(db_path).await?;
        let registry = ReaderRegistry::new(db.clone());
        let matcher = Matcher::new(registry.clone());
        let rules = EscalationRules::from_config(&config.escalation);
        let audit = AuditLog::new(db.clone());

        info!(
            "Call engine initialized (max escalation level {}, ring timeout {}s)",
            config.escalation.max_escalation_level, config.escalation.ring_timeout_secs
        );

        Ok(Arc::new(Self {
            config,
            db,
            registry,
            matcher,
            scheduler: EscalationScheduler::new(),
            rules,
            audit,
            dispatcher,
            sessions: DashMap::new(),
        }))
    }

    pub fn config(&self) -> &CallEngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ReaderRegistry {
        &self.registry
    }

    pub fn database(&self) -> &CallEngineDatabase {
        &self.db
    }

    pub(crate) fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub(crate) fn scheduler(&self) -> &EscalationScheduler {
        &self.scheduler
    }

    pub(crate) fn rules(&self) -> &EscalationRules {
        &self.rules
    }

    pub(crate) fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub(crate) fn dispatcher(&self) -> &Arc<dyn NotificationDispatcher> {
        &self.dispatcher
    }

    pub(crate) fn session_entry(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<Mutex<CallSession>>> {
        self.sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CallEngineError::SessionNotFound(session_id.to_string()))
    }

    pub(crate) fn insert_session_entry(&self, session: CallSession) -> Arc<Mutex<CallSession>> {
        let entry = Arc::new(Mutex::new(session.clone()));
        self.sessions.insert(session.session_id, Arc::clone(&entry));
        entry
    }

    /// Current snapshot of a session.
    pub async fn get_session(&self, session_id: &SessionId) -> Result<CallSession> {
        let entry = self.session_entry(session_id)?;
        let guard = entry.lock().await;
        Ok(guard.clone())
    }

    /// Full audit history for a session, in order.
    pub fn session_history(&self, session_id: &SessionId) -> Vec<AuditEntry> {
        self.audit.session_history(session_id)
    }

    /// Aggregate counts across live sessions and the reader pool.
    pub async fn get_stats(&self) -> Result<EngineStats> {
        let entries: Vec<Arc<Mutex<CallSession>>> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut stats = EngineStats {
            total_sessions: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            let guard = entry.lock().await;
            match guard.status {
                CallStatus::Pending => stats.pending_calls += 1,
                CallStatus::Ringing => stats.ringing_calls += 1,
                CallStatus::Escalated => stats.escalated_calls += 1,
                CallStatus::Active => stats.active_calls += 1,
                CallStatus::Ended => stats.ended_calls += 1,
                CallStatus::Failed => stats.failed_calls += 1,
            }
        }
        stats.readers = self.registry.stats().await?;
        Ok(stats)
    }

    /// Abort all outstanding timers. Sessions already persisted keep their
    /// state; nothing fires after shutdown.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        info!("Call engine shut down");
    }

    /// Arm the ring timer for a session at the given escalation level.
    /// A fire escalates with reason `timeout` iff the session is still
    /// ringing at that level when it arrives; the level is the fire's
    /// epoch, so a fire that slept through a reassignment cannot act on
    /// the replacement assignment.
    pub(crate) fn arm_ring_timer(self: &Arc<Self>, session_id: SessionId, level: u32) {
        let timeout = self.rules.timeout_for(EscalationReason::Timeout, level);
        let engine = Arc::downgrade(self);
        let fire_id = session_id.clone();
        self.scheduler.arm(session_id, timeout, async move {
            if let Some(engine) = engine.upgrade() {
                engine.handle_ring_timeout(fire_id, level).await;
            }
        });
    }

    /// Arm the short retry timer for a session escalated to `level` with
    /// no reader available.
    pub(crate) fn arm_retry_timer(self: &Arc<Self>, session_id: SessionId, level: u32) {
        let delay = self.config.escalation.no_reader_retry_delay();
        let engine = Arc::downgrade(self);
        let fire_id = session_id.clone();
        self.scheduler.arm(session_id, delay, async move {
            if let Some(engine) = engine.upgrade() {
                engine.handle_no_reader_retry(fire_id, level).await;
            }
        });
    }

    /// Evict terminal sessions older than `retention` from the in-memory
    /// maps, together with their in-memory audit history. The durable rows
    /// keep the full record; live sessions are never touched. Returns the
    /// number of sessions evicted.
    pub async fn evict_terminal_sessions(&self, retention: std::time::Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(retention.as_secs() as i64);
        let entries: Vec<(SessionId, Arc<Mutex<CallSession>>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut evicted = 0;
        for (session_id, entry) in entries {
            let guard = entry.lock().await;
            let expired =
                guard.status.is_terminal() && guard.ended_at.map_or(true, |t| t < cutoff);
            drop(guard);
            if expired {
                self.sessions.remove(&session_id);
                self.audit.evict(&session_id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("Evicted {} terminal sessions from memory", evicted);
        }
        evicted
    }

    pub(crate) fn debug_stale_fire(&self, session_id: &SessionId, status: CallStatus) {
        debug!(
            "Timer fire for session {} ignored in state {}",
            session_id, status
        );
    }
}
