//! Append-only audit log
//!
//! Every state transition, escalation, match attempt and notification
//! delivery attempt is recorded with a monotonic per-session sequence
//! number, enabling full reconstruction of a session's history. Entries are
//! kept in memory for fast reads and written through to the append-only
//! `audit_log` table; the durable copy failing is logged, never fatal.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::database::CallEngineDatabase;
use crate::session::{CallStatus, SessionId};

/// One audited event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    SessionCreated {
        client_id: String,
        call_type: String,
        is_emergency: bool,
    },
    StateChanged {
        old_status: CallStatus,
        new_status: CallStatus,
        reason: Option<String>,
    },
    MatchAttempt {
        excluded: usize,
        outcome: String,
    },
    EscalationCreated {
        escalation_id: String,
        level: u32,
        reason: String,
    },
    EscalationClosed {
        status: String,
    },
    TimerArmed {
        trigger: String,
        timeout_ms: u64,
    },
    TimerCancelled,
    NotificationAttempt {
        recipient: String,
        is_siren: bool,
        delivered: bool,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::SessionCreated { .. } => "session_created",
            AuditEvent::StateChanged { .. } => "state_changed",
            AuditEvent::MatchAttempt { .. } => "match_attempt",
            AuditEvent::EscalationCreated { .. } => "escalation_created",
            AuditEvent::EscalationClosed { .. } => "escalation_closed",
            AuditEvent::TimerArmed { .. } => "timer_armed",
            AuditEvent::TimerCancelled => "timer_cancelled",
            AuditEvent::NotificationAttempt { .. } => "notification_attempt",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub event: AuditEvent,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuditLog {
    entries: Arc<DashMap<SessionId, Vec<AuditEntry>>>,
    db: CallEngineDatabase,
}

impl AuditLog {
    pub fn new(db: CallEngineDatabase) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            db,
        }
    }

    /// Append an event for a session. Sequence numbers are monotonic per
    /// session; no entry is ever updated or removed.
    pub async fn record(&self, session_id: &SessionId, event: AuditEvent) {
        let (seq, entry) = {
            let mut entries = self.entries.entry(session_id.clone()).or_default();
            let seq = entries.len() as u64 + 1;
            let entry = AuditEntry {
                seq,
                event,
                recorded_at: Utc::now(),
            };
            entries.push(entry.clone());
            (seq, entry)
        };

        let detail = serde_json::to_string(&entry.event).unwrap_or_default();
        if let Err(e) = self
            .db
            .insert_audit_entry(session_id, seq, entry.event.name(), &detail)
            .await
        {
            warn!(
                "Audit write for session {} seq {} failed: {}",
                session_id, seq, e
            );
        }
    }

    /// Drop a session's in-memory history. Only called for sessions whose
    /// durable rows already carry the full record; `record` is never
    /// invoked again for an evicted (terminal) session.
    pub fn evict(&self, session_id: &SessionId) {
        self.entries.remove(session_id);
    }

    /// Full in-order history for a session.
    pub fn session_history(&self, session_id: &SessionId) -> Vec<AuditEntry> {
        self.entries
            .get(session_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}
