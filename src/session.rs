//! Call session types
//!
//! A [`CallSession`] owns the lifecycle of one emergency call from creation
//! to termination. The engine in [`crate::orchestrator`] is the sole writer
//! of `status`; terminal states are immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::reader::ReaderId;

/// Unique session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to the requesting client (owned externally)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "voice" => Some(CallType::Voice),
            "video" => Some(CallType::Video),
            _ => None,
        }
    }
}

/// Call session state machine values
///
/// ```text
/// pending ──► ringing ──► active ──► ended
///    │           │  ▲                  ▲
///    │           ▼  │                  │
///    └──────► escalated ──────► failed │
///                └─────────────────────┘ (abandonment)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Created, match not yet attempted or still in flight
    Pending,
    /// A reader is assigned and being alerted
    Ringing,
    /// Searching for the next reader after a timeout or empty pool
    Escalated,
    /// Answered; media path established externally
    Active,
    /// Terminal: completed or abandoned
    Ended,
    /// Terminal: escalation depth exhausted, handed to the admin tier
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Pending => "pending",
            CallStatus::Ringing => "ringing",
            CallStatus::Escalated => "escalated",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CallStatus::Pending),
            "ringing" => Some(CallStatus::Ringing),
            "escalated" => Some(CallStatus::Escalated),
            "active" => Some(CallStatus::Active),
            "ended" => Some(CallStatus::Ended),
            "failed" => Some(CallStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Failed)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emergency call from intake to termination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub session_id: SessionId,
    pub client_id: ClientId,
    /// Currently assigned reader; `None` while searching
    pub assigned_reader: Option<ReaderId>,
    pub call_type: CallType,
    pub is_emergency: bool,
    pub status: CallStatus,
    /// Starts at 1; only ever increases within a session
    pub escalation_level: u32,
    pub initiated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub scheduled_duration_secs: Option<i64>,
    /// Non-negative end − start; set once both timestamps exist
    pub actual_duration_secs: Option<i64>,
    /// Readers already tried for this session, excluded from re-matching
    #[serde(default)]
    pub tried_readers: HashSet<ReaderId>,
}

impl CallSession {
    pub fn new(client_id: ClientId, call_type: CallType, is_emergency: bool) -> Self {
        Self {
            session_id: SessionId::new(),
            client_id,
            assigned_reader: None,
            call_type,
            is_emergency,
            status: CallStatus::Pending,
            escalation_level: 1,
            initiated_at: Utc::now(),
            started_at: None,
            ended_at: None,
            scheduled_duration_secs: None,
            actual_duration_secs: None,
            tried_readers: HashSet::new(),
        }
    }

    /// Derive `actual_duration_secs` once start and end are both known,
    /// floored at zero against clock adjustments
    pub fn compute_actual_duration(&mut self) {
        if let (Some(start), Some(end)) = (self.started_at, self.ended_at) {
            self.actual_duration_secs = Some((end - start).num_seconds().max(0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_session_starts_pending_at_level_one() {
        let session = CallSession::new(
            ClientId("client-1".to_string()),
            CallType::Voice,
            true,
        );
        assert_eq!(session.status, CallStatus::Pending);
        assert_eq!(session.escalation_level, 1);
        assert!(session.assigned_reader.is_none());
        assert!(session.actual_duration_secs.is_none());
    }

    #[test]
    fn actual_duration_is_non_negative() {
        let mut session = CallSession::new(
            ClientId("client-1".to_string()),
            CallType::Video,
            false,
        );
        let now = Utc::now();
        session.started_at = Some(now);
        session.ended_at = Some(now - Duration::seconds(5));
        session.compute_actual_duration();
        assert_eq!(session.actual_duration_secs, Some(0));

        session.ended_at = Some(now + Duration::seconds(42));
        session.compute_actual_duration();
        assert_eq!(session.actual_duration_secs, Some(42));
    }

    #[test]
    fn duration_stays_unset_without_answer() {
        let mut session = CallSession::new(
            ClientId("client-1".to_string()),
            CallType::Voice,
            true,
        );
        session.ended_at = Some(Utc::now());
        session.compute_actual_duration();
        assert!(session.actual_duration_secs.is_none());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            CallStatus::Pending,
            CallStatus::Ringing,
            CallStatus::Escalated,
            CallStatus::Active,
            CallStatus::Ended,
            CallStatus::Failed,
        ] {
            assert_eq!(CallStatus::parse(status.as_str()), Some(status));
        }
        assert!(CallStatus::parse("bogus").is_none());
    }
}
