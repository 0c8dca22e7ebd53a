//! Escalation records, rules and the timeout scheduler
//!
//! An escalation is the act of moving an unanswered or stalled session to a
//! different responder. Records are append-style rows referencing the
//! session and, optionally, the escalation that preceded them; a session has
//! at most one unresolved record at any time. The scheduler that drives
//! timeout-based escalation lives in [`scheduler`].

pub mod scheduler;

pub use scheduler::EscalationScheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::EscalationConfig;
use crate::reader::ReaderId;
use crate::session::SessionId;

/// Why a session was escalated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EscalationReason {
    /// Ring timer expired before the reader answered
    Timeout,
    /// Reader explicitly declined or never picked up
    NoAnswer,
    /// Administrator-invoked escalation
    Manual,
    /// No reachable reader (pool empty or reader dropped offline)
    ReaderOffline,
    /// Content flagged mid-call by the review pipeline
    FlaggedContent,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::Timeout => "timeout",
            EscalationReason::NoAnswer => "no-answer",
            EscalationReason::Manual => "manual",
            EscalationReason::ReaderOffline => "reader-offline",
            EscalationReason::FlaggedContent => "flagged-content",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(EscalationReason::Timeout),
            "no-answer" => Some(EscalationReason::NoAnswer),
            "manual" => Some(EscalationReason::Manual),
            "reader-offline" => Some(EscalationReason::ReaderOffline),
            "flagged-content" => Some(EscalationReason::FlaggedContent),
            _ => None,
        }
    }
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the escalation was created by the scheduler or by an admin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationKind {
    Auto,
    Manual,
}

impl EscalationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationKind::Auto => "auto",
            EscalationKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(EscalationKind::Auto),
            "manual" => Some(EscalationKind::Manual),
            _ => None,
        }
    }
}

/// Lifecycle of a single escalation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    /// Created, no reader assigned yet
    Pending,
    /// A reader was assigned for this escalation
    Assigned,
    /// The session reached active (or was explicitly closed out)
    Resolved,
    /// Superseded by a later escalation or abandoned
    Cancelled,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::Assigned => "assigned",
            EscalationStatus::Resolved => "resolved",
            EscalationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EscalationStatus::Pending),
            "assigned" => Some(EscalationStatus::Assigned),
            "resolved" => Some(EscalationStatus::Resolved),
            "cancelled" => Some(EscalationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, EscalationStatus::Pending | EscalationStatus::Assigned)
    }
}

/// One escalation step for a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub escalation_id: String,
    pub session_id: SessionId,
    /// Prior escalation in this session's chain, if any
    pub previous_escalation_id: Option<String>,
    pub escalated_from: Option<ReaderId>,
    pub escalated_to: Option<ReaderId>,
    pub reason: EscalationReason,
    pub kind: EscalationKind,
    pub status: EscalationStatus,
    /// 1 (lowest) to 5 (highest)
    pub priority_level: u32,
    pub escalated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscalationRecord {
    pub fn new(
        session_id: SessionId,
        previous_escalation_id: Option<String>,
        escalated_from: Option<ReaderId>,
        reason: EscalationReason,
        kind: EscalationKind,
        priority_level: u32,
    ) -> Self {
        Self {
            escalation_id: uuid::Uuid::new_v4().to_string(),
            session_id,
            previous_escalation_id,
            escalated_from,
            escalated_to: None,
            reason,
            kind,
            status: EscalationStatus::Pending,
            priority_level: priority_level.clamp(1, 5),
            escalated_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Timeout lookup keyed by `(trigger, level)`
///
/// Deployments can tune each trigger condition independently; the table is
/// a static set of overrides on top of the default ring timeout.
#[derive(Debug, Clone)]
pub struct EscalationRules {
    default_timeout: Duration,
    overrides: Vec<(EscalationReason, u32, Duration)>,
}

impl EscalationRules {
    pub fn from_config(config: &EscalationConfig) -> Self {
        Self {
            default_timeout: config.ring_timeout(),
            overrides: config
                .overrides
                .iter()
                .map(|o| (o.trigger, o.level, Duration::from_secs(o.timeout_secs)))
                .collect(),
        }
    }

    /// Timeout to arm for a session ringing at `level`, escalating with
    /// `trigger` when it fires
    pub fn timeout_for(&self, trigger: EscalationReason, level: u32) -> Duration {
        self.overrides
            .iter()
            .find(|(t, l, _)| *t == trigger && *l == level)
            .map(|(_, _, d)| *d)
            .unwrap_or(self.default_timeout)
    }
}

/// Priority carried by an auto escalation at the given level
pub fn auto_priority(level: u32) -> u32 {
    (2 + level).min(5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EscalationRuleOverride;

    #[test]
    fn rule_lookup_prefers_override() {
        let config = EscalationConfig {
            overrides: vec![EscalationRuleOverride {
                trigger: EscalationReason::Timeout,
                level: 2,
                timeout_secs: 15,
            }],
            ..Default::default()
        };
        let rules = EscalationRules::from_config(&config);

        assert_eq!(
            rules.timeout_for(EscalationReason::Timeout, 2),
            Duration::from_secs(15)
        );
        // Unmatched (trigger, level) pairs fall back to the default
        assert_eq!(
            rules.timeout_for(EscalationReason::Timeout, 1),
            Duration::from_secs(30)
        );
        assert_eq!(
            rules.timeout_for(EscalationReason::NoAnswer, 2),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn priority_is_capped_at_five() {
        assert_eq!(auto_priority(1), 3);
        assert_eq!(auto_priority(2), 4);
        assert_eq!(auto_priority(3), 5);
        assert_eq!(auto_priority(9), 5);
    }

    #[test]
    fn new_record_starts_pending() {
        let record = EscalationRecord::new(
            SessionId::new(),
            None,
            Some(ReaderId("reader-1".to_string())),
            EscalationReason::Timeout,
            EscalationKind::Auto,
            3,
        );
        assert_eq!(record.status, EscalationStatus::Pending);
        assert!(record.escalated_to.is_none());
        assert!(record.resolved_at.is_none());
    }
}
