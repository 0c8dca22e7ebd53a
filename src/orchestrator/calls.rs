//! Call session transitions
//!
//! Every public operation locks the session, validates the transition,
//! persists the new state, commits it in memory and only then — after the
//! lock is dropped — dispatches notifications. Timer fires come through
//! `handle_ring_timeout`/`handle_no_reader_retry` and re-check state under
//! the same lock, so a timeout can never escalate a call that was just
//! answered.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::audit::AuditEvent;
use crate::error::{CallEngineError, Result};
use crate::escalation::{
    auto_priority, EscalationKind, EscalationReason, EscalationRecord, EscalationStatus,
};
use crate::matcher::MatchOutcome;
use crate::notify::NotificationEvent;
use crate::orchestrator::CallEngine;
use crate::reader::ReaderId;
use crate::session::{CallSession, CallStatus, CallType, ClientId, SessionId};

/// Notifications collected during a locked transition, dispatched after
/// the lock is dropped and the row is persisted.
#[derive(Default)]
struct Effects {
    notifications: Vec<NotificationEvent>,
}

impl CallEngine {
    /// Intake a new emergency call request.
    ///
    /// The session is created in `pending` and immediately matched: on
    /// success it returns in `ringing` with a timer armed; with the pool
    /// exhausted it returns in `escalated` (retrying shortly) or, if the
    /// depth cap is already spent, `failed`. The requester never sees a
    /// raw internal error for pool exhaustion.
    pub async fn create_call(
        self: &Arc<Self>,
        client_id: ClientId,
        call_type: CallType,
        is_emergency: bool,
        scheduled_duration_secs: Option<i64>,
    ) -> Result<CallSession> {
        let mut session = CallSession::new(client_id.clone(), call_type, is_emergency);
        session.scheduled_duration_secs = scheduled_duration_secs;
        self.database().insert_session(&session).await?;
        self.audit_log()
            .record(
                &session.session_id,
                AuditEvent::SessionCreated {
                    client_id: client_id.to_string(),
                    call_type: call_type.as_str().to_string(),
                    is_emergency,
                },
            )
            .await;
        info!(
            "Created {} session {} for client {} (emergency: {})",
            call_type.as_str(),
            session.session_id,
            client_id,
            is_emergency
        );

        let entry = self.insert_session_entry(session);
        let mut guard = entry.lock().await;
        let mut effects = Effects::default();

        match self.matcher().find_and_reserve(&guard.tried_readers).await? {
            MatchOutcome::Assigned(reader_id) => {
                self.commit_ringing(&mut guard, reader_id, None, &mut effects)
                    .await?;
            }
            MatchOutcome::NoReaderAvailable => {
                self.record_match_miss(&guard).await;
                self.escalate_step(
                    &mut guard,
                    EscalationReason::ReaderOffline,
                    EscalationKind::Auto,
                    &mut effects,
                )
                .await?;
            }
        }

        let snapshot = guard.clone();
        drop(guard);
        self.flush(effects).await;
        Ok(snapshot)
    }

    /// A reader picks up a ringing call.
    ///
    /// Valid only from `ringing` and only for the currently assigned
    /// reader; duplicate answers are rejected with `InvalidTransition` so
    /// two readers can never both believe they hold the same caller.
    pub async fn answer(&self, session_id: &SessionId, reader_id: &ReaderId) -> Result<CallSession> {
        let entry = self.session_entry(session_id)?;
        let mut guard = entry.lock().await;

        if guard.status != CallStatus::Ringing {
            return Err(CallEngineError::invalid_transition(
                session_id.as_str(),
                format!("answer is only valid from ringing, session is {}", guard.status),
            ));
        }
        if guard.assigned_reader.as_ref() != Some(reader_id) {
            return Err(CallEngineError::invalid_transition(
                session_id.as_str(),
                format!("reader {} is not assigned to this session", reader_id),
            ));
        }

        let mut updated = guard.clone();
        updated.status = CallStatus::Active;
        updated.started_at = Some(Utc::now());
        self.database().update_session(&updated).await?;

        let closed = self
            .database()
            .close_unresolved_escalations(session_id, EscalationStatus::Resolved)
            .await?;

        self.scheduler().cancel(session_id);
        self.audit_log()
            .record(session_id, AuditEvent::TimerCancelled)
            .await;
        if closed > 0 {
            self.audit_log()
                .record(
                    session_id,
                    AuditEvent::EscalationClosed {
                        status: EscalationStatus::Resolved.as_str().to_string(),
                    },
                )
                .await;
        }
        self.audit_log()
            .record(
                session_id,
                AuditEvent::StateChanged {
                    old_status: CallStatus::Ringing,
                    new_status: CallStatus::Active,
                    reason: Some(format!("answered by reader {}", reader_id)),
                },
            )
            .await;

        *guard = updated;
        info!("Session {} answered by reader {}", session_id, reader_id);
        Ok(guard.clone())
    }

    /// Terminate a call.
    ///
    /// Valid from `active` (normal completion) and from
    /// `ringing`/`pending`/`escalated` (caller abandonment before answer).
    /// A second `end` on a terminal session is an idempotent no-op.
    pub async fn end(&self, session_id: &SessionId) -> Result<CallSession> {
        let entry = self.session_entry(session_id)?;
        let mut guard = entry.lock().await;

        if guard.status.is_terminal() {
            // Timer cancellation is still attempted; no-op when none armed
            self.scheduler().cancel(session_id);
            return Ok(guard.clone());
        }
        let old_status = guard.status;

        if let Some(reader_id) = guard.assigned_reader.clone() {
            self.matcher().release(&reader_id).await?;
        }

        let mut updated = guard.clone();
        updated.status = CallStatus::Ended;
        updated.ended_at = Some(Utc::now());
        updated.compute_actual_duration();
        self.database().update_session(&updated).await?;

        let closed = self
            .database()
            .close_unresolved_escalations(session_id, EscalationStatus::Cancelled)
            .await?;

        self.scheduler().cancel(session_id);
        self.audit_log()
            .record(session_id, AuditEvent::TimerCancelled)
            .await;
        if closed > 0 {
            self.audit_log()
                .record(
                    session_id,
                    AuditEvent::EscalationClosed {
                        status: EscalationStatus::Cancelled.as_str().to_string(),
                    },
                )
                .await;
        }
        self.audit_log()
            .record(
                session_id,
                AuditEvent::StateChanged {
                    old_status,
                    new_status: CallStatus::Ended,
                    reason: match old_status {
                        CallStatus::Active => Some("call completed".to_string()),
                        _ => Some("abandoned before answer".to_string()),
                    },
                },
            )
            .await;

        *guard = updated;
        info!(
            "Session {} ended from {} (duration: {:?}s)",
            session_id, old_status, guard.actual_duration_secs
        );
        Ok(guard.clone())
    }

    /// Administrator-invoked escalation. The acting admin is an explicit
    /// parameter — there is no ambient identity in the engine.
    pub async fn escalate_manual(
        self: &Arc<Self>,
        session_id: &SessionId,
        admin_id: &str,
        reason: EscalationReason,
    ) -> Result<CallSession> {
        let entry = self.session_entry(session_id)?;
        let mut guard = entry.lock().await;

        if guard.status != CallStatus::Ringing {
            return Err(CallEngineError::invalid_transition(
                session_id.as_str(),
                format!(
                    "manual escalation is only valid from ringing, session is {}",
                    guard.status
                ),
            ));
        }

        info!(
            "Manual escalation of session {} by admin {} ({})",
            session_id, admin_id, reason
        );
        let mut effects = Effects::default();
        self.escalate_step(&mut guard, reason, EscalationKind::Manual, &mut effects)
            .await?;

        let snapshot = guard.clone();
        drop(guard);
        self.flush(effects).await;
        Ok(snapshot)
    }

    /// Ring timer fired. Escalates iff the session is still ringing at the
    /// level the timer was armed for — an answer that won the race, or a
    /// reassignment that re-entered ringing at a higher level, makes this a
    /// no-op. A fire that has finished its sleep can no longer be cancelled,
    /// so the state check alone is not enough: a manual escalation could
    /// slip in between the sleep and the lock and put the session back in
    /// ringing against a different reader.
    pub(crate) async fn handle_ring_timeout(self: Arc<Self>, session_id: SessionId, level: u32) {
        let Ok(entry) = self.session_entry(&session_id) else {
            return;
        };
        let mut guard = entry.lock().await;
        if guard.status != CallStatus::Ringing || guard.escalation_level != level {
            self.debug_stale_fire(&session_id, guard.status);
            return;
        }

        let mut effects = Effects::default();
        if let Err(e) = self
            .escalate_step(
                &mut guard,
                EscalationReason::Timeout,
                EscalationKind::Auto,
                &mut effects,
            )
            .await
        {
            self.fail_on_storage_error(&mut guard, &e, &mut effects).await;
        }
        drop(guard);
        self.flush(effects).await;
    }

    /// No-reader retry timer fired. Runs another escalation step iff the
    /// session is still parked in `escalated` at the armed level.
    pub(crate) async fn handle_no_reader_retry(self: Arc<Self>, session_id: SessionId, level: u32) {
        let Ok(entry) = self.session_entry(&session_id) else {
            return;
        };
        let mut guard = entry.lock().await;
        if guard.status != CallStatus::Escalated || guard.escalation_level != level {
            self.debug_stale_fire(&session_id, guard.status);
            return;
        }

        let mut effects = Effects::default();
        if let Err(e) = self
            .escalate_step(
                &mut guard,
                EscalationReason::ReaderOffline,
                EscalationKind::Auto,
                &mut effects,
            )
            .await
        {
            self.fail_on_storage_error(&mut guard, &e, &mut effects).await;
        }
        drop(guard);
        self.flush(effects).await;
    }

    /// One escalation step: release the current reader, bump the level
    /// (failing the session past the cap), create the next escalation
    /// record and re-match excluding every reader already tried.
    async fn escalate_step(
        self: &Arc<Self>,
        session: &mut CallSession,
        reason: EscalationReason,
        kind: EscalationKind,
        effects: &mut Effects,
    ) -> Result<()> {
        let session_id = session.session_id.clone();
        let escalated_from = session.assigned_reader.clone();

        if let Some(reader_id) = &escalated_from {
            self.matcher().release(reader_id).await?;
        }

        let new_level = session.escalation_level + 1;
        if new_level > self.config().escalation.max_escalation_level {
            return self.fail_session(session, reason, effects).await;
        }

        // Supersede whatever record is still open; at most one unresolved
        // record may exist per session
        let previous = self.database().unresolved_escalation(&session_id).await?;
        let closed = self
            .database()
            .close_unresolved_escalations(&session_id, EscalationStatus::Cancelled)
            .await?;
        if closed > 0 {
            self.audit_log()
                .record(
                    &session_id,
                    AuditEvent::EscalationClosed {
                        status: EscalationStatus::Cancelled.as_str().to_string(),
                    },
                )
                .await;
        }

        let priority = match kind {
            EscalationKind::Manual => 5,
            EscalationKind::Auto => auto_priority(new_level),
        };
        let record = EscalationRecord::new(
            session_id.clone(),
            previous.map(|p| p.escalation_id),
            escalated_from,
            reason,
            kind,
            priority,
        );
        self.database().insert_escalation(&record).await?;
        self.audit_log()
            .record(
                &session_id,
                AuditEvent::EscalationCreated {
                    escalation_id: record.escalation_id.clone(),
                    level: new_level,
                    reason: reason.as_str().to_string(),
                },
            )
            .await;

        let old_status = session.status;
        match self.matcher().find_and_reserve(&session.tried_readers).await? {
            MatchOutcome::Assigned(reader_id) => {
                let mut updated = session.clone();
                updated.escalation_level = new_level;
                self.commit_ringing_inner(
                    session,
                    updated,
                    reader_id.clone(),
                    Some(record.escalation_id.as_str()),
                )
                .await?;
                effects.notifications.push(NotificationEvent {
                    recipient: reader_id.to_string(),
                    is_emergency: session.is_emergency,
                    is_siren: true,
                    title: "Escalated emergency call".to_string(),
                    body: format!(
                        "Session {} escalated to you at level {} ({})",
                        session_id, new_level, reason
                    ),
                    session_id: session_id.clone(),
                });
            }
            MatchOutcome::NoReaderAvailable => {
                self.record_match_miss(session).await;
                let mut updated = session.clone();
                updated.status = CallStatus::Escalated;
                updated.escalation_level = new_level;
                updated.assigned_reader = None;
                self.database().update_session(&updated).await?;
                *session = updated;

                self.arm_retry_timer(session_id.clone(), new_level);
                self.audit_log()
                    .record(
                        &session_id,
                        AuditEvent::TimerArmed {
                            trigger: EscalationReason::ReaderOffline.as_str().to_string(),
                            timeout_ms: self
                                .config()
                                .escalation
                                .no_reader_retry_delay()
                                .as_millis() as u64,
                        },
                    )
                    .await;
                if old_status != CallStatus::Escalated {
                    self.audit_log()
                        .record(
                            &session_id,
                            AuditEvent::StateChanged {
                                old_status,
                                new_status: CallStatus::Escalated,
                                reason: Some(reason.as_str().to_string()),
                            },
                        )
                        .await;
                }

                warn!(
                    "Session {} escalated to level {} with no reader available",
                    session_id, new_level
                );
                effects.notifications.push(NotificationEvent {
                    recipient: self.config().escalation.admin_recipient.clone(),
                    is_emergency: session.is_emergency,
                    is_siren: true,
                    title: "Emergency call awaiting reader".to_string(),
                    body: format!(
                        "Session {} at escalation level {}: no eligible reader, retrying",
                        session_id, new_level
                    ),
                    session_id: session_id.clone(),
                });
            }
        }

        Ok(())
    }

    /// Escalation depth exhausted: terminal failure, handed to humans.
    async fn fail_session(
        &self,
        session: &mut CallSession,
        reason: EscalationReason,
        effects: &mut Effects,
    ) -> Result<()> {
        let session_id = session.session_id.clone();
        let old_status = session.status;

        let mut updated = session.clone();
        updated.status = CallStatus::Failed;
        updated.assigned_reader = None;
        updated.ended_at = Some(Utc::now());
        self.database().update_session(&updated).await?;

        let closed = self
            .database()
            .close_unresolved_escalations(&session_id, EscalationStatus::Cancelled)
            .await?;
        self.scheduler().cancel(&session_id);

        if closed > 0 {
            self.audit_log()
                .record(
                    &session_id,
                    AuditEvent::EscalationClosed {
                        status: EscalationStatus::Cancelled.as_str().to_string(),
                    },
                )
                .await;
        }
        self.audit_log()
            .record(
                &session_id,
                AuditEvent::StateChanged {
                    old_status,
                    new_status: CallStatus::Failed,
                    reason: Some(format!("escalation depth exhausted ({})", reason)),
                },
            )
            .await;

        *session = updated;
        error!(
            "Session {} failed after exhausting escalation depth {}",
            session_id,
            self.config().escalation.max_escalation_level
        );
        effects.notifications.push(NotificationEvent {
            recipient: self.config().escalation.admin_recipient.clone(),
            is_emergency: session.is_emergency,
            is_siren: true,
            title: "Emergency call needs human intervention".to_string(),
            body: format!(
                "Session {} exhausted all escalation levels without an answer",
                session_id
            ),
            session_id,
        });
        Ok(())
    }

    /// Last-resort failure for a timer-driven escalation whose storage
    /// operations kept failing. The timer already consumed itself, so
    /// returning the error would strand the session in a non-terminal state
    /// with nothing armed against it; instead the in-memory state is
    /// committed to `failed` even if the row cannot be written, and every
    /// remaining storage step is attempted best-effort.
    async fn fail_on_storage_error(
        &self,
        session: &mut CallSession,
        cause: &CallEngineError,
        effects: &mut Effects,
    ) {
        let session_id = session.session_id.clone();
        let old_status = session.status;

        if let Some(reader_id) = session.assigned_reader.take() {
            if let Err(e) = self.matcher().release(&reader_id).await {
                warn!(
                    "Release for reader {} during forced failure of session {} failed: {}",
                    reader_id, session_id, e
                );
            }
        }

        session.status = CallStatus::Failed;
        session.ended_at = Some(Utc::now());
        if let Err(e) = self.database().update_session(session).await {
            warn!("Failed session {} could not be persisted: {}", session_id, e);
        }
        if let Err(e) = self
            .database()
            .close_unresolved_escalations(&session_id, EscalationStatus::Cancelled)
            .await
        {
            warn!(
                "Open escalations for session {} could not be closed: {}",
                session_id, e
            );
        }
        self.scheduler().cancel(&session_id);

        self.audit_log()
            .record(
                &session_id,
                AuditEvent::StateChanged {
                    old_status,
                    new_status: CallStatus::Failed,
                    reason: Some(format!("storage failure during escalation: {}", cause)),
                },
            )
            .await;

        error!(
            "Session {} failed after storage errors during escalation: {}",
            session_id, cause
        );
        effects.notifications.push(NotificationEvent {
            recipient: self.config().escalation.admin_recipient.clone(),
            is_emergency: session.is_emergency,
            is_siren: true,
            title: "Emergency call needs human intervention".to_string(),
            body: format!(
                "Session {} could not be escalated and was failed",
                session_id
            ),
            session_id,
        });
    }

    /// Commit `pending → ringing` for the initial match.
    async fn commit_ringing(
        self: &Arc<Self>,
        session: &mut CallSession,
        reader_id: ReaderId,
        escalation_id: Option<&str>,
        effects: &mut Effects,
    ) -> Result<()> {
        let updated = session.clone();
        self.commit_ringing_inner(session, updated, reader_id.clone(), escalation_id)
            .await?;
        effects.notifications.push(NotificationEvent {
            recipient: reader_id.to_string(),
            is_emergency: session.is_emergency,
            is_siren: session.is_emergency,
            title: "Incoming emergency call".to_string(),
            body: format!(
                "Client {} is requesting an emergency {} call",
                session.client_id,
                session.call_type.as_str()
            ),
            session_id: session.session_id.clone(),
        });
        Ok(())
    }

    /// Shared ringing commit: persist, mark the escalation record assigned,
    /// arm the ring timer, update the audit trail. The reservation is
    /// rolled back if persistence fails.
    async fn commit_ringing_inner(
        self: &Arc<Self>,
        session: &mut CallSession,
        mut updated: CallSession,
        reader_id: ReaderId,
        escalation_id: Option<&str>,
    ) -> Result<()> {
        let session_id = session.session_id.clone();
        let old_status = session.status;

        updated.status = CallStatus::Ringing;
        updated.assigned_reader = Some(reader_id.clone());
        updated.tried_readers.insert(reader_id.clone());
        if let Err(e) = self.database().update_session(&updated).await {
            // Give the capacity unit back; the transition never happened
            if let Err(release_err) = self.matcher().release(&reader_id).await {
                error!(
                    "Rollback release for reader {} failed: {}",
                    reader_id, release_err
                );
            }
            return Err(e);
        }

        if let Some(escalation_id) = escalation_id {
            self.database()
                .assign_escalation(escalation_id, &reader_id)
                .await?;
        }

        self.audit_log()
            .record(
                &session_id,
                AuditEvent::MatchAttempt {
                    excluded: session.tried_readers.len(),
                    outcome: format!("assigned:{}", reader_id),
                },
            )
            .await;

        let level = updated.escalation_level;
        *session = updated;

        self.arm_ring_timer(session_id.clone(), level);
        self.audit_log()
            .record(
                &session_id,
                AuditEvent::TimerArmed {
                    trigger: EscalationReason::Timeout.as_str().to_string(),
                    timeout_ms: self
                        .rules()
                        .timeout_for(EscalationReason::Timeout, level)
                        .as_millis() as u64,
                },
            )
            .await;
        self.audit_log()
            .record(
                &session_id,
                AuditEvent::StateChanged {
                    old_status,
                    new_status: CallStatus::Ringing,
                    reason: Some(format!("assigned reader {}", reader_id)),
                },
            )
            .await;

        Ok(())
    }

    async fn record_match_miss(&self, session: &CallSession) {
        self.audit_log()
            .record(
                &session.session_id,
                AuditEvent::MatchAttempt {
                    excluded: session.tried_readers.len(),
                    outcome: "no_reader_available".to_string(),
                },
            )
            .await;
    }

    /// Dispatch collected notifications. Best-effort: failures are logged
    /// and audited, never surfaced to the transition caller.
    async fn flush(&self, effects: Effects) {
        for event in effects.notifications {
            let session_id = event.session_id.clone();
            let recipient = event.recipient.clone();
            let is_siren = event.is_siren;
            let delivered = match self.dispatcher().notify(event).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        "Notification to {} for session {} failed: {}",
                        recipient, session_id, e
                    );
                    false
                }
            };
            self.audit_log()
                .record(
                    &session_id,
                    AuditEvent::NotificationAttempt {
                        recipient,
                        is_siren,
                        delivered,
                    },
                )
                .await;
        }
    }
}
