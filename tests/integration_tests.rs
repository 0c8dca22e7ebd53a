//! End-to-end call lifecycle tests
//!
//! Each test builds its own engine over an in-memory database with a
//! channel-backed notification dispatcher, so dispatched events can be
//! asserted directly. Timing-sensitive tests run with one-second timeouts
//! and are serialized to keep the scheduler honest.

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;

use emergency_call_engine::config::CallEngineConfig;
use emergency_call_engine::escalation::{EscalationKind, EscalationReason, EscalationStatus};
use emergency_call_engine::notify::{ChannelDispatcher, NotificationEvent};
use emergency_call_engine::prelude::*;

async fn engine_with_config(
    config: CallEngineConfig,
) -> (Arc<CallEngine>, UnboundedReceiver<NotificationEvent>) {
    let (dispatcher, rx) = ChannelDispatcher::channel();
    let engine = CallEngine::with_dispatcher(config, None, Arc::new(dispatcher))
        .await
        .expect("engine should build against an in-memory database");
    (engine, rx)
}

/// One-second timers so escalation chains complete within a few seconds.
fn fast_config() -> CallEngineConfig {
    let mut config = CallEngineConfig::default();
    config.escalation.ring_timeout_secs = 1;
    config.escalation.no_reader_retry_secs = 1;
    config
}

async fn register_reader(engine: &Arc<CallEngine>, id: &str, capacity: u32) -> ReaderId {
    let reader_id = ReaderId(id.to_string());
    engine
        .registry()
        .upsert_presence(&reader_id, true, true, capacity, None)
        .await
        .expect("presence upsert should succeed");
    reader_id
}

async fn reader_load(engine: &Arc<CallEngine>, reader_id: &ReaderId) -> u32 {
    engine
        .registry()
        .get(reader_id)
        .await
        .unwrap()
        .expect("reader should exist")
        .current_call_count
}

fn drain(rx: &mut UnboundedReceiver<NotificationEvent>) -> Vec<NotificationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn happy_path_reserves_answers_and_releases() {
    let (engine, mut rx) = engine_with_config(CallEngineConfig::default()).await;
    let r1 = register_reader(&engine, "r1", 1).await;

    let session = engine
        .create_call(ClientId("client-1".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();
    assert_eq!(session.status, CallStatus::Ringing);
    assert_eq!(session.assigned_reader, Some(r1.clone()));
    assert_eq!(reader_load(&engine, &r1).await, 1);

    let alerts = drain(&mut rx);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].recipient, "r1");
    assert!(alerts[0].is_siren, "emergency ring alert uses the siren channel");

    let session = engine.answer(&session.session_id, &r1).await.unwrap();
    assert_eq!(session.status, CallStatus::Active);
    assert!(session.started_at.is_some());

    let session = engine.end(&session.session_id).await.unwrap();
    assert_eq!(session.status, CallStatus::Ended);
    assert!(session.actual_duration_secs.is_some());
    assert_eq!(reader_load(&engine, &r1).await, 0);
}

#[tokio::test]
#[serial]
async fn unanswered_call_exhausts_escalation_and_fails() {
    let (engine, mut rx) = engine_with_config(fast_config()).await;
    let r1 = register_reader(&engine, "r1", 1).await;

    let session = engine
        .create_call(ClientId("client-1".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();
    assert_eq!(session.status, CallStatus::Ringing);

    // Level 1 rings for 1s, then two no-reader retries at levels 2 and 3,
    // then the depth cap fails the session
    sleep(Duration::from_millis(4500)).await;

    let session = engine.get_session(&session.session_id).await.unwrap();
    assert_eq!(session.status, CallStatus::Failed);
    assert!(session.assigned_reader.is_none());
    assert_eq!(reader_load(&engine, &r1).await, 0, "reservation was given back");

    let events = drain(&mut rx);
    // Initial ring alert plus one siren per escalation attempt plus the
    // final needs-human-intervention siren
    assert!(events.len() >= 4, "got {} events", events.len());
    assert!(events.iter().all(|e| e.is_siren));
    let last = events.last().unwrap();
    assert_eq!(last.recipient, "admin-tier");
    assert!(last.title.contains("human intervention"));

    // Nothing left armed against the failed session
    sleep(Duration::from_millis(1500)).await;
    let session = engine.get_session(&session.session_id).await.unwrap();
    assert_eq!(session.status, CallStatus::Failed);
}

#[tokio::test]
async fn concurrent_requests_never_overcommit_a_reader() {
    let (engine, _rx) = engine_with_config(CallEngineConfig::default()).await;
    let r1 = register_reader(&engine, "r1", 1).await;

    let (a, b) = tokio::join!(
        engine.create_call(ClientId("client-a".to_string()), CallType::Voice, true, None),
        engine.create_call(ClientId("client-b".to_string()), CallType::Voice, true, None),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    let winners = [&a, &b]
        .iter()
        .filter(|s| s.status == CallStatus::Ringing)
        .count();
    assert_eq!(winners, 1, "exactly one request wins the only capacity unit");
    let loser = if a.status == CallStatus::Ringing { &b } else { &a };
    assert_eq!(loser.status, CallStatus::Escalated);
    assert!(loser.assigned_reader.is_none());

    assert_eq!(reader_load(&engine, &r1).await, 1);

    engine.end(&a.session_id).await.unwrap();
    engine.end(&b.session_id).await.unwrap();
    assert_eq!(reader_load(&engine, &r1).await, 0);
}

#[tokio::test]
async fn end_is_idempotent() {
    let (engine, _rx) = engine_with_config(CallEngineConfig::default()).await;
    let r1 = register_reader(&engine, "r1", 1).await;

    let session = engine
        .create_call(ClientId("client-1".to_string()), CallType::Video, true, None)
        .await
        .unwrap();
    engine.answer(&session.session_id, &r1).await.unwrap();
    let first = engine.end(&session.session_id).await.unwrap();
    let second = engine.end(&session.session_id).await.unwrap();

    assert_eq!(first.status, CallStatus::Ended);
    assert_eq!(second.status, CallStatus::Ended);
    assert_eq!(first.ended_at, second.ended_at);
    // Released exactly once, floored at zero
    assert_eq!(reader_load(&engine, &r1).await, 0);
}

#[tokio::test]
async fn answer_from_wrong_reader_is_rejected() {
    let (engine, _rx) = engine_with_config(CallEngineConfig::default()).await;
    let r1 = register_reader(&engine, "r1", 1).await;

    let session = engine
        .create_call(ClientId("client-1".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();
    let err = engine
        .answer(&session.session_id, &ReaderId("imposter".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, CallEngineError::InvalidTransition { .. }));

    // The rightful reader can still answer
    let session = engine.answer(&session.session_id, &r1).await.unwrap();
    assert_eq!(session.status, CallStatus::Active);
}

#[tokio::test]
#[serial]
async fn answer_after_timeout_escalation_is_rejected() {
    let (engine, _rx) = engine_with_config(fast_config()).await;
    let r1 = register_reader(&engine, "r1", 1).await;

    let session = engine
        .create_call(ClientId("client-1".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();

    // Let the ring timer win the race
    sleep(Duration::from_millis(1500)).await;
    let current = engine.get_session(&session.session_id).await.unwrap();
    assert_ne!(current.status, CallStatus::Ringing);

    let err = engine.answer(&session.session_id, &r1).await.unwrap_err();
    assert!(matches!(err, CallEngineError::InvalidTransition { .. }));
}

#[tokio::test]
#[serial]
async fn answer_cancels_the_ring_timer() {
    let (engine, _rx) = engine_with_config(fast_config()).await;
    let r1 = register_reader(&engine, "r1", 1).await;

    let session = engine
        .create_call(ClientId("client-1".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();
    engine.answer(&session.session_id, &r1).await.unwrap();

    // Well past the ring timeout; the cancelled timer must not escalate
    sleep(Duration::from_millis(2500)).await;
    let session = engine.get_session(&session.session_id).await.unwrap();
    assert_eq!(session.status, CallStatus::Active);
    assert_eq!(session.escalation_level, 1);
}

#[tokio::test]
async fn manual_escalation_hands_off_to_the_next_reader() {
    let (engine, mut rx) = engine_with_config(CallEngineConfig::default()).await;
    let r1 = register_reader(&engine, "r1", 1).await;

    let session = engine
        .create_call(ClientId("client-1".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();
    assert_eq!(session.assigned_reader, Some(r1.clone()));
    drain(&mut rx);

    // A second reader comes online after the first was assigned
    let r2 = register_reader(&engine, "r2", 1).await;

    let session = engine
        .escalate_manual(&session.session_id, "admin-7", EscalationReason::Manual)
        .await
        .unwrap();
    assert_eq!(session.status, CallStatus::Ringing);
    assert_eq!(session.assigned_reader, Some(r2.clone()));
    assert_eq!(session.escalation_level, 2);
    assert_eq!(reader_load(&engine, &r1).await, 0);
    assert_eq!(reader_load(&engine, &r2).await, 1);

    let records = engine
        .database()
        .escalations_for_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, EscalationKind::Manual);
    assert_eq!(records[0].status, EscalationStatus::Assigned);
    assert_eq!(records[0].priority_level, 5);
    assert_eq!(records[0].escalated_from, Some(r1));
    assert_eq!(records[0].escalated_to, Some(r2.clone()));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| e.recipient == "r2" && e.is_siren));

    // Answering resolves the open escalation record
    engine.answer(&session.session_id, &r2).await.unwrap();
    let records = engine
        .database()
        .escalations_for_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(records[0].status, EscalationStatus::Resolved);
    assert!(records[0].resolved_at.is_some());
}

#[tokio::test]
async fn manual_escalation_requires_a_ringing_session() {
    let (engine, _rx) = engine_with_config(CallEngineConfig::default()).await;
    let r1 = register_reader(&engine, "r1", 1).await;

    let session = engine
        .create_call(ClientId("client-1".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();
    engine.answer(&session.session_id, &r1).await.unwrap();

    let err = engine
        .escalate_manual(&session.session_id, "admin-7", EscalationReason::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, CallEngineError::InvalidTransition { .. }));
}

#[tokio::test]
#[serial]
async fn empty_pool_request_is_accepted_and_recovers() {
    let (engine, _rx) = engine_with_config(fast_config()).await;

    // No readers at all: the request is accepted, not refused
    let session = engine
        .create_call(ClientId("client-1".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();
    assert_eq!(session.status, CallStatus::Escalated);
    assert!(session.assigned_reader.is_none());

    // A reader appearing before the retry timer fires gets the call
    let r1 = register_reader(&engine, "r1", 1).await;
    sleep(Duration::from_millis(1600)).await;

    let session = engine.get_session(&session.session_id).await.unwrap();
    assert_eq!(session.status, CallStatus::Ringing);
    assert_eq!(session.assigned_reader, Some(r1));
}

#[tokio::test]
async fn capacity_is_respected_across_a_burst() {
    let (engine, _rx) = engine_with_config(CallEngineConfig::default()).await;
    let r1 = register_reader(&engine, "r1", 2).await;

    let mut ringing = 0;
    for i in 0..4 {
        let session = engine
            .create_call(ClientId(format!("client-{i}")), CallType::Voice, true, None)
            .await
            .unwrap();
        if session.status == CallStatus::Ringing {
            ringing += 1;
        }
        let load = reader_load(&engine, &r1).await;
        assert!(load <= 2, "load {load} exceeded capacity");
    }
    assert_eq!(ringing, 2);
    assert_eq!(reader_load(&engine, &r1).await, 2);
}

#[tokio::test]
async fn audit_history_is_ordered_and_complete() {
    let (engine, _rx) = engine_with_config(CallEngineConfig::default()).await;
    let r1 = register_reader(&engine, "r1", 1).await;

    let session = engine
        .create_call(ClientId("client-1".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();
    engine.answer(&session.session_id, &r1).await.unwrap();
    engine.end(&session.session_id).await.unwrap();

    let history = engine.session_history(&session.session_id);
    assert!(!history.is_empty());
    for (i, entry) in history.iter().enumerate() {
        assert_eq!(entry.seq, i as u64 + 1, "sequence numbers are gapless");
    }
    assert_eq!(history[0].event.name(), "session_created");
    assert!(history.iter().any(|e| e.event.name() == "state_changed"));
    assert!(history.iter().any(|e| e.event.name() == "notification_attempt"));

    // Durable copy carries the same events in the same order
    let rows = engine
        .database()
        .audit_entries_for_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), history.len());
    assert_eq!(rows[0].event, "session_created");
}

#[tokio::test]
#[serial]
async fn storage_outage_during_timeout_fails_the_session() {
    let (engine, mut rx) = engine_with_config(fast_config()).await;
    register_reader(&engine, "r1", 1).await;

    let session = engine
        .create_call(ClientId("client-1".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();
    assert_eq!(session.status, CallStatus::Ringing);
    drain(&mut rx);

    // Storage goes away before the ring timer fires; every escalation
    // write will now error
    engine.database().pool().close().await;
    sleep(Duration::from_millis(1500)).await;

    // The session is not stranded in ringing with nothing armed: it is
    // failed in memory and the admin tier is sirened
    let session = engine.get_session(&session.session_id).await.unwrap();
    assert_eq!(session.status, CallStatus::Failed);
    assert!(session.assigned_reader.is_none());

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| e.is_siren && e.recipient == "admin-tier"));

    // The in-memory audit trail still carries the failure reason
    let history = engine.session_history(&session.session_id);
    assert!(history
        .iter()
        .any(|e| e.event.name() == "state_changed"));
}

#[tokio::test]
async fn terminal_sessions_are_evicted_after_retention() {
    let (engine, _rx) = engine_with_config(CallEngineConfig::default()).await;
    let r1 = register_reader(&engine, "r1", 2).await;

    let ended = engine
        .create_call(ClientId("client-a".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();
    engine.answer(&ended.session_id, &r1).await.unwrap();
    engine.end(&ended.session_id).await.unwrap();

    let live = engine
        .create_call(ClientId("client-b".to_string()), CallType::Voice, true, None)
        .await
        .unwrap();

    let evicted = engine.evict_terminal_sessions(Duration::ZERO).await;
    assert_eq!(evicted, 1);

    assert!(matches!(
        engine.get_session(&ended.session_id).await,
        Err(CallEngineError::SessionNotFound(_))
    ));
    assert!(engine.session_history(&ended.session_id).is_empty());
    // The durable audit rows survive eviction
    let rows = engine
        .database()
        .audit_entries_for_session(&ended.session_id)
        .await
        .unwrap();
    assert!(!rows.is_empty());

    // Live sessions are never evicted
    let live = engine.get_session(&live.session_id).await.unwrap();
    assert_eq!(live.status, CallStatus::Ringing);
}

#[tokio::test]
async fn scheduled_duration_is_carried_and_persisted() {
    let (engine, _rx) = engine_with_config(CallEngineConfig::default()).await;
    register_reader(&engine, "r1", 1).await;

    let session = engine
        .create_call(
            ClientId("client-1".to_string()),
            CallType::Video,
            true,
            Some(900),
        )
        .await
        .unwrap();
    assert_eq!(session.scheduled_duration_secs, Some(900));

    let row = engine
        .database()
        .get_session_row(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.scheduled_duration_secs, Some(900));
}

#[tokio::test]
async fn unknown_session_is_reported_as_not_found() {
    let (engine, _rx) = engine_with_config(CallEngineConfig::default()).await;
    let err = engine.get_session(&SessionId::new()).await.unwrap_err();
    assert!(matches!(err, CallEngineError::SessionNotFound(_)));
}
