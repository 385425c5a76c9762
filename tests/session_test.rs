// tests/session_test.rs — Integration test: session lifecycle state machine

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use sibyl::infra::errors::EngineError;
use sibyl::ledger::{billing_minute_key, EntryKind, EntryRefs};
use sibyl::sessions::{Modality, SessionState};
use sibyl::store::store::{ChargeOutcome, FinalizeOutcome, Store};

fn test_store() -> Store {
    sibyl::store::in_memory().unwrap()
}

/// A funded client, a reader, and a fresh session at the given rate.
fn setup_session(store: &Store, opening: Decimal, rate: Decimal) -> (String, String, String) {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);

    let client = store
        .create_account(&format!("client-{n}"), None, None)
        .unwrap();
    let reader = store
        .create_account(&format!("reader-{n}"), None, None)
        .unwrap();
    if opening > Decimal::ZERO {
        store
            .credit(
                &client.id,
                opening,
                EntryKind::TopUp,
                &format!("seed_client_{n}"),
                &EntryRefs::default(),
            )
            .unwrap();
    }
    let session = store
        .create_session(&client.id, &reader.id, Modality::Voice, rate, Utc::now())
        .unwrap();
    (client.id, reader.id, session.id)
}

#[test]
fn test_create_session_locks_rate_and_waits() {
    let store = test_store();
    let (_, _, session_id) = setup_session(&store, dec!(10.00), dec!(2.00));

    let session = store.get_session(&session_id).unwrap().unwrap();
    assert_eq!(session.state, SessionState::Waiting);
    assert_eq!(session.rate_per_minute, dec!(2.00));
    assert_eq!(session.billed_minutes, 0);
    assert!(session.started_at.is_none());
}

#[test]
fn test_activate_assigns_channel_and_start() {
    let store = test_store();
    let (_, _, session_id) = setup_session(&store, dec!(10.00), dec!(2.00));

    let session = store.activate_session(&session_id, Utc::now()).unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert!(session.started_at.is_some());
    let channel = session.channel_name.clone().unwrap();
    assert!(channel.starts_with(&format!("session_{session_id}_")));

    // Re-activation from active is rejected
    let err = store
        .activate_session(&session_id, Utc::now())
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[test]
fn test_pause_sets_grace_and_counts_reconnects() {
    let store = test_store();
    let (_, _, session_id) = setup_session(&store, dec!(10.00), dec!(2.00));
    store.activate_session(&session_id, Utc::now()).unwrap();

    let grace_until = Utc::now() + Duration::minutes(5);
    let session = store.pause_session(&session_id, grace_until).unwrap();
    assert_eq!(session.state, SessionState::Paused);
    assert_eq!(session.reconnect_count, 1);
    assert!(session.grace_until.is_some());
}

#[test]
fn test_reconnect_within_grace() {
    let store = test_store();
    let (_, _, session_id) = setup_session(&store, dec!(10.00), dec!(2.00));
    store.activate_session(&session_id, Utc::now()).unwrap();
    store
        .pause_session(&session_id, Utc::now() + Duration::minutes(5))
        .unwrap();

    let session = store.begin_reconnect(&session_id, Utc::now()).unwrap();
    assert_eq!(session.state, SessionState::Reconnecting);

    // A retried attempt from reconnecting is accepted
    let session = store.begin_reconnect(&session_id, Utc::now()).unwrap();
    assert_eq!(session.state, SessionState::Reconnecting);

    let session = store.complete_reconnect(&session_id).unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert!(session.grace_until.is_none());
}

#[test]
fn test_reconnect_after_grace_expires_is_rejected() {
    let store = test_store();
    let (_, _, session_id) = setup_session(&store, dec!(10.00), dec!(2.00));
    store.activate_session(&session_id, Utc::now()).unwrap();
    // Deadline already in the past
    store
        .pause_session(&session_id, Utc::now() - Duration::seconds(1))
        .unwrap();

    let err = store
        .begin_reconnect(&session_id, Utc::now())
        .unwrap_err();
    assert!(matches!(err, EngineError::GraceExpired { .. }));

    // State unchanged; the scheduler, not the client, ends it
    let session = store.get_session(&session_id).unwrap().unwrap();
    assert_eq!(session.state, SessionState::Paused);
}

#[test]
fn test_reconnect_from_waiting_is_invalid() {
    let store = test_store();
    let (_, _, session_id) = setup_session(&store, dec!(10.00), dec!(2.00));

    let err = store
        .begin_reconnect(&session_id, Utc::now())
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[test]
fn test_end_and_finalize_once() {
    let store = test_store();
    let (_, _, session_id) = setup_session(&store, dec!(10.00), dec!(2.00));
    store.activate_session(&session_id, Utc::now()).unwrap();

    let session = store
        .end_session(&session_id, Some("client hung up"), Utc::now())
        .unwrap();
    assert_eq!(session.state, SessionState::Ended);
    assert!(session.ended_at.is_some());

    let outcome = store
        .finalize_session(&session_id, "0 minute(s) billed")
        .unwrap();
    assert!(matches!(outcome, FinalizeOutcome::Finalized(_)));

    // Second finalize is a no-op, not an error
    let outcome = store
        .finalize_session(&session_id, "0 minute(s) billed")
        .unwrap();
    assert!(matches!(outcome, FinalizeOutcome::AlreadyFinalized));

    // Summary is write-once: the end-time note survives finalization
    let session = store.get_session(&session_id).unwrap().unwrap();
    assert_eq!(session.summary.as_deref(), Some("client hung up"));
}

#[test]
fn test_finalize_requires_ended() {
    let store = test_store();
    let (_, _, session_id) = setup_session(&store, dec!(10.00), dec!(2.00));

    let err = store
        .finalize_session(&session_id, "summary")
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[test]
fn test_ended_session_cannot_be_resurrected() {
    let store = test_store();
    let (_, _, session_id) = setup_session(&store, dec!(10.00), dec!(2.00));
    store.activate_session(&session_id, Utc::now()).unwrap();
    store.end_session(&session_id, None, Utc::now()).unwrap();

    assert!(matches!(
        store.activate_session(&session_id, Utc::now()),
        Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
        store.pause_session(&session_id, Utc::now()),
        Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
        store.end_session(&session_id, None, Utc::now()),
        Err(EngineError::InvalidTransition { .. })
    ));

    let session = store.get_session(&session_id).unwrap().unwrap();
    assert_eq!(session.state, SessionState::Ended);
}

#[test]
fn test_charge_scenario_two_minutes_then_pause() {
    // Rate $2.00/min, balance $5.00: two charges succeed, the third
    // reports insufficient funds with $1.00 left and the counter at 2.
    let store = test_store();
    let (client_id, _, session_id) = setup_session(&store, dec!(5.00), dec!(2.00));
    store.activate_session(&session_id, Utc::now()).unwrap();

    let first = store
        .charge_active_minute(&session_id, Utc::now())
        .unwrap();
    assert!(matches!(first, ChargeOutcome::Charged { minute: 1, .. }));

    let second = store
        .charge_active_minute(&session_id, Utc::now())
        .unwrap();
    assert!(matches!(second, ChargeOutcome::Charged { minute: 2, .. }));

    let third = store
        .charge_active_minute(&session_id, Utc::now())
        .unwrap();
    match third {
        ChargeOutcome::InsufficientFunds { balance, rate } => {
            assert_eq!(balance, dec!(1.00));
            assert_eq!(rate, dec!(2.00));
        }
        other => panic!("expected InsufficientFunds, got {other:?}"),
    }

    let account = store.get_account(&client_id).unwrap().unwrap();
    assert_eq!(account.balance, dec!(1.00));
    let session = store.get_session(&session_id).unwrap().unwrap();
    assert_eq!(session.billed_minutes, 2);
    assert_eq!(session.total_charged(), dec!(4.00));
}

#[test]
fn test_charge_replay_heals_counter_without_double_charge() {
    // Simulate a tick that died after the debit landed but before the
    // counter advanced: the same key is detected and the counter is
    // repaired with no second charge.
    let store = test_store();
    let (client_id, _, session_id) = setup_session(&store, dec!(10.00), dec!(2.00));
    store.activate_session(&session_id, Utc::now()).unwrap();

    store
        .charge_active_minute(&session_id, Utc::now())
        .unwrap();
    // Roll the counter back behind the ledger
    store
        .conn()
        .execute(
            "UPDATE sessions SET billed_minutes = 0 WHERE id = ?1",
            [&session_id],
        )
        .unwrap();

    let outcome = store
        .charge_active_minute(&session_id, Utc::now())
        .unwrap();
    assert!(matches!(outcome, ChargeOutcome::AlreadyCharged { minute: 1 }));

    // One entry, one minute's worth of money moved
    let account = store.get_account(&client_id).unwrap().unwrap();
    assert_eq!(account.balance, dec!(8.00));
    let session = store.get_session(&session_id).unwrap().unwrap();
    assert_eq!(session.billed_minutes, 1);
    assert!(store
        .entry_by_key(&billing_minute_key(&session_id, 1))
        .unwrap()
        .is_some());
}

#[test]
fn test_charge_skips_non_active_session() {
    let store = test_store();
    let (_, _, session_id) = setup_session(&store, dec!(10.00), dec!(2.00));

    let outcome = store
        .charge_active_minute(&session_id, Utc::now())
        .unwrap();
    assert!(matches!(
        outcome,
        ChargeOutcome::SkippedNotActive {
            state: SessionState::Waiting
        }
    ));
}

#[test]
fn test_charge_zero_rate_session() {
    let store = test_store();
    let (_, _, session_id) = setup_session(&store, dec!(10.00), dec!(0));
    store.activate_session(&session_id, Utc::now()).unwrap();

    let outcome = store
        .charge_active_minute(&session_id, Utc::now())
        .unwrap();
    assert!(matches!(outcome, ChargeOutcome::ZeroRate));
}

#[test]
fn test_grace_expired_scan_picks_correct_sessions() {
    let store = test_store();
    let now = Utc::now();

    let (_, _, expired_id) = setup_session(&store, dec!(10.00), dec!(2.00));
    store.activate_session(&expired_id, now).unwrap();
    store
        .pause_session(&expired_id, now - Duration::seconds(30))
        .unwrap();

    let (_, _, fresh_id) = setup_session(&store, dec!(10.00), dec!(2.00));
    store.activate_session(&fresh_id, now).unwrap();
    store
        .pause_session(&fresh_id, now + Duration::minutes(5))
        .unwrap();

    let expired = store.grace_expired_sessions(now, 100).unwrap();
    let ids: Vec<&str> = expired.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec![expired_id.as_str()]);
}
