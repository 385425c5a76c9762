// tests/scheduler_test.rs — Integration test: scheduler jobs and engine
// operations over the store server

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use sibyl::engine::{Engine, PaymentEvent};
use sibyl::infra::config::Config;
use sibyl::infra::errors::EngineError;
use sibyl::ledger::{billing_minute_key, ApplyOutcome, EntryKind, EntryRefs};
use sibyl::scheduler::{
    run_billing_tick, run_finalization, run_grace_expiry, run_payout_batch,
};
use sibyl::sessions::{Modality, SessionState};
use sibyl::store::store::PaymentEventOutcome;
use sibyl::store::{spawn_store_server, StoreHandle};
use sibyl::external::{LoggedRail, SignedTokenProvider};

struct Harness {
    engine: Engine,
    store: StoreHandle,
    config: Config,
}

fn harness(config: Config) -> Harness {
    let store = sibyl::store::in_memory().unwrap();
    let (handle, _task) = spawn_store_server(store);
    let engine = Engine::new(
        handle.clone(),
        config.clone(),
        Arc::new(SignedTokenProvider::new("app", "cert")),
        Arc::new(LoggedRail),
    );
    Harness {
        engine,
        store: handle,
        config,
    }
}

/// Funded client + reader + active session, all through the store handle.
async fn active_session(
    h: &Harness,
    opening: Decimal,
    rate: Decimal,
) -> (String, String, String) {
    let client = h
        .store
        .create_account("client".into(), None, None)
        .await
        .unwrap();
    let reader = h
        .store
        .create_account("reader".into(), None, None)
        .await
        .unwrap();
    h.store
        .credit(
            client.id.clone(),
            opening,
            EntryKind::TopUp,
            "seed_client".into(),
            EntryRefs::default(),
        )
        .await
        .unwrap();
    let session = h
        .store
        .create_session(
            client.id.clone(),
            reader.id.clone(),
            Modality::Voice,
            rate,
            chrono::Utc::now(),
        )
        .await
        .unwrap();
    let session = h
        .store
        .activate_session(session.id, chrono::Utc::now())
        .await
        .unwrap();
    (client.id, reader.id, session.id)
}

#[tokio::test]
async fn test_billing_tick_charges_then_pauses() {
    // Rate $2.00/min, payer balance $5.00: $2, $2, then insufficient
    // funds pauses the session with $1.00 left and the counter at 2.
    let h = harness(Config::default());
    let (client_id, _, session_id) = active_session(&h, dec!(5.00), dec!(2.00)).await;

    let tick1 = run_billing_tick(&h.store, &h.config).await.unwrap();
    assert_eq!(tick1.charged, 1);
    let tick2 = run_billing_tick(&h.store, &h.config).await.unwrap();
    assert_eq!(tick2.charged, 1);
    let tick3 = run_billing_tick(&h.store, &h.config).await.unwrap();
    assert_eq!(tick3.charged, 0);
    assert_eq!(tick3.paused, 1);

    let account = h.store.get_account(client_id).await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(1.00));

    let session = h.store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Paused);
    assert_eq!(session.billed_minutes, 2);
    assert!(session.grace_until.is_some());
}

#[tokio::test]
async fn test_billing_tick_never_doubles_a_unit() {
    let h = harness(Config::default());
    let (client_id, _, session_id) = active_session(&h, dec!(100.00), dec!(2.00)).await;

    run_billing_tick(&h.store, &h.config).await.unwrap();
    run_billing_tick(&h.store, &h.config).await.unwrap();

    // Two units, one entry each — never two entries for the same unit
    for minute in [1, 2] {
        let entry = h
            .store
            .entry_by_key(billing_minute_key(&session_id, minute))
            .await
            .unwrap();
        assert!(entry.is_some(), "minute {minute} should be charged once");
    }
    let account = h.store.get_account(client_id).await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(96.00));

    let session = h.store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.billed_minutes, 2);
}

#[tokio::test]
async fn test_grace_expiry_then_finalize_twice() {
    let mut config = Config::default();
    config.billing.grace_minutes = 0;
    let h = harness(config);
    let (client_id, _, session_id) = active_session(&h, dec!(10.00), dec!(2.00)).await;

    run_billing_tick(&h.store, &h.config).await.unwrap();
    h.engine.disconnect_session(&session_id).await.unwrap();

    // Deadline is already due (zero-minute grace)
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let ended = run_grace_expiry(&h.store, &h.config).await.unwrap();
    assert_eq!(ended, 1);

    let session = h
        .store
        .get_session(session_id.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.state, SessionState::Ended);
    assert!(session.ended_at.is_some());

    let finalized = run_finalization(&h.store, &h.config).await.unwrap();
    assert_eq!(finalized, 1);

    let session = h
        .store
        .get_session(session_id.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.state, SessionState::Finalized);
    let summary = session.summary.unwrap();
    assert!(summary.contains("1 minute(s)"), "summary: {summary}");
    assert!(summary.contains("2.00"), "summary: {summary}");

    // Finalization sweep is idempotent
    let finalized = run_finalization(&h.store, &h.config).await.unwrap();
    assert_eq!(finalized, 0);

    // Payer balance still equals the ledger sum
    let outcome = h.store.reconcile(client_id).await.unwrap();
    assert!(!outcome.corrected);
    assert_eq!(outcome.balance, dec!(8.00));
}

#[tokio::test]
async fn test_concurrent_mutations_preserve_invariant() {
    let h = harness(Config::default());
    let account = h
        .store
        .create_account("client".into(), None, None)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let store = h.store.clone();
        let id = account.id.clone();
        tasks.push(tokio::spawn(async move {
            store
                .credit(
                    id,
                    dec!(1.00),
                    EntryKind::TopUp,
                    format!("credit_{i}"),
                    EntryRefs::default(),
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut tasks = Vec::new();
    for i in 0..5 {
        let store = h.store.clone();
        let id = account.id.clone();
        tasks.push(tokio::spawn(async move {
            store
                .debit(
                    id,
                    dec!(0.50),
                    EntryKind::SessionCharge,
                    format!("debit_{i}"),
                    EntryRefs::default(),
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let outcome = h.store.reconcile(account.id.clone()).await.unwrap();
    assert!(!outcome.corrected, "balance must already match the ledger");
    assert_eq!(outcome.balance, dec!(7.50));
}

#[tokio::test]
async fn test_payout_batch_sweeps_once_per_day() {
    let h = harness(Config::default());
    let reader = h
        .store
        .create_account("reader".into(), None, Some("dest_acct_1".into()))
        .await
        .unwrap();
    h.store
        .credit(
            reader.id.clone(),
            dec!(25.00),
            EntryKind::Commission,
            "earnings_1".into(),
            EntryRefs::default(),
        )
        .await
        .unwrap();

    let paid = run_payout_batch(&h.store, &h.config, h.engine.rail())
        .await
        .unwrap();
    assert_eq!(paid, 1);

    let account = h.store.get_account(reader.id.clone()).await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(0.00));

    // New earnings the same day: the rail key is deterministic per
    // (account, day), so the replayed receipt makes the debit a no-op
    // and nothing moves until tomorrow's batch.
    h.store
        .credit(
            reader.id.clone(),
            dec!(50.00),
            EntryKind::Commission,
            "earnings_2".into(),
            EntryRefs::default(),
        )
        .await
        .unwrap();

    let paid = run_payout_batch(&h.store, &h.config, h.engine.rail())
        .await
        .unwrap();
    assert_eq!(paid, 0);

    let account = h.store.get_account(reader.id.clone()).await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(50.00));
    let outcome = h.store.reconcile(reader.id).await.unwrap();
    assert!(!outcome.corrected);
}

#[tokio::test]
async fn test_payout_skips_underfunded_accounts() {
    let h = harness(Config::default());
    let reader = h
        .store
        .create_account("reader".into(), None, Some("dest_acct_2".into()))
        .await
        .unwrap();
    // Below the $10.00 minimum
    h.store
        .credit(
            reader.id.clone(),
            dec!(9.99),
            EntryKind::Commission,
            "earnings_small".into(),
            EntryRefs::default(),
        )
        .await
        .unwrap();

    let paid = run_payout_batch(&h.store, &h.config, h.engine.rail())
        .await
        .unwrap();
    assert_eq!(paid, 0);

    let account = h.store.get_account(reader.id).await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(9.99));
}

#[tokio::test]
async fn test_engine_session_lifecycle() {
    let h = harness(Config::default());
    let client = h
        .engine
        .create_account("client", Some("cus_1"), None)
        .await
        .unwrap();
    let reader = h
        .engine
        .create_account("reader", None, None)
        .await
        .unwrap();

    // No funds yet: session creation is refused
    let err = h
        .engine
        .create_session(&client.id, &reader.id, Modality::Video, dec!(3.00))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFunds { .. }));

    // Top up through the webhook path
    let outcome = h
        .engine
        .top_up(&PaymentEvent {
            event_id: "evt_1".into(),
            customer_ref: "cus_1".into(),
            amount: dec!(30.00),
            payment_ref: Some("pi_1".into()),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, PaymentEventOutcome::Applied(_)));

    // Redelivery is swallowed
    let outcome = h
        .engine
        .top_up(&PaymentEvent {
            event_id: "evt_1".into(),
            customer_ref: "cus_1".into(),
            amount: dec!(30.00),
            payment_ref: Some("pi_1".into()),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, PaymentEventOutcome::AlreadyProcessed));

    let session = h
        .engine
        .create_session(&client.id, &reader.id, Modality::Video, dec!(3.00))
        .await
        .unwrap();
    assert_eq!(session.state, SessionState::Waiting);

    let access = h
        .engine
        .activate_session(&session.id, "client")
        .await
        .unwrap();
    assert_eq!(access.session.state, SessionState::Active);
    assert!(!access.token.token.is_empty());
    assert_eq!(
        Some(access.token.channel.as_str()),
        access.session.channel_name.as_deref()
    );

    let paused = h.engine.disconnect_session(&session.id).await.unwrap();
    assert_eq!(paused.state, SessionState::Paused);
    assert_eq!(paused.reconnect_count, 1);

    let access = h
        .engine
        .reconnect_session(&session.id, "client")
        .await
        .unwrap();
    assert_eq!(access.session.state, SessionState::Active);
    assert!(access.session.grace_until.is_none());

    let ended = h
        .engine
        .end_session(&session.id, Some("wrapped up".into()))
        .await
        .unwrap();
    assert_eq!(ended.state, SessionState::Ended);
}

#[tokio::test]
async fn test_engine_reconnect_outside_grace_surfaces_expired() {
    let mut config = Config::default();
    config.billing.grace_minutes = 0;
    let h = harness(config);
    let (_, _, session_id) = active_session(&h, dec!(10.00), dec!(2.00)).await;

    h.engine.disconnect_session(&session_id).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let err = h
        .engine
        .reconnect_session(&session_id, "client")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::GraceExpired { .. }));
}

#[tokio::test]
async fn test_engine_gift_split() {
    let h = harness(Config::default());
    let sender = h
        .engine
        .create_account("viewer", Some("cus_v"), None)
        .await
        .unwrap();
    let provider = h
        .engine
        .create_account("reader", None, None)
        .await
        .unwrap();
    h.engine
        .top_up(&PaymentEvent {
            event_id: "evt_fund".into(),
            customer_ref: "cus_v".into(),
            amount: dec!(100.00),
            payment_ref: None,
        })
        .await
        .unwrap();

    h.engine
        .send_gift(&sender.id, &provider.id, dec!(10.00), "purchase_77")
        .await
        .unwrap();

    let sender_row = h.store.get_account(sender.id).await.unwrap().unwrap();
    let provider_row = h.store.get_account(provider.id).await.unwrap().unwrap();
    assert_eq!(sender_row.balance, dec!(90.00));
    assert_eq!(provider_row.balance, dec!(7.00));
}

#[tokio::test]
async fn test_engine_booking_flow() {
    let h = harness(Config::default());
    let client = h
        .engine
        .create_account("client", Some("cus_b"), None)
        .await
        .unwrap();
    let reader = h
        .engine
        .create_account("reader", None, None)
        .await
        .unwrap();
    h.engine
        .top_up(&PaymentEvent {
            event_id: "evt_fund".into(),
            customer_ref: "cus_b".into(),
            amount: dec!(200.00),
            payment_ref: None,
        })
        .await
        .unwrap();

    let start = chrono::Utc::now() + chrono::Duration::days(1);
    let slot = h
        .store
        .create_slot(reader.id.clone(), start, start + chrono::Duration::minutes(30), 30)
        .await
        .unwrap();

    // 30 minutes at $50.00/hour
    let booking = h.engine.book_slot(&slot.id, &client.id).await.unwrap();
    assert_eq!(booking.amount, dec!(25.00));
    let row = h.store.get_account(client.id.clone()).await.unwrap().unwrap();
    assert_eq!(row.balance, dec!(175.00));

    // Replaying the booking returns the same booking, no second charge
    let replay = h.engine.book_slot(&slot.id, &client.id).await.unwrap();
    assert_eq!(replay.id, booking.id);
    let row = h.store.get_account(client.id.clone()).await.unwrap().unwrap();
    assert_eq!(row.balance, dec!(175.00));

    // Cancel refunds in full, idempotently
    let cancelled = h.engine.cancel_booking(&booking.id).await.unwrap();
    assert!(cancelled.cancelled_at.is_some());
    assert_eq!(cancelled.refund_amount, Some(dec!(25.00)));

    let again = h.engine.cancel_booking(&booking.id).await.unwrap();
    assert_eq!(again.id, cancelled.id);

    let row = h.store.get_account(client.id).await.unwrap().unwrap();
    assert_eq!(row.balance, dec!(200.00));
}

#[tokio::test]
async fn test_engine_paid_reply_charges_once() {
    let h = harness(Config::default());
    let client = h
        .engine
        .create_account("client", Some("cus_p"), None)
        .await
        .unwrap();
    h.engine
        .top_up(&PaymentEvent {
            event_id: "evt_fund".into(),
            customer_ref: "cus_p".into(),
            amount: dec!(5.00),
            payment_ref: None,
        })
        .await
        .unwrap();

    let first = h.engine.paid_reply(&client.id, "conv_1", 3).await.unwrap();
    assert!(matches!(first, ApplyOutcome::Applied(_)));

    let replay = h.engine.paid_reply(&client.id, "conv_1", 3).await.unwrap();
    assert!(replay.is_replay());

    let row = h.store.get_account(client.id).await.unwrap().unwrap();
    assert_eq!(row.balance, dec!(4.00));
}
