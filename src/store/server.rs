// src/store/server.rs — Async message passing for Store
//
// The store runs behind a single-writer command queue: every ledger
// mutation and session transition is one command executing one SQLite
// transaction, so a duplicate idempotency key can never land twice even
// under concurrent callers. Commands never perform network I/O.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};

use crate::infra::errors::EngineError;
use crate::ledger::{ApplyOutcome, EntryKind, EntryRefs, LedgerEntry};
use crate::sessions::{Modality, SessionState};
use crate::store::store::{
    AccountRow, BookingRow, ChargeOutcome, FinalizeOutcome, GiftOutcome, PaymentEventOutcome,
    ReconcileOutcome, SessionRow, SlotRow, Store,
};

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

#[derive(Debug)]
pub enum StoreCommand {
    // Accounts
    CreateAccount {
        owner_id: String,
        payment_customer_ref: Option<String>,
        payout_destination: Option<String>,
        resp: Reply<AccountRow>,
    },
    GetAccount {
        id: String,
        resp: Reply<Option<AccountRow>>,
    },
    GetAccountByCustomerRef {
        customer_ref: String,
        resp: Reply<Option<AccountRow>>,
    },
    PayoutCandidates {
        minimum: Decimal,
        limit: u32,
        resp: Reply<Vec<AccountRow>>,
    },

    // Ledger
    Debit {
        account_id: String,
        amount: Decimal,
        kind: EntryKind,
        idempotency_key: String,
        refs: Box<EntryRefs>,
        resp: Reply<ApplyOutcome>,
    },
    Credit {
        account_id: String,
        amount: Decimal,
        kind: EntryKind,
        idempotency_key: String,
        refs: Box<EntryRefs>,
        resp: Reply<ApplyOutcome>,
    },
    Reconcile {
        account_id: String,
        resp: Reply<ReconcileOutcome>,
    },
    ApplyPaymentEvent {
        event_id: String,
        account_id: String,
        amount: Decimal,
        kind: EntryKind,
        idempotency_key: String,
        payment_ref: Option<String>,
        resp: Reply<PaymentEventOutcome>,
    },

    // Sessions
    CreateSession {
        client_account_id: String,
        reader_account_id: String,
        modality: Modality,
        rate_per_minute: Decimal,
        now: DateTime<Utc>,
        resp: Reply<SessionRow>,
    },
    GetSession {
        id: String,
        resp: Reply<Option<SessionRow>>,
    },
    ActivateSession {
        id: String,
        now: DateTime<Utc>,
        resp: Reply<SessionRow>,
    },
    PauseSession {
        id: String,
        grace_until: DateTime<Utc>,
        resp: Reply<SessionRow>,
    },
    BeginReconnect {
        id: String,
        now: DateTime<Utc>,
        resp: Reply<SessionRow>,
    },
    CompleteReconnect {
        id: String,
        resp: Reply<SessionRow>,
    },
    EndSession {
        id: String,
        summary: Option<String>,
        now: DateTime<Utc>,
        resp: Reply<SessionRow>,
    },
    FinalizeSession {
        id: String,
        summary: String,
        resp: Reply<FinalizeOutcome>,
    },
    ChargeActiveMinute {
        session_id: String,
        now: DateTime<Utc>,
        resp: Reply<ChargeOutcome>,
    },
    SessionsInState {
        state: SessionState,
        limit: u32,
        resp: Reply<Vec<SessionRow>>,
    },
    GraceExpiredSessions {
        now: DateTime<Utc>,
        limit: u32,
        resp: Reply<Vec<SessionRow>>,
    },

    // Slots & bookings
    GetSlot {
        id: String,
        resp: Reply<Option<SlotRow>>,
    },
    CreateSlot {
        reader_account_id: String,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        duration_minutes: u32,
        resp: Reply<SlotRow>,
    },
    BookSlot {
        slot_id: String,
        client_account_id: String,
        amount: Decimal,
        idempotency_key: String,
        resp: Reply<BookingRow>,
    },
    CancelBooking {
        booking_id: String,
        resp: Reply<BookingRow>,
    },

    // Gifts
    SendGift {
        sender_account_id: String,
        provider_account_id: String,
        amount: Decimal,
        commission_rate: Decimal,
        gift_key: String,
        commission_key: String,
        refs: Box<EntryRefs>,
        resp: Reply<GiftOutcome>,
    },

    // Audit
    AppendAudit {
        account_id: Option<String>,
        action: String,
        object_type: Option<String>,
        object_id: Option<String>,
        details: serde_json::Value,
        resp: Reply<()>,
    },

    // Misc
    EntryByKey {
        idempotency_key: String,
        resp: Reply<Option<LedgerEntry>>,
    },
}

/// A handle to the Store that uses message passing.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

macro_rules! send_command {
    ($self:expr, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (resp_tx, resp_rx) = oneshot::channel();
        $self
            .tx
            .send(StoreCommand::$variant {
                $($field: $value,)*
                resp: resp_tx,
            })
            .await
            .map_err(|e| EngineError::Other(anyhow::anyhow!("store server gone: {e}")))?;
        resp_rx
            .await
            .map_err(|e| EngineError::Other(anyhow::anyhow!("store server dropped reply: {e}")))?
    }};
}

impl StoreHandle {
    pub fn new(tx: mpsc::Sender<StoreCommand>) -> Self {
        Self { tx }
    }

    // -- Accounts --

    pub async fn create_account(
        &self,
        owner_id: String,
        payment_customer_ref: Option<String>,
        payout_destination: Option<String>,
    ) -> Result<AccountRow, EngineError> {
        send_command!(self, CreateAccount {
            owner_id: owner_id,
            payment_customer_ref: payment_customer_ref,
            payout_destination: payout_destination,
        })
    }

    pub async fn get_account(&self, id: String) -> Result<Option<AccountRow>, EngineError> {
        send_command!(self, GetAccount { id: id })
    }

    pub async fn get_account_by_customer_ref(
        &self,
        customer_ref: String,
    ) -> Result<Option<AccountRow>, EngineError> {
        send_command!(self, GetAccountByCustomerRef {
            customer_ref: customer_ref
        })
    }

    pub async fn payout_candidates(
        &self,
        minimum: Decimal,
        limit: u32,
    ) -> Result<Vec<AccountRow>, EngineError> {
        send_command!(self, PayoutCandidates {
            minimum: minimum,
            limit: limit
        })
    }

    // -- Ledger --

    pub async fn debit(
        &self,
        account_id: String,
        amount: Decimal,
        kind: EntryKind,
        idempotency_key: String,
        refs: EntryRefs,
    ) -> Result<ApplyOutcome, EngineError> {
        send_command!(self, Debit {
            account_id: account_id,
            amount: amount,
            kind: kind,
            idempotency_key: idempotency_key,
            refs: Box::new(refs),
        })
    }

    pub async fn credit(
        &self,
        account_id: String,
        amount: Decimal,
        kind: EntryKind,
        idempotency_key: String,
        refs: EntryRefs,
    ) -> Result<ApplyOutcome, EngineError> {
        send_command!(self, Credit {
            account_id: account_id,
            amount: amount,
            kind: kind,
            idempotency_key: idempotency_key,
            refs: Box::new(refs),
        })
    }

    pub async fn reconcile(&self, account_id: String) -> Result<ReconcileOutcome, EngineError> {
        send_command!(self, Reconcile {
            account_id: account_id
        })
    }

    pub async fn apply_payment_event(
        &self,
        event_id: String,
        account_id: String,
        amount: Decimal,
        kind: EntryKind,
        idempotency_key: String,
        payment_ref: Option<String>,
    ) -> Result<PaymentEventOutcome, EngineError> {
        send_command!(self, ApplyPaymentEvent {
            event_id: event_id,
            account_id: account_id,
            amount: amount,
            kind: kind,
            idempotency_key: idempotency_key,
            payment_ref: payment_ref,
        })
    }

    // -- Sessions --

    pub async fn create_session(
        &self,
        client_account_id: String,
        reader_account_id: String,
        modality: Modality,
        rate_per_minute: Decimal,
        now: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        send_command!(self, CreateSession {
            client_account_id: client_account_id,
            reader_account_id: reader_account_id,
            modality: modality,
            rate_per_minute: rate_per_minute,
            now: now,
        })
    }

    pub async fn get_session(&self, id: String) -> Result<Option<SessionRow>, EngineError> {
        send_command!(self, GetSession { id: id })
    }

    pub async fn activate_session(
        &self,
        id: String,
        now: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        send_command!(self, ActivateSession { id: id, now: now })
    }

    pub async fn pause_session(
        &self,
        id: String,
        grace_until: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        send_command!(self, PauseSession {
            id: id,
            grace_until: grace_until
        })
    }

    pub async fn begin_reconnect(
        &self,
        id: String,
        now: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        send_command!(self, BeginReconnect { id: id, now: now })
    }

    pub async fn complete_reconnect(&self, id: String) -> Result<SessionRow, EngineError> {
        send_command!(self, CompleteReconnect { id: id })
    }

    pub async fn end_session(
        &self,
        id: String,
        summary: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        send_command!(self, EndSession {
            id: id,
            summary: summary,
            now: now
        })
    }

    pub async fn finalize_session(
        &self,
        id: String,
        summary: String,
    ) -> Result<FinalizeOutcome, EngineError> {
        send_command!(self, FinalizeSession {
            id: id,
            summary: summary
        })
    }

    pub async fn charge_active_minute(
        &self,
        session_id: String,
        now: DateTime<Utc>,
    ) -> Result<ChargeOutcome, EngineError> {
        send_command!(self, ChargeActiveMinute {
            session_id: session_id,
            now: now
        })
    }

    pub async fn sessions_in_state(
        &self,
        state: SessionState,
        limit: u32,
    ) -> Result<Vec<SessionRow>, EngineError> {
        send_command!(self, SessionsInState {
            state: state,
            limit: limit
        })
    }

    pub async fn grace_expired_sessions(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SessionRow>, EngineError> {
        send_command!(self, GraceExpiredSessions {
            now: now,
            limit: limit
        })
    }

    // -- Slots & bookings --

    pub async fn get_slot(&self, id: String) -> Result<Option<SlotRow>, EngineError> {
        send_command!(self, GetSlot { id: id })
    }

    pub async fn create_slot(
        &self,
        reader_account_id: String,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        duration_minutes: u32,
    ) -> Result<SlotRow, EngineError> {
        send_command!(self, CreateSlot {
            reader_account_id: reader_account_id,
            start_at: start_at,
            end_at: end_at,
            duration_minutes: duration_minutes,
        })
    }

    pub async fn book_slot(
        &self,
        slot_id: String,
        client_account_id: String,
        amount: Decimal,
        idempotency_key: String,
    ) -> Result<BookingRow, EngineError> {
        send_command!(self, BookSlot {
            slot_id: slot_id,
            client_account_id: client_account_id,
            amount: amount,
            idempotency_key: idempotency_key,
        })
    }

    pub async fn cancel_booking(&self, booking_id: String) -> Result<BookingRow, EngineError> {
        send_command!(self, CancelBooking {
            booking_id: booking_id
        })
    }

    // -- Gifts --

    #[allow(clippy::too_many_arguments)]
    pub async fn send_gift(
        &self,
        sender_account_id: String,
        provider_account_id: String,
        amount: Decimal,
        commission_rate: Decimal,
        gift_key: String,
        commission_key: String,
        refs: EntryRefs,
    ) -> Result<GiftOutcome, EngineError> {
        send_command!(self, SendGift {
            sender_account_id: sender_account_id,
            provider_account_id: provider_account_id,
            amount: amount,
            commission_rate: commission_rate,
            gift_key: gift_key,
            commission_key: commission_key,
            refs: Box::new(refs),
        })
    }

    // -- Audit --

    pub async fn append_audit(
        &self,
        account_id: Option<String>,
        action: String,
        object_type: Option<String>,
        object_id: Option<String>,
        details: serde_json::Value,
    ) -> Result<(), EngineError> {
        send_command!(self, AppendAudit {
            account_id: account_id,
            action: action,
            object_type: object_type,
            object_id: object_id,
            details: details,
        })
    }

    pub async fn entry_by_key(
        &self,
        idempotency_key: String,
    ) -> Result<Option<LedgerEntry>, EngineError> {
        send_command!(self, EntryByKey {
            idempotency_key: idempotency_key
        })
    }
}

/// Helper to spawn the store server and return a handle.
pub fn spawn_store_server(store: Store) -> (StoreHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(100);
    let handle = StoreHandle::new(tx);
    let join_handle = tokio::spawn(run_store_server(store, rx));
    (handle, join_handle)
}

/// The background task that owns the Store.
pub async fn run_store_server(store: Store, mut rx: mpsc::Receiver<StoreCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::CreateAccount {
                owner_id,
                payment_customer_ref,
                payout_destination,
                resp,
            } => {
                let res = store.create_account(
                    &owner_id,
                    payment_customer_ref.as_deref(),
                    payout_destination.as_deref(),
                );
                let _ = resp.send(res);
            }
            StoreCommand::GetAccount { id, resp } => {
                let _ = resp.send(store.get_account(&id));
            }
            StoreCommand::GetAccountByCustomerRef { customer_ref, resp } => {
                let _ = resp.send(store.get_account_by_customer_ref(&customer_ref));
            }
            StoreCommand::PayoutCandidates {
                minimum,
                limit,
                resp,
            } => {
                let _ = resp.send(store.payout_candidates(minimum, limit));
            }
            StoreCommand::Debit {
                account_id,
                amount,
                kind,
                idempotency_key,
                refs,
                resp,
            } => {
                let _ = resp.send(store.debit(&account_id, amount, kind, &idempotency_key, &refs));
            }
            StoreCommand::Credit {
                account_id,
                amount,
                kind,
                idempotency_key,
                refs,
                resp,
            } => {
                let _ = resp.send(store.credit(&account_id, amount, kind, &idempotency_key, &refs));
            }
            StoreCommand::Reconcile { account_id, resp } => {
                let _ = resp.send(store.reconcile(&account_id));
            }
            StoreCommand::ApplyPaymentEvent {
                event_id,
                account_id,
                amount,
                kind,
                idempotency_key,
                payment_ref,
                resp,
            } => {
                let res = store.apply_payment_event(
                    &event_id,
                    &account_id,
                    amount,
                    kind,
                    &idempotency_key,
                    payment_ref.as_deref(),
                );
                let _ = resp.send(res);
            }
            StoreCommand::CreateSession {
                client_account_id,
                reader_account_id,
                modality,
                rate_per_minute,
                now,
                resp,
            } => {
                let res = store.create_session(
                    &client_account_id,
                    &reader_account_id,
                    modality,
                    rate_per_minute,
                    now,
                );
                let _ = resp.send(res);
            }
            StoreCommand::GetSession { id, resp } => {
                let _ = resp.send(store.get_session(&id));
            }
            StoreCommand::ActivateSession { id, now, resp } => {
                let _ = resp.send(store.activate_session(&id, now));
            }
            StoreCommand::PauseSession {
                id,
                grace_until,
                resp,
            } => {
                let _ = resp.send(store.pause_session(&id, grace_until));
            }
            StoreCommand::BeginReconnect { id, now, resp } => {
                let _ = resp.send(store.begin_reconnect(&id, now));
            }
            StoreCommand::CompleteReconnect { id, resp } => {
                let _ = resp.send(store.complete_reconnect(&id));
            }
            StoreCommand::EndSession {
                id,
                summary,
                now,
                resp,
            } => {
                let _ = resp.send(store.end_session(&id, summary.as_deref(), now));
            }
            StoreCommand::FinalizeSession { id, summary, resp } => {
                let _ = resp.send(store.finalize_session(&id, &summary));
            }
            StoreCommand::ChargeActiveMinute {
                session_id,
                now,
                resp,
            } => {
                let _ = resp.send(store.charge_active_minute(&session_id, now));
            }
            StoreCommand::SessionsInState { state, limit, resp } => {
                let _ = resp.send(store.sessions_in_state(state, limit));
            }
            StoreCommand::GraceExpiredSessions { now, limit, resp } => {
                let _ = resp.send(store.grace_expired_sessions(now, limit));
            }
            StoreCommand::GetSlot { id, resp } => {
                let _ = resp.send(store.get_slot(&id));
            }
            StoreCommand::CreateSlot {
                reader_account_id,
                start_at,
                end_at,
                duration_minutes,
                resp,
            } => {
                let res = store.create_slot(&reader_account_id, start_at, end_at, duration_minutes);
                let _ = resp.send(res);
            }
            StoreCommand::BookSlot {
                slot_id,
                client_account_id,
                amount,
                idempotency_key,
                resp,
            } => {
                let res = store.book_slot(&slot_id, &client_account_id, amount, &idempotency_key);
                let _ = resp.send(res);
            }
            StoreCommand::CancelBooking { booking_id, resp } => {
                let _ = resp.send(store.cancel_booking(&booking_id));
            }
            StoreCommand::SendGift {
                sender_account_id,
                provider_account_id,
                amount,
                commission_rate,
                gift_key,
                commission_key,
                refs,
                resp,
            } => {
                let res = store.send_gift(
                    &sender_account_id,
                    &provider_account_id,
                    amount,
                    commission_rate,
                    &gift_key,
                    &commission_key,
                    &refs,
                );
                let _ = resp.send(res);
            }
            StoreCommand::AppendAudit {
                account_id,
                action,
                object_type,
                object_id,
                details,
                resp,
            } => {
                let res = store.append_audit(
                    account_id.as_deref(),
                    &action,
                    object_type.as_deref(),
                    object_id.as_deref(),
                    &details,
                );
                let _ = resp.send(res);
            }
            StoreCommand::EntryByKey {
                idempotency_key,
                resp,
            } => {
                let _ = resp.send(store.entry_by_key(&idempotency_key));
            }
        }
    }
}
