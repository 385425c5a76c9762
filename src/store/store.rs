// src/store/store.rs — SQLite operations
//
// Every balance mutation is one transaction: duplicate-key check, balance
// check, entry insert, balance update. The account balance column is a
// cache over SUM(ledger_entries.amount) and is only ever written here.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use tracing::warn;
use uuid::Uuid;

use crate::infra::errors::EngineError;
use crate::ledger::{billing_minute_key, split_gift, ApplyOutcome, EntryKind, EntryRefs, LedgerEntry};
use crate::sessions::{Modality, SessionState};

/// Low-level SQLite operations for accounts, ledger entries, sessions,
/// bookings, and the audit log.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Get a reference to the underlying connection (for advanced queries).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // -- Accounts --

    pub fn create_account(
        &self,
        owner_id: &str,
        payment_customer_ref: Option<&str>,
        payout_destination: Option<&str>,
    ) -> Result<AccountRow, EngineError> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO accounts (id, owner_id, balance, payment_customer_ref,
             payout_destination, created_at, updated_at)
             VALUES (?1, ?2, '0', ?3, ?4, ?5, ?5)",
            params![
                id,
                owner_id,
                payment_customer_ref,
                payout_destination,
                now.to_rfc3339()
            ],
        )?;
        require_account(&self.conn, &id)
    }

    pub fn get_account(&self, id: &str) -> Result<Option<AccountRow>, EngineError> {
        get_account_inner(&self.conn, id)
    }

    pub fn get_account_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> Result<Option<AccountRow>, EngineError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE payment_customer_ref = ?1"),
                params![customer_ref],
                map_account,
            )
            .optional()?;
        Ok(row)
    }

    pub fn all_accounts(&self) -> Result<Vec<AccountRow>, EngineError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ACCOUNT_COLS} FROM accounts ORDER BY owner_id"))?;
        let rows = stmt.query_map([], map_account)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Accounts eligible for the payout batch: a payout destination is on
    /// file and the cached balance meets the minimum.
    pub fn payout_candidates(
        &self,
        minimum: Decimal,
        limit: u32,
    ) -> Result<Vec<AccountRow>, EngineError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ACCOUNT_COLS} FROM accounts
             WHERE payout_destination IS NOT NULL
             ORDER BY owner_id"
        ))?;
        let rows = stmt.query_map([], map_account)?;

        let mut result = Vec::new();
        for row in rows {
            let account = row?;
            if account.balance >= minimum {
                result.push(account);
                if result.len() as u32 >= limit {
                    break;
                }
            }
        }
        Ok(result)
    }

    // -- Ledger --

    /// Idempotent debit. A duplicate idempotency key returns the original
    /// entry; a debit that would take the balance negative fails with
    /// `InsufficientFunds` and changes nothing.
    pub fn debit(
        &self,
        account_id: &str,
        amount: Decimal,
        kind: EntryKind,
        idempotency_key: &str,
        refs: &EntryRefs,
    ) -> Result<ApplyOutcome, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount { amount });
        }
        let tx = self.conn.unchecked_transaction()?;
        if let Some(existing) = entry_by_key_inner(&tx, idempotency_key)? {
            return Ok(ApplyOutcome::AlreadyApplied(existing));
        }
        let account = require_account(&tx, account_id)?;
        if account.balance < amount {
            return Err(EngineError::InsufficientFunds {
                account: account_id.to_string(),
                balance: account.balance,
                requested: amount,
            });
        }
        let entry = insert_entry(&tx, &account, -amount, kind, idempotency_key, refs)?;
        tx.commit()?;
        Ok(ApplyOutcome::Applied(entry))
    }

    /// Idempotent credit. Same idempotency contract as `debit`; no balance
    /// floor check.
    pub fn credit(
        &self,
        account_id: &str,
        amount: Decimal,
        kind: EntryKind,
        idempotency_key: &str,
        refs: &EntryRefs,
    ) -> Result<ApplyOutcome, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount { amount });
        }
        let tx = self.conn.unchecked_transaction()?;
        if let Some(existing) = entry_by_key_inner(&tx, idempotency_key)? {
            return Ok(ApplyOutcome::AlreadyApplied(existing));
        }
        let account = require_account(&tx, account_id)?;
        let entry = insert_entry(&tx, &account, amount, kind, idempotency_key, refs)?;
        tx.commit()?;
        Ok(ApplyOutcome::Applied(entry))
    }

    /// Recompute the balance from the ledger. On drift the cache is
    /// overwritten, the incident is logged, and an audit row is written —
    /// never silently corrected.
    pub fn reconcile(&self, account_id: &str) -> Result<ReconcileOutcome, EngineError> {
        let now = Utc::now();
        let tx = self.conn.unchecked_transaction()?;
        let account = require_account(&tx, account_id)?;
        let ledger_sum = ledger_sum_inner(&tx, account_id)?;

        if ledger_sum == account.balance {
            return Ok(ReconcileOutcome {
                balance: ledger_sum,
                previous: account.balance,
                corrected: false,
            });
        }

        warn!(
            "Balance drift on account {}: cached {} != ledger {}",
            account_id, account.balance, ledger_sum
        );
        tx.execute(
            "UPDATE accounts SET balance = ?1, updated_at = ?2 WHERE id = ?3",
            params![ledger_sum.to_string(), now.to_rfc3339(), account_id],
        )?;
        insert_audit(
            &tx,
            Some(account_id),
            "balance_reconciled",
            Some("account"),
            Some(account_id),
            &serde_json::json!({
                "cached": account.balance.to_string(),
                "ledger_sum": ledger_sum.to_string(),
            }),
            now,
        )?;
        tx.commit()?;
        Ok(ReconcileOutcome {
            balance: ledger_sum,
            previous: account.balance,
            corrected: true,
        })
    }

    pub fn ledger_sum(&self, account_id: &str) -> Result<Decimal, EngineError> {
        ledger_sum_inner(&self.conn, account_id)
    }

    pub fn entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>, EngineError> {
        entry_by_key_inner(&self.conn, idempotency_key)
    }

    pub fn entries_for_account(&self, account_id: &str) -> Result<Vec<LedgerEntry>, EngineError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLS} FROM ledger_entries
             WHERE account_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![account_id], map_entry)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Apply an external payment event (top-up credits, refund debits).
    /// The processed-event check and the ledger write are one transaction,
    /// so webhook redelivery is a no-op.
    pub fn apply_payment_event(
        &self,
        event_id: &str,
        account_id: &str,
        amount: Decimal,
        kind: EntryKind,
        idempotency_key: &str,
        payment_ref: Option<&str>,
    ) -> Result<PaymentEventOutcome, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount { amount });
        }
        let now = Utc::now();
        let tx = self.conn.unchecked_transaction()?;

        let already: Option<String> = tx
            .query_row(
                "SELECT event_id FROM processed_events WHERE event_id = ?1",
                params![event_id],
                |r| r.get(0),
            )
            .optional()?;
        if already.is_some() {
            return Ok(PaymentEventOutcome::AlreadyProcessed);
        }

        let account = require_account(&tx, account_id)?;
        let refs = EntryRefs {
            payment_ref: payment_ref.map(str::to_string),
            payment_event_id: Some(event_id.to_string()),
            ..Default::default()
        };
        let entry = match kind {
            EntryKind::TopUp => insert_entry(&tx, &account, amount, kind, idempotency_key, &refs)?,
            EntryKind::Refund => {
                if account.balance < amount {
                    return Err(EngineError::InsufficientFunds {
                        account: account_id.to_string(),
                        balance: account.balance,
                        requested: amount,
                    });
                }
                insert_entry(&tx, &account, -amount, kind, idempotency_key, &refs)?
            }
            other => {
                return Err(anyhow::anyhow!("unsupported payment event kind: {other}").into());
            }
        };
        tx.execute(
            "INSERT INTO processed_events (event_id, created_at) VALUES (?1, ?2)",
            params![event_id, now.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(PaymentEventOutcome::Applied(entry))
    }

    // -- Sessions --

    /// Insert a new session and step it to `waiting` so it is joinable.
    /// The rate is locked here and never changes afterwards.
    pub fn create_session(
        &self,
        client_account_id: &str,
        reader_account_id: &str,
        modality: Modality,
        rate_per_minute: Decimal,
        now: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        if rate_per_minute < Decimal::ZERO {
            return Err(EngineError::InvalidAmount {
                amount: rate_per_minute,
            });
        }
        let tx = self.conn.unchecked_transaction()?;
        require_account(&tx, client_account_id)?;
        require_account(&tx, reader_account_id)?;

        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO sessions (id, client_account_id, reader_account_id, modality,
             state, rate_per_minute, billed_minutes, created_at, reconnect_count)
             VALUES (?1, ?2, ?3, ?4, 'created', ?5, 0, ?6, 0)",
            params![
                id,
                client_account_id,
                reader_account_id,
                modality.as_str(),
                rate_per_minute.to_string(),
                now.to_rfc3339()
            ],
        )?;
        // created -> waiting
        tx.execute(
            "UPDATE sessions SET state = 'waiting' WHERE id = ?1",
            params![id],
        )?;
        let session = require_session(&tx, &id)?;
        tx.commit()?;
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRow>, EngineError> {
        get_session_inner(&self.conn, id)
    }

    /// waiting -> active. Sets the start timestamp on first activation and
    /// assigns the realtime channel name if none exists yet.
    pub fn activate_session(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        let tx = self.conn.unchecked_transaction()?;
        let session = require_session(&tx, id)?;
        ensure_transition(&session, SessionState::Active)?;

        let channel = session
            .channel_name
            .clone()
            .unwrap_or_else(|| format!("session_{}_{}", id, now.timestamp()));
        let started = session.started_at.unwrap_or(now);
        tx.execute(
            "UPDATE sessions SET state = 'active', channel_name = ?1, started_at = ?2,
             grace_until = NULL WHERE id = ?3",
            params![channel, started.to_rfc3339(), id],
        )?;
        let session = require_session(&tx, id)?;
        tx.commit()?;
        Ok(session)
    }

    /// active -> paused. Sets the grace deadline and bumps the reconnect
    /// counter. Used for both client disconnects and failed charges.
    pub fn pause_session(
        &self,
        id: &str,
        grace_until: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        let tx = self.conn.unchecked_transaction()?;
        let session = require_session(&tx, id)?;
        ensure_transition(&session, SessionState::Paused)?;

        tx.execute(
            "UPDATE sessions SET state = 'paused', grace_until = ?1,
             reconnect_count = reconnect_count + 1 WHERE id = ?2",
            params![grace_until.to_rfc3339(), id],
        )?;
        let session = require_session(&tx, id)?;
        tx.commit()?;
        Ok(session)
    }

    /// paused -> reconnecting, only inside the grace window. A repeated
    /// attempt from `reconnecting` is accepted (the client retried).
    pub fn begin_reconnect(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        let tx = self.conn.unchecked_transaction()?;
        let session = require_session(&tx, id)?;
        if !matches!(
            session.state,
            SessionState::Paused | SessionState::Reconnecting
        ) {
            return Err(EngineError::InvalidTransition {
                from: session.state,
                to: SessionState::Reconnecting,
            });
        }
        match session.grace_until {
            Some(deadline) if now < deadline => {}
            _ => {
                return Err(EngineError::GraceExpired {
                    session: id.to_string(),
                });
            }
        }
        tx.execute(
            "UPDATE sessions SET state = 'reconnecting' WHERE id = ?1",
            params![id],
        )?;
        let session = require_session(&tx, id)?;
        tx.commit()?;
        Ok(session)
    }

    /// reconnecting -> active. Clears the grace deadline.
    pub fn complete_reconnect(&self, id: &str) -> Result<SessionRow, EngineError> {
        let tx = self.conn.unchecked_transaction()?;
        let session = require_session(&tx, id)?;
        if session.state != SessionState::Reconnecting {
            return Err(EngineError::InvalidTransition {
                from: session.state,
                to: SessionState::Active,
            });
        }
        tx.execute(
            "UPDATE sessions SET state = 'active', grace_until = NULL WHERE id = ?1",
            params![id],
        )?;
        let session = require_session(&tx, id)?;
        tx.commit()?;
        Ok(session)
    }

    /// Any live state -> ended. Billing stops permanently.
    pub fn end_session(
        &self,
        id: &str,
        summary: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        let tx = self.conn.unchecked_transaction()?;
        let session = require_session(&tx, id)?;
        ensure_transition(&session, SessionState::Ended)?;

        tx.execute(
            "UPDATE sessions SET state = 'ended', ended_at = ?1, grace_until = NULL,
             summary = COALESCE(summary, ?2) WHERE id = ?3",
            params![now.to_rfc3339(), summary, id],
        )?;
        let session = require_session(&tx, id)?;
        tx.commit()?;
        Ok(session)
    }

    /// ended -> finalized. Idempotent: a second call is a no-op. The
    /// summary is write-once; an existing summary is kept.
    pub fn finalize_session(
        &self,
        id: &str,
        summary: &str,
    ) -> Result<FinalizeOutcome, EngineError> {
        let tx = self.conn.unchecked_transaction()?;
        let session = require_session(&tx, id)?;
        if session.state == SessionState::Finalized {
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }
        ensure_transition(&session, SessionState::Finalized)?;

        tx.execute(
            "UPDATE sessions SET state = 'finalized', summary = COALESCE(summary, ?1)
             WHERE id = ?2",
            params![summary, id],
        )?;
        let session = require_session(&tx, id)?;
        tx.commit()?;
        Ok(FinalizeOutcome::Finalized(session))
    }

    /// Charge one billing minute of an active session. The idempotency key
    /// is derived from the persisted counter and the debit and the counter
    /// advance commit together, so a replayed tick can never double-charge.
    pub fn charge_active_minute(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ChargeOutcome, EngineError> {
        let tx = self.conn.unchecked_transaction()?;
        let session = require_session(&tx, session_id)?;
        if session.state != SessionState::Active {
            return Ok(ChargeOutcome::SkippedNotActive {
                state: session.state,
            });
        }
        if session.rate_per_minute <= Decimal::ZERO {
            return Ok(ChargeOutcome::ZeroRate);
        }

        let minute = session.billed_minutes + 1;
        let key = billing_minute_key(session_id, minute);
        if entry_by_key_inner(&tx, &key)?.is_some() {
            // An earlier run charged this minute but died before the
            // counter advanced. Heal the counter without a second charge.
            advance_billing(&tx, session_id, minute, now)?;
            tx.commit()?;
            return Ok(ChargeOutcome::AlreadyCharged { minute });
        }

        let account = require_account(&tx, &session.client_account_id)?;
        if account.balance < session.rate_per_minute {
            return Ok(ChargeOutcome::InsufficientFunds {
                balance: account.balance,
                rate: session.rate_per_minute,
            });
        }

        let entry = insert_entry(
            &tx,
            &account,
            -session.rate_per_minute,
            EntryKind::SessionCharge,
            &key,
            &EntryRefs::for_session(session_id),
        )?;
        advance_billing(&tx, session_id, minute, now)?;
        tx.commit()?;
        Ok(ChargeOutcome::Charged { minute, entry })
    }

    pub fn sessions_in_state(
        &self,
        state: SessionState,
        limit: u32,
    ) -> Result<Vec<SessionRow>, EngineError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLS} FROM sessions WHERE state = ?1
             ORDER BY created_at LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![state.as_str(), limit], map_session)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Paused or reconnecting sessions whose grace deadline has passed.
    pub fn grace_expired_sessions(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SessionRow>, EngineError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLS} FROM sessions
             WHERE state IN ('paused', 'reconnecting')
               AND grace_until IS NOT NULL AND grace_until < ?1
             ORDER BY grace_until LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![now.to_rfc3339(), limit], map_session)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -- Slots & bookings --

    pub fn create_slot(
        &self,
        reader_account_id: &str,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        duration_minutes: u32,
    ) -> Result<SlotRow, EngineError> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO slots (id, reader_account_id, start_at, end_at,
             duration_minutes, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'available')",
            params![
                id,
                reader_account_id,
                start_at.to_rfc3339(),
                end_at.to_rfc3339(),
                duration_minutes
            ],
        )?;
        require_slot(&self.conn, &id)
    }

    pub fn get_slot(&self, id: &str) -> Result<Option<SlotRow>, EngineError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {SLOT_COLS} FROM slots WHERE id = ?1"),
                params![id],
                map_slot,
            )
            .optional()?;
        Ok(row)
    }

    /// Book an available slot: debit the client and mark the slot in one
    /// transaction. Replaying the same (slot, client) pair returns the
    /// existing booking.
    pub fn book_slot(
        &self,
        slot_id: &str,
        client_account_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<BookingRow, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount { amount });
        }
        let now = Utc::now();
        let tx = self.conn.unchecked_transaction()?;
        let slot = require_slot(&tx, slot_id)?;

        if let Some(existing) = booking_for_slot(&tx, slot_id)? {
            if existing.client_account_id == client_account_id {
                return Ok(existing);
            }
            return Err(EngineError::SlotUnavailable {
                slot: slot_id.to_string(),
                status: slot.status.as_str().to_string(),
            });
        }
        if slot.status != SlotStatus::Available {
            return Err(EngineError::SlotUnavailable {
                slot: slot_id.to_string(),
                status: slot.status.as_str().to_string(),
            });
        }

        // Debit unless a half-completed earlier attempt already landed the
        // entry; either way the booking row is (re)created below.
        if entry_by_key_inner(&tx, idempotency_key)?.is_none() {
            let account = require_account(&tx, client_account_id)?;
            if account.balance < amount {
                return Err(EngineError::InsufficientFunds {
                    account: client_account_id.to_string(),
                    balance: account.balance,
                    requested: amount,
                });
            }
            insert_entry(
                &tx,
                &account,
                -amount,
                EntryKind::Booking,
                idempotency_key,
                &EntryRefs::for_reference("booking", slot_id),
            )?;
        }

        let booking_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO bookings (id, slot_id, client_account_id, amount,
             ledger_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                booking_id,
                slot_id,
                client_account_id,
                amount.to_string(),
                idempotency_key,
                now.to_rfc3339()
            ],
        )?;
        tx.execute(
            "UPDATE slots SET status = 'booked', client_account_id = ?1 WHERE id = ?2",
            params![client_account_id, slot_id],
        )?;
        let booking = require_booking(&tx, &booking_id)?;
        tx.commit()?;
        Ok(booking)
    }

    pub fn get_booking(&self, id: &str) -> Result<Option<BookingRow>, EngineError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {BOOKING_COLS} FROM bookings WHERE id = ?1"),
                params![id],
                map_booking,
            )
            .optional()?;
        Ok(row)
    }

    /// Cancel a booking and refund the client in full. Idempotent: an
    /// already-cancelled booking is returned unchanged.
    pub fn cancel_booking(&self, booking_id: &str) -> Result<BookingRow, EngineError> {
        let now = Utc::now();
        let tx = self.conn.unchecked_transaction()?;
        let booking = require_booking(&tx, booking_id)?;
        if booking.cancelled_at.is_some() {
            return Ok(booking);
        }

        let refund_key = crate::ledger::booking_refund_key(booking_id);
        if entry_by_key_inner(&tx, &refund_key)?.is_none() {
            let account = require_account(&tx, &booking.client_account_id)?;
            insert_entry(
                &tx,
                &account,
                booking.amount,
                EntryKind::Refund,
                &refund_key,
                &EntryRefs::for_reference("booking", &booking.slot_id),
            )?;
        }
        tx.execute(
            "UPDATE bookings SET cancelled_at = ?1, refund_amount = ?2 WHERE id = ?3",
            params![now.to_rfc3339(), booking.amount.to_string(), booking_id],
        )?;
        tx.execute(
            "UPDATE slots SET status = 'cancelled' WHERE id = ?1",
            params![booking.slot_id],
        )?;
        let booking = require_booking(&tx, booking_id)?;
        tx.commit()?;
        Ok(booking)
    }

    // -- Gifts --

    /// Debit the sender for the full gift and credit the provider their
    /// share, in one transaction with two independent idempotency keys.
    #[allow(clippy::too_many_arguments)]
    pub fn send_gift(
        &self,
        sender_account_id: &str,
        provider_account_id: &str,
        amount: Decimal,
        commission_rate: Decimal,
        gift_key: &str,
        commission_key: &str,
        refs: &EntryRefs,
    ) -> Result<GiftOutcome, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount { amount });
        }
        let tx = self.conn.unchecked_transaction()?;
        if entry_by_key_inner(&tx, gift_key)?.is_some() {
            return Ok(GiftOutcome::AlreadyApplied);
        }

        let sender = require_account(&tx, sender_account_id)?;
        if sender.balance < amount {
            return Err(EngineError::InsufficientFunds {
                account: sender_account_id.to_string(),
                balance: sender.balance,
                requested: amount,
            });
        }
        let debit = insert_entry(&tx, &sender, -amount, EntryKind::Gift, gift_key, refs)?;

        let (provider_cut, _platform_cut) = split_gift(amount, commission_rate);
        let provider = require_account(&tx, provider_account_id)?;
        let commission = insert_entry(
            &tx,
            &provider,
            provider_cut,
            EntryKind::Commission,
            commission_key,
            refs,
        )?;
        tx.commit()?;
        Ok(GiftOutcome::Applied { debit, commission })
    }

    // -- Audit log --

    pub fn append_audit(
        &self,
        account_id: Option<&str>,
        action: &str,
        object_type: Option<&str>,
        object_id: Option<&str>,
        details: &serde_json::Value,
    ) -> Result<(), EngineError> {
        insert_audit(
            &self.conn,
            account_id,
            action,
            object_type,
            object_id,
            details,
            Utc::now(),
        )
    }

    // -- Counters (status reporting) --

    pub fn count_accounts(&self) -> Result<i64, EngineError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_entries(&self) -> Result<i64, EngineError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn session_state_counts(&self) -> Result<Vec<(String, i64)>, EngineError> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM sessions GROUP BY state ORDER BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

// -- Outcomes --

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub balance: Decimal,
    pub previous: Decimal,
    pub corrected: bool,
}

#[derive(Debug, Clone)]
pub enum PaymentEventOutcome {
    Applied(LedgerEntry),
    AlreadyProcessed,
}

#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    Finalized(SessionRow),
    AlreadyFinalized,
}

#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    Charged { minute: u32, entry: LedgerEntry },
    AlreadyCharged { minute: u32 },
    InsufficientFunds { balance: Decimal, rate: Decimal },
    ZeroRate,
    SkippedNotActive { state: SessionState },
}

#[derive(Debug, Clone)]
pub enum GiftOutcome {
    Applied {
        debit: LedgerEntry,
        commission: LedgerEntry,
    },
    AlreadyApplied,
}

// -- Row types --

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: String,
    pub owner_id: String,
    pub balance: Decimal,
    pub payment_customer_ref: Option<String>,
    pub payout_destination: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub client_account_id: String,
    pub reader_account_id: String,
    pub modality: Modality,
    pub state: SessionState,
    pub channel_name: Option<String>,
    pub rate_per_minute: Decimal,
    pub billed_minutes: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_billed_at: Option<DateTime<Utc>>,
    pub grace_until: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
    pub summary: Option<String>,
}

impl SessionRow {
    /// Total charged so far, from the locked rate and the billing counter.
    pub fn total_charged(&self) -> Decimal {
        self.rate_per_minute * Decimal::from(self.billed_minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Available,
    Booked,
    Completed,
    Cancelled,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Booked => "booked",
            SlotStatus::Completed => "completed",
            SlotStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(SlotStatus::Available),
            "booked" => Some(SlotStatus::Booked),
            "completed" => Some(SlotStatus::Completed),
            "cancelled" => Some(SlotStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotRow {
    pub id: String,
    pub reader_account_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub status: SlotStatus,
    pub client_account_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BookingRow {
    pub id: String,
    pub slot_id: String,
    pub client_account_id: String,
    pub amount: Decimal,
    pub ledger_key: String,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub refund_amount: Option<Decimal>,
}

// -- Column lists & row mappers --

const ACCOUNT_COLS: &str = "id, owner_id, balance, payment_customer_ref, \
     payout_destination, created_at, updated_at";

const ENTRY_COLS: &str = "id, account_id, amount, kind, idempotency_key, \
     created_at, session_id, payment_ref, payment_event_id, reference_type, reference_id";

const SESSION_COLS: &str = "id, client_account_id, reader_account_id, modality, \
     state, channel_name, rate_per_minute, billed_minutes, created_at, started_at, \
     ended_at, last_billed_at, grace_until, reconnect_count, summary";

const SLOT_COLS: &str =
    "id, reader_account_id, start_at, end_at, duration_minutes, status, client_account_id";

const BOOKING_COLS: &str = "id, slot_id, client_account_id, amount, ledger_key, \
     created_at, cancelled_at, refund_amount";

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
    )
}

fn decimal_col(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| conversion_err(idx, format!("bad decimal '{s}': {e}")))
}

fn opt_decimal_col(row: &Row, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => Decimal::from_str(&s)
            .map(Some)
            .map_err(|e| conversion_err(idx, format!("bad decimal '{s}': {e}"))),
        None => Ok(None),
    }
}

fn ts_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, format!("bad timestamp '{s}': {e}")))
}

fn opt_ts_col(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| conversion_err(idx, format!("bad timestamp '{s}': {e}"))),
        None => Ok(None),
    }
}

fn map_account(row: &Row) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        balance: decimal_col(row, 2)?,
        payment_customer_ref: row.get(3)?,
        payout_destination: row.get(4)?,
        created_at: ts_col(row, 5)?,
        updated_at: ts_col(row, 6)?,
    })
}

fn map_entry(row: &Row) -> rusqlite::Result<LedgerEntry> {
    let kind_str: String = row.get(3)?;
    let kind = EntryKind::parse(&kind_str)
        .ok_or_else(|| conversion_err(3, format!("unknown entry kind '{kind_str}'")))?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: decimal_col(row, 2)?,
        kind,
        idempotency_key: row.get(4)?,
        created_at: ts_col(row, 5)?,
        session_id: row.get(6)?,
        payment_ref: row.get(7)?,
        payment_event_id: row.get(8)?,
        reference_type: row.get(9)?,
        reference_id: row.get(10)?,
    })
}

fn map_session(row: &Row) -> rusqlite::Result<SessionRow> {
    let modality_str: String = row.get(3)?;
    let modality = Modality::parse(&modality_str)
        .ok_or_else(|| conversion_err(3, format!("unknown modality '{modality_str}'")))?;
    let state_str: String = row.get(4)?;
    let state = SessionState::parse(&state_str)
        .ok_or_else(|| conversion_err(4, format!("unknown session state '{state_str}'")))?;
    Ok(SessionRow {
        id: row.get(0)?,
        client_account_id: row.get(1)?,
        reader_account_id: row.get(2)?,
        modality,
        state,
        channel_name: row.get(5)?,
        rate_per_minute: decimal_col(row, 6)?,
        billed_minutes: row.get::<_, i64>(7)? as u32,
        created_at: ts_col(row, 8)?,
        started_at: opt_ts_col(row, 9)?,
        ended_at: opt_ts_col(row, 10)?,
        last_billed_at: opt_ts_col(row, 11)?,
        grace_until: opt_ts_col(row, 12)?,
        reconnect_count: row.get::<_, i64>(13)? as u32,
        summary: row.get(14)?,
    })
}

fn map_slot(row: &Row) -> rusqlite::Result<SlotRow> {
    let status_str: String = row.get(5)?;
    let status = SlotStatus::parse(&status_str)
        .ok_or_else(|| conversion_err(5, format!("unknown slot status '{status_str}'")))?;
    Ok(SlotRow {
        id: row.get(0)?,
        reader_account_id: row.get(1)?,
        start_at: ts_col(row, 2)?,
        end_at: ts_col(row, 3)?,
        duration_minutes: row.get::<_, i64>(4)? as u32,
        status,
        client_account_id: row.get(6)?,
    })
}

fn map_booking(row: &Row) -> rusqlite::Result<BookingRow> {
    Ok(BookingRow {
        id: row.get(0)?,
        slot_id: row.get(1)?,
        client_account_id: row.get(2)?,
        amount: decimal_col(row, 3)?,
        ledger_key: row.get(4)?,
        created_at: ts_col(row, 5)?,
        cancelled_at: opt_ts_col(row, 6)?,
        refund_amount: opt_decimal_col(row, 7)?,
    })
}

// -- Transaction helpers --
//
// These take &Connection so they work both standalone and inside a
// Transaction (which derefs to Connection).

fn get_account_inner(conn: &Connection, id: &str) -> Result<Option<AccountRow>, EngineError> {
    let row = conn
        .query_row(
            &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE id = ?1"),
            params![id],
            map_account,
        )
        .optional()?;
    Ok(row)
}

fn require_account(conn: &Connection, id: &str) -> Result<AccountRow, EngineError> {
    get_account_inner(conn, id)?.ok_or_else(|| EngineError::AccountNotFound {
        account: id.to_string(),
    })
}

fn get_session_inner(conn: &Connection, id: &str) -> Result<Option<SessionRow>, EngineError> {
    let row = conn
        .query_row(
            &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
            params![id],
            map_session,
        )
        .optional()?;
    Ok(row)
}

fn require_session(conn: &Connection, id: &str) -> Result<SessionRow, EngineError> {
    get_session_inner(conn, id)?.ok_or_else(|| EngineError::SessionNotFound {
        session: id.to_string(),
    })
}

fn require_slot(conn: &Connection, id: &str) -> Result<SlotRow, EngineError> {
    let row = conn
        .query_row(
            &format!("SELECT {SLOT_COLS} FROM slots WHERE id = ?1"),
            params![id],
            map_slot,
        )
        .optional()?;
    row.ok_or_else(|| EngineError::SlotNotFound {
        slot: id.to_string(),
    })
}

fn require_booking(conn: &Connection, id: &str) -> Result<BookingRow, EngineError> {
    let row = conn
        .query_row(
            &format!("SELECT {BOOKING_COLS} FROM bookings WHERE id = ?1"),
            params![id],
            map_booking,
        )
        .optional()?;
    row.ok_or_else(|| EngineError::BookingNotFound {
        booking: id.to_string(),
    })
}

fn booking_for_slot(conn: &Connection, slot_id: &str) -> Result<Option<BookingRow>, EngineError> {
    let row = conn
        .query_row(
            &format!("SELECT {BOOKING_COLS} FROM bookings WHERE slot_id = ?1"),
            params![slot_id],
            map_booking,
        )
        .optional()?;
    Ok(row)
}

fn entry_by_key_inner(conn: &Connection, key: &str) -> Result<Option<LedgerEntry>, EngineError> {
    let row = conn
        .query_row(
            &format!("SELECT {ENTRY_COLS} FROM ledger_entries WHERE idempotency_key = ?1"),
            params![key],
            map_entry,
        )
        .optional()?;
    Ok(row)
}

fn ledger_sum_inner(conn: &Connection, account_id: &str) -> Result<Decimal, EngineError> {
    // Amounts are stored as decimal TEXT; SQLite's SUM would coerce to
    // float, so the summation happens here.
    let mut stmt = conn.prepare("SELECT amount FROM ledger_entries WHERE account_id = ?1")?;
    let rows = stmt.query_map(params![account_id], |row| decimal_col(row, 0))?;

    let mut sum = Decimal::ZERO;
    for amount in rows {
        sum += amount?;
    }
    Ok(sum)
}

/// Append one ledger entry and move the cached balance by its signed
/// amount. Callers have already done the duplicate-key and floor checks.
fn insert_entry(
    conn: &Connection,
    account: &AccountRow,
    signed_amount: Decimal,
    kind: EntryKind,
    idempotency_key: &str,
    refs: &EntryRefs,
) -> Result<LedgerEntry, EngineError> {
    let now = Utc::now();
    let entry = LedgerEntry {
        id: Uuid::new_v4().to_string(),
        account_id: account.id.clone(),
        amount: signed_amount,
        kind,
        idempotency_key: idempotency_key.to_string(),
        created_at: now,
        session_id: refs.session_id.clone(),
        payment_ref: refs.payment_ref.clone(),
        payment_event_id: refs.payment_event_id.clone(),
        reference_type: refs.reference_type.clone(),
        reference_id: refs.reference_id.clone(),
    };
    conn.execute(
        "INSERT INTO ledger_entries (id, account_id, amount, kind, idempotency_key,
         created_at, session_id, payment_ref, payment_event_id, reference_type, reference_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.id,
            entry.account_id,
            entry.amount.to_string(),
            entry.kind.as_str(),
            entry.idempotency_key,
            now.to_rfc3339(),
            entry.session_id,
            entry.payment_ref,
            entry.payment_event_id,
            entry.reference_type,
            entry.reference_id
        ],
    )?;
    let new_balance = account.balance + signed_amount;
    conn.execute(
        "UPDATE accounts SET balance = ?1, updated_at = ?2 WHERE id = ?3",
        params![new_balance.to_string(), now.to_rfc3339(), account.id],
    )?;
    Ok(entry)
}

fn advance_billing(
    conn: &Connection,
    session_id: &str,
    minute: u32,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE sessions SET billed_minutes = ?1, last_billed_at = ?2 WHERE id = ?3",
        params![minute, now.to_rfc3339(), session_id],
    )?;
    Ok(())
}

fn ensure_transition(session: &SessionRow, to: SessionState) -> Result<(), EngineError> {
    if session.state.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: session.state,
            to,
        })
    }
}

fn insert_audit(
    conn: &Connection,
    account_id: Option<&str>,
    action: &str,
    object_type: Option<&str>,
    object_id: Option<&str>,
    details: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO audit_log (id, account_id, action, object_type, object_id,
         details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            account_id,
            action,
            object_type,
            object_id,
            details.to_string(),
            now.to_rfc3339()
        ],
    )?;
    Ok(())
}
