// src/engine/mod.rs — Public operation surface
//
// Everything the calling layer (CLI, API, webhook relay) is allowed to do
// resolves to the operations here. Each operation is one or more store
// commands plus, where needed, an external call made outside the store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;

use crate::external::{
    PayoutRail, RealtimeToken, RealtimeTokenProvider, TokenRequest, TokenRole,
};
use crate::infra::config::Config;
use crate::infra::errors::EngineError;
use crate::ledger::{
    self, ApplyOutcome, EntryKind, EntryRefs,
};
use crate::sessions::Modality;
use crate::store::store::{
    AccountRow, BookingRow, GiftOutcome, PaymentEventOutcome, ReconcileOutcome, SessionRow,
};
use crate::store::StoreHandle;

/// A top-up or refund event delivered by the external payment webhook
/// relay. Redelivery of the same event id is a no-op.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub event_id: String,
    pub customer_ref: String,
    pub amount: Decimal,
    pub payment_ref: Option<String>,
}

/// A session row plus the realtime channel token issued for the caller.
#[derive(Debug, Clone)]
pub struct SessionAccess {
    pub session: SessionRow,
    pub token: RealtimeToken,
}

pub struct Engine {
    store: StoreHandle,
    config: Config,
    tokens: Arc<dyn RealtimeTokenProvider>,
    rail: Arc<dyn PayoutRail>,
}

impl Engine {
    pub fn new(
        store: StoreHandle,
        config: Config,
        tokens: Arc<dyn RealtimeTokenProvider>,
        rail: Arc<dyn PayoutRail>,
    ) -> Self {
        Self {
            store,
            config,
            tokens,
            rail,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rail(&self) -> Arc<dyn PayoutRail> {
        self.rail.clone()
    }

    // -- Accounts --

    pub async fn create_account(
        &self,
        owner_id: &str,
        payment_customer_ref: Option<&str>,
        payout_destination: Option<&str>,
    ) -> Result<AccountRow, EngineError> {
        self.store
            .create_account(
                owner_id.to_string(),
                payment_customer_ref.map(str::to_string),
                payout_destination.map(str::to_string),
            )
            .await
    }

    pub async fn reconcile_account(
        &self,
        account_id: &str,
    ) -> Result<ReconcileOutcome, EngineError> {
        self.store.reconcile(account_id.to_string()).await
    }

    // -- Session lifecycle --

    /// Create a session with the rate locked in. The client must be able
    /// to afford at least one billing minute up front.
    pub async fn create_session(
        &self,
        client_account_id: &str,
        reader_account_id: &str,
        modality: Modality,
        rate_per_minute: Decimal,
    ) -> Result<SessionRow, EngineError> {
        let client = self
            .store
            .get_account(client_account_id.to_string())
            .await?
            .ok_or_else(|| EngineError::AccountNotFound {
                account: client_account_id.to_string(),
            })?;
        if client.balance < rate_per_minute {
            return Err(EngineError::InsufficientFunds {
                account: client_account_id.to_string(),
                balance: client.balance,
                requested: rate_per_minute,
            });
        }
        self.store
            .create_session(
                client_account_id.to_string(),
                reader_account_id.to_string(),
                modality,
                rate_per_minute,
                Utc::now(),
            )
            .await
    }

    /// waiting -> active; issues the realtime channel token for the caller.
    pub async fn activate_session(
        &self,
        session_id: &str,
        party_id: &str,
    ) -> Result<SessionAccess, EngineError> {
        let session = self
            .store
            .activate_session(session_id.to_string(), Utc::now())
            .await?;
        let token = self.issue_token(&session, party_id).await?;
        Ok(SessionAccess { session, token })
    }

    /// active -> paused with a fresh grace deadline.
    pub async fn disconnect_session(&self, session_id: &str) -> Result<SessionRow, EngineError> {
        let grace_until = Utc::now() + Duration::minutes(self.config.billing.grace_minutes);
        self.store
            .pause_session(session_id.to_string(), grace_until)
            .await
    }

    /// Reconnect within the grace window: paused -> reconnecting, token
    /// issued, reconnecting -> active. A token failure leaves the session
    /// in `reconnecting`, where grace expiry can still claim it.
    pub async fn reconnect_session(
        &self,
        session_id: &str,
        party_id: &str,
    ) -> Result<SessionAccess, EngineError> {
        let now = Utc::now();
        let session = self
            .store
            .begin_reconnect(session_id.to_string(), now)
            .await?;

        // The client must still be able to afford the next minute.
        let client = self
            .store
            .get_account(session.client_account_id.clone())
            .await?
            .ok_or_else(|| EngineError::AccountNotFound {
                account: session.client_account_id.clone(),
            })?;
        if client.balance < session.rate_per_minute {
            return Err(EngineError::InsufficientFunds {
                account: session.client_account_id.clone(),
                balance: client.balance,
                requested: session.rate_per_minute,
            });
        }

        let token = self.issue_token(&session, party_id).await?;
        let session = self
            .store
            .complete_reconnect(session_id.to_string())
            .await?;
        Ok(SessionAccess { session, token })
    }

    /// Any live state -> ended. Finalization is picked up by the scheduler.
    pub async fn end_session(
        &self,
        session_id: &str,
        summary: Option<String>,
    ) -> Result<SessionRow, EngineError> {
        self.store
            .end_session(session_id.to_string(), summary, Utc::now())
            .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>, EngineError> {
        self.store.get_session(session_id.to_string()).await
    }

    async fn issue_token(
        &self,
        session: &SessionRow,
        party_id: &str,
    ) -> Result<RealtimeToken, EngineError> {
        let channel = session.channel_name.clone().unwrap_or_default();
        self.tokens
            .issue(&TokenRequest {
                channel,
                party_id: party_id.to_string(),
                role: TokenRole::Publisher,
                ttl_secs: self.config.realtime.token_ttl_secs,
            })
            .await
    }

    // -- Payments --

    /// Credit a wallet from an external top-up event.
    pub async fn top_up(&self, event: &PaymentEvent) -> Result<PaymentEventOutcome, EngineError> {
        let account = self.account_for_event(event).await?;
        self.store
            .apply_payment_event(
                event.event_id.clone(),
                account.id,
                event.amount,
                EntryKind::TopUp,
                ledger::topup_key(&event.event_id),
                event.payment_ref.clone(),
            )
            .await
    }

    /// Pull a refunded amount back out of a wallet.
    pub async fn refund(&self, event: &PaymentEvent) -> Result<PaymentEventOutcome, EngineError> {
        let account = self.account_for_event(event).await?;
        self.store
            .apply_payment_event(
                event.event_id.clone(),
                account.id,
                event.amount,
                EntryKind::Refund,
                ledger::refund_key(&event.event_id),
                event.payment_ref.clone(),
            )
            .await
    }

    async fn account_for_event(&self, event: &PaymentEvent) -> Result<AccountRow, EngineError> {
        self.store
            .get_account_by_customer_ref(event.customer_ref.clone())
            .await?
            .ok_or_else(|| EngineError::AccountNotFound {
                account: event.customer_ref.clone(),
            })
    }

    // -- Gifts --

    /// Debit the sender for the full gift amount and credit the provider
    /// their commission share. `reference` identifies the gift purchase
    /// and makes the operation replay-safe.
    pub async fn send_gift(
        &self,
        sender_account_id: &str,
        provider_account_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<GiftOutcome, EngineError> {
        self.store
            .send_gift(
                sender_account_id.to_string(),
                provider_account_id.to_string(),
                amount,
                self.config.billing.commission_rate,
                ledger::gift_key(reference),
                ledger::gift_commission_key(reference),
                EntryRefs::for_reference("gift", reference),
            )
            .await
    }

    // -- Bookings --

    /// Book an available slot, charging the flat hourly rate pro-rated to
    /// the slot duration.
    pub async fn book_slot(
        &self,
        slot_id: &str,
        client_account_id: &str,
    ) -> Result<BookingRow, EngineError> {
        let slot = self
            .store
            .get_slot(slot_id.to_string())
            .await?
            .ok_or_else(|| EngineError::SlotNotFound {
                slot: slot_id.to_string(),
            })?;
        let amount = (self.config.billing.booking_hourly_rate
            * Decimal::from(slot.duration_minutes)
            / Decimal::from(60))
        .round_dp(2);
        self.store
            .book_slot(
                slot_id.to_string(),
                client_account_id.to_string(),
                amount,
                ledger::booking_key(slot_id, client_account_id),
            )
            .await
    }

    /// Cancel a booking, refunding the client in full.
    pub async fn cancel_booking(&self, booking_id: &str) -> Result<BookingRow, EngineError> {
        self.store.cancel_booking(booking_id.to_string()).await
    }

    // -- Paid replies --

    /// Charge the client the flat paid-reply price for one reader reply
    /// in a conversation. The sequence number keys the charge.
    pub async fn paid_reply(
        &self,
        client_account_id: &str,
        conversation_id: &str,
        sequence: u32,
    ) -> Result<ApplyOutcome, EngineError> {
        self.store
            .debit(
                client_account_id.to_string(),
                self.config.billing.paid_reply_price,
                EntryKind::PaidReply,
                ledger::paid_reply_key(conversation_id, sequence),
                EntryRefs::for_reference("paid_reply", conversation_id),
            )
            .await
    }
}
