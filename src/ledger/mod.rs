// src/ledger/mod.rs — Ledger vocabulary: entry kinds, apply outcomes,
// idempotency keys, and the gift split.
//
// The atomic debit/credit/reconcile transactions themselves live on the
// Store (src/store/store.rs); this module defines the types they speak.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a ledger entry records. Closed set — billing logic matches on
/// these exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    TopUp,
    SessionCharge,
    Booking,
    PaidReply,
    Gift,
    Refund,
    Adjustment,
    Payout,
    Commission,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::TopUp => "top_up",
            EntryKind::SessionCharge => "session_charge",
            EntryKind::Booking => "booking",
            EntryKind::PaidReply => "paid_reply",
            EntryKind::Gift => "gift",
            EntryKind::Refund => "refund",
            EntryKind::Adjustment => "adjustment",
            EntryKind::Payout => "payout",
            EntryKind::Commission => "commission",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "top_up" => Some(EntryKind::TopUp),
            "session_charge" => Some(EntryKind::SessionCharge),
            "booking" => Some(EntryKind::Booking),
            "paid_reply" => Some(EntryKind::PaidReply),
            "gift" => Some(EntryKind::Gift),
            "refund" => Some(EntryKind::Refund),
            "adjustment" => Some(EntryKind::Adjustment),
            "payout" => Some(EntryKind::Payout),
            "commission" => Some(EntryKind::Commission),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an idempotent ledger mutation. A duplicate idempotency key
/// is not an error: the caller gets the original entry back.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(LedgerEntry),
    AlreadyApplied(LedgerEntry),
}

impl ApplyOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            ApplyOutcome::Applied(e) | ApplyOutcome::AlreadyApplied(e) => e,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, ApplyOutcome::AlreadyApplied(_))
    }
}

/// An immutable signed money movement. Negative amount = debit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub account_id: String,
    pub amount: Decimal,
    pub kind: EntryKind,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub payment_ref: Option<String>,
    pub payment_event_id: Option<String>,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
}

/// Optional linkage recorded with an entry. Informational only: ledger
/// correctness never depends on it.
#[derive(Debug, Clone, Default)]
pub struct EntryRefs {
    pub session_id: Option<String>,
    pub payment_ref: Option<String>,
    pub payment_event_id: Option<String>,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
}

impl EntryRefs {
    pub fn for_session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            reference_type: Some("session".to_string()),
            reference_id: Some(session_id.to_string()),
            ..Default::default()
        }
    }

    pub fn for_reference(reference_type: &str, reference_id: &str) -> Self {
        Self {
            reference_type: Some(reference_type.to_string()),
            reference_id: Some(reference_id.to_string()),
            ..Default::default()
        }
    }
}

// -- Idempotency keys --
//
// Billing keys are derived from persisted state so a replayed job
// recomputes the same key; event keys echo the external event id.

pub fn billing_minute_key(session_id: &str, minute: u32) -> String {
    format!("session_{session_id}_min_{minute}")
}

pub fn topup_key(event_id: &str) -> String {
    format!("topup_{event_id}")
}

pub fn refund_key(event_id: &str) -> String {
    format!("refund_{event_id}")
}

pub fn booking_key(slot_id: &str, client_account: &str) -> String {
    format!("booking_{slot_id}_{client_account}")
}

pub fn booking_refund_key(booking_id: &str) -> String {
    format!("booking_refund_{booking_id}")
}

pub fn gift_key(reference: &str) -> String {
    format!("gift_{reference}")
}

pub fn gift_commission_key(reference: &str) -> String {
    format!("gift_commission_{reference}")
}

pub fn payout_rail_key(account_id: &str, date: chrono::NaiveDate) -> String {
    format!("payout_{account_id}_{date}")
}

pub fn payout_debit_key(receipt_id: &str) -> String {
    format!("payout_{receipt_id}")
}

pub fn paid_reply_key(conversation_id: &str, sequence: u32) -> String {
    format!("paid_reply_{conversation_id}_{sequence}")
}

/// Split a gift between the receiving provider and the platform.
/// Returns (provider_cut, platform_cut); the two always sum to `amount`.
pub fn split_gift(amount: Decimal, commission_rate: Decimal) -> (Decimal, Decimal) {
    let provider = (amount * commission_rate).round_dp(2);
    (provider, amount - provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_entry_kind_round_trip() {
        for kind in [
            EntryKind::TopUp,
            EntryKind::SessionCharge,
            EntryKind::Booking,
            EntryKind::PaidReply,
            EntryKind::Gift,
            EntryKind::Refund,
            EntryKind::Adjustment,
            EntryKind::Payout,
            EntryKind::Commission,
        ] {
            assert_eq!(EntryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntryKind::parse("tip"), None);
    }

    #[test]
    fn test_billing_key_is_deterministic() {
        let a = billing_minute_key("s-1", 3);
        let b = billing_minute_key("s-1", 3);
        assert_eq!(a, b);
        assert_eq!(a, "session_s-1_min_3");
        assert_ne!(a, billing_minute_key("s-1", 4));
    }

    #[test]
    fn test_split_gift_sums_to_whole() {
        let (provider, platform) = split_gift(dec!(10.00), dec!(0.70));
        assert_eq!(provider, dec!(7.00));
        assert_eq!(platform, dec!(3.00));
        assert_eq!(provider + platform, dec!(10.00));
    }

    #[test]
    fn test_split_gift_rounding_never_loses_money() {
        // 0.70 * 0.01 rounds to 0.01; the platform absorbs the remainder
        let (provider, platform) = split_gift(dec!(0.01), dec!(0.70));
        assert_eq!(provider + platform, dec!(0.01));

        let (provider, platform) = split_gift(dec!(3.33), dec!(0.70));
        assert_eq!(provider + platform, dec!(3.33));
    }
}
