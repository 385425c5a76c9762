// src/external/mod.rs — External collaborator seams
//
// The engine never holds a store lock across these calls: tokens are
// issued and transfers requested before/after the store command, never
// inside it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::infra::errors::EngineError;

/// Role a party plays on a realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRole {
    Publisher,
    Subscriber,
}

impl TokenRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenRole::Publisher => "publisher",
            TokenRole::Subscriber => "subscriber",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub channel: String,
    pub party_id: String,
    pub role: TokenRole,
    pub ttl_secs: u64,
}

/// A short-lived channel access token. Replay-safe by construction:
/// tokens expire on their own and each issuance is independent.
#[derive(Debug, Clone)]
pub struct RealtimeToken {
    pub token: String,
    pub channel: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues access tokens for the realtime transport channel backing a
/// session. Called once per activation and once per reconnect.
#[async_trait]
pub trait RealtimeTokenProvider: Send + Sync {
    async fn issue(&self, req: &TokenRequest) -> Result<RealtimeToken, EngineError>;
}

/// Local token provider: signs (app id, channel, party, role, expiry)
/// with the configured certificate. Stands in for a hosted transport
/// provider in development and tests.
pub struct SignedTokenProvider {
    app_id: String,
    certificate: String,
}

impl SignedTokenProvider {
    pub fn new(app_id: impl Into<String>, certificate: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            certificate: certificate.into(),
        }
    }
}

#[async_trait]
impl RealtimeTokenProvider for SignedTokenProvider {
    async fn issue(&self, req: &TokenRequest) -> Result<RealtimeToken, EngineError> {
        let expires_at = Utc::now() + Duration::seconds(req.ttl_secs as i64);

        let mut hasher = Sha256::new();
        hasher.update(self.app_id.as_bytes());
        hasher.update(self.certificate.as_bytes());
        hasher.update(req.channel.as_bytes());
        hasher.update(req.party_id.as_bytes());
        hasher.update(req.role.as_str().as_bytes());
        hasher.update(expires_at.timestamp().to_be_bytes());
        let signature = hex::encode(hasher.finalize());

        Ok(RealtimeToken {
            token: format!("{}:{}:{}", self.app_id, expires_at.timestamp(), signature),
            channel: req.channel.clone(),
            expires_at,
        })
    }
}

/// Confirmation returned by the payout rail.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub id: String,
    pub destination: String,
    pub amount: Decimal,
}

/// External payout rail. Assumed idempotent on the idempotency key: a
/// repeated transfer request with the same key returns the original
/// receipt instead of moving money twice.
#[async_trait]
pub trait PayoutRail: Send + Sync {
    async fn transfer(
        &self,
        destination: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<TransferReceipt, EngineError>;
}

/// Development rail: logs the transfer and fabricates a receipt id from
/// the idempotency key, so replays correlate the way a real rail would.
pub struct LoggedRail;

#[async_trait]
impl PayoutRail for LoggedRail {
    async fn transfer(
        &self,
        destination: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<TransferReceipt, EngineError> {
        tracing::info!(
            "Payout transfer: {} -> {} (key {})",
            amount,
            destination,
            idempotency_key
        );
        let mut hasher = Sha256::new();
        hasher.update(idempotency_key.as_bytes());
        let digest = hex::encode(&hasher.finalize()[..8]);
        Ok(TransferReceipt {
            id: format!("tr_{digest}"),
            destination: destination.to_string(),
            amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_signed_token_is_deterministic_per_expiry() {
        let provider = SignedTokenProvider::new("app", "cert");
        let req = TokenRequest {
            channel: "session_1".into(),
            party_id: "client-1".into(),
            role: TokenRole::Publisher,
            ttl_secs: 1200,
        };
        let token = provider.issue(&req).await.unwrap();
        assert_eq!(token.channel, "session_1");
        assert!(token.token.starts_with("app:"));
        assert!(token.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_logged_rail_receipt_is_stable_for_key() {
        let rail = LoggedRail;
        let a = rail
            .transfer("dest_1", dec!(25.00), "payout_acct_2026-08-06")
            .await
            .unwrap();
        let b = rail
            .transfer("dest_1", dec!(25.00), "payout_acct_2026-08-06")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.amount, dec!(25.00));
    }
}
