// src/infra/config.rs — Configuration loading (TOML)

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::infra::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub billing: BillingConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub payout: PayoutConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database. Defaults to the platform data dir.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Reconnect window after a disconnect or failed charge, in minutes.
    pub grace_minutes: i64,
    /// Provider share of a gift; the platform retains the rest.
    pub commission_rate: Decimal,
    /// Flat rate used to price scheduled slots.
    pub booking_hourly_rate: Decimal,
    /// Flat charge for a paid reader reply in a conversation.
    pub paid_reply_price: Decimal,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            grace_minutes: 5,
            commission_rate: Decimal::new(70, 2),       // 0.70
            booking_hourly_rate: Decimal::new(5000, 2), // 50.00
            paid_reply_price: Decimal::new(100, 2),     // 1.00
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub billing_tick_secs: u64,
    pub grace_expiry_secs: u64,
    pub finalize_secs: u64,
    pub payout_secs: u64,
    /// Max sessions/accounts touched per job run.
    pub batch_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            billing_tick_secs: 60,
            grace_expiry_secs: 30,
            finalize_secs: 60,
            payout_secs: 3600,
            batch_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutConfig {
    /// Accounts below this balance are skipped by the payout batch.
    pub minimum: Decimal,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            minimum: Decimal::new(1000, 2), // 10.00
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Application id passed through to issued channel tokens.
    pub app_id: String,
    /// Signing certificate for the local token provider.
    pub certificate: String,
    /// Token lifetime in seconds.
    pub token_ttl_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            certificate: String::new(),
            token_ttl_secs: 1200,
        }
    }
}

impl Config {
    /// Load from the default config path, falling back to defaults
    /// if no config.toml exists.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.billing.grace_minutes, 5);
        assert_eq!(config.billing.commission_rate, dec!(0.70));
        assert_eq!(config.payout.minimum, dec!(10.00));
        assert_eq!(config.scheduler.billing_tick_secs, 60);
        assert_eq!(config.scheduler.grace_expiry_secs, 30);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [billing]
            grace_minutes = 2
            commission_rate = "0.70"
            booking_hourly_rate = "50.00"
            paid_reply_price = "1.00"
            "#,
        )
        .unwrap();
        assert_eq!(config.billing.grace_minutes, 2);
        // Untouched sections keep their defaults
        assert_eq!(config.scheduler.batch_limit, 500);
        assert_eq!(config.realtime.token_ttl_secs, 1200);
    }
}
