// src/config.rs
use std::env;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::warn;

use crate::{LedgerError, Result};

/// Business limits applied by [`crate::LedgerSystem`].
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Currency codes balances may be opened in.
    pub currencies: Vec<String>,
    /// Currency manual-fund totals are reported in.
    pub reference_currency: String,
    /// Largest magnitude a single delta may have.
    pub max_delta: Decimal,
    /// Fractional digits kept by the store.
    pub max_scale: u32,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            currencies: ["USD", "EUR", "GBP", "P"].iter().map(|c| c.to_string()).collect(),
            reference_currency: "USD".to_string(),
            max_delta: Decimal::from(1_000_000),
            max_scale: 8,
            default_page_size: 10,
            max_page_size: 100,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let currencies = env::var("LEDGER_CURRENCIES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|c| c.trim().to_ascii_uppercase())
                    .filter(|c| !c.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|codes| !codes.is_empty())
            .unwrap_or(defaults.currencies);

        let reference_currency = env::var("LEDGER_REFERENCE_CURRENCY")
            .ok()
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .unwrap_or(defaults.reference_currency);

        Self {
            currencies,
            reference_currency,
            max_delta: parse_env("LEDGER_MAX_DELTA", defaults.max_delta),
            max_scale: parse_env("LEDGER_MAX_SCALE", defaults.max_scale),
            default_page_size: parse_env("LEDGER_DEFAULT_PAGE_SIZE", defaults.default_page_size),
            max_page_size: parse_env("LEDGER_MAX_PAGE_SIZE", defaults.max_page_size),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.currencies.is_empty() {
            return Err(LedgerError::invalid("at least one currency must be configured"));
        }
        if !self
            .currencies
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&self.reference_currency))
        {
            return Err(LedgerError::invalid(format!(
                "reference currency {} is not a configured currency",
                self.reference_currency
            )));
        }
        if self.max_delta <= Decimal::ZERO {
            return Err(LedgerError::invalid("max_delta must be positive"));
        }
        // NUMERIC(28,8) columns
        if self.max_scale > 8 {
            return Err(LedgerError::invalid("max_scale cannot exceed 8"));
        }
        if self.max_page_size == 0
            || self.default_page_size == 0
            || self.default_page_size > self.max_page_size
        {
            return Err(LedgerError::invalid(
                "default_page_size must be within 1..=max_page_size",
            ));
        }
        Ok(())
    }
}

/// Connection settings for [`crate::adapters::PostgresAdapter::connect`].
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PostgresConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| LedgerError::invalid("missing required environment variable: DATABASE_URL"))?;
        let defaults = Self::new(database_url);

        Ok(Self {
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS", defaults.max_connections),
            acquire_timeout: Duration::from_secs(parse_env(
                "DATABASE_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )),
            ..defaults
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "unparseable config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(LedgerConfig::default().validate().is_ok());
    }

    #[test]
    fn reference_currency_must_be_configured() {
        let config = LedgerConfig {
            reference_currency: "BTC".to_string(),
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn page_sizes_are_checked() {
        let config = LedgerConfig {
            default_page_size: 500,
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = LedgerConfig {
            max_page_size: 0,
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn ceiling_must_be_positive() {
        let config = LedgerConfig {
            max_delta: Decimal::ZERO,
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn postgres_defaults() {
        let config = PostgresConfig::new("postgres://localhost/ledger");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }
}
