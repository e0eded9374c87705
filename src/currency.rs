// src/currency.rs
use std::collections::BTreeSet;

use crate::{LedgerError, Result};

/// The set of currency codes the ledger accepts balances in.
#[derive(Debug, Clone)]
pub struct CurrencyRegistry {
    codes: BTreeSet<String>,
}

impl CurrencyRegistry {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            codes: codes
                .into_iter()
                .map(|c| normalize(c.as_ref()))
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(&normalize(code))
    }

    /// Returns the canonical (trimmed, upper-case) code, or `InvalidInput`
    /// when the currency is unknown.
    pub fn resolve(&self, code: &str) -> Result<String> {
        let code = normalize(code);
        if code.is_empty() {
            return Err(LedgerError::invalid("currency code is required"));
        }
        if !self.codes.contains(&code) {
            return Err(LedgerError::invalid(format!("unknown currency: {}", code)));
        }
        Ok(code)
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.codes.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_codes_case_insensitively() {
        let registry = CurrencyRegistry::new(["USD", "eur", " P "]);
        assert_eq!(registry.resolve("usd").unwrap(), "USD");
        assert_eq!(registry.resolve("EUR").unwrap(), "EUR");
        assert_eq!(registry.resolve("p").unwrap(), "P");
        assert!(registry.contains(" usd"));
    }

    #[test]
    fn rejects_unknown_and_empty_codes() {
        let registry = CurrencyRegistry::new(["USD"]);
        assert!(matches!(
            registry.resolve("BTC"),
            Err(LedgerError::InvalidInput(_))
        ));
        assert!(matches!(
            registry.resolve("  "),
            Err(LedgerError::InvalidInput(_))
        ));
    }

    #[test]
    fn empty_entries_are_dropped() {
        let registry = CurrencyRegistry::new(["", "  "]);
        assert!(registry.is_empty());
    }
}
