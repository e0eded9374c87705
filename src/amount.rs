// src/amount.rs
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::{LedgerError, Result};

/// Minor units per major unit. Every supported currency is tracked in cents.
pub const SUBUNITS_PER_UNIT: i64 = 100;

/// `floor(units * 100)`. Cents truncate, they never round up.
pub fn to_subunits(units: Decimal) -> Result<i64> {
    units
        .checked_mul(Decimal::from(SUBUNITS_PER_UNIT))
        .map(|cents| cents.floor())
        .and_then(|cents| cents.to_i64())
        .ok_or_else(|| LedgerError::invalid(format!("amount {} is out of range", units)))
}

pub fn to_units(subunits: i64) -> Decimal {
    Decimal::new(subunits, 2)
}

/// Rejects zero deltas, deltas above the configured ceiling and deltas with
/// more fractional digits than the store keeps.
pub fn validate_delta(delta: Decimal, max_delta: Decimal, max_scale: u32) -> Result<()> {
    if delta.is_zero() {
        return Err(LedgerError::invalid("delta must not be zero"));
    }
    if delta.abs() > max_delta {
        return Err(LedgerError::invalid(format!(
            "delta {} exceeds the allowed magnitude of {}",
            delta, max_delta
        )));
    }
    if delta.normalize().scale() > max_scale {
        return Err(LedgerError::invalid(format!(
            "delta {} has more than {} decimal places",
            delta, max_scale
        )));
    }
    Ok(())
}
