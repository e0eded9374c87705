// src/balance.rs
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::to_subunits;
use crate::{LedgerError, Result};

/// Which half of a balance a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Component {
    /// Withdrawable money.
    Spendable,
    /// Promotional money, playable but not withdrawable.
    Restricted,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Spendable => "SPENDABLE",
            Component::Restricted => "RESTRICTED",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SPENDABLE" => Ok(Component::Spendable),
            "RESTRICTED" => Ok(Component::Restricted),
            other => Err(LedgerError::invalid(format!("unknown balance component: {}", other))),
        }
    }
}

/// One row per (user, currency). Each component is held twice: as integer
/// cents and as a decimal unit amount.
///
/// Invariants:
/// - `*_subunits == floor(*_units * 100)`
/// - both unit amounts are `>= 0`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub currency_code: String,
    pub spendable_subunits: i64,
    pub spendable_units: Decimal,
    pub restricted_subunits: i64,
    pub restricted_units: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl BalanceRecord {
    pub fn new(user_id: Uuid, currency_code: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            currency_code: currency_code.into(),
            spendable_subunits: 0,
            spendable_units: Decimal::ZERO,
            restricted_subunits: 0,
            restricted_units: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    pub fn units(&self, component: Component) -> Decimal {
        match component {
            Component::Spendable => self.spendable_units,
            Component::Restricted => self.restricted_units,
        }
    }

    pub fn subunits(&self, component: Component) -> i64 {
        match component {
            Component::Spendable => self.spendable_subunits,
            Component::Restricted => self.restricted_subunits,
        }
    }

    /// Returns the record after adding `delta` to one component.
    ///
    /// Subunits are recomputed from the new unit total, never incremented,
    /// so repeated small deltas cannot drift.
    pub fn apply_delta(&self, component: Component, delta: Decimal) -> Result<BalanceRecord> {
        let units = self
            .units(component)
            .checked_add(delta)
            .ok_or_else(|| LedgerError::invalid("balance amount out of range"))?;
        if units < Decimal::ZERO {
            return Err(LedgerError::InsufficientFunds);
        }
        let subunits = to_subunits(units)?;

        let mut next = self.clone();
        match component {
            Component::Spendable => {
                next.spendable_units = units;
                next.spendable_subunits = subunits;
            }
            Component::Restricted => {
                next.restricted_units = units;
                next.restricted_subunits = subunits;
            }
        }
        next.updated_at = Utc::now();
        Ok(next)
    }

    /// Re-derives both subunit columns from the unit columns and reports any
    /// mismatch or negative amount.
    pub fn check_invariants(&self) -> Result<()> {
        for component in [Component::Spendable, Component::Restricted] {
            let units = self.units(component);
            if units < Decimal::ZERO {
                return Err(LedgerError::Internal(format!(
                    "{} balance of {}/{} is negative",
                    component, self.user_id, self.currency_code
                )));
            }
            let expected = to_subunits(units)
                .map_err(|e| LedgerError::Internal(e.to_string()))?;
            if expected != self.subunits(component) {
                return Err(LedgerError::Internal(format!(
                    "{} subunits drifted for {}/{}: stored {}, expected {}",
                    component,
                    self.user_id,
                    self.currency_code,
                    self.subunits(component),
                    expected
                )));
            }
        }
        Ok(())
    }
}
