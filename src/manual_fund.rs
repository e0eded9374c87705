// src/manual_fund.rs
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::histogram;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::amount::validate_delta;
use crate::mutation::{AuditContext, LedgerMutationRequest};
use crate::query::{ManualFundFilter, ManualFundQuery, Page, PageRequest};
use crate::{Component, LedgerError, LedgerSystem, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FundType {
    Credit,
    Debit,
    Adjustment,
}

impl FundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundType::Credit => "CREDIT",
            FundType::Debit => "DEBIT",
            FundType::Adjustment => "ADJUSTMENT",
        }
    }

    /// CREDIT for money in, DEBIT for money out.
    pub fn for_delta(delta: Decimal) -> Self {
        if delta < Decimal::ZERO {
            FundType::Debit
        } else {
            FundType::Credit
        }
    }
}

impl fmt::Display for FundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FundType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREDIT" => Ok(FundType::Credit),
            "DEBIT" => Ok(FundType::Debit),
            "ADJUSTMENT" => Ok(FundType::Adjustment),
            other => Err(LedgerError::invalid(format!("unknown fund type: {}", other))),
        }
    }
}

/// Append-only audit record of a human-initiated balance change.
///
/// `amount` is the signed delta that was applied, so summing entries gives
/// the net effect on balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualFundEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub admin_id: Uuid,
    /// Equals the idempotency key of the mutation that produced it.
    pub transaction_id: String,
    pub fund_type: FundType,
    pub amount: Decimal,
    pub currency_code: String,
    pub component: Component,
    pub reason: String,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// A manual fund as submitted from the admin side, before it is applied.
///
/// CREDIT and DEBIT carry a positive magnitude. ADJUSTMENT carries the
/// signed change itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewManualFund {
    pub user_id: Uuid,
    pub admin_id: Uuid,
    pub transaction_id: String,
    pub fund_type: FundType,
    pub amount: Decimal,
    pub currency_code: String,
    pub component: Component,
    pub reason: String,
    pub note: String,
}

impl NewManualFund {
    pub fn credit(
        user_id: Uuid,
        admin_id: Uuid,
        transaction_id: impl Into<String>,
        amount: Decimal,
        currency_code: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            admin_id,
            transaction_id: transaction_id.into(),
            fund_type: FundType::Credit,
            amount,
            currency_code: currency_code.into(),
            component: Component::Spendable,
            reason: reason.into(),
            note: String::new(),
        }
    }

    pub fn debit(
        user_id: Uuid,
        admin_id: Uuid,
        transaction_id: impl Into<String>,
        amount: Decimal,
        currency_code: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            fund_type: FundType::Debit,
            ..Self::credit(user_id, admin_id, transaction_id, amount, currency_code, reason)
        }
    }

    pub fn adjustment(
        user_id: Uuid,
        admin_id: Uuid,
        transaction_id: impl Into<String>,
        amount: Decimal,
        currency_code: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            fund_type: FundType::Adjustment,
            ..Self::credit(user_id, admin_id, transaction_id, amount, currency_code, reason)
        }
    }

    pub fn on_component(mut self, component: Component) -> Self {
        self.component = component;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_nil() {
            return Err(LedgerError::invalid("user_id is required"));
        }
        if self.admin_id.is_nil() {
            return Err(LedgerError::invalid("admin_id is required"));
        }
        if self.transaction_id.trim().is_empty() {
            return Err(LedgerError::invalid("transaction_id is required"));
        }
        if self.reason.trim().is_empty() {
            return Err(LedgerError::invalid("reason is required"));
        }
        match self.fund_type {
            FundType::Credit | FundType::Debit if self.amount <= Decimal::ZERO => Err(
                LedgerError::invalid(format!("{} amount must be positive", self.fund_type)),
            ),
            FundType::Adjustment if self.amount.is_zero() => {
                Err(LedgerError::invalid("ADJUSTMENT amount must not be zero"))
            }
            _ => Ok(()),
        }
    }

    /// Signed change this entry applies to the balance.
    pub fn delta(&self) -> Decimal {
        match self.fund_type {
            FundType::Credit | FundType::Adjustment => self.amount,
            FundType::Debit => -self.amount,
        }
    }
}

/// Net manual funding in the reference currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualFundTotals {
    pub currency_code: String,
    pub total: Decimal,
    pub entry_count: u64,
}

impl LedgerSystem {
    /// Apply an admin correction and return its audit entry.
    ///
    /// Resubmitting the same transaction id with the same payload returns the
    /// original entry. Reusing it for a different payload is a `Conflict`.
    #[instrument(skip(self, fund), fields(transaction_id = %fund.transaction_id, admin_id = %fund.admin_id))]
    pub async fn record_manual_fund(&self, fund: NewManualFund) -> Result<ManualFundEntry> {
        fund.validate()?;

        let audit = AuditContext {
            admin_id: fund.admin_id,
            reason: fund.reason.clone(),
            note: fund.note.clone(),
            fund_type: Some(fund.fund_type),
        };
        let request =
            LedgerMutationRequest::new(fund.user_id, &fund.currency_code, fund.component, fund.delta())
                .with_idempotency_key(fund.transaction_id.trim())
                .with_audit(audit);

        let outcome = self.mutate(request).await?;
        self.adapter
            .get_manual_fund(outcome.idempotency_key())
            .await
            .map_err(|e| match e {
                LedgerError::NotFound(key) => {
                    LedgerError::Internal(format!("mutation {} committed without audit entry", key))
                }
                other => other,
            })
    }

    #[instrument(skip(self))]
    pub async fn get_manual_fund(&self, transaction_id: &str) -> Result<ManualFundEntry> {
        let transaction_id = transaction_id.trim();
        if transaction_id.is_empty() {
            return Err(LedgerError::invalid("transaction_id is required"));
        }
        self.adapter.get_manual_fund(transaction_id).await
    }

    /// First page at the configured default size.
    pub fn default_page(&self) -> PageRequest {
        PageRequest::new(1, self.config.default_page_size)
    }

    /// Filtered, sorted, paginated view of the audit log.
    #[instrument(skip(self, query))]
    pub async fn query_manual_funds(&self, query: ManualFundQuery) -> Result<Page<ManualFundEntry>> {
        query.filter.validate()?;
        query.page.validate(self.config.max_page_size)?;
        if let Some(code) = &query.filter.currency_code {
            self.currencies.resolve(code)?;
        }

        let started = Instant::now();
        let (items, total) = self.adapter.query_manual_funds(&query).await?;
        histogram!("ledger.manual_funds.query.duration_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);

        Ok(Page::new(items, total, query.page))
    }

    /// One user's manual-fund history, newest first.
    #[instrument(skip(self))]
    pub async fn manual_funds_for_user(
        &self,
        user_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<ManualFundEntry>> {
        if user_id.is_nil() {
            return Err(LedgerError::invalid("user_id is required"));
        }
        let filter = ManualFundFilter::new().customer(crate::UserIdentity::Id(user_id));
        self.query_manual_funds(ManualFundQuery::new(filter, page)).await
    }

    /// Sum of signed amounts over matching entries in the reference currency.
    #[instrument(skip(self, filter))]
    pub async fn manual_fund_totals(&self, filter: ManualFundFilter) -> Result<ManualFundTotals> {
        filter.validate()?;
        let reference = self.config.reference_currency.to_ascii_uppercase();
        if let Some(code) = &filter.currency_code {
            let code = self.currencies.resolve(code)?;
            if code != reference {
                return Err(LedgerError::invalid(format!(
                    "totals are reported in {}, not {}",
                    reference, code
                )));
            }
        }

        let filter = filter.currency(reference.clone());
        let (total, entry_count) = self.adapter.sum_manual_funds(&filter).await?;
        Ok(ManualFundTotals {
            currency_code: reference,
            total,
            entry_count,
        })
    }

    /// Cap the magnitude of any single manual change an admin can make.
    /// `None` removes the cap.
    #[instrument(skip(self))]
    pub async fn set_admin_funding_limit(&self, admin_id: Uuid, limit: Option<Decimal>) -> Result<()> {
        if admin_id.is_nil() {
            return Err(LedgerError::invalid("admin_id is required"));
        }
        if let Some(limit) = limit {
            if limit <= Decimal::ZERO {
                return Err(LedgerError::invalid("funding limit must be positive"));
            }
            validate_delta(limit, Decimal::MAX, self.config.max_scale)?;
        }
        self.adapter.set_admin_funding_limit(admin_id, limit).await?;
        info!(%admin_id, limit = ?limit, "admin funding limit updated");
        Ok(())
    }

    pub async fn admin_funding_limit(&self, admin_id: Uuid) -> Result<Option<Decimal>> {
        self.adapter.get_admin_funding_limit(admin_id).await
    }
}
