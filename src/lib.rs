// src/lib.rs
pub mod adapters;
pub mod amount;
pub mod balance;
pub mod config;
pub mod currency;
pub mod error;
pub mod manual_fund;
pub mod mutation;
pub mod query;
pub mod reconciliation;

pub use balance::{BalanceRecord, Component};
pub use config::{LedgerConfig, PostgresConfig};
pub use currency::CurrencyRegistry;
pub use error::{LedgerError, Result};
pub use manual_fund::{FundType, ManualFundEntry, ManualFundTotals, NewManualFund};
pub use mutation::{
    AuditContext, LedgerMutationRequest, MutationOutcome, MutationPlan, MutationRecord,
};
pub use query::{
    ManualFundFilter, ManualFundQuery, ManualFundSort, Page, PageRequest, SortField, SortOrder,
    UserIdentity, UserProfile,
};
pub use reconciliation::{ReconciliationRecord, ReconciliationState};

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Each field is length-prefixed, so distinct field lists never hash alike.
pub(crate) fn fingerprint_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(fields.len() as u64).to_le_bytes());
    for field in fields {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Storage seam of the ledger.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Execute one mutation plan atomically.
    /// Implementors MUST:
    /// 1. Serialize against other plans carrying the same idempotency key
    /// 2. Return the stored record (`replayed = true`) when the key exists with
    ///    the same fingerprint, `Conflict` when it exists with another one
    /// 3. For a manual change, read the admin's funding limit inside the same
    ///    transaction and reject amounts above it with `InvalidInput`
    /// 4. Create the balance row if missing, then apply the delta in a single
    ///    locked read-modify-write, returning `InsufficientFunds` if it would
    ///    go negative
    /// 5. Insert the manual-fund entry, if any, and the mutation record
    /// 6. Commit all of it, or none of it
    async fn execute_plan(&self, plan: &MutationPlan) -> Result<MutationOutcome>;

    // BALANCE STORE
    async fn get_balance(&self, user_id: Uuid, currency_code: &str) -> Result<BalanceRecord>;
    async fn get_or_create_balance(
        &self,
        user_id: Uuid,
        currency_code: &str,
    ) -> Result<BalanceRecord>;
    async fn apply_delta(
        &self,
        user_id: Uuid,
        currency_code: &str,
        component: Component,
        delta: Decimal,
    ) -> Result<BalanceRecord>;
    async fn get_balances_for_user(&self, user_id: Uuid) -> Result<Vec<BalanceRecord>>;

    // IDEMPOTENCY
    async fn get_mutation(&self, idempotency_key: &str) -> Result<MutationRecord>;

    // MANUAL FUND AUDIT
    async fn get_manual_fund(&self, transaction_id: &str) -> Result<ManualFundEntry>;
    async fn query_manual_funds(
        &self,
        query: &ManualFundQuery,
    ) -> Result<(Vec<ManualFundEntry>, u64)>;
    async fn sum_manual_funds(&self, filter: &ManualFundFilter) -> Result<(Decimal, u64)>;
    async fn get_admin_funding_limit(&self, admin_id: Uuid) -> Result<Option<Decimal>>;
    async fn set_admin_funding_limit(&self, admin_id: Uuid, limit: Option<Decimal>)
    -> Result<()>;
}

/// Entry point callers use. Wraps an adapter with validation, idempotency
/// and audit correlation.
pub struct LedgerSystem {
    adapter: Arc<dyn LedgerAdapter>,
    config: LedgerConfig,
    currencies: CurrencyRegistry,
}

impl LedgerSystem {
    pub fn new(adapter: Box<dyn LedgerAdapter>, config: LedgerConfig) -> Result<Self> {
        config.validate()?;
        let currencies = CurrencyRegistry::new(&config.currencies);
        Ok(Self {
            adapter: adapter.into(),
            config,
            currencies,
        })
    }

    /// Get adapter reference
    pub fn adapter(&self) -> &dyn LedgerAdapter {
        self.adapter.as_ref()
    }

    /// Get adapter Arc (for sharing with other collaborators)
    pub fn adapter_arc(&self) -> Arc<dyn LedgerAdapter> {
        Arc::clone(&self.adapter)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn currencies(&self) -> &CurrencyRegistry {
        &self.currencies
    }

    /// Current balance for a (user, currency). `NotFound` when the pair has
    /// never been mutated.
    #[instrument(skip(self))]
    pub async fn get_balance(&self, user_id: Uuid, currency_code: &str) -> Result<BalanceRecord> {
        let currency = self.currencies.resolve(currency_code)?;
        self.adapter.get_balance(user_id, &currency).await
    }

    /// Every balance the user holds, ordered by currency code.
    #[instrument(skip(self))]
    pub async fn balances(&self, user_id: Uuid) -> Result<Vec<BalanceRecord>> {
        if user_id.is_nil() {
            return Err(LedgerError::invalid("user_id is required"));
        }
        self.adapter.get_balances_for_user(user_id).await
    }
}
