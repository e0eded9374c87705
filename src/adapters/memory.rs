// src/adapters/memory.rs
use crate::mutation::{check_funding_limit, replay};
use crate::query::{Predicate, SortField, SortOrder, UserIdentity, UserProfile};
use crate::{
    BalanceRecord, Component, LedgerAdapter, LedgerError, ManualFundEntry, ManualFundFilter,
    ManualFundQuery, MutationOutcome, MutationPlan, MutationRecord, Result,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    balances: HashMap<(Uuid, String), BalanceRecord>,
    manual_funds: HashMap<String, ManualFundEntry>,
    mutations: HashMap<String, MutationRecord>,
    funding_limits: HashMap<Uuid, Decimal>,
    users: HashMap<Uuid, UserProfile>,
}

impl MemoryState {
    fn matches(&self, entry: &ManualFundEntry, predicate: &Predicate) -> bool {
        match predicate {
            Predicate::Search(term) => self.search_matches(entry, term),
            Predicate::Customer(identity) => self.identity_matches(entry.user_id, identity),
            Predicate::Admin(identity) => self.identity_matches(entry.admin_id, identity),
            Predicate::FundType(fund_type) => entry.fund_type == *fund_type,
            Predicate::Currency(code) => entry.currency_code == *code,
            Predicate::CreatedFrom(from) => entry.created_at >= *from,
            Predicate::CreatedBefore(before) => entry.created_at < *before,
        }
    }

    fn identity_matches(&self, user_id: Uuid, identity: &UserIdentity) -> bool {
        match identity {
            UserIdentity::Id(id) => user_id == *id,
            other => self
                .users
                .get(&user_id)
                .is_some_and(|profile| profile.matches(other)),
        }
    }

    fn search_matches(&self, entry: &ManualFundEntry, term: &str) -> bool {
        let term = term.to_lowercase();
        let contains = |value: &str| value.to_lowercase().contains(&term);
        contains(&entry.transaction_id)
            || self
                .users
                .get(&entry.user_id)
                .is_some_and(|profile| contains(&profile.username) || contains(&profile.email))
    }

    fn admin_email(&self, entry: &ManualFundEntry) -> Option<String> {
        self.users
            .get(&entry.admin_id)
            .map(|profile| profile.email.to_lowercase())
    }

    fn filtered(&self, filter: &ManualFundFilter) -> Vec<&ManualFundEntry> {
        let predicates = filter.predicates();
        self.manual_funds
            .values()
            .filter(|entry| predicates.iter().all(|p| self.matches(entry, p)))
            .collect()
    }
}

/// In-process adapter. One mutex guards every table, so a plan executes
/// as a single critical section.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Internal("memory store lock poisoned".to_string()))
    }

    /// Stand-in for the platform's user directory, used by identity filters.
    pub fn register_user(&self, profile: UserProfile) -> Result<()> {
        self.state()?.users.insert(profile.id, profile);
        Ok(())
    }
}

#[async_trait]
impl LedgerAdapter for MemoryAdapter {
    async fn execute_plan(&self, plan: &MutationPlan) -> Result<MutationOutcome> {
        let mut state = self.state()?;

        if let Some(existing) = state.mutations.get(&plan.idempotency_key) {
            return replay(existing.clone(), &plan.fingerprint);
        }

        // Every check happens before the first write so a failure leaves
        // nothing behind.
        if let Some(entry) = &plan.manual_fund {
            check_funding_limit(entry, state.funding_limits.get(&entry.admin_id).copied())?;
        }
        let key = (plan.user_id, plan.currency_code.clone());
        let current = state
            .balances
            .get(&key)
            .cloned()
            .unwrap_or_else(|| BalanceRecord::new(plan.user_id, &plan.currency_code));
        let next = current.apply_delta(plan.component, plan.delta)?;
        next.check_invariants()?;

        if let Some(entry) = &plan.manual_fund {
            if state.manual_funds.contains_key(&entry.transaction_id) {
                return Err(LedgerError::Conflict(format!(
                    "manual fund {} already recorded",
                    entry.transaction_id
                )));
            }
        }

        let record = plan.record(next.clone());
        state.balances.insert(key, next);
        if let Some(entry) = &plan.manual_fund {
            state
                .manual_funds
                .insert(entry.transaction_id.clone(), entry.clone());
        }
        state
            .mutations
            .insert(plan.idempotency_key.clone(), record.clone());

        Ok(MutationOutcome {
            record,
            replayed: false,
        })
    }

    async fn get_balance(&self, user_id: Uuid, currency_code: &str) -> Result<BalanceRecord> {
        let state = self.state()?;
        state
            .balances
            .get(&(user_id, currency_code.to_string()))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("{}/{}", user_id, currency_code)))
    }

    async fn get_or_create_balance(
        &self,
        user_id: Uuid,
        currency_code: &str,
    ) -> Result<BalanceRecord> {
        let mut state = self.state()?;
        let balance = state
            .balances
            .entry((user_id, currency_code.to_string()))
            .or_insert_with(|| BalanceRecord::new(user_id, currency_code));
        Ok(balance.clone())
    }

    async fn apply_delta(
        &self,
        user_id: Uuid,
        currency_code: &str,
        component: Component,
        delta: Decimal,
    ) -> Result<BalanceRecord> {
        let mut state = self.state()?;
        let balance = state
            .balances
            .get_mut(&(user_id, currency_code.to_string()))
            .ok_or_else(|| LedgerError::NotFound(format!("{}/{}", user_id, currency_code)))?;
        let next = balance.apply_delta(component, delta)?;
        *balance = next.clone();
        Ok(next)
    }

    async fn get_balances_for_user(&self, user_id: Uuid) -> Result<Vec<BalanceRecord>> {
        let state = self.state()?;
        let mut balances: Vec<BalanceRecord> = state
            .balances
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        balances.sort_by(|a, b| a.currency_code.cmp(&b.currency_code));
        Ok(balances)
    }

    async fn get_mutation(&self, idempotency_key: &str) -> Result<MutationRecord> {
        let state = self.state()?;
        state
            .mutations
            .get(idempotency_key)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(idempotency_key.to_string()))
    }

    async fn get_manual_fund(&self, transaction_id: &str) -> Result<ManualFundEntry> {
        let state = self.state()?;
        state
            .manual_funds
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(transaction_id.to_string()))
    }

    async fn query_manual_funds(
        &self,
        query: &ManualFundQuery,
    ) -> Result<(Vec<ManualFundEntry>, u64)> {
        let state = self.state()?;
        let mut entries = state.filtered(&query.filter);
        let total = entries.len() as u64;

        let directed = |ordering: Ordering| match query.sort.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        entries.sort_by(|a, b| {
            let primary = match query.sort.field {
                SortField::CreatedAt => directed(a.created_at.cmp(&b.created_at)),
                SortField::Amount => directed(a.amount.cmp(&b.amount)),
                SortField::AdminEmail => match (state.admin_email(a), state.admin_email(b)) {
                    (Some(x), Some(y)) => directed(x.cmp(&y)),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                },
            };
            primary.then_with(|| directed(a.id.cmp(&b.id)))
        });

        let page = entries
            .into_iter()
            .skip(query.page.offset() as usize)
            .take(query.page.limit() as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn sum_manual_funds(&self, filter: &ManualFundFilter) -> Result<(Decimal, u64)> {
        let state = self.state()?;
        let entries = state.filtered(filter);
        let mut total = Decimal::ZERO;
        for entry in &entries {
            total = total
                .checked_add(entry.amount)
                .ok_or_else(|| LedgerError::Internal("manual fund total overflowed".into()))?;
        }
        Ok((total, entries.len() as u64))
    }

    async fn get_admin_funding_limit(&self, admin_id: Uuid) -> Result<Option<Decimal>> {
        Ok(self.state()?.funding_limits.get(&admin_id).copied())
    }

    async fn set_admin_funding_limit(
        &self,
        admin_id: Uuid,
        limit: Option<Decimal>,
    ) -> Result<()> {
        let mut state = self.state()?;
        match limit {
            Some(limit) => state.funding_limits.insert(admin_id, limit),
            None => state.funding_limits.remove(&admin_id),
        };
        Ok(())
    }
}
