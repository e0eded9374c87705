// src/mutation.rs
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::amount::validate_delta;
use crate::manual_fund::{FundType, ManualFundEntry};
use crate::{BalanceRecord, Component, LedgerError, LedgerSystem, Result, fingerprint_fields};

const MAX_KEY_LEN: usize = 255;

/// Who made a manual change and why. Its presence on a request marks the
/// mutation as non-gameplay and produces a manual-fund entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub admin_id: Uuid,
    pub reason: String,
    pub note: String,
    /// Defaults to CREDIT for positive and DEBIT for negative deltas.
    pub fund_type: Option<FundType>,
}

impl AuditContext {
    pub fn new(admin_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            admin_id,
            reason: reason.into(),
            note: String::new(),
            fund_type: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn adjustment(mut self) -> Self {
        self.fund_type = Some(FundType::Adjustment);
        self
    }

    fn resolve_fund_type(&self, delta: Decimal) -> Result<FundType> {
        if self.admin_id.is_nil() {
            return Err(LedgerError::invalid("admin_id is required for manual changes"));
        }
        if self.reason.trim().is_empty() {
            return Err(LedgerError::invalid("reason can not be empty"));
        }
        let fund_type = self.fund_type.unwrap_or_else(|| FundType::for_delta(delta));
        match fund_type {
            FundType::Credit if delta < Decimal::ZERO => Err(LedgerError::invalid(
                "a CREDIT entry requires a positive delta",
            )),
            FundType::Debit if delta > Decimal::ZERO => Err(LedgerError::invalid(
                "a DEBIT entry requires a negative delta",
            )),
            other => Ok(other),
        }
    }
}

/// A signed change to one component of one balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMutationRequest {
    pub user_id: Uuid,
    pub currency_code: String,
    pub component: Component,
    pub delta: Decimal,
    pub idempotency_key: Option<String>,
    pub audit: Option<AuditContext>,
}

impl LedgerMutationRequest {
    pub fn new(
        user_id: Uuid,
        currency_code: impl Into<String>,
        component: Component,
        delta: Decimal,
    ) -> Self {
        Self {
            user_id,
            currency_code: currency_code.into(),
            component,
            delta,
            idempotency_key: None,
            audit: None,
        }
    }

    pub fn spendable(user_id: Uuid, currency_code: impl Into<String>, delta: Decimal) -> Self {
        Self::new(user_id, currency_code, Component::Spendable, delta)
    }

    pub fn restricted(user_id: Uuid, currency_code: impl Into<String>, delta: Decimal) -> Self {
        Self::new(user_id, currency_code, Component::Restricted, delta)
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_audit(mut self, audit: AuditContext) -> Self {
        self.audit = Some(audit);
        self
    }
}

/// Validated, storage-ready form of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationPlan {
    pub idempotency_key: String,
    pub fingerprint: String,
    pub user_id: Uuid,
    pub currency_code: String,
    pub component: Component,
    pub delta: Decimal,
    pub manual_fund: Option<ManualFundEntry>,
}

impl MutationPlan {
    /// Record persisted alongside the updated balance.
    pub fn record(&self, balance: BalanceRecord) -> MutationRecord {
        MutationRecord {
            idempotency_key: self.idempotency_key.clone(),
            fingerprint: self.fingerprint.clone(),
            user_id: self.user_id,
            currency_code: self.currency_code.clone(),
            component: self.component,
            delta: self.delta,
            balance,
            manual_fund_id: self.manual_fund.as_ref().map(|e| e.id),
            created_at: Utc::now(),
        }
    }
}

/// What a committed mutation produced, keyed by its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub idempotency_key: String,
    pub fingerprint: String,
    pub user_id: Uuid,
    pub currency_code: String,
    pub component: Component,
    pub delta: Decimal,
    /// Balance as it stood right after this mutation committed.
    pub balance: BalanceRecord,
    pub manual_fund_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub record: MutationRecord,
    /// True when the key had already been applied and nothing changed.
    pub replayed: bool,
}

impl MutationOutcome {
    pub fn balance(&self) -> &BalanceRecord {
        &self.record.balance
    }

    pub fn idempotency_key(&self) -> &str {
        &self.record.idempotency_key
    }
}

fn payload_fingerprint(
    user_id: Uuid,
    currency_code: &str,
    component: Component,
    delta: Decimal,
    audit: Option<(&AuditContext, FundType)>,
) -> String {
    let user_id = user_id.to_string();
    let delta = delta.normalize().to_string();
    let mut fields = vec![user_id.as_str(), currency_code, component.as_str(), delta.as_str()];

    let admin_id;
    if let Some((ctx, fund_type)) = audit {
        admin_id = ctx.admin_id.to_string();
        fields.extend([
            admin_id.as_str(),
            fund_type.as_str(),
            ctx.reason.trim(),
            ctx.note.trim(),
        ]);
    }
    fingerprint_fields(&fields)
}

/// Rejects a manual change larger than the admin's funding limit. Adapters
/// call this with the limit read inside the plan's transaction.
pub(crate) fn check_funding_limit(entry: &ManualFundEntry, limit: Option<Decimal>) -> Result<()> {
    match limit {
        Some(limit) if entry.amount.abs() > limit => Err(LedgerError::invalid(format!(
            "amount {} exceeds the admin's funding limit of {}",
            entry.amount.abs(),
            limit
        ))),
        _ => Ok(()),
    }
}

fn resolve_key(key: Option<&str>) -> Result<String> {
    match key {
        Some(key) => {
            let key = key.trim();
            if key.is_empty() {
                return Err(LedgerError::invalid("idempotency key must not be blank"));
            }
            if key.len() > MAX_KEY_LEN {
                return Err(LedgerError::invalid(format!(
                    "idempotency key longer than {} bytes",
                    MAX_KEY_LEN
                )));
            }
            Ok(key.to_string())
        }
        None => Ok(Uuid::now_v7().to_string()),
    }
}

impl LedgerSystem {
    /// Apply a signed delta to one balance component.
    ///
    /// With an idempotency key the change is applied at most once: a repeat
    /// with the same payload returns the first result, a repeat with another
    /// payload is a `Conflict`. Without one, a fresh key is generated so the
    /// mutation can still be looked up later.
    #[instrument(
        skip(self, request),
        fields(user_id = %request.user_id, currency = %request.currency_code, component = %request.component)
    )]
    pub async fn mutate(&self, request: LedgerMutationRequest) -> Result<MutationOutcome> {
        let result = self.mutate_inner(request).await;

        let status = match &result {
            Ok(outcome) if outcome.replayed => "replayed",
            Ok(_) => "applied",
            Err(_) => "rejected",
        };
        counter!("ledger.mutations.total", "status" => status).increment(1);

        match &result {
            Ok(outcome) => info!(
                key = %outcome.record.idempotency_key,
                replayed = outcome.replayed,
                "ledger mutation committed"
            ),
            Err(LedgerError::Internal(msg)) => error!(error = %msg, "ledger invariant violated"),
            Err(err) => debug!(error = %err, "ledger mutation rejected"),
        }
        result
    }

    async fn mutate_inner(&self, request: LedgerMutationRequest) -> Result<MutationOutcome> {
        if request.user_id.is_nil() {
            return Err(LedgerError::invalid("user_id is required"));
        }
        let currency = self.currencies.resolve(&request.currency_code)?;
        validate_delta(request.delta, self.config.max_delta, self.config.max_scale)?;

        let audit = match &request.audit {
            Some(ctx) => Some((ctx, ctx.resolve_fund_type(request.delta)?)),
            None => None,
        };
        let fingerprint = payload_fingerprint(
            request.user_id,
            &currency,
            request.component,
            request.delta,
            audit,
        );
        let key = resolve_key(request.idempotency_key.as_deref())?;

        // Fast path for retries; execute_plan re-checks under the key lock
        // and enforces the funding limit after that.
        if request.idempotency_key.is_some() {
            match self.adapter.get_mutation(&key).await {
                Ok(existing) => return replay(existing, &fingerprint),
                Err(LedgerError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let manual_fund = match audit {
            Some((ctx, fund_type)) => Some(ManualFundEntry {
                id: Uuid::now_v7(),
                user_id: request.user_id,
                admin_id: ctx.admin_id,
                transaction_id: key.clone(),
                fund_type,
                amount: request.delta,
                currency_code: currency.clone(),
                component: request.component,
                reason: ctx.reason.trim().to_string(),
                note: ctx.note.trim().to_string(),
                created_at: Utc::now(),
            }),
            None => None,
        };

        let plan = MutationPlan {
            idempotency_key: key,
            fingerprint,
            user_id: request.user_id,
            currency_code: currency,
            component: request.component,
            delta: request.delta,
            manual_fund,
        };

        histogram!(
            "ledger.mutation.delta",
            "currency" => plan.currency_code.clone(),
            "component" => plan.component.as_str()
        )
        .record(plan.delta.abs().to_f64().unwrap_or(0.0));

        let outcome = self.adapter.execute_plan(&plan).await?;
        if let (Some(entry), false) = (&plan.manual_fund, outcome.replayed) {
            counter!("ledger.manual_funds.total", "type" => entry.fund_type.as_str()).increment(1);
        }
        Ok(outcome)
    }

    /// Look up the result of an earlier mutation. Used by the reconciliation
    /// gateway to reconfirm state after a crash, and by callers that timed
    /// out before retrying.
    #[instrument(skip(self))]
    pub async fn get_mutation_by_key(&self, idempotency_key: &str) -> Result<MutationRecord> {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return Err(LedgerError::invalid("idempotency key must not be blank"));
        }
        self.adapter.get_mutation(key).await
    }
}

/// Shared by adapters: turn an existing record into a replay, or a conflict
/// when the payload differs.
pub(crate) fn replay(existing: MutationRecord, fingerprint: &str) -> Result<MutationOutcome> {
    if existing.fingerprint != fingerprint {
        return Err(LedgerError::Conflict(format!(
            "idempotency key {} was already used with a different payload",
            existing.idempotency_key
        )));
    }
    Ok(MutationOutcome {
        record: existing,
        replayed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn fingerprint_ignores_trailing_zeros() {
        let user = Uuid::now_v7();
        let a = payload_fingerprint(user, "USD", Component::Spendable, dec("50"), None);
        let b = payload_fingerprint(user, "USD", Component::Spendable, dec("50.00"), None);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_covers_audit_context() {
        let user = Uuid::now_v7();
        let ctx = AuditContext::new(Uuid::now_v7(), "bonus grant");
        let plain = payload_fingerprint(user, "USD", Component::Restricted, dec("10"), None);
        let audited = payload_fingerprint(
            user,
            "USD",
            Component::Restricted,
            dec("10"),
            Some((&ctx, FundType::Credit)),
        );
        assert_ne!(plain, audited);
    }

    #[test]
    fn fingerprint_separates_reason_and_note() {
        let user = Uuid::now_v7();
        let admin = Uuid::now_v7();
        let first = AuditContext::new(admin, "a|").with_note("b");
        let second = AuditContext::new(admin, "a").with_note("|b");
        let a = payload_fingerprint(
            user,
            "USD",
            Component::Restricted,
            dec("10"),
            Some((&first, FundType::Credit)),
        );
        let b = payload_fingerprint(
            user,
            "USD",
            Component::Restricted,
            dec("10"),
            Some((&second, FundType::Credit)),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn fund_type_follows_delta_sign() {
        let ctx = AuditContext::new(Uuid::now_v7(), "correction");
        assert_eq!(ctx.resolve_fund_type(dec("1")).unwrap(), FundType::Credit);
        assert_eq!(ctx.resolve_fund_type(dec("-1")).unwrap(), FundType::Debit);

        let adjustment = ctx.clone().adjustment();
        assert_eq!(
            adjustment.resolve_fund_type(dec("-1")).unwrap(),
            FundType::Adjustment
        );

        let mismatched = AuditContext {
            fund_type: Some(FundType::Credit),
            ..ctx
        };
        assert!(mismatched.resolve_fund_type(dec("-1")).is_err());
    }

    #[test]
    fn audit_requires_admin_and_reason() {
        let ctx = AuditContext::new(Uuid::nil(), "reason");
        assert!(ctx.resolve_fund_type(dec("1")).is_err());
        let ctx = AuditContext::new(Uuid::now_v7(), "   ");
        assert!(ctx.resolve_fund_type(dec("1")).is_err());
    }

    #[test]
    fn keys_are_trimmed_or_generated() {
        assert_eq!(resolve_key(Some(" tx-1 ")).unwrap(), "tx-1");
        assert!(resolve_key(Some("   ")).is_err());
        assert!(resolve_key(Some(&"k".repeat(256))).is_err());
        let generated = resolve_key(None).unwrap();
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn replay_with_other_payload_conflicts() {
        let balance = BalanceRecord::new(Uuid::now_v7(), "USD");
        let plan = MutationPlan {
            idempotency_key: "tx-9".into(),
            fingerprint: "abc".into(),
            user_id: balance.user_id,
            currency_code: "USD".into(),
            component: Component::Spendable,
            delta: dec("1"),
            manual_fund: None,
        };
        let record = plan.record(balance);
        assert!(replay(record.clone(), "abc").unwrap().replayed);
        assert!(matches!(
            replay(record, "def"),
            Err(LedgerError::Conflict(_))
        ));
    }
}
