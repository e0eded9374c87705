// src/adapters/postgres.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{
    PgPool, Postgres, Row,
    postgres::{PgArguments, PgPoolOptions, PgRow},
    query::{Query as PgQuery, QueryScalar},
    types::Json,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::mutation::{check_funding_limit, replay};
use crate::query::{ManualFundSort, Predicate, SortField, UserIdentity};
use crate::{
    BalanceRecord, Component, LedgerAdapter, LedgerError, ManualFundEntry, ManualFundFilter,
    ManualFundQuery, MutationOutcome, MutationPlan, MutationRecord, PostgresConfig, Result,
};

/// Versioned schema steps. Each runs once, inside its own transaction, and
/// is recorded in `ledger_schema_migrations`.
const MIGRATIONS: &[(i32, &[&str])] = &[(
    1,
    &[
        r#"
        CREATE TABLE IF NOT EXISTS balances (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            currency_code TEXT NOT NULL,
            spendable_subunits BIGINT NOT NULL DEFAULT 0,
            spendable_units NUMERIC(28, 8) NOT NULL DEFAULT 0,
            restricted_subunits BIGINT NOT NULL DEFAULT 0,
            restricted_units NUMERIC(28, 8) NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT balances_user_currency_key UNIQUE (user_id, currency_code),
            CONSTRAINT balances_spendable_non_negative
                CHECK (spendable_units >= 0 AND spendable_subunits >= 0),
            CONSTRAINT balances_restricted_non_negative
                CHECK (restricted_units >= 0 AND restricted_subunits >= 0)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS manual_funds (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            admin_id UUID NOT NULL,
            transaction_id TEXT NOT NULL UNIQUE,
            type TEXT NOT NULL CHECK (type IN ('CREDIT', 'DEBIT', 'ADJUSTMENT')),
            amount NUMERIC(28, 8) NOT NULL,
            currency_code TEXT NOT NULL,
            component TEXT NOT NULL CHECK (component IN ('SPENDABLE', 'RESTRICTED')),
            reason TEXT NOT NULL,
            note TEXT NOT NULL DEFAULT '',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_manual_funds_user_created ON manual_funds(user_id, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_manual_funds_admin_created ON manual_funds(admin_id, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_manual_funds_created ON manual_funds(created_at)",
        r#"
        CREATE TABLE IF NOT EXISTS ledger_mutations (
            idempotency_key TEXT PRIMARY KEY,
            fingerprint TEXT NOT NULL,
            user_id UUID NOT NULL,
            currency_code TEXT NOT NULL,
            component TEXT NOT NULL,
            delta NUMERIC(28, 8) NOT NULL,
            balance JSONB NOT NULL,
            manual_fund_id UUID REFERENCES manual_funds(id),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS admin_funding_limits (
            admin_id UUID PRIMARY KEY,
            max_amount NUMERIC(28, 8) NOT NULL CHECK (max_amount > 0),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ],
)];

const BALANCE_COLUMNS: &str = "id, user_id, currency_code, spendable_subunits, spendable_units, \
     restricted_subunits, restricted_units, updated_at";

const MANUAL_FUND_COLUMNS: &str = "mf.id, mf.user_id, mf.admin_id, mf.transaction_id, mf.type, \
     mf.amount, mf.currency_code, mf.component, mf.reason, mf.note, mf.created_at";

// Subunits are always recomputed from the new unit total in the same
// statement. The WHERE guard rejects overdrafts under the row lock.
const APPLY_SPENDABLE_SQL: &str = r#"
    UPDATE balances
    SET spendable_units = spendable_units + $3,
        spendable_subunits = FLOOR((spendable_units + $3) * 100)::BIGINT,
        updated_at = NOW()
    WHERE user_id = $1 AND currency_code = $2 AND spendable_units + $3 >= 0
    RETURNING id, user_id, currency_code, spendable_subunits, spendable_units,
              restricted_subunits, restricted_units, updated_at
"#;

const APPLY_RESTRICTED_SQL: &str = r#"
    UPDATE balances
    SET restricted_units = restricted_units + $3,
        restricted_subunits = FLOOR((restricted_units + $3) * 100)::BIGINT,
        updated_at = NOW()
    WHERE user_id = $1 AND currency_code = $2 AND restricted_units + $3 >= 0
    RETURNING id, user_id, currency_code, spendable_subunits, spendable_units,
              restricted_subunits, restricted_units, updated_at
"#;

/// Maps driver failures onto the ledger taxonomy.
pub(crate) fn storage_error(err: sqlx::Error) -> LedgerError {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => LedgerError::Transient(err.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization failure, deadlock
            Some("40001") | Some("40P01") => LedgerError::Transient(err.to_string()),
            Some("23505") => LedgerError::Conflict(err.to_string()),
            Some("23514") => LedgerError::InsufficientFunds,
            _ => LedgerError::Internal(err.to_string()),
        },
        _ => LedgerError::Internal(err.to_string()),
    }
}

/// `%term%` with LIKE wildcards in the term escaped.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// PostgreSQL adapter.
///
/// Balances live in `balances`, the audit trail in `manual_funds` and the
/// idempotency log in `ledger_mutations`. Identity filters read the
/// platform-owned `users(id, username, email, phone_number)` table, which
/// this adapter never writes to.
pub struct PostgresAdapter {
    pub(crate) pool: PgPool,
}

impl PostgresAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(storage_error)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bring the schema up to the latest version. Safe to call from several
    /// processes at once: every step, including creating the bookkeeping
    /// table, runs under the same transaction-scoped advisory lock.
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        Self::lock_migrations_internal_tx(&mut tx).await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;
        tx.commit().await.map_err(storage_error)?;

        for (version, statements) in MIGRATIONS {
            let mut tx = self.pool.begin().await.map_err(storage_error)?;
            Self::lock_migrations_internal_tx(&mut tx).await?;

            let applied: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM ledger_schema_migrations WHERE version = $1)",
            )
            .bind(version)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage_error)?;

            if applied {
                debug!(version, "ledger schema migration already applied");
                continue;
            }

            for statement in statements.iter() {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_error)?;
            }

            sqlx::query("INSERT INTO ledger_schema_migrations (version) VALUES ($1)")
                .bind(version)
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;

            tx.commit().await.map_err(storage_error)?;
            info!(version, "applied ledger schema migration");
        }

        Ok(())
    }

    async fn lock_migrations_internal_tx(tx: &mut sqlx::Transaction<'_, Postgres>) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('ledger_schema_migrations'))")
            .execute(&mut **tx)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    fn map_row_to_balance(row: &PgRow) -> Result<BalanceRecord> {
        Ok(BalanceRecord {
            id: row.try_get("id").map_err(storage_error)?,
            user_id: row.try_get("user_id").map_err(storage_error)?,
            currency_code: row.try_get("currency_code").map_err(storage_error)?,
            spendable_subunits: row.try_get("spendable_subunits").map_err(storage_error)?,
            spendable_units: row.try_get("spendable_units").map_err(storage_error)?,
            restricted_subunits: row.try_get("restricted_subunits").map_err(storage_error)?,
            restricted_units: row.try_get("restricted_units").map_err(storage_error)?,
            updated_at: row.try_get("updated_at").map_err(storage_error)?,
        })
    }

    fn map_row_to_manual_fund(row: &PgRow) -> Result<ManualFundEntry> {
        let fund_type: String = row.try_get("type").map_err(storage_error)?;
        let component: String = row.try_get("component").map_err(storage_error)?;
        Ok(ManualFundEntry {
            id: row.try_get("id").map_err(storage_error)?,
            user_id: row.try_get("user_id").map_err(storage_error)?,
            admin_id: row.try_get("admin_id").map_err(storage_error)?,
            transaction_id: row.try_get("transaction_id").map_err(storage_error)?,
            fund_type: fund_type
                .parse()
                .map_err(|e: LedgerError| LedgerError::Internal(e.to_string()))?,
            amount: row.try_get("amount").map_err(storage_error)?,
            currency_code: row.try_get("currency_code").map_err(storage_error)?,
            component: component
                .parse()
                .map_err(|e: LedgerError| LedgerError::Internal(e.to_string()))?,
            reason: row.try_get("reason").map_err(storage_error)?,
            note: row.try_get("note").map_err(storage_error)?,
            created_at: row.try_get("created_at").map_err(storage_error)?,
        })
    }

    fn map_row_to_mutation(row: &PgRow) -> Result<MutationRecord> {
        let component: String = row.try_get("component").map_err(storage_error)?;
        let balance: Json<BalanceRecord> = row.try_get("balance").map_err(storage_error)?;
        Ok(MutationRecord {
            idempotency_key: row.try_get("idempotency_key").map_err(storage_error)?,
            fingerprint: row.try_get("fingerprint").map_err(storage_error)?,
            user_id: row.try_get("user_id").map_err(storage_error)?,
            currency_code: row.try_get("currency_code").map_err(storage_error)?,
            component: component
                .parse()
                .map_err(|e: LedgerError| LedgerError::Internal(e.to_string()))?,
            delta: row.try_get("delta").map_err(storage_error)?,
            balance: balance.0,
            manual_fund_id: row.try_get("manual_fund_id").map_err(storage_error)?,
            created_at: row.try_get("created_at").map_err(storage_error)?,
        })
    }

    /// Lowers predicates into a WHERE clause with numbered placeholders
    /// starting at `$1`. Returns the clause and the next free placeholder.
    fn build_manual_fund_conditions(predicates: &[Predicate]) -> (String, usize) {
        let mut conditions = Vec::with_capacity(predicates.len());
        let mut param_idx = 1;

        for predicate in predicates {
            let condition = match predicate {
                Predicate::Search(_) => format!(
                    "(mf.transaction_id ILIKE ${idx} OR EXISTS (SELECT 1 FROM users u \
                     WHERE u.id = mf.user_id AND (u.username ILIKE ${idx} OR u.email ILIKE ${idx})))",
                    idx = param_idx
                ),
                Predicate::Customer(UserIdentity::Id(_)) => {
                    format!("mf.user_id = ${}", param_idx)
                }
                Predicate::Customer(identity) => format!(
                    "EXISTS (SELECT 1 FROM users u WHERE u.id = mf.user_id AND {})",
                    Self::identity_condition(identity, param_idx)
                ),
                Predicate::Admin(UserIdentity::Id(_)) => {
                    format!("mf.admin_id = ${}", param_idx)
                }
                Predicate::Admin(identity) => format!(
                    "EXISTS (SELECT 1 FROM users u WHERE u.id = mf.admin_id AND {})",
                    Self::identity_condition(identity, param_idx)
                ),
                Predicate::FundType(_) => format!("mf.type = ${}", param_idx),
                Predicate::Currency(_) => format!("mf.currency_code = ${}", param_idx),
                Predicate::CreatedFrom(_) => format!("mf.created_at >= ${}", param_idx),
                Predicate::CreatedBefore(_) => format!("mf.created_at < ${}", param_idx),
            };
            conditions.push(condition);
            param_idx += 1;
        }

        if conditions.is_empty() {
            return (String::new(), param_idx);
        }
        (format!("WHERE {}", conditions.join(" AND ")), param_idx)
    }

    fn identity_condition(identity: &UserIdentity, param_idx: usize) -> String {
        match identity {
            UserIdentity::Id(_) => format!("u.id = ${}", param_idx),
            UserIdentity::Username(_) => format!("u.username = ${}", param_idx),
            UserIdentity::Email(_) => format!("LOWER(u.email) = LOWER(${})", param_idx),
            UserIdentity::Phone(_) => format!("u.phone_number = ${}", param_idx),
        }
    }

    fn build_order_clause(sort: &ManualFundSort) -> String {
        let direction = sort.order.as_sql();
        match sort.field {
            SortField::CreatedAt => format!("ORDER BY mf.created_at {0}, mf.id {0}", direction),
            SortField::Amount => format!("ORDER BY mf.amount {0}, mf.id {0}", direction),
            SortField::AdminEmail => format!(
                "ORDER BY (SELECT LOWER(u.email) FROM users u WHERE u.id = mf.admin_id) {0} NULLS LAST, \
                 mf.id {0}",
                direction
            ),
        }
    }

    fn query_bind_predicates<'a>(
        mut query: PgQuery<'a, Postgres, PgArguments>,
        predicates: &[Predicate],
    ) -> PgQuery<'a, Postgres, PgArguments> {
        for predicate in predicates {
            query = match predicate {
                Predicate::Search(term) => query.bind(like_pattern(term)),
                Predicate::Customer(identity) | Predicate::Admin(identity) => match identity {
                    UserIdentity::Id(id) => query.bind(*id),
                    UserIdentity::Username(v) | UserIdentity::Email(v) | UserIdentity::Phone(v) => {
                        query.bind(v.trim().to_string())
                    }
                },
                Predicate::FundType(fund_type) => query.bind(fund_type.as_str()),
                Predicate::Currency(code) => query.bind(code.clone()),
                Predicate::CreatedFrom(ts) | Predicate::CreatedBefore(ts) => query.bind(*ts),
            };
        }
        query
    }

    fn query_scalar_bind_predicates<'a, O>(
        mut query: QueryScalar<'a, Postgres, O, PgArguments>,
        predicates: &[Predicate],
    ) -> QueryScalar<'a, Postgres, O, PgArguments> {
        for predicate in predicates {
            query = match predicate {
                Predicate::Search(term) => query.bind(like_pattern(term)),
                Predicate::Customer(identity) | Predicate::Admin(identity) => match identity {
                    UserIdentity::Id(id) => query.bind(*id),
                    UserIdentity::Username(v) | UserIdentity::Email(v) | UserIdentity::Phone(v) => {
                        query.bind(v.trim().to_string())
                    }
                },
                Predicate::FundType(fund_type) => query.bind(fund_type.as_str()),
                Predicate::Currency(code) => query.bind(code.clone()),
                Predicate::CreatedFrom(ts) | Predicate::CreatedBefore(ts) => query.bind(*ts),
            };
        }
        query
    }

    async fn lock_key_internal_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        idempotency_key: &str,
    ) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(idempotency_key)
            .execute(&mut **tx)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn fetch_mutation_internal_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        idempotency_key: &str,
    ) -> Result<Option<MutationRecord>> {
        let row = sqlx::query(
            r#"
            SELECT idempotency_key, fingerprint, user_id, currency_code, component, delta,
                   balance, manual_fund_id, created_at
            FROM ledger_mutations
            WHERE idempotency_key = $1
            "#,
        )
        .bind(idempotency_key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(Self::map_row_to_mutation).transpose()
    }

    // FOR SHARE holds off a concurrent limit change until this plan commits.
    async fn funding_limit_internal_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        admin_id: Uuid,
    ) -> Result<Option<Decimal>> {
        sqlx::query_scalar(
            "SELECT max_amount FROM admin_funding_limits WHERE admin_id = $1 FOR SHARE",
        )
        .bind(admin_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage_error)
    }

    async fn ensure_balance_internal_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        user_id: Uuid,
        currency_code: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO balances (id, user_id, currency_code)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, currency_code) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(user_id)
        .bind(currency_code)
        .execute(&mut **tx)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn apply_delta_internal_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        user_id: Uuid,
        currency_code: &str,
        component: Component,
        delta: Decimal,
    ) -> Result<BalanceRecord> {
        let sql = match component {
            Component::Spendable => APPLY_SPENDABLE_SQL,
            Component::Restricted => APPLY_RESTRICTED_SQL,
        };
        let row = sqlx::query(sql)
            .bind(user_id)
            .bind(currency_code)
            .bind(delta)
            .fetch_optional(&mut **tx)
            .await
            .map_err(storage_error)?;

        match row {
            Some(row) => Self::map_row_to_balance(&row),
            None => {
                let exists: bool = sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM balances WHERE user_id = $1 AND currency_code = $2)",
                )
                .bind(user_id)
                .bind(currency_code)
                .fetch_one(&mut **tx)
                .await
                .map_err(storage_error)?;

                if exists {
                    Err(LedgerError::InsufficientFunds)
                } else {
                    Err(LedgerError::NotFound(format!("{}/{}", user_id, currency_code)))
                }
            }
        }
    }

    async fn insert_manual_fund_internal_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        entry: &ManualFundEntry,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manual_funds
                (id, user_id, admin_id, transaction_id, type, amount, currency_code,
                 component, reason, note, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.admin_id)
        .bind(&entry.transaction_id)
        .bind(entry.fund_type.as_str())
        .bind(entry.amount)
        .bind(&entry.currency_code)
        .bind(entry.component.as_str())
        .bind(&entry.reason)
        .bind(&entry.note)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn insert_mutation_internal_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        plan: &MutationPlan,
        balance: BalanceRecord,
    ) -> Result<MutationRecord> {
        let mut record = plan.record(balance);
        let created_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO ledger_mutations
                (idempotency_key, fingerprint, user_id, currency_code, component, delta,
                 balance, manual_fund_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING created_at
            "#,
        )
        .bind(&record.idempotency_key)
        .bind(&record.fingerprint)
        .bind(record.user_id)
        .bind(&record.currency_code)
        .bind(record.component.as_str())
        .bind(record.delta)
        .bind(Json(&record.balance))
        .bind(record.manual_fund_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(storage_error)?;

        record.created_at = created_at;
        Ok(record)
    }

    async fn fetch_balance(&self, user_id: Uuid, currency_code: &str) -> Result<Option<BalanceRecord>> {
        let sql = format!(
            "SELECT {} FROM balances WHERE user_id = $1 AND currency_code = $2",
            BALANCE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(currency_code)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.as_ref().map(Self::map_row_to_balance).transpose()
    }
}

#[async_trait::async_trait]
impl LedgerAdapter for PostgresAdapter {
    async fn execute_plan(&self, plan: &MutationPlan) -> Result<MutationOutcome> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        // Same-key requests queue here until the first one commits.
        Self::lock_key_internal_tx(&mut tx, &plan.idempotency_key).await?;

        if let Some(existing) = Self::fetch_mutation_internal_tx(&mut tx, &plan.idempotency_key).await? {
            tx.rollback().await.map_err(storage_error)?;
            return replay(existing, &plan.fingerprint);
        }

        if let Some(entry) = &plan.manual_fund {
            let limit = Self::funding_limit_internal_tx(&mut tx, entry.admin_id).await?;
            check_funding_limit(entry, limit)?;
        }

        Self::ensure_balance_internal_tx(&mut tx, plan.user_id, &plan.currency_code).await?;
        let balance = Self::apply_delta_internal_tx(
            &mut tx,
            plan.user_id,
            &plan.currency_code,
            plan.component,
            plan.delta,
        )
        .await?;
        balance.check_invariants()?;

        if let Some(entry) = &plan.manual_fund {
            Self::insert_manual_fund_internal_tx(&mut tx, entry).await?;
        }
        let record = Self::insert_mutation_internal_tx(&mut tx, plan, balance).await?;

        tx.commit().await.map_err(storage_error)?;

        Ok(MutationOutcome {
            record,
            replayed: false,
        })
    }

    async fn get_balance(&self, user_id: Uuid, currency_code: &str) -> Result<BalanceRecord> {
        self.fetch_balance(user_id, currency_code)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("{}/{}", user_id, currency_code)))
    }

    async fn get_or_create_balance(
        &self,
        user_id: Uuid,
        currency_code: &str,
    ) -> Result<BalanceRecord> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        Self::ensure_balance_internal_tx(&mut tx, user_id, currency_code).await?;
        tx.commit().await.map_err(storage_error)?;

        // Losers of a creation race read the winner's row.
        self.get_balance(user_id, currency_code).await
    }

    async fn apply_delta(
        &self,
        user_id: Uuid,
        currency_code: &str,
        component: Component,
        delta: Decimal,
    ) -> Result<BalanceRecord> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        let balance =
            Self::apply_delta_internal_tx(&mut tx, user_id, currency_code, component, delta).await?;
        balance.check_invariants()?;
        tx.commit().await.map_err(storage_error)?;
        Ok(balance)
    }

    async fn get_balances_for_user(&self, user_id: Uuid) -> Result<Vec<BalanceRecord>> {
        let sql = format!(
            "SELECT {} FROM balances WHERE user_id = $1 ORDER BY currency_code",
            BALANCE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
        rows.iter().map(Self::map_row_to_balance).collect()
    }

    async fn get_mutation(&self, idempotency_key: &str) -> Result<MutationRecord> {
        let row = sqlx::query(
            r#"
            SELECT idempotency_key, fingerprint, user_id, currency_code, component, delta,
                   balance, manual_fund_id, created_at
            FROM ledger_mutations
            WHERE idempotency_key = $1
            "#,
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| LedgerError::NotFound(idempotency_key.to_string()))?;

        Self::map_row_to_mutation(&row)
    }

    async fn get_manual_fund(&self, transaction_id: &str) -> Result<ManualFundEntry> {
        let sql = format!(
            "SELECT {} FROM manual_funds mf WHERE mf.transaction_id = $1",
            MANUAL_FUND_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| LedgerError::NotFound(transaction_id.to_string()))?;

        Self::map_row_to_manual_fund(&row)
    }

    async fn query_manual_funds(
        &self,
        query: &ManualFundQuery,
    ) -> Result<(Vec<ManualFundEntry>, u64)> {
        let predicates = query.filter.predicates();
        let (where_clause, next_idx) = Self::build_manual_fund_conditions(&predicates);
        let order_clause = Self::build_order_clause(&query.sort);

        let select_sql = format!(
            r#"
            SELECT {}
            FROM manual_funds mf
            {}
            {}
            LIMIT ${} OFFSET ${}
            "#,
            MANUAL_FUND_COLUMNS,
            where_clause,
            order_clause,
            next_idx,
            next_idx + 1
        );
        let count_sql = format!("SELECT COUNT(*) FROM manual_funds mf {}", where_clause);

        // Page and count come from the same snapshot.
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

        let select = Self::query_bind_predicates(sqlx::query(&select_sql), &predicates)
            .bind(query.page.limit() as i64)
            .bind(query.page.offset() as i64);
        let rows = select.fetch_all(&mut *tx).await.map_err(storage_error)?;

        let count: i64 =
            Self::query_scalar_bind_predicates(sqlx::query_scalar(&count_sql), &predicates)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)?;

        let entries = rows
            .iter()
            .map(Self::map_row_to_manual_fund)
            .collect::<Result<Vec<_>>>()?;
        Ok((entries, count.max(0) as u64))
    }

    async fn sum_manual_funds(&self, filter: &ManualFundFilter) -> Result<(Decimal, u64)> {
        let predicates = filter.predicates();
        let (where_clause, _) = Self::build_manual_fund_conditions(&predicates);
        let sql = format!(
            r#"
            SELECT COALESCE(SUM(mf.amount), 0) AS total, COUNT(*) AS entry_count
            FROM manual_funds mf
            {}
            "#,
            where_clause
        );

        let row = Self::query_bind_predicates(sqlx::query(&sql), &predicates)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;

        let total: Decimal = row.try_get("total").map_err(storage_error)?;
        let count: i64 = row.try_get("entry_count").map_err(storage_error)?;
        Ok((total, count.max(0) as u64))
    }

    async fn get_admin_funding_limit(&self, admin_id: Uuid) -> Result<Option<Decimal>> {
        sqlx::query_scalar("SELECT max_amount FROM admin_funding_limits WHERE admin_id = $1")
            .bind(admin_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)
    }

    async fn set_admin_funding_limit(
        &self,
        admin_id: Uuid,
        limit: Option<Decimal>,
    ) -> Result<()> {
        match limit {
            Some(limit) => {
                sqlx::query(
                    r#"
                    INSERT INTO admin_funding_limits (admin_id, max_amount, updated_at)
                    VALUES ($1, $2, NOW())
                    ON CONFLICT (admin_id) DO UPDATE SET max_amount = $2, updated_at = NOW()
                    "#,
                )
                .bind(admin_id)
                .bind(limit)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
            }
            None => {
                sqlx::query("DELETE FROM admin_funding_limits WHERE admin_id = $1")
                    .bind(admin_id)
                    .execute(&self.pool)
                    .await
                    .map_err(storage_error)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manual_fund::FundType;
    use crate::query::SortOrder;
    use chrono::NaiveDate;

    #[test]
    fn empty_filter_has_no_where_clause() {
        let (clause, next) = PostgresAdapter::build_manual_fund_conditions(&[]);
        assert!(clause.is_empty());
        assert_eq!(next, 1);
    }

    #[test]
    fn predicates_become_numbered_placeholders() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let filter = ManualFundFilter::new()
            .customer(UserIdentity::Email("a@b.c".into()))
            .admin(UserIdentity::Id(Uuid::now_v7()))
            .fund_type(FundType::Debit)
            .currency("usd")
            .created_between(day, day);
        let (clause, next) = PostgresAdapter::build_manual_fund_conditions(&filter.predicates());

        assert_eq!(
            clause,
            "WHERE EXISTS (SELECT 1 FROM users u WHERE u.id = mf.user_id AND LOWER(u.email) = LOWER($1)) \
             AND mf.admin_id = $2 AND mf.type = $3 AND mf.currency_code = $4 \
             AND mf.created_at >= $5 AND mf.created_at < $6"
        );
        assert_eq!(next, 7);
    }

    #[test]
    fn user_values_never_reach_the_sql_text() {
        let filter =
            ManualFundFilter::new().customer(UserIdentity::Username("x'; DROP TABLE balances; --".into()));
        let (clause, _) = PostgresAdapter::build_manual_fund_conditions(&filter.predicates());
        assert!(!clause.contains("DROP"));
    }

    #[test]
    fn order_clause_breaks_ties_by_id() {
        let sort = ManualFundSort::new(SortField::Amount, SortOrder::Asc);
        assert_eq!(
            PostgresAdapter::build_order_clause(&sort),
            "ORDER BY mf.amount ASC, mf.id ASC"
        );
        assert_eq!(
            PostgresAdapter::build_order_clause(&ManualFundSort::default()),
            "ORDER BY mf.created_at DESC, mf.id DESC"
        );
        let by_admin = ManualFundSort::new(SortField::AdminEmail, SortOrder::Desc);
        assert_eq!(
            PostgresAdapter::build_order_clause(&by_admin),
            "ORDER BY (SELECT LOWER(u.email) FROM users u WHERE u.id = mf.admin_id) DESC NULLS LAST, \
             mf.id DESC"
        );
    }

    #[test]
    fn search_binds_one_escaped_pattern() {
        let filter = ManualFundFilter::new().search("50%_off").fund_type(FundType::Credit);
        let (clause, next) = PostgresAdapter::build_manual_fund_conditions(&filter.predicates());
        assert_eq!(
            clause,
            "WHERE (mf.transaction_id ILIKE $1 OR EXISTS (SELECT 1 FROM users u \
             WHERE u.id = mf.user_id AND (u.username ILIKE $1 OR u.email ILIKE $1))) \
             AND mf.type = $2"
        );
        assert_eq!(next, 3);
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(like_pattern("a\\b"), "%a\\\\b%");
    }
}
