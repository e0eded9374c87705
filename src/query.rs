// src/query.rs
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::manual_fund::FundType;
use crate::{LedgerError, Result};

/// How a customer or admin is looked up when filtering the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum UserIdentity {
    Id(Uuid),
    Username(String),
    Email(String),
    Phone(String),
}

impl UserIdentity {
    fn validate(&self, role: &str) -> Result<()> {
        let empty = match self {
            UserIdentity::Id(id) => id.is_nil(),
            UserIdentity::Username(v) | UserIdentity::Email(v) | UserIdentity::Phone(v) => {
                v.trim().is_empty()
            }
        };
        if empty {
            return Err(LedgerError::invalid(format!("{} filter must not be empty", role)));
        }
        Ok(())
    }
}

/// Identity columns of the platform's `users` table the ledger reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub phone_number: String,
}

impl UserProfile {
    /// Emails compare case-insensitively, everything else exactly.
    pub fn matches(&self, identity: &UserIdentity) -> bool {
        match identity {
            UserIdentity::Id(id) => self.id == *id,
            UserIdentity::Username(username) => self.username == *username,
            UserIdentity::Email(email) => self.email.eq_ignore_ascii_case(email),
            UserIdentity::Phone(phone) => self.phone_number == *phone,
        }
    }
}

const MAX_SEARCH_LEN: usize = 255;

/// Typed filter over manual-fund entries. Every field is optional and all
/// present fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualFundFilter {
    pub customer: Option<UserIdentity>,
    pub admin: Option<UserIdentity>,
    pub fund_type: Option<FundType>,
    pub currency_code: Option<String>,
    /// First day included (UTC).
    pub start_date: Option<NaiveDate>,
    /// Last day included (UTC).
    pub end_date: Option<NaiveDate>,
    /// Case-insensitive substring of the customer's username or email, or of
    /// the transaction id.
    pub search: Option<String>,
}

impl ManualFundFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn customer(mut self, identity: UserIdentity) -> Self {
        self.customer = Some(identity);
        self
    }

    pub fn admin(mut self, identity: UserIdentity) -> Self {
        self.admin = Some(identity);
        self
    }

    pub fn fund_type(mut self, fund_type: FundType) -> Self {
        self.fund_type = Some(fund_type);
        self
    }

    pub fn currency(mut self, code: impl Into<String>) -> Self {
        self.currency_code = Some(code.into());
        self
    }

    pub fn created_between(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    pub fn created_from(mut self, start: NaiveDate) -> Self {
        self.start_date = Some(start);
        self
    }

    pub fn created_until(mut self, end: NaiveDate) -> Self {
        self.end_date = Some(end);
        self
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(term) = &self.search {
            if term.trim().is_empty() {
                return Err(LedgerError::invalid("search term must not be empty"));
            }
            if term.len() > MAX_SEARCH_LEN {
                return Err(LedgerError::invalid(format!(
                    "search term longer than {} bytes",
                    MAX_SEARCH_LEN
                )));
            }
        }
        if let Some(customer) = &self.customer {
            customer.validate("customer")?;
        }
        if let Some(admin) = &self.admin {
            admin.validate("admin")?;
        }
        if let Some(code) = &self.currency_code {
            if code.trim().is_empty() {
                return Err(LedgerError::invalid("currency filter must not be empty"));
            }
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(LedgerError::invalid(format!(
                    "start date {} is after end date {}",
                    start, end
                )));
            }
        }
        Ok(())
    }

    /// Lowers the filter into a flat list of conjunctive predicates that
    /// adapters translate into bound parameters.
    pub fn predicates(&self) -> Vec<Predicate> {
        let mut predicates = Vec::new();
        if let Some(term) = &self.search {
            predicates.push(Predicate::Search(term.trim().to_string()));
        }
        if let Some(customer) = &self.customer {
            predicates.push(Predicate::Customer(customer.clone()));
        }
        if let Some(admin) = &self.admin {
            predicates.push(Predicate::Admin(admin.clone()));
        }
        if let Some(fund_type) = self.fund_type {
            predicates.push(Predicate::FundType(fund_type));
        }
        if let Some(code) = &self.currency_code {
            predicates.push(Predicate::Currency(code.trim().to_ascii_uppercase()));
        }
        if let Some(start) = self.start_date {
            predicates.push(Predicate::CreatedFrom(start_of_day(start)));
        }
        // end day is inclusive: everything before the next midnight
        if let Some(next) = self.end_date.and_then(|end| end.succ_opt()) {
            predicates.push(Predicate::CreatedBefore(start_of_day(next)));
        }
        predicates
    }
}

fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Search(String),
    Customer(UserIdentity),
    Admin(UserIdentity),
    FundType(FundType),
    Currency(String),
    CreatedFrom(DateTime<Utc>),
    CreatedBefore(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    Amount,
    /// Admin's email from the user directory. Entries whose admin has no
    /// profile sort last in either direction.
    AdminEmail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(LedgerError::invalid(format!(
                "invalid sort order {:?}, expected asc or desc",
                other
            ))),
        }
    }
}

/// Defaults to newest first. Ties are broken by entry id in the same direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManualFundSort {
    pub field: SortField,
    pub order: SortOrder,
}

impl ManualFundSort {
    pub fn new(field: SortField, order: SortOrder) -> Self {
        Self { field, order }
    }
}

/// 1-based page number and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page, per_page }
    }

    pub fn validate(&self, max_per_page: u32) -> Result<()> {
        if self.page == 0 {
            return Err(LedgerError::invalid("page numbers start at 1"));
        }
        if self.per_page == 0 || self.per_page > max_per_page {
            return Err(LedgerError::invalid(format!(
                "per_page must be between 1 and {}",
                max_per_page
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.per_page)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.per_page)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total_count: u64, request: PageRequest) -> Self {
        Self {
            items,
            total_count,
            page: request.page,
            per_page: request.per_page,
            total_pages: total_count.div_ceil(u64::from(request.per_page.max(1))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualFundQuery {
    pub filter: ManualFundFilter,
    pub sort: ManualFundSort,
    pub page: PageRequest,
}

impl ManualFundQuery {
    pub fn new(filter: ManualFundFilter, page: PageRequest) -> Self {
        Self {
            filter,
            sort: ManualFundSort::default(),
            page,
        }
    }

    pub fn sorted_by(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort = ManualFundSort::new(field, order);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_pages_round_up() {
        let request = PageRequest::new(1, 10);
        assert_eq!(Page::<()>::new(vec![], 0, request).total_pages, 0);
        assert_eq!(Page::<()>::new(vec![], 10, request).total_pages, 1);
        assert_eq!(Page::<()>::new(vec![], 11, request).total_pages, 2);
        assert_eq!(Page::<()>::new(vec![], 25, PageRequest::new(3, 7)).total_pages, 4);
    }

    #[test]
    fn page_request_bounds() {
        assert!(PageRequest::new(0, 10).validate(100).is_err());
        assert!(PageRequest::new(1, 0).validate(100).is_err());
        assert!(PageRequest::new(1, 101).validate(100).is_err());
        assert!(PageRequest::new(3, 100).validate(100).is_ok());
        assert_eq!(PageRequest::new(3, 20).offset(), 40);
    }

    #[test]
    fn search_term_is_trimmed_and_checked() {
        let filter = ManualFundFilter::new().search("  alice ");
        assert!(filter.validate().is_ok());
        assert_eq!(filter.predicates(), vec![Predicate::Search("alice".into())]);

        assert!(ManualFundFilter::new().search("   ").validate().is_err());
        assert!(ManualFundFilter::new().search("x".repeat(256)).validate().is_err());
    }

    #[test]
    fn date_range_is_inclusive_by_day() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let predicates = ManualFundFilter::new().created_between(start, end).predicates();

        assert_eq!(
            predicates,
            vec![
                Predicate::CreatedFrom(start_of_day(start)),
                Predicate::CreatedBefore(start_of_day(NaiveDate::from_ymd_opt(2024, 4, 1).unwrap())),
            ]
        );
    }

    #[test]
    fn inverted_range_is_rejected() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert!(ManualFundFilter::new().created_between(start, end).validate().is_err());
    }

    #[test]
    fn blank_identities_are_rejected() {
        let filter = ManualFundFilter::new().customer(UserIdentity::Email("  ".into()));
        assert!(filter.validate().is_err());
        let filter = ManualFundFilter::new().admin(UserIdentity::Id(Uuid::nil()));
        assert!(filter.validate().is_err());
    }

    #[test]
    fn currency_predicate_is_normalized() {
        let predicates = ManualFundFilter::new()
            .currency(" usd ")
            .fund_type(FundType::Credit)
            .predicates();
        assert_eq!(
            predicates,
            vec![
                Predicate::FundType(FundType::Credit),
                Predicate::Currency("USD".into())
            ]
        );
    }

    #[test]
    fn sort_order_parsing() {
        assert_eq!("ASC".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert_eq!(" desc".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("sideways".parse::<SortOrder>().is_err());
        assert_eq!(ManualFundSort::default().order, SortOrder::Desc);
    }
}
