// src/reconciliation.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LedgerError, Result};

/// Lifecycle of an outbound settlement notification for one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationState {
    /// Waiting to be sent
    Pending,
    /// Handed to the partner, no answer yet
    Sent,
    /// Partner confirmed
    Acknowledged,
    /// Last attempt failed, may be retried
    Failed,
    /// Out of retries, needs a human
    Disputed,
}

impl ReconciliationState {
    pub fn can_transition_to(&self, target: ReconciliationState) -> bool {
        use ReconciliationState::*;
        match (self, target) {
            (Acknowledged, _) | (Disputed, _) => false,
            (s1, s2) if *s1 == s2 => true,
            (Pending, Sent) | (Pending, Failed) => true,
            (Sent, Acknowledged) | (Sent, Failed) => true,
            (Failed, Pending) | (Failed, Disputed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReconciliationState::Acknowledged | ReconciliationState::Disputed
        )
    }
}

/// Retry bookkeeping the gateway keeps per mutation key. The ledger itself
/// only guarantees the key is stable and that
/// [`crate::LedgerSystem::get_mutation_by_key`] answers for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub idempotency_key: String,
    pub state: ReconciliationState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciliationRecord {
    pub fn new(idempotency_key: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            state: ReconciliationState::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    fn transition(&mut self, target: ReconciliationState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(LedgerError::invalid(format!(
                "reconciliation {} cannot move from {:?} to {:?}",
                self.idempotency_key, self.state, target
            )));
        }
        self.state = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_sent(&mut self) -> Result<()> {
        self.transition(ReconciliationState::Sent)
    }

    pub fn acknowledge(&mut self) -> Result<()> {
        if self.state != ReconciliationState::Sent {
            return Err(LedgerError::invalid(format!(
                "reconciliation {} was never sent",
                self.idempotency_key
            )));
        }
        self.transition(ReconciliationState::Acknowledged)
    }

    /// Records a failed attempt. Moves to `Disputed` once `max_attempts`
    /// failures have accumulated.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        if !matches!(
            self.state,
            ReconciliationState::Pending | ReconciliationState::Sent
        ) {
            return Err(LedgerError::invalid(format!(
                "reconciliation {} is not in flight",
                self.idempotency_key
            )));
        }
        self.transition(ReconciliationState::Failed)?;
        self.attempts += 1;
        self.last_error = Some(error.into());
        if self.attempts >= self.max_attempts {
            self.transition(ReconciliationState::Disputed)?;
        }
        Ok(())
    }

    pub fn retry(&mut self) -> Result<()> {
        if self.state != ReconciliationState::Failed {
            return Err(LedgerError::invalid(format!(
                "reconciliation {} has nothing to retry",
                self.idempotency_key
            )));
        }
        self.transition(ReconciliationState::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReconciliationState::*;

    #[test]
    fn state_transitions() {
        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Acknowledged));
        assert!(Sent.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Disputed));

        assert!(!Pending.can_transition_to(Acknowledged));
        assert!(!Acknowledged.can_transition_to(Pending));
        assert!(!Disputed.can_transition_to(Pending));
        assert!(!Disputed.can_transition_to(Disputed));
        assert!(Sent.can_transition_to(Sent));
    }

    #[test]
    fn happy_path() {
        let mut record = ReconciliationRecord::new("tx-1", 3);
        record.mark_sent().unwrap();
        record.acknowledge().unwrap();
        assert_eq!(record.state, Acknowledged);
        assert!(record.state.is_terminal());
        assert!(record.mark_sent().is_err());
    }

    #[test]
    fn retries_until_disputed() {
        let mut record = ReconciliationRecord::new("tx-2", 2);
        record.mark_sent().unwrap();
        record.fail("timeout").unwrap();
        assert_eq!(record.state, Failed);
        assert_eq!(record.attempts, 1);

        record.retry().unwrap();
        record.mark_sent().unwrap();
        record.fail("timeout again").unwrap();
        assert_eq!(record.state, Disputed);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.last_error.as_deref(), Some("timeout again"));
        assert!(record.retry().is_err());
    }

    #[test]
    fn cannot_acknowledge_unsent() {
        let mut record = ReconciliationRecord::new("tx-3", 1);
        assert!(record.acknowledge().is_err());
        assert!(record.retry().is_err());
    }
}
