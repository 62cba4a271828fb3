use crate::core::{DbError, Result};
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Options applied to a single transaction
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TransactionOptions {
    /// Upper bound on the commit call (falls back to the client operation timeout)
    #[serde(default, with = "millis")]
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    pub fn max_commit_time(mut self, limit: Duration) -> Self {
        self.max_commit_time = Some(limit);
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Transaction state following the State Pattern
///
/// State transitions:
/// ```text
/// None ──start──> InProgress ──commit──> Committed
///                     │
///                     └──abort──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No transaction has been started on the session
    None,

    /// Started and accepting operations
    InProgress,

    Committed,

    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::None => write!(f, "NONE"),
            TransactionState::InProgress => write!(f, "IN_PROGRESS"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// One transaction on a session, identified by the session's `txnNumber`
#[derive(Debug, Clone)]
pub struct Transaction {
    number: u64,
    state: TransactionState,
    options: TransactionOptions,
    operation_count: usize,
    start_time: Instant,
}

impl Transaction {
    pub fn new(number: u64, options: TransactionOptions) -> Self {
        Self {
            number,
            state: TransactionState::InProgress,
            options,
            operation_count: 0,
            start_time: Instant::now(),
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    /// Operations issued inside this transaction so far
    pub fn operation_count(&self) -> usize {
        self.operation_count
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Count an operation executed inside the transaction
    ///
    /// # Errors
    /// Returns error if the transaction is not in progress
    pub fn record_operation(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::InvalidOperation(format!(
                "Cannot run an operation: transaction {} is {}",
                self.number, self.state
            )));
        }
        self.operation_count += 1;
        Ok(())
    }

    /// # Errors
    /// Returns error if the transaction is not in progress
    pub fn commit(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::InvalidOperation(format!(
                "Cannot commit: transaction {} is already {}",
                self.number, self.state
            )));
        }
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// # Errors
    /// Returns error if the transaction is not in progress
    pub fn abort(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::InvalidOperation(format!(
                "Cannot abort: transaction {} is already {}",
                self.number, self.state
            )));
        }
        self.state = TransactionState::Aborted;
        Ok(())
    }
}
