/*!
Error types for the SmartCheque payment infrastructure.

Comprehensive error handling across the queue/batcher, authorization,
execution, confirmation, escrow, and reconciliation subsystems.
*/

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SmartChequeError>;

/// Top-level error type for SmartCheque operations.
#[derive(Error, Debug)]
pub enum SmartChequeError {
    /// Missing or ill-formed input (addresses, amounts, ids).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An entity (SmartCheque, milestone, authorization, execution, batch) was not found.
    #[error("not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    /// A status transition was attempted that the state machine does not allow.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A bounded queue or worker pool is at capacity.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// The ledger driver reported a failure.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// A confirmation or execution window was exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The fraud subsystem flagged the transaction; terminal.
    #[error("fraud detected: {0}")]
    FraudDetected(String),

    /// Queue-specific error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Authorization-specific error.
    #[error("authorization error: {0}")]
    Authorization(#[from] AuthorizationError),

    /// Execution-specific error.
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Confirmation-specific error.
    #[error("confirmation error: {0}")]
    Confirmation(#[from] ConfirmationError),

    /// Escrow-specific error.
    #[error("escrow error: {0}")]
    Escrow(#[from] EscrowError),

    /// Reconciliation-specific error.
    #[error("reconciliation error: {0}")]
    Reconciliation(#[from] ReconciliationError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors surfaced by the external ledger driver capability.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("address validation failed: {0}")]
    InvalidAddress(String),

    #[error("condition generation failed: {0}")]
    InvalidInput(String),

    #[error("ledger rejected operation: {0}")]
    LedgerRejected(String),

    #[error("escrow not found: owner={owner} sequence={sequence}")]
    EscrowNotFound { owner: String, sequence: u32 },

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("ledger call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors specific to the transaction queue and batcher.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is at capacity: {0}")]
    Full(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(String),

    #[error("batch {0} not found")]
    BatchNotFound(String),

    #[error("transaction {id} retry budget exhausted ({retry_count}/{max})")]
    RetryBudgetExhausted {
        id: String,
        retry_count: u32,
        max: u32,
    },
}

/// Errors specific to the authorization engine.
#[derive(Error, Debug)]
pub enum AuthorizationError {
    #[error("authorization request {0} not found")]
    NotFound(String),

    #[error("authorization {id} is time-locked until {expires_at}")]
    TimeLocked {
        id: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("authorization {id} already has {current}/{required} approvals")]
    AlreadyFullyApproved {
        id: String,
        current: u32,
        required: u32,
    },

    #[error("authorization {0} is not in a state that accepts approvals")]
    NotPending(String),
}

/// Errors specific to the execution engine.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("execution {0} not found")]
    NotFound(String),

    #[error("authorization {0} is not approved")]
    AuthorizationNotApproved(String),

    #[error("execution {id} cannot be retried: status={status}, attempts={attempts}/{max}")]
    RetryNotAllowed {
        id: String,
        status: String,
        attempts: u32,
        max: u32,
    },

    #[error("execution {id} cannot be cancelled from status {status}")]
    CancelNotAllowed { id: String, status: String },

    #[error("step {0} failed: {1}")]
    StepFailed(&'static str, String),
}

/// Errors specific to the confirmation tracker.
#[derive(Error, Debug)]
pub enum ConfirmationError {
    #[error("tracking entry for transaction {0} not found")]
    NotFound(String),

    #[error("confirmation timed out for transaction {0}")]
    TimedOut(String),
}

/// Errors specific to the escrow / SmartCheque controller.
#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("smart cheque {0} not found")]
    SmartChequeNotFound(String),

    #[error("milestone {0} not found")]
    MilestoneNotFound(String),

    #[error("smart cheque {0} has no escrow address")]
    NoEscrow(String),

    #[error("smart cheque {id} cannot be cancelled from status {status}")]
    CancelNotAllowed { id: String, status: String },

    #[error("smart cheque {0} has no completed milestones to refund against")]
    NoCompletedMilestones(String),

    #[error("smart cheque {0} has no unverified milestones remaining for partial refund")]
    NoRemainingMilestones(String),

    #[error("invalid refund percentage: {0}")]
    InvalidPercentage(rust_decimal::Decimal),
}

/// Errors specific to the reconciliation engine.
#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("discrepancy {0} not found")]
    DiscrepancyNotFound(String),

    #[error("discrepancy {0} is already resolved")]
    AlreadyResolved(String),
}

impl SmartChequeError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller should retry this operation with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            SmartChequeError::Ledger(_) => true,
            SmartChequeError::Overloaded(_) => true,
            SmartChequeError::Timeout(_) => true,
            SmartChequeError::Queue(QueueError::Full(_)) => true,
            _ => false,
        }
    }

    /// Error category used for metrics labeling.
    pub fn category(&self) -> &'static str {
        match self {
            SmartChequeError::InvalidArgument(_) => "invalid_argument",
            SmartChequeError::NotFound { .. } => "not_found",
            SmartChequeError::PreconditionFailed(_) => "precondition_failed",
            SmartChequeError::Overloaded(_) => "overloaded",
            SmartChequeError::Ledger(_) => "ledger",
            SmartChequeError::Timeout(_) => "timeout",
            SmartChequeError::FraudDetected(_) => "fraud",
            SmartChequeError::Queue(_) => "queue",
            SmartChequeError::Authorization(_) => "authorization",
            SmartChequeError::Execution(_) => "execution",
            SmartChequeError::Confirmation(_) => "confirmation",
            SmartChequeError::Escrow(_) => "escrow",
            SmartChequeError::Reconciliation(_) => "reconciliation",
            SmartChequeError::Serialization(_) => "serialization",
            SmartChequeError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SmartChequeError::from(LedgerError::Timeout(std::time::Duration::from_secs(1))).is_retryable());
        assert!(SmartChequeError::Overloaded("queue full".into()).is_retryable());
        assert!(!SmartChequeError::invalid_argument("bad").is_retryable());
    }

    #[test]
    fn categories() {
        assert_eq!(SmartChequeError::invalid_argument("x").category(), "invalid_argument");
        assert_eq!(
            SmartChequeError::not_found("smart_cheque", "abc").category(),
            "not_found"
        );
    }
}
