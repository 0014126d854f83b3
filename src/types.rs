/*!
Core types for the SmartCheque payment infrastructure.

Entity definitions, closed enums for tagged variants, and the invariants
that the rest of the crate enforces when mutating them.
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;

/// Generate a new opaque entity id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Supported settlement currencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    Xrp,
    Usdt,
    Usdc,
    ERupee,
}

impl Currency {
    /// Number of decimal places the ledger driver expects for this asset.
    pub fn decimals(&self) -> u32 {
        match self {
            Currency::Xrp => 6,
            Currency::Usdt | Currency::Usdc => 6,
            Currency::ERupee => 2,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Currency::Xrp => "XRP",
            Currency::Usdt => "USDT",
            Currency::Usdc => "USDC",
            Currency::ERupee => "e₹",
        };
        write!(f, "{s}")
    }
}

/// How a milestone's completion is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationMethod {
    Manual,
    Oracle,
    Hybrid,
}

/// Milestone lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MilestoneStatus {
    Pending,
    Verified,
    Failed,
}

/// A single deliverable within a SmartCheque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub description: String,
    pub amount: Option<Decimal>,
    pub verification_method: VerificationMethod,
    pub status: MilestoneStatus,
    pub estimated_duration: chrono::Duration,
    pub estimated_end_date: Option<DateTime<Utc>>,
    pub oracle_config: Option<String>,
    pub percentage_complete: Decimal,
    pub completed_at: Option<DateTime<Utc>>,

    /// Condition-fulfillment material persisted at escrow-creation time so that
    /// finishing the escrow later fulfills the exact condition that was created.
    pub secret: Option<String>,
    pub condition: Option<String>,
    pub fulfillment: Option<String>,
    pub offer_sequence: Option<u32>,
}

impl Milestone {
    pub fn new(description: impl Into<String>, amount: Option<Decimal>) -> Self {
        Self {
            id: new_id(),
            description: description.into(),
            amount,
            verification_method: VerificationMethod::Manual,
            status: MilestoneStatus::Pending,
            estimated_duration: chrono::Duration::days(7),
            estimated_end_date: None,
            oracle_config: None,
            percentage_complete: Decimal::ZERO,
            completed_at: None,
            secret: None,
            condition: None,
            fulfillment: None,
            offer_sequence: None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.status == MilestoneStatus::Verified
    }
}

/// SmartCheque lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmartChequeStatus {
    Created,
    Locked,
    InProgress,
    Completed,
    Disputed,
}

impl SmartChequeStatus {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: SmartChequeStatus) -> bool {
        use SmartChequeStatus::*;
        matches!(
            (self, next),
            (Created, Locked)
                | (Locked, InProgress)
                | (Locked, Completed)
                | (Locked, Disputed)
                | (InProgress, Completed)
                | (InProgress, Disputed)
                | (Disputed, Completed)
                | (Disputed, Disputed)
        )
    }
}

/// A contract-linked payment commitment whose release is conditioned on
/// milestone completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartCheque {
    pub id: String,
    pub payer_id: String,
    pub payee_id: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub milestones: Vec<Milestone>,
    pub escrow_address: Option<String>,
    pub owner_address: Option<String>,
    pub status: SmartChequeStatus,
    pub contract_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SmartCheque {
    pub fn new(
        payer_id: impl Into<String>,
        payee_id: impl Into<String>,
        amount: Decimal,
        currency: Currency,
        milestones: Vec<Milestone>,
        contract_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            payer_id: payer_id.into(),
            payee_id: payee_id.into(),
            amount,
            currency,
            milestones,
            escrow_address: None,
            owner_address: None,
            status: SmartChequeStatus::Created,
            contract_hash: contract_hash.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `sum(milestones.amount) == amount` when every milestone is priced.
    pub fn milestones_balanced(&self) -> bool {
        if self.milestones.iter().any(|m| m.amount.is_none()) {
            return true;
        }
        let total: Decimal = self.milestones.iter().filter_map(|m| m.amount).sum();
        total == self.amount
    }

    pub fn milestone_mut(&mut self, milestone_id: &str) -> Option<&mut Milestone> {
        self.milestones.iter_mut().find(|m| m.id == milestone_id)
    }

    pub fn all_milestones_verified(&self) -> bool {
        !self.milestones.is_empty() && self.milestones.iter().all(Milestone::is_verified)
    }

    pub fn transition_to(&mut self, next: SmartChequeStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::SmartChequeError::PreconditionFailed(format!(
                "smart cheque {:?} cannot transition {:?} -> {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Transaction type, gating which fields are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    EscrowCreate,
    EscrowFinish,
    EscrowCancel,
    Payment,
    WalletSetup,
}

impl TransactionType {
    pub fn requires_offer_sequence(self) -> bool {
        matches!(self, TransactionType::EscrowFinish | TransactionType::EscrowCancel)
    }

    /// Relative fee weight applied on top of the base fee.
    pub fn fee_weight(self) -> Decimal {
        match self {
            TransactionType::EscrowFinish => Decimal::new(12, 1), // 1.2
            TransactionType::EscrowCancel => Decimal::new(11, 1), // 1.1
            TransactionType::EscrowCreate => Decimal::new(15, 1), // 1.5
            TransactionType::Payment => Decimal::ONE,
            TransactionType::WalletSetup => Decimal::new(8, 1), // 0.8
        }
    }

    pub fn can_batch(self) -> bool {
        !matches!(self, TransactionType::WalletSetup)
    }
}

/// Transaction priority; only same-priority transactions batch together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransactionPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Transaction lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Queued,
    Batching,
    Batched,
    Processing,
    Confirming,
    Confirmed,
    Failed,
    Expired,
    Cancelled,
    Fraud,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Confirmed
                | TransactionStatus::Expired
                | TransactionStatus::Cancelled
                | TransactionStatus::Fraud
        )
    }

    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        if self == next {
            return false;
        }
        match self {
            Queued => matches!(next, Batching | Processing | Expired | Cancelled | Fraud),
            Batching => matches!(next, Batched | Expired | Cancelled),
            Batched => matches!(next, Processing | Expired | Cancelled),
            Processing => matches!(next, Confirming | Confirmed | Failed | Fraud | Expired),
            Confirming => matches!(next, Confirmed | Failed | Expired),
            Failed => matches!(next, Queued | Expired),
            Confirmed | Expired | Cancelled | Fraud => false,
        }
    }
}

/// A transaction submitted for ledger processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub tx_type: TransactionType,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub enterprise_id: String,
    pub user_id: String,
    pub status: TransactionStatus,
    pub priority: TransactionPriority,
    pub batch_id: Option<String>,
    pub smart_cheque_id: Option<String>,
    pub milestone_id: Option<String>,
    pub tx_hash: Option<String>,
    pub ledger_index: Option<u64>,
    pub offer_sequence: Option<u32>,
    pub condition: Option<String>,
    pub fulfillment: Option<String>,
    pub fee: Option<Decimal>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Transaction {
    pub fn new(
        tx_type: TransactionType,
        from: impl Into<String>,
        to: impl Into<String>,
        amount: Decimal,
        currency: Currency,
        enterprise_id: impl Into<String>,
        user_id: impl Into<String>,
        priority: TransactionPriority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            tx_type,
            from: from.into(),
            to: to.into(),
            amount,
            currency,
            enterprise_id: enterprise_id.into(),
            user_id: user_id.into(),
            status: TransactionStatus::Queued,
            priority,
            batch_id: None,
            smart_cheque_id: None,
            milestone_id: None,
            tx_hash: None,
            ledger_index: None,
            offer_sequence: None,
            condition: None,
            fulfillment: None,
            fee: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            processed_at: None,
            confirmed_at: None,
            expires_at: None,
            last_error: None,
        }
    }

    pub fn can_batch(&self) -> bool {
        self.tx_type.can_batch()
    }

    pub fn transition_to(&mut self, next: TransactionStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::SmartChequeError::PreconditionFailed(format!(
                "transaction {} cannot transition {:?} -> {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Batching,
    Ready,
    Processing,
    Confirmed,
    Failed,
}

/// A group of same-priority transactions dispatched together to amortize fees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionBatch {
    pub id: String,
    pub priority: TransactionPriority,
    pub status: BatchStatus,
    pub transaction_ids: Vec<String>,
    pub max_transactions: usize,
    pub min_batch_size: usize,
    pub total_fee: Decimal,
    pub optimized_fee: Decimal,
    pub fee_savings: Decimal,
    pub success_count: u32,
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransactionBatch {
    pub fn new(priority: TransactionPriority, min_batch_size: usize, max_transactions: usize) -> Self {
        Self {
            id: new_id(),
            priority,
            status: BatchStatus::Batching,
            transaction_ids: Vec::new(),
            max_transactions,
            min_batch_size,
            total_fee: Decimal::ZERO,
            optimized_fee: Decimal::ZERO,
            fee_savings: Decimal::ZERO,
            success_count: 0,
            failure_count: 0,
            created_at: Utc::now(),
            dispatched_at: None,
            completed_at: None,
        }
    }

    pub fn count(&self) -> usize {
        self.transaction_ids.len()
    }

    pub fn is_ready(&self, max_wait: chrono::Duration) -> bool {
        let age = Utc::now() - self.created_at;
        self.status == BatchStatus::Batching
            && self.count() >= self.min_batch_size
            && (self.count() >= self.max_transactions || age >= max_wait)
    }
}

/// Approval record attached to an authorization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub approver_id: String,
    pub approved_at: DateTime<Utc>,
}

/// Authorization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Pending,
    Approved,
    Rejected,
    TimeLocked,
    Processing,
    Completed,
    Cancelled,
    Expired,
}

/// A decision record granting or denying a payment with quorum, risk, and
/// time-lock metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAuthorization {
    pub id: String,
    pub smart_cheque_id: String,
    pub milestone_id: String,
    pub enterprise_id: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: AuthorizationStatus,
    pub required_approvals: u32,
    pub current_approvals: u32,
    pub approvals: Vec<Approval>,
    pub risk_score: Decimal,
    pub time_locked: bool,
    pub time_lock_expires_at: Option<DateTime<Utc>>,
    pub auto_approved: bool,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAuthorization {
    pub fn is_fully_approved(&self) -> bool {
        self.current_approvals >= self.required_approvals
    }
}

/// A single step within a payment execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepType {
    Validation,
    FulfillmentGeneration,
    LedgerSubmit,
    Confirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step_type: StepType,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub attempt: u32,
}

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Confirming,
    Completed,
    Failed,
    Cancelled,
    Retry,
}

/// The ordered sequence of steps turning an approved authorization into a
/// submitted ledger transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentExecution {
    pub id: String,
    pub authorization_id: String,
    pub status: ExecutionStatus,
    pub steps: Vec<ExecutionStep>,
    pub attempts: u32,
    pub transaction_id: Option<String>,
    pub fulfillment: Option<String>,
    pub last_error: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentExecution {
    pub fn progress(&self) -> (usize, usize) {
        let total = 4usize;
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        (completed, total)
    }
}

/// A single poll record in a confirmation tracking entry's bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationCheck {
    pub checked_at: DateTime<Utc>,
    pub confirmations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationStatus {
    Pending,
    Confirming,
    Confirmed,
    Failed,
    Expired,
}

/// Tracks on-ledger confirmation progress for a submitted transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationTracking {
    pub transaction_id: String,
    pub authorization_id: Option<String>,
    pub required_confirmations: u32,
    pub current_confirmations: u32,
    pub status: ConfirmationStatus,
    pub started_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub check_history: std::collections::VecDeque<ConfirmationCheck>,
}

/// Maximum number of checks retained in a tracking entry's ring buffer.
pub const CONFIRMATION_HISTORY_CAPACITY: usize = 20;

/// Discrepancy severity, a pure function of magnitude and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiscrepancySeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscrepancyStatus {
    Pending,
    Investigating,
    Resolved,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionType {
    AdjustInternal,
    AdjustLedger,
    Ignore,
    Investigate,
}

/// A measured divergence between internal and ledger balances exceeding tolerance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: String,
    pub enterprise_id: String,
    pub currency: Currency,
    pub internal_balance: Decimal,
    pub ledger_balance: Decimal,
    pub amount: Decimal,
    pub percent: Decimal,
    pub severity: DiscrepancySeverity,
    pub status: DiscrepancyStatus,
    pub possible_causes: Vec<String>,
    pub resolution: Option<ResolutionType>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// On-ledger escrow health, derived from driver flags, milestone progress,
/// and the cancel-after window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowHealth {
    Active,
    PartiallyComplete,
    ReadyForRelease,
    Inactive,
    Expired,
    NoEscrow,
    SyncError,
}

/// Free-form typed event published to the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn milestones_balanced_when_priced() {
        let m1 = Milestone::new("m1", Some(Decimal::new(40, 0)));
        let m2 = Milestone::new("m2", Some(Decimal::new(60, 0)));
        let sc = SmartCheque::new("payer", "payee", Decimal::new(100, 0), Currency::Xrp, vec![m1, m2], "hash");
        assert!(sc.milestones_balanced());
    }

    #[test]
    fn milestones_unbalanced_when_priced_mismatch() {
        let m1 = Milestone::new("m1", Some(Decimal::new(40, 0)));
        let sc = SmartCheque::new("payer", "payee", Decimal::new(100, 0), Currency::Xrp, vec![m1], "hash");
        assert!(!sc.milestones_balanced());
    }

    #[test]
    fn smart_cheque_status_transitions() {
        assert!(SmartChequeStatus::Created.can_transition_to(SmartChequeStatus::Locked));
        assert!(!SmartChequeStatus::Completed.can_transition_to(SmartChequeStatus::Disputed));
    }

    #[test]
    fn transaction_status_transitions() {
        assert!(TransactionStatus::Queued.can_transition_to(TransactionStatus::Batching));
        assert!(!TransactionStatus::Confirmed.can_transition_to(TransactionStatus::Queued));
        assert!(TransactionStatus::Failed.can_transition_to(TransactionStatus::Queued));
    }

    #[test]
    fn batch_respects_same_priority_invariant() {
        let batch = TransactionBatch::new(TransactionPriority::High, 3, 5);
        assert_eq!(batch.priority, TransactionPriority::High);
        assert!(batch.count() <= batch.max_transactions);
    }
}
