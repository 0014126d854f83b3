/*!
Ledger driver capability: the only XRPL-facing surface the core uses.

The real driver (address validation, transaction signing/submission, the
XRPL protocol itself) is an external collaborator out of scope for this
crate. This module defines the trait call sites depend on, the request and
response shapes from the capability table, and a deterministic in-memory
fake used by tests.
*/

use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

/// Parameters for creating a conditional escrow.
#[derive(Debug, Clone)]
pub struct CreateEscrowRequest {
    pub account: String,
    pub destination: String,
    pub amount: Decimal,
    pub condition: Option<String>,
    /// uint32 offset from the Ripple epoch (2000-01-01T00:00:00Z).
    pub cancel_after: u32,
    pub finish_after: u32,
}

/// Per-milestone condition attached when creating an escrow with validation.
#[derive(Debug, Clone)]
pub struct MilestoneCondition {
    pub milestone_id: String,
    pub condition: String,
}

#[derive(Debug, Clone)]
pub struct CreateEscrowResult {
    pub tx_id: String,
    pub ledger_index: u64,
    pub offer_sequence: u32,
}

#[derive(Debug, Clone)]
pub struct FinishEscrowRequest {
    pub account: String,
    pub owner: String,
    pub offer_sequence: u32,
    pub condition: String,
    pub fulfillment: String,
}

#[derive(Debug, Clone)]
pub struct CancelEscrowRequest {
    pub account: String,
    pub owner: String,
    pub offer_sequence: u32,
}

#[derive(Debug, Clone)]
pub struct EscrowStatus {
    pub active: bool,
    pub account: String,
    pub destination: String,
    pub condition: Option<String>,
    /// uint32 offset from the Ripple epoch.
    pub cancel_after: u32,
    pub finish_after: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerTransactionState {
    Pending,
    Success,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TransactionStatusReport {
    pub state: LedgerTransactionState,
    pub confirmations: u32,
    pub ledger_index: Option<u64>,
    pub close_time: Option<chrono::DateTime<chrono::Utc>>,
    pub fee: Decimal,
}

/// Seconds between the Unix epoch and the Ripple epoch (2000-01-01T00:00:00Z).
pub const RIPPLE_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Convert a `chrono` timestamp into a Ripple-epoch `uint32` offset.
pub fn to_ripple_time(at: chrono::DateTime<chrono::Utc>) -> u32 {
    (at.timestamp() - RIPPLE_EPOCH_OFFSET_SECS).max(0) as u32
}

/// Capability exposing address validation, escrow CRUD, and transaction
/// submission/status against the external ledger.
#[async_trait]
pub trait LedgerDriver: Send + Sync {
    async fn validate_address(&self, address: &str) -> bool;

    /// Derive a (condition, fulfillment) pair from a secret.
    async fn generate_condition(&self, secret: &str) -> Result<(String, String)>;

    async fn create_escrow(&self, req: CreateEscrowRequest) -> Result<CreateEscrowResult>;

    async fn create_conditional_escrow_with_validation(
        &self,
        req: CreateEscrowRequest,
        milestone_conditions: &[MilestoneCondition],
    ) -> Result<CreateEscrowResult>;

    async fn finish_escrow(&self, req: FinishEscrowRequest) -> Result<CreateEscrowResult>;

    async fn cancel_escrow(&self, req: CancelEscrowRequest) -> Result<CreateEscrowResult>;

    /// Submit a direct value transfer (the queue's `payment`/`walletSetup`
    /// transaction types, which do not involve an escrow).
    async fn submit_payment(&self, from: &str, to: &str, amount: Decimal) -> Result<CreateEscrowResult>;

    async fn get_escrow_status(&self, owner: &str, sequence: u32) -> Result<EscrowStatus>;

    async fn get_transaction_status(&self, tx_id: &str) -> Result<TransactionStatusReport>;

    async fn monitor_transaction(
        &self,
        tx_id: &str,
        retries: u32,
        interval: Duration,
    ) -> Result<TransactionStatusReport>;
}

/// Deterministic in-memory ledger driver for tests and demos.
pub mod mock {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    pub struct MockLedgerDriver {
        next_sequence: AtomicU32,
        next_ledger_index: AtomicU64,
        escrows: DashMap<(String, u32), EscrowStatus>,
        transactions: DashMap<String, TransactionStatusReport>,
        /// Confirmations appended on each `get_transaction_status`/`monitor_transaction` poll.
        pub confirmations_per_poll: u32,
        pub valid_address_prefixes: Vec<String>,
    }

    impl Default for MockLedgerDriver {
        fn default() -> Self {
            Self {
                next_sequence: AtomicU32::new(1),
                next_ledger_index: AtomicU64::new(1000),
                escrows: DashMap::new(),
                transactions: DashMap::new(),
                confirmations_per_poll: 1,
                valid_address_prefixes: vec!["r".to_string()],
            }
        }
    }

    impl MockLedgerDriver {
        pub fn new() -> Self {
            Self::default()
        }

        fn record_tx(&self, tx_id: &str, confirmations: u32, fee: Decimal) {
            self.transactions.insert(
                tx_id.to_string(),
                TransactionStatusReport {
                    state: LedgerTransactionState::Success,
                    confirmations,
                    ledger_index: Some(self.next_ledger_index.load(Ordering::SeqCst)),
                    close_time: Some(chrono::Utc::now()),
                    fee,
                },
            );
        }

        /// Test hook: advance confirmations for a previously submitted transaction.
        pub fn advance_confirmations(&self, tx_id: &str, by: u32) {
            if let Some(mut report) = self.transactions.get_mut(tx_id) {
                report.confirmations += by;
            }
        }
    }

    #[async_trait]
    impl LedgerDriver for MockLedgerDriver {
        async fn validate_address(&self, address: &str) -> bool {
            !address.is_empty() && self.valid_address_prefixes.iter().any(|p| address.starts_with(p.as_str()))
        }

        async fn generate_condition(&self, secret: &str) -> Result<(String, String)> {
            if secret.is_empty() {
                return Err(LedgerError::InvalidInput("empty secret".into()).into());
            }
            let fulfillment = format!("fulfillment:{secret}");
            let condition = format!("condition:{}", blake_like_hash(secret));
            Ok((condition, fulfillment))
        }

        async fn create_escrow(&self, req: CreateEscrowRequest) -> Result<CreateEscrowResult> {
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            let ledger_index = self.next_ledger_index.fetch_add(1, Ordering::SeqCst);
            let tx_id = format!("TX{sequence}");
            self.escrows.insert(
                (req.account.clone(), sequence),
                EscrowStatus {
                    active: true,
                    account: req.account.clone(),
                    destination: req.destination.clone(),
                    condition: req.condition.clone(),
                    cancel_after: req.cancel_after,
                    finish_after: req.finish_after,
                },
            );
            self.record_tx(&tx_id, 0, Decimal::new(12, 2));
            Ok(CreateEscrowResult {
                tx_id,
                ledger_index,
                offer_sequence: sequence,
            })
        }

        async fn create_conditional_escrow_with_validation(
            &self,
            req: CreateEscrowRequest,
            milestone_conditions: &[MilestoneCondition],
        ) -> Result<CreateEscrowResult> {
            if milestone_conditions.is_empty() {
                return Err(LedgerError::InvalidInput("no milestone conditions supplied".into()).into());
            }
            self.create_escrow(req).await
        }

        async fn finish_escrow(&self, req: FinishEscrowRequest) -> Result<CreateEscrowResult> {
            let key = (req.owner.clone(), req.offer_sequence);
            let mut escrow = self
                .escrows
                .get_mut(&key)
                .ok_or_else(|| LedgerError::EscrowNotFound {
                    owner: req.owner.clone(),
                    sequence: req.offer_sequence,
                })?;
            if !escrow.active {
                return Err(LedgerError::LedgerRejected("escrow already finalized".into()).into());
            }
            escrow.active = false;
            drop(escrow);
            let ledger_index = self.next_ledger_index.fetch_add(1, Ordering::SeqCst);
            let tx_id = format!("FIN{}", req.offer_sequence);
            self.record_tx(&tx_id, 0, Decimal::new(12, 2));
            Ok(CreateEscrowResult {
                tx_id,
                ledger_index,
                offer_sequence: req.offer_sequence,
            })
        }

        async fn cancel_escrow(&self, req: CancelEscrowRequest) -> Result<CreateEscrowResult> {
            let key = (req.owner.clone(), req.offer_sequence);
            let mut escrow = self
                .escrows
                .get_mut(&key)
                .ok_or_else(|| LedgerError::EscrowNotFound {
                    owner: req.owner.clone(),
                    sequence: req.offer_sequence,
                })?;
            escrow.active = false;
            drop(escrow);
            let ledger_index = self.next_ledger_index.fetch_add(1, Ordering::SeqCst);
            let tx_id = format!("CNL{}", req.offer_sequence);
            self.record_tx(&tx_id, 0, Decimal::new(12, 2));
            Ok(CreateEscrowResult {
                tx_id,
                ledger_index,
                offer_sequence: req.offer_sequence,
            })
        }

        async fn submit_payment(&self, _from: &str, _to: &str, _amount: Decimal) -> Result<CreateEscrowResult> {
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            let ledger_index = self.next_ledger_index.fetch_add(1, Ordering::SeqCst);
            let tx_id = format!("PAY{sequence}");
            self.record_tx(&tx_id, 0, Decimal::new(12, 2));
            Ok(CreateEscrowResult {
                tx_id,
                ledger_index,
                offer_sequence: sequence,
            })
        }

        async fn get_escrow_status(&self, owner: &str, sequence: u32) -> Result<EscrowStatus> {
            self.escrows
                .get(&(owner.to_string(), sequence))
                .map(|e| e.clone())
                .ok_or_else(|| {
                    LedgerError::EscrowNotFound {
                        owner: owner.to_string(),
                        sequence,
                    }
                    .into()
                })
        }

        async fn get_transaction_status(&self, tx_id: &str) -> Result<TransactionStatusReport> {
            let mut report = self
                .transactions
                .get_mut(tx_id)
                .ok_or_else(|| LedgerError::TransactionNotFound(tx_id.to_string()))?;
            report.confirmations += self.confirmations_per_poll;
            Ok(report.clone())
        }

        async fn monitor_transaction(
            &self,
            tx_id: &str,
            retries: u32,
            _interval: Duration,
        ) -> Result<TransactionStatusReport> {
            let mut last = self.get_transaction_status(tx_id).await?;
            for _ in 0..retries {
                last = self.get_transaction_status(tx_id).await?;
            }
            Ok(last)
        }
    }

    fn blake_like_hash(input: &str) -> String {
        let mut acc: u64 = 0xcbf29ce484222325;
        for byte in input.as_bytes() {
            acc ^= *byte as u64;
            acc = acc.wrapping_mul(0x100000001b3);
        }
        format!("{acc:016x}")
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockLedgerDriver;
    use super::*;

    #[tokio::test]
    async fn validates_r_prefixed_addresses() {
        let driver = MockLedgerDriver::new();
        assert!(driver.validate_address("rPayerAddress").await);
        assert!(!driver.validate_address("0xNotXrpl").await);
    }

    #[tokio::test]
    async fn finish_requires_prior_create() {
        let driver = MockLedgerDriver::new();
        let err = driver
            .finish_escrow(FinishEscrowRequest {
                account: "rA".into(),
                owner: "rA".into(),
                offer_sequence: 999,
                condition: "c".into(),
                fulfillment: "f".into(),
            })
            .await;
        assert!(err.is_err());
    }

    #[test]
    fn ripple_epoch_conversion_is_offset() {
        let at = chrono::DateTime::from_timestamp(RIPPLE_EPOCH_OFFSET_SECS + 100, 0).unwrap();
        assert_eq!(to_ripple_time(at), 100);
    }
}
