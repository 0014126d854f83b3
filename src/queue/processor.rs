/*!
Per-transaction processing: fraud check, fee assignment, and dispatch to the
type-specific ledger handler.
*/

use crate::error::{Result, SmartChequeError};
use crate::ledger::{CancelEscrowRequest, CreateEscrowRequest, FinishEscrowRequest, LedgerDriver};
use crate::queue::fee::FeeCalculator;
use crate::types::{Transaction, TransactionType};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Pluggable fraud-screening capability invoked before a transaction is
/// dispatched to the ledger. Absent in configurations that don't enable it.
#[async_trait]
pub trait FraudCheck: Send + Sync {
    async fn check(&self, tx: &Transaction) -> bool;
}

/// Dispatch a single transaction to its type-specific ledger handler,
/// stamping `tx_hash`/`ledger_index` on success.
#[instrument(skip(ledger, fee_calculator, fraud_check, tx), fields(transaction_id = %tx.id))]
pub async fn process_transaction(
    tx: &mut Transaction,
    ledger: &Arc<dyn LedgerDriver>,
    fee_calculator: &FeeCalculator,
    fraud_check: Option<&Arc<dyn FraudCheck>>,
) -> Result<()> {
    if let Some(check) = fraud_check {
        if !check.check(tx).await {
            return Err(SmartChequeError::FraudDetected(format!(
                "transaction {} flagged by fraud check",
                tx.id
            )));
        }
    }

    if tx.fee.is_none() {
        tx.fee = Some(fee_calculator.transaction_fee(tx.tx_type));
    }

    let result = match tx.tx_type {
        TransactionType::EscrowCreate => {
            ledger
                .create_escrow(CreateEscrowRequest {
                    account: tx.from.clone(),
                    destination: tx.to.clone(),
                    amount: tx.amount,
                    condition: tx.condition.clone(),
                    cancel_after: 0,
                    finish_after: 0,
                })
                .await
        }
        TransactionType::EscrowFinish => {
            let offer_sequence = tx.offer_sequence.ok_or_else(|| {
                SmartChequeError::invalid_argument("escrowFinish transaction missing offer_sequence")
            })?;
            let condition = tx.condition.clone().unwrap_or_default();
            let fulfillment = tx.fulfillment.clone().unwrap_or_default();
            ledger
                .finish_escrow(FinishEscrowRequest {
                    account: tx.to.clone(),
                    owner: tx.from.clone(),
                    offer_sequence,
                    condition,
                    fulfillment,
                })
                .await
        }
        TransactionType::EscrowCancel => {
            let offer_sequence = tx.offer_sequence.ok_or_else(|| {
                SmartChequeError::invalid_argument("escrowCancel transaction missing offer_sequence")
            })?;
            ledger
                .cancel_escrow(CancelEscrowRequest {
                    account: tx.from.clone(),
                    owner: tx.from.clone(),
                    offer_sequence,
                })
                .await
        }
        TransactionType::Payment | TransactionType::WalletSetup => {
            ledger.submit_payment(&tx.from, &tx.to, tx.amount).await
        }
    };

    match result {
        Ok(submitted) => {
            tx.tx_hash = Some(submitted.tx_id);
            tx.ledger_index = Some(submitted.ledger_index);
            if tx.tx_type.requires_offer_sequence() && tx.offer_sequence.is_none() {
                tx.offer_sequence = Some(submitted.offer_sequence);
            }
            tx.processed_at = Some(chrono::Utc::now());
            Ok(())
        }
        Err(err) => {
            warn!(error = %err, "ledger call failed while processing transaction");
            tx.last_error = Some(err.to_string());
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::MockLedgerDriver;
    use crate::types::{Currency, TransactionPriority};
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn escrow_create_stamps_tx_hash_and_offer_sequence() {
        let ledger: Arc<dyn LedgerDriver> = Arc::new(MockLedgerDriver::new());
        let fees = FeeCalculator::default();
        let mut tx = Transaction::new(
            TransactionType::EscrowCreate,
            "rPayer",
            "rPayee",
            Decimal::new(100, 0),
            Currency::Xrp,
            "ent-1",
            "user-1",
            TransactionPriority::High,
        );
        process_transaction(&mut tx, &ledger, &fees, None).await.unwrap();
        assert!(tx.tx_hash.is_some());
        assert!(tx.offer_sequence.is_some());
        assert!(tx.fee.is_some());
    }

    struct AlwaysFraud;

    #[async_trait]
    impl FraudCheck for AlwaysFraud {
        async fn check(&self, _tx: &Transaction) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn fraud_check_blocks_processing() {
        let ledger: Arc<dyn LedgerDriver> = Arc::new(MockLedgerDriver::new());
        let fees = FeeCalculator::default();
        let fraud: Arc<dyn FraudCheck> = Arc::new(AlwaysFraud);
        let mut tx = Transaction::new(
            TransactionType::Payment,
            "rPayer",
            "rPayee",
            Decimal::new(5, 0),
            Currency::Xrp,
            "ent-1",
            "user-1",
            TransactionPriority::Normal,
        );
        let err = process_transaction(&mut tx, &ledger, &fees, Some(&fraud)).await;
        assert!(matches!(err, Err(SmartChequeError::FraudDetected(_))));
    }
}
