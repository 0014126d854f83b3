/*!
Fee optimization for the transaction queue and batcher.

Per-transaction base fees are weighted by transaction type and a
network-load factor; batches compute an optimized fee that must come in
under the sum of individual fees, surfacing the savings.
*/

use crate::types::{Transaction, TransactionType};
use rust_decimal::Decimal;

/// Base fee, in the transaction's own currency units, before type/load weighting.
pub const BASE_FEE: Decimal = Decimal::new(12, 2); // 0.12

/// Fee calculator applying type weights and a network-load multiplier.
#[derive(Debug, Clone)]
pub struct FeeCalculator {
    /// Current network-load factor in [1.0, +inf); 1.0 means no congestion surcharge.
    pub network_load_factor: Decimal,
}

impl Default for FeeCalculator {
    fn default() -> Self {
        Self {
            network_load_factor: Decimal::ONE,
        }
    }
}

impl FeeCalculator {
    pub fn new(network_load_factor: Decimal) -> Self {
        Self { network_load_factor }
    }

    /// Per-transaction fee: base fee weighted by transaction-type and network load.
    pub fn transaction_fee(&self, tx_type: TransactionType) -> Decimal {
        BASE_FEE * tx_type.fee_weight() * self.network_load_factor
    }

    /// Sum of the individual fees each transaction would pay outside a batch.
    pub fn individual_total(&self, transactions: &[Transaction]) -> Decimal {
        transactions.iter().map(|tx| self.transaction_fee(tx.tx_type)).sum()
    }

    /// The optimized, batched fee: a fixed per-batch overhead plus a reduced
    /// marginal fee per additional transaction, always below the sum of
    /// individual fees for more than one transaction.
    pub fn optimized_batch_fee(&self, transactions: &[Transaction]) -> Decimal {
        if transactions.is_empty() {
            return Decimal::ZERO;
        }
        let overhead = self.transaction_fee(transactions[0].tx_type);
        let marginal_rate = Decimal::new(6, 1); // 60% of an individual fee per extra tx
        let marginal: Decimal = transactions[1..]
            .iter()
            .map(|tx| self.transaction_fee(tx.tx_type) * marginal_rate)
            .sum();
        overhead + marginal
    }

    /// `(total_fee, optimized_fee, fee_savings)` for a batch.
    pub fn batch_fees(&self, transactions: &[Transaction]) -> (Decimal, Decimal, Decimal) {
        let total = self.individual_total(transactions);
        let optimized = self.optimized_batch_fee(transactions).min(total);
        (total, optimized, total - optimized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Currency, TransactionPriority};

    fn tx(tx_type: TransactionType) -> Transaction {
        Transaction::new(
            tx_type,
            "rFrom",
            "rTo",
            Decimal::new(100, 0),
            Currency::Xrp,
            "ent-1",
            "user-1",
            TransactionPriority::High,
        )
    }

    #[test]
    fn batching_multiple_transactions_saves_fees() {
        let calc = FeeCalculator::default();
        let txs = vec![
            tx(TransactionType::EscrowFinish),
            tx(TransactionType::EscrowFinish),
            tx(TransactionType::EscrowFinish),
            tx(TransactionType::EscrowFinish),
        ];
        let (total, optimized, savings) = calc.batch_fees(&txs);
        assert!(optimized < total);
        assert!(savings > Decimal::ZERO);
    }

    #[test]
    fn single_transaction_has_no_marginal_savings() {
        let calc = FeeCalculator::default();
        let txs = vec![tx(TransactionType::Payment)];
        let (total, optimized, savings) = calc.batch_fees(&txs);
        assert_eq!(total, optimized);
        assert_eq!(savings, Decimal::ZERO);
    }
}
