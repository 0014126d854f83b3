/*!
Batch accumulation for the transaction queue.

A batch accepts a transaction iff it is still accumulating, has spare
capacity, shares the transaction's priority, and hasn't aged past the
max-wait window. When no open batch qualifies, a new one is created.
*/

use crate::queue::fee::FeeCalculator;
use crate::types::{BatchStatus, Transaction, TransactionBatch, TransactionPriority};
use std::collections::HashMap;

/// Holds the set of batches currently accepting transactions, keyed by priority.
pub struct BatchAccumulator {
    open_batches: HashMap<TransactionPriority, TransactionBatch>,
    min_batch_size: usize,
    max_batch_size: usize,
    max_wait: chrono::Duration,
}

impl BatchAccumulator {
    pub fn new(min_batch_size: usize, max_batch_size: usize, max_wait: chrono::Duration) -> Self {
        Self {
            open_batches: HashMap::new(),
            min_batch_size,
            max_batch_size,
            max_wait,
        }
    }

    /// Assign `tx` to an open batch of its priority, creating one if needed.
    /// Returns the batch id the transaction was placed into.
    pub fn accept(&mut self, tx: &Transaction) -> String {
        let qualifies = self
            .open_batches
            .get(&tx.priority)
            .map(|b| {
                b.status == BatchStatus::Batching
                    && b.count() < b.max_transactions
                    && (chrono::Utc::now() - b.created_at) < self.max_wait
            })
            .unwrap_or(false);

        if !qualifies {
            let batch = TransactionBatch::new(tx.priority, self.min_batch_size, self.max_batch_size);
            self.open_batches.insert(tx.priority, batch);
        }

        let batch = self.open_batches.get_mut(&tx.priority).expect("just inserted");
        batch.transaction_ids.push(tx.id.clone());
        batch.id.clone()
    }

    /// Drain every batch that has become ready for dispatch, replacing it
    /// with nothing (the priority slot reopens on the next `accept`).
    pub fn drain_ready(&mut self) -> Vec<TransactionBatch> {
        let ready_priorities: Vec<TransactionPriority> = self
            .open_batches
            .iter()
            .filter(|(_, b)| b.is_ready(self.max_wait))
            .map(|(p, _)| *p)
            .collect();

        ready_priorities
            .into_iter()
            .filter_map(|p| self.open_batches.remove(&p))
            .collect()
    }

    pub fn open_batch_count(&self) -> usize {
        self.open_batches.len()
    }
}

/// Apply fee optimization to a batch given its resolved transactions,
/// mutating the batch's fee fields in place.
pub fn apply_fee_optimization(batch: &mut TransactionBatch, transactions: &[Transaction], calculator: &FeeCalculator) {
    let (total, optimized, savings) = calculator.batch_fees(transactions);
    batch.total_fee = total;
    batch.optimized_fee = optimized;
    batch.fee_savings = savings;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Currency;
    use rust_decimal::Decimal;

    fn tx(priority: TransactionPriority) -> Transaction {
        Transaction::new(
            crate::types::TransactionType::Payment,
            "rFrom",
            "rTo",
            Decimal::new(10, 0),
            Currency::Xrp,
            "ent-1",
            "user-1",
            priority,
        )
    }

    #[test]
    fn only_same_priority_transactions_share_a_batch() {
        let mut acc = BatchAccumulator::new(1, 5, chrono::Duration::seconds(2));
        let high = tx(TransactionPriority::High);
        let low = tx(TransactionPriority::Low);
        let high_batch = acc.accept(&high);
        let low_batch = acc.accept(&low);
        assert_ne!(high_batch, low_batch);
    }

    #[test]
    fn batch_becomes_ready_once_min_size_reached() {
        let mut acc = BatchAccumulator::new(2, 5, chrono::Duration::seconds(2));
        acc.accept(&tx(TransactionPriority::High));
        assert!(acc.drain_ready().is_empty());
        acc.accept(&tx(TransactionPriority::High));
        let ready = acc.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].count(), 2);
    }

    #[test]
    fn batch_respects_max_capacity() {
        let mut acc = BatchAccumulator::new(1, 2, chrono::Duration::seconds(2));
        acc.accept(&tx(TransactionPriority::High));
        acc.accept(&tx(TransactionPriority::High));
        let ready = acc.drain_ready();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].count() <= 2);
    }
}
