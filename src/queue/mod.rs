/*!
Transaction Queue & Batcher.

Priority-aware queue with fee-optimizing batching, bounded concurrency, and
retry/expiry, driven by four cooperating background tasks sharing the
intake channel: intake/router, batch aggregator, transaction processor, and
status monitor.
*/

pub mod batcher;
pub mod fee;
pub mod processor;

use crate::config::QueueConfig;
use crate::error::{QueueError, Result, SmartChequeError};
use crate::events::{self, EventBus};
use crate::ledger::LedgerDriver;
use crate::repository::Repositories;
use crate::types::{Transaction, TransactionBatch, TransactionStatus};
use batcher::BatchAccumulator;
use dashmap::DashMap;
use fee::FeeCalculator;
use processor::FraudCheck;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Snapshot of queue-wide counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub batching: usize,
    pub batched: usize,
    pub processing: usize,
    pub confirming: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub expired: usize,
    pub cancelled: usize,
    pub fraud: usize,
    pub open_batches: usize,
}

struct Channels {
    intake_rx: mpsc::Receiver<String>,
    processing_rx: mpsc::Receiver<String>,
}

/// The queue's live state: active transactions/batches, the batch
/// accumulator, and the channels the four background workers share.
pub struct TransactionQueue {
    config: QueueConfig,
    repositories: Arc<Repositories>,
    ledger: Arc<dyn LedgerDriver>,
    events: Arc<dyn EventBus>,
    fraud_check: Option<Arc<dyn FraudCheck>>,
    fee_calculator: FeeCalculator,

    transactions: Arc<DashMap<String, Transaction>>,
    batches: Arc<DashMap<String, TransactionBatch>>,
    accumulator: Arc<Mutex<BatchAccumulator>>,
    semaphore: Arc<Semaphore>,

    intake_tx: mpsc::Sender<String>,
    processing_tx: mpsc::Sender<String>,
    channels: Mutex<Option<Channels>>,
}

impl TransactionQueue {
    pub fn new(
        config: QueueConfig,
        repositories: Arc<Repositories>,
        ledger: Arc<dyn LedgerDriver>,
        events: Arc<dyn EventBus>,
        fraud_check: Option<Arc<dyn FraudCheck>>,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(config.max_queue_depth);
        let (processing_tx, processing_rx) = mpsc::channel(config.max_queue_depth);
        let accumulator = BatchAccumulator::new(
            config.min_batch_size,
            config.max_batch_size,
            chrono::Duration::seconds(config.max_wait_time_seconds as i64),
        );
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_executions));

        Self {
            config,
            repositories,
            ledger,
            events,
            fraud_check,
            fee_calculator: FeeCalculator::default(),
            transactions: Arc::new(DashMap::new()),
            batches: Arc::new(DashMap::new()),
            accumulator: Arc::new(Mutex::new(accumulator)),
            semaphore,
            intake_tx,
            processing_tx,
            channels: Mutex::new(Some(Channels { intake_rx, processing_rx })),
        }
    }

    /// Validate and accept a transaction, routing it to batching or direct
    /// processing. Fails with `Overloaded` when both queues are full.
    #[instrument(skip(self, tx))]
    pub async fn enqueue(&self, mut tx: Transaction) -> Result<Transaction> {
        if tx.from.is_empty() || tx.to.is_empty() || tx.enterprise_id.is_empty() || tx.user_id.is_empty() {
            return Err(SmartChequeError::invalid_argument(
                "transaction missing from/to/enterprise_id/user_id",
            ));
        }
        if tx.amount <= rust_decimal::Decimal::ZERO {
            return Err(SmartChequeError::invalid_argument("transaction amount must be positive"));
        }
        if !self.ledger.validate_address(&tx.from).await || !self.ledger.validate_address(&tx.to).await {
            return Err(SmartChequeError::invalid_argument("invalid from/to address"));
        }
        if tx.expires_at.is_none() {
            tx.expires_at = Some(tx.created_at + self.config.default_expiry);
        }

        let tx = self.repositories.transactions.create_transaction(tx).await?;
        self.transactions.insert(tx.id.clone(), tx.clone());

        crate::metrics::record_transaction_queued(&format!("{:?}", tx.priority));
        self.events
            .publish(events::transaction_queued(
                &tx.id,
                &format!("{:?}", tx.tx_type),
                "queued",
                &tx.enterprise_id,
                &tx.user_id,
                tx.amount,
                tx.currency,
                tx.batch_id.as_deref(),
            ))
            .await;

        self.intake_tx
            .try_send(tx.id.clone())
            .map_err(|_| SmartChequeError::Overloaded("intake queue at capacity".into()))?;

        Ok(tx)
    }

    /// Re-enqueue eligible failed transactions (retryCount < max) with an
    /// incremented retry count. A no-op for non-failed transactions.
    #[instrument(skip(self))]
    pub async fn retry_failed(&self) -> Result<usize> {
        let mut retried = 0usize;
        let candidates: Vec<String> = self
            .transactions
            .iter()
            .filter(|e| e.status == TransactionStatus::Failed && e.retry_count < self.config.max_retries)
            .map(|e| e.id.clone())
            .collect();

        for id in candidates {
            if let Some(mut tx) = self.transactions.get_mut(&id) {
                tx.retry_count += 1;
                tx.transition_to(TransactionStatus::Queued)?;
                let tx_clone = tx.clone();
                drop(tx);
                self.repositories.transactions.update_transaction(tx_clone).await?;
                if self.intake_tx.try_send(id).is_ok() {
                    retried += 1;
                }
            }
        }
        Ok(retried)
    }

    /// Transition any non-terminal transaction past its expiry to `expired`.
    #[instrument(skip(self))]
    pub async fn expire_old(&self) -> Result<usize> {
        let now = chrono::Utc::now();
        let mut expired = 0usize;
        let candidates: Vec<String> = self
            .transactions
            .iter()
            .filter(|e| {
                matches!(
                    e.status,
                    TransactionStatus::Queued | TransactionStatus::Processing | TransactionStatus::Batched
                ) && e.expires_at.map(|exp| now > exp).unwrap_or(false)
            })
            .map(|e| e.id.clone())
            .collect();

        for id in candidates {
            if let Some(mut tx) = self.transactions.get_mut(&id) {
                if tx.transition_to(TransactionStatus::Expired).is_ok() {
                    let tx_clone = tx.clone();
                    drop(tx);
                    self.repositories.transactions.update_transaction(tx_clone).await?;
                    expired += 1;
                }
            }
        }
        Ok(expired)
    }

    pub fn get_transaction_status(&self, id: &str) -> Result<Transaction> {
        self.transactions
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| QueueError::TransactionNotFound(id.to_string()).into())
    }

    pub fn get_batch_status(&self, id: &str) -> Result<TransactionBatch> {
        self.batches
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| QueueError::BatchNotFound(id.to_string()).into())
    }

    pub fn get_stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.transactions.iter() {
            match entry.status {
                TransactionStatus::Queued => stats.queued += 1,
                TransactionStatus::Batching => stats.batching += 1,
                TransactionStatus::Batched => stats.batched += 1,
                TransactionStatus::Processing => stats.processing += 1,
                TransactionStatus::Confirming => stats.confirming += 1,
                TransactionStatus::Confirmed => stats.confirmed += 1,
                TransactionStatus::Failed => stats.failed += 1,
                TransactionStatus::Expired => stats.expired += 1,
                TransactionStatus::Cancelled => stats.cancelled += 1,
                TransactionStatus::Fraud => stats.fraud += 1,
            }
        }
        stats.open_batches = self.batches.len();
        stats
    }

    /// Start the four cooperating background workers. Returns once `cancel`
    /// is triggered and every worker has wound down. Calling `run` twice
    /// without an intervening reconstruction is an internal error: the
    /// channel receivers are only available once.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let Channels { intake_rx, processing_rx } = self
            .channels
            .lock()
            .await
            .take()
            .ok_or_else(|| SmartChequeError::internal("queue workers already started"))?;

        let intake_router = tokio::spawn(Self::intake_router_task(self.clone(), intake_rx, cancel.clone()));
        let batch_aggregator = tokio::spawn(Self::batch_aggregator_task(self.clone(), cancel.clone()));
        let tx_processor = tokio::spawn(Self::transaction_processor_task(self.clone(), processing_rx, cancel.clone()));
        let status_monitor = tokio::spawn(Self::status_monitor_task(self.clone(), cancel.clone()));

        let _ = tokio::join!(intake_router, batch_aggregator, tx_processor, status_monitor);
        Ok(())
    }

    async fn intake_router_task(queue: Arc<Self>, mut intake_rx: mpsc::Receiver<String>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("intake router shutting down");
                    return;
                }
                maybe_id = intake_rx.recv() => {
                    let Some(id) = maybe_id else { return };
                    let Some(tx) = queue.transactions.get(&id).map(|e| e.clone()) else { continue };
                    if tx.can_batch() && queue.config.fee_optimization_enabled {
                        let batch_id = queue.accumulator.lock().await.accept(&tx);
                        if let Some(mut entry) = queue.transactions.get_mut(&id) {
                            entry.batch_id = Some(batch_id);
                            let _ = entry.transition_to(TransactionStatus::Batching);
                        }
                    } else if queue.processing_tx.try_send(id.clone()).is_err() {
                        warn!(transaction_id = %id, "processing queue full, will be retried");
                    }
                }
            }
        }
    }

    async fn batch_aggregator_task(queue: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            queue.config.batch_timeout_seconds.max(1),
        ));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("batch aggregator shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let ready = queue.accumulator.lock().await.drain_ready();
                    for mut batch in ready {
                        batch.status = crate::types::BatchStatus::Ready;
                        let transactions: Vec<Transaction> = batch
                            .transaction_ids
                            .iter()
                            .filter_map(|id| queue.transactions.get(id).map(|e| e.clone()))
                            .collect();
                        batcher::apply_fee_optimization(&mut batch, &transactions, &queue.fee_calculator);
                        batch.status = crate::types::BatchStatus::Processing;
                        batch.dispatched_at = Some(chrono::Utc::now());

                        for id in &batch.transaction_ids {
                            if let Some(mut entry) = queue.transactions.get_mut(id) {
                                let _ = entry.transition_to(TransactionStatus::Batched);
                            }
                            if queue.processing_tx.try_send(id.clone()).is_err() {
                                warn!(batch_id = %batch.id, "processing queue full dispatching batch");
                            }
                        }

                        if let Ok(persisted) = queue.repositories.batches.create_batch(batch.clone()).await {
                            queue.batches.insert(persisted.id.clone(), persisted);
                        } else {
                            queue.batches.insert(batch.id.clone(), batch);
                        }
                    }
                }
            }
        }
    }

    async fn transaction_processor_task(
        queue: Arc<Self>,
        mut processing_rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("transaction processor shutting down");
                    return;
                }
                maybe_id = processing_rx.recv() => {
                    let Some(id) = maybe_id else { return };
                    let Ok(permit) = queue.semaphore.clone().acquire_owned().await else { return };
                    let queue = queue.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        queue.process_one(&id).await;
                    });
                }
            }
        }
    }

    async fn process_one(&self, id: &str) {
        let Some(mut tx) = self.transactions.get_mut(id).map(|e| e.clone()) else {
            return;
        };
        if tx.transition_to(TransactionStatus::Processing).is_err() {
            return;
        }

        let outcome = processor::process_transaction(
            &mut tx,
            &self.ledger,
            &self.fee_calculator,
            self.fraud_check.as_ref(),
        )
        .await;

        match outcome {
            Ok(()) => {
                let _ = tx.transition_to(TransactionStatus::Confirmed);
                tx.confirmed_at = Some(chrono::Utc::now());
                crate::metrics::record_transaction_terminal("confirmed");
                self.events
                    .publish(events::transaction_confirmed(
                        &tx.id,
                        &format!("{:?}", tx.tx_type),
                        &tx.enterprise_id,
                        &tx.user_id,
                        tx.amount,
                        tx.currency,
                        tx.batch_id.as_deref(),
                    ))
                    .await;
            }
            Err(SmartChequeError::FraudDetected(reason)) => {
                tx.last_error = Some(reason);
                let _ = tx.transition_to(TransactionStatus::Fraud);
                crate::metrics::record_transaction_terminal("fraud");
            }
            Err(err) => {
                tx.last_error = Some(err.to_string());
                let _ = tx.transition_to(TransactionStatus::Failed);
                crate::metrics::record_transaction_terminal("failed");
                self.events
                    .publish(events::transaction_failed(
                        &tx.id,
                        &format!("{:?}", tx.tx_type),
                        &tx.enterprise_id,
                        &tx.user_id,
                        tx.amount,
                        tx.currency,
                        tx.batch_id.as_deref(),
                    ))
                    .await;
            }
        }

        self.transactions.insert(tx.id.clone(), tx.clone());
        let batch_id = tx.batch_id.clone();
        if let Err(err) = self.repositories.transactions.update_transaction(tx).await {
            error!(error = %err, "failed to persist transaction after processing");
        }

        if let Some(batch_id) = batch_id {
            self.maybe_complete_batch(&batch_id).await;
        }
    }

    /// Once every transaction in a batch has reached a terminal outcome
    /// (confirmed/failed/expired/cancelled/fraud), tally the batch's
    /// success/failure counts, move it to `confirmed` or `failed`, persist
    /// it, and publish `batch_completed`. A no-op until then, and a no-op
    /// if the batch has already completed.
    async fn maybe_complete_batch(&self, batch_id: &str) {
        let Some(transaction_ids) = self.batches.get(batch_id).map(|b| b.transaction_ids.clone()) else {
            return;
        };
        let members: Vec<Transaction> = transaction_ids
            .iter()
            .filter_map(|id| self.transactions.get(id).map(|e| e.clone()))
            .collect();
        if members.len() < transaction_ids.len() {
            return;
        }
        let all_settled = members.iter().all(|tx| {
            matches!(
                tx.status,
                TransactionStatus::Confirmed
                    | TransactionStatus::Failed
                    | TransactionStatus::Expired
                    | TransactionStatus::Cancelled
                    | TransactionStatus::Fraud
            )
        });
        if !all_settled {
            return;
        }
        let success_count = members.iter().filter(|tx| tx.status == TransactionStatus::Confirmed).count() as u32;
        let failure_count = members.len() as u32 - success_count;
        let new_status = if failure_count == 0 {
            crate::types::BatchStatus::Confirmed
        } else {
            crate::types::BatchStatus::Failed
        };

        // Claim the transition under the batch's shard lock so concurrently
        // finishing batch members can't both win the completion race.
        let batch = {
            let Some(mut entry) = self.batches.get_mut(batch_id) else {
                return;
            };
            if matches!(entry.status, crate::types::BatchStatus::Confirmed | crate::types::BatchStatus::Failed) {
                return;
            }
            entry.success_count = success_count;
            entry.failure_count = failure_count;
            entry.status = new_status;
            entry.completed_at = Some(chrono::Utc::now());
            entry.clone()
        };

        self.events
            .publish(events::batch_completed(
                &batch.id,
                &format!("{:?}", batch.status).to_lowercase(),
                batch.count(),
                batch.success_count,
                batch.failure_count,
                batch.total_fee,
                batch.optimized_fee,
                batch.fee_savings,
            ))
            .await;

        if let Err(err) = self.repositories.batches.update_batch(batch).await {
            error!(error = %err, "failed to persist completed batch");
        }
    }

    async fn status_monitor_task(queue: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("status monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = queue.expire_old().await {
                        error!(error = %err, "expire_old failed");
                    }
                    if let Err(err) = queue.retry_failed().await {
                        error!(error = %err, "retry_failed failed");
                    }
                    let stats = queue.get_stats();
                    crate::metrics::record_queue_depth(stats.queued + stats.batching + stats.processing);
                    debug!(?stats, "queue status tick");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::mock::InMemoryEventBus;
    use crate::ledger::mock::MockLedgerDriver;
    use crate::repository::mock::InMemoryRepositories;
    use crate::types::{Currency, TransactionPriority, TransactionType};
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn test_queue() -> Arc<TransactionQueue> {
        let mut config = QueueConfig::default();
        config.batch_timeout_seconds = 1;
        config.min_batch_size = 2;
        let (_, repositories) = InMemoryRepositories::bundle();
        Arc::new(TransactionQueue::new(
            config,
            Arc::new(repositories),
            Arc::new(MockLedgerDriver::new()),
            Arc::new(InMemoryEventBus::new()),
            None,
        ))
    }

    #[tokio::test]
    async fn non_batchable_transaction_confirms_without_waiting_for_a_batch() {
        let queue = test_queue();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(cancel.clone()));

        let tx = Transaction::new(
            TransactionType::WalletSetup,
            "rFrom",
            "rTo",
            Decimal::new(10, 0),
            Currency::Xrp,
            "ent-1",
            "user-1",
            TransactionPriority::High,
        );
        let tx = queue.enqueue(tx).await.unwrap();

        let mut confirmed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if queue.get_transaction_status(&tx.id).unwrap().status == TransactionStatus::Confirmed {
                confirmed = true;
                break;
            }
        }
        assert!(confirmed, "transaction never reached confirmed");

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn batchable_transactions_of_same_priority_dispatch_together() {
        let queue = test_queue();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(cancel.clone()));

        let mut ids = Vec::new();
        for _ in 0..2 {
            let tx = Transaction::new(
                TransactionType::EscrowCreate,
                "rFrom",
                "rTo",
                Decimal::new(50, 0),
                Currency::Xrp,
                "ent-1",
                "user-1",
                TransactionPriority::Normal,
            );
            ids.push(queue.enqueue(tx).await.unwrap().id);
        }

        let mut all_confirmed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            all_confirmed = ids.iter().all(|id| {
                queue.get_transaction_status(id).map(|t| t.status) == Ok(TransactionStatus::Confirmed)
            });
            if all_confirmed {
                break;
            }
        }
        assert!(all_confirmed, "batched transactions never reached confirmed");
        assert!(queue.get_stats().open_batches == 0 || queue.get_stats().confirmed == 2);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn expire_old_transitions_stale_queued_transactions() {
        let queue = test_queue();
        let mut tx = Transaction::new(
            TransactionType::WalletSetup,
            "rFrom",
            "rTo",
            Decimal::new(1, 0),
            Currency::Xrp,
            "ent-1",
            "user-1",
            TransactionPriority::Low,
        );
        tx.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        let tx = queue.enqueue(tx).await.unwrap();

        let expired = queue.expire_old().await.unwrap();
        assert_eq!(expired, 1);
        assert_eq!(queue.get_transaction_status(&tx.id).unwrap().status, TransactionStatus::Expired);
    }
}
