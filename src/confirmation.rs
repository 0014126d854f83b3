/*!
Confirmation Tracker.

Translates on-ledger confirmation counts into payment-execution state
transitions. One background monitor task refreshes every active tracking
entry on a fixed interval; `wait_for` additionally allows a caller to block
cooperatively on a specific transaction.
*/

use crate::config::ConfirmationConfig;
use crate::error::{ConfirmationError, Result, SmartChequeError};
use crate::events;
use crate::events::EventBus;
use crate::execution::{ConfirmationRegistrar, ExecutionStatusSink};
use crate::ledger::LedgerDriver;
use crate::types::{ConfirmationCheck, ConfirmationStatus, ConfirmationTracking, CONFIRMATION_HISTORY_CAPACITY};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Watches submitted transactions for on-ledger confirmation and signals
/// the Payment Execution Engine when each reaches a terminal state.
pub struct ConfirmationTracker {
    config: ConfirmationConfig,
    ledger: Arc<dyn LedgerDriver>,
    events: Arc<dyn EventBus>,
    execution_sink: Arc<dyn ExecutionStatusSink>,
    active: DashMap<String, ConfirmationTracking>,
}

impl ConfirmationTracker {
    pub fn new(
        config: ConfirmationConfig,
        ledger: Arc<dyn LedgerDriver>,
        events: Arc<dyn EventBus>,
        execution_sink: Arc<dyn ExecutionStatusSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ledger,
            events,
            execution_sink,
            active: DashMap::new(),
        })
    }

    /// Mutates the required-confirmations threshold on an active entry.
    #[instrument(skip(self))]
    pub fn update_requirements(&self, tx_id: &str, required: u32) -> Result<()> {
        let mut entry = self
            .active
            .get_mut(tx_id)
            .ok_or_else(|| ConfirmationError::NotFound(tx_id.to_string()))?;
        entry.required_confirmations = required;
        Ok(())
    }

    /// Blocks cooperatively until either `confirmations ≥ required`
    /// (success) or `confirmation_timeout` expires (failure).
    #[instrument(skip(self))]
    pub async fn wait_for(&self, tx_id: &str, required: u32) -> Result<ConfirmationTracking> {
        let deadline = tokio::time::Instant::now() + self.config.confirmation_timeout;
        let mut interval = tokio::time::interval(self.config.monitoring_interval.min(std::time::Duration::from_secs(1)));

        loop {
            self.check_one(tx_id).await?;
            if let Some(entry) = self.active.get(tx_id) {
                if entry.current_confirmations >= required || entry.status == ConfirmationStatus::Confirmed {
                    return Ok(entry.clone());
                }
                if entry.status == ConfirmationStatus::Expired || entry.status == ConfirmationStatus::Failed {
                    return Err(ConfirmationError::TimedOut(tx_id.to_string()).into());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConfirmationError::TimedOut(tx_id.to_string()).into());
            }
            interval.tick().await;
        }
    }
}

#[async_trait]
impl ConfirmationRegistrar for ConfirmationTracker {
    /// Creates a tracking entry with `required_confirmations :=
    /// default_required`, status=`pending`. A no-op if `tx_id` is already
    /// tracked.
    #[instrument(skip(self))]
    async fn start(&self, tx_id: &str, execution_id: &str) -> Result<()> {
        if self.active.contains_key(tx_id) {
            return Ok(());
        }

        let now = Utc::now();
        let tracking = ConfirmationTracking {
            transaction_id: tx_id.to_string(),
            authorization_id: Some(execution_id.to_string()),
            required_confirmations: self.config.default_required_confirmations,
            current_confirmations: 0,
            status: ConfirmationStatus::Pending,
            started_at: now,
            last_checked_at: now,
            completed_at: None,
            check_history: Default::default(),
        };
        self.active.insert(tx_id.to_string(), tracking);

        self.events
            .publish(events::confirmation_started(tx_id, execution_id, self.config.default_required_confirmations))
            .await;
        Ok(())
    }
}

impl ConfirmationTracker {
    async fn check_one(&self, tx_id: &str) -> Result<()> {
        let Some(mut entry) = self.active.get_mut(tx_id) else {
            return Ok(());
        };

        if matches!(entry.status, ConfirmationStatus::Confirmed | ConfirmationStatus::Failed | ConfirmationStatus::Expired) {
            return Ok(());
        }

        let status = self.ledger.get_transaction_status(tx_id).await?;
        entry.current_confirmations = status.confirmations;
        entry.last_checked_at = Utc::now();
        entry.check_history.push_back(ConfirmationCheck {
            checked_at: entry.last_checked_at,
            confirmations: status.confirmations,
        });
        while entry.check_history.len() > CONFIRMATION_HISTORY_CAPACITY {
            entry.check_history.pop_front();
        }

        if entry.status == ConfirmationStatus::Pending {
            entry.status = ConfirmationStatus::Confirming;
        }

        let just_confirmed = entry.current_confirmations >= entry.required_confirmations
            && entry.status != ConfirmationStatus::Confirmed;

        if just_confirmed {
            entry.status = ConfirmationStatus::Confirmed;
            entry.completed_at = Some(Utc::now());
            let transaction_id = entry.transaction_id.clone();
            let execution_id = entry.authorization_id.clone();
            drop(entry);

            if let Some(execution_id) = execution_id {
                if let Err(err) = self.execution_sink.mark_confirmed(&execution_id, &transaction_id).await {
                    warn!(error = %err, "failed to notify execution engine of confirmation");
                }
            }
            return Ok(());
        }

        if entry.status == ConfirmationStatus::Pending || entry.status == ConfirmationStatus::Confirming {
            if Utc::now() - entry.started_at > chrono::Duration::from_std(self.config.confirmation_timeout).unwrap_or_else(|_| chrono::Duration::seconds(300)) {
                entry.status = ConfirmationStatus::Expired;
                let transaction_id = entry.transaction_id.clone();
                let execution_id = entry.authorization_id.clone();
                drop(entry);

                if let Some(execution_id) = execution_id {
                    if let Err(err) = self.execution_sink.mark_failed(&execution_id, "confirmation timeout exceeded").await {
                        warn!(error = %err, "failed to notify execution engine of timeout");
                    }
                }
                warn!(%transaction_id, "confirmation timed out");
            }
        }

        Ok(())
    }

    fn evict_completed(&self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.completed_entry_eviction).unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|e| {
                matches!(e.status, ConfirmationStatus::Confirmed | ConfirmationStatus::Expired)
                    && e.completed_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .map(|e| e.transaction_id.clone())
            .collect();
        for id in stale {
            self.active.remove(&id);
        }
    }

    /// Cooperative loop on `monitoring_interval` refreshing every active
    /// entry; intended to run as a single background task.
    pub async fn monitor(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.enable_background_monitoring {
            return;
        }
        let mut ticker = tokio::time::interval(self.config.monitoring_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("confirmation monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let ids: Vec<String> = self.active.iter().map(|e| e.transaction_id.clone()).collect();
                    for id in ids {
                        if let Err(err) = self.check_one(&id).await {
                            warn!(transaction_id = %id, error = %err, "confirmation check failed");
                        }
                    }
                    self.evict_completed();
                    debug!(active = self.active.len(), "confirmation monitor tick");
                }
            }
        }
    }

    pub fn get(&self, tx_id: &str) -> Result<ConfirmationTracking> {
        self.active
            .get(tx_id)
            .map(|e| e.clone())
            .ok_or_else(|| ConfirmationError::NotFound(tx_id.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::mock::InMemoryEventBus;
    use crate::ledger::mock::MockLedgerDriver;
    use rust_decimal::Decimal;

    struct NoopSink;

    #[async_trait]
    impl ExecutionStatusSink for NoopSink {
        async fn mark_confirmed(&self, _execution_id: &str, _tx_id: &str) -> Result<()> {
            Ok(())
        }
        async fn mark_failed(&self, _execution_id: &str, _reason: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn wait_for_succeeds_once_ledger_reports_enough_confirmations() {
        let ledger = Arc::new(MockLedgerDriver::new());
        let result = ledger.submit_payment("rFrom", "rTo", Decimal::new(10, 0)).await.unwrap();
        ledger.advance_confirmations(&result.tx_id, 10);

        let mut config = ConfirmationConfig::default();
        config.default_required_confirmations = 6;
        config.monitoring_interval = std::time::Duration::from_millis(10);

        let tracker = ConfirmationTracker::new(config, ledger, Arc::new(InMemoryEventBus::new()), Arc::new(NoopSink));
        tracker.start(&result.tx_id, "exec-1").await.unwrap();

        let tracking = tracker.wait_for(&result.tx_id, 6).await.unwrap();
        assert_eq!(tracking.status, ConfirmationStatus::Confirmed);
    }

    #[tokio::test]
    async fn start_on_already_tracked_tx_is_a_no_op() {
        let ledger = Arc::new(MockLedgerDriver::new());
        let events = Arc::new(InMemoryEventBus::new());
        let tracker = ConfirmationTracker::new(ConfirmationConfig::default(), ledger, events.clone(), Arc::new(NoopSink));
        tracker.start("TX1", "exec-1").await.unwrap();
        tracker.update_requirements("TX1", 12).unwrap();

        tracker.start("TX1", "exec-2").await.unwrap();

        let tracking = tracker.get("TX1").unwrap();
        assert_eq!(tracking.required_confirmations, 12, "re-starting must not reset an in-flight tracking entry");
        assert_eq!(events.count_of_type("payment.confirmation.started").await, 1);
    }

    #[tokio::test]
    async fn update_requirements_changes_threshold() {
        let ledger = Arc::new(MockLedgerDriver::new());
        let tracker = ConfirmationTracker::new(ConfirmationConfig::default(), ledger, Arc::new(InMemoryEventBus::new()), Arc::new(NoopSink));
        tracker.start("TX1", "exec-1").await.unwrap();
        tracker.update_requirements("TX1", 12).unwrap();
        assert_eq!(tracker.get("TX1").unwrap().required_confirmations, 12);
    }
}
