/*!
Escrow / SmartCheque Controller.

The authoritative mapping between a SmartCheque and its on-ledger escrows:
enforces valid status transitions, computes refund semantics, records
every ledger action as a Transaction row, and optionally monitors escrow
health on a per-SmartCheque background task.
*/

use crate::error::{EscrowError, Result, SmartChequeError};
use crate::events::{self, EventBus};
use crate::ledger::{CancelEscrowRequest, CreateEscrowRequest, FinishEscrowRequest, LedgerDriver, MilestoneCondition};
use crate::repository::Repositories;
use crate::types::{EscrowHealth, MilestoneStatus, SmartCheque, SmartChequeStatus, Transaction, TransactionPriority, TransactionType};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Minimum lead time XRPL requires between escrow creation and its
/// `finishAfter` offset.
const MIN_FINISH_AFTER_BUFFER: chrono::Duration = chrono::Duration::hours(1);
/// Slack added on top of a milestone's estimated completion before the
/// escrow's `cancelAfter` offset, so a slow-but-legitimate milestone isn't
/// force-cancelled by the ledger.
const CANCEL_AFTER_BUFFER: chrono::Duration = chrono::Duration::hours(24);

pub struct EscrowController {
    repositories: Arc<Repositories>,
    ledger: Arc<dyn LedgerDriver>,
    events: Arc<dyn EventBus>,
}

impl EscrowController {
    pub fn new(repositories: Arc<Repositories>, ledger: Arc<dyn LedgerDriver>, events: Arc<dyn EventBus>) -> Arc<Self> {
        Arc::new(Self { repositories, ledger, events })
    }

    async fn record_transaction(
        &self,
        tx_type: TransactionType,
        from: &str,
        to: &str,
        amount: Decimal,
        smart_cheque: &SmartCheque,
        milestone_id: Option<&str>,
        tx_id: &str,
        ledger_index: u64,
        offer_sequence: Option<u32>,
    ) -> Result<Transaction> {
        let mut tx = Transaction::new(
            tx_type,
            from,
            to,
            amount,
            smart_cheque.currency,
            &smart_cheque.payer_id,
            &smart_cheque.payee_id,
            TransactionPriority::Normal,
        );
        tx.smart_cheque_id = Some(smart_cheque.id.clone());
        tx.milestone_id = milestone_id.map(str::to_string);
        tx.tx_hash = Some(tx_id.to_string());
        tx.ledger_index = Some(ledger_index);
        tx.offer_sequence = offer_sequence;
        tx.processed_at = Some(Utc::now());
        let _ = tx.transition_to(crate::types::TransactionStatus::Confirmed);
        self.repositories.transactions.create_transaction(tx).await
    }

    /// Validates addresses, creates one ledger escrow per milestone
    /// (`cancelAfter` derived from that milestone's duration/end date,
    /// `finishAfter` at least an hour out), and persists the resulting
    /// condition/fulfillment/offer_sequence on each milestone.
    #[instrument(skip(self))]
    pub async fn create_escrow_for_smart_cheque(
        &self,
        smart_cheque_id: &str,
        payer_addr: &str,
        payee_addr: &str,
    ) -> Result<SmartCheque> {
        let mut smart_cheque = self.repositories.smart_cheques.get_smart_cheque(smart_cheque_id).await?;

        if !self.ledger.validate_address(payer_addr).await || !self.ledger.validate_address(payee_addr).await {
            return Err(SmartChequeError::invalid_argument("invalid payer/payee address"));
        }

        let now = Utc::now();
        let finish_after = crate::ledger::to_ripple_time(now + MIN_FINISH_AFTER_BUFFER);

        let mut last_tx_id = None;
        for milestone in smart_cheque.milestones.iter_mut() {
            let secret = crate::types::new_id();
            let (condition, fulfillment) = self.ledger.generate_condition(&secret).await?;

            let cancel_at = milestone
                .estimated_end_date
                .unwrap_or(now + milestone.estimated_duration)
                + CANCEL_AFTER_BUFFER;
            let cancel_after = crate::ledger::to_ripple_time(cancel_at);

            let amount = milestone.amount.unwrap_or(smart_cheque.amount);
            let result = self
                .ledger
                .create_conditional_escrow_with_validation(
                    CreateEscrowRequest {
                        account: payer_addr.to_string(),
                        destination: payee_addr.to_string(),
                        amount,
                        condition: Some(condition.clone()),
                        cancel_after,
                        finish_after,
                    },
                    &[MilestoneCondition {
                        milestone_id: milestone.id.clone(),
                        condition: condition.clone(),
                    }],
                )
                .await?;

            milestone.secret = Some(secret);
            milestone.condition = Some(condition);
            milestone.fulfillment = Some(fulfillment);
            milestone.offer_sequence = Some(result.offer_sequence);

            self.record_transaction(
                TransactionType::EscrowCreate,
                payer_addr,
                payee_addr,
                amount,
                &smart_cheque,
                Some(&milestone.id),
                &result.tx_id,
                result.ledger_index,
                Some(result.offer_sequence),
            )
            .await?;

            self.events.publish(events::escrow_created(smart_cheque_id, &milestone.id, milestone.offer_sequence.unwrap())).await;

            last_tx_id = Some(result.tx_id);
        }

        smart_cheque.escrow_address = last_tx_id;
        smart_cheque.owner_address = Some(payer_addr.to_string());
        smart_cheque.transition_to(SmartChequeStatus::Locked)?;

        self.repositories.smart_cheques.update_smart_cheque(smart_cheque).await
    }

    /// Finishes the escrow created for `milestone_id` using the persisted
    /// condition/fulfillment, marks it verified, and advances the
    /// SmartCheque to `completed` once every milestone is verified.
    #[instrument(skip(self))]
    pub async fn complete_milestone_payment(&self, smart_cheque_id: &str, milestone_id: &str) -> Result<SmartCheque> {
        let mut smart_cheque = self.repositories.smart_cheques.get_smart_cheque(smart_cheque_id).await?;
        if smart_cheque.escrow_address.is_none() {
            return Err(EscrowError::NoEscrow(smart_cheque_id.to_string()).into());
        }

        let payer = smart_cheque.owner_address.clone().unwrap_or_else(|| smart_cheque.payer_id.clone());
        let payee = smart_cheque.payee_id.clone();
        let currency = smart_cheque.currency;
        let cheque_amount = smart_cheque.amount;

        let milestone = smart_cheque
            .milestone_mut(milestone_id)
            .ok_or_else(|| EscrowError::MilestoneNotFound(milestone_id.to_string()))?;
        let offer_sequence = milestone.offer_sequence.ok_or_else(|| EscrowError::NoEscrow(smart_cheque_id.to_string()))?;
        let condition = milestone.condition.clone().ok_or_else(|| EscrowError::NoEscrow(smart_cheque_id.to_string()))?;
        let fulfillment = milestone.fulfillment.clone().ok_or_else(|| EscrowError::NoEscrow(smart_cheque_id.to_string()))?;
        let amount = milestone.amount.unwrap_or(cheque_amount);

        let result = self
            .ledger
            .finish_escrow(FinishEscrowRequest {
                account: payee.clone(),
                owner: payer.clone(),
                offer_sequence,
                condition,
                fulfillment,
            })
            .await?;

        let milestone = smart_cheque.milestone_mut(milestone_id).expect("looked up above");
        milestone.status = MilestoneStatus::Verified;
        milestone.completed_at = Some(Utc::now());
        milestone.percentage_complete = Decimal::new(100, 0);

        self.record_transaction(
            TransactionType::EscrowFinish,
            &payer,
            &payee,
            amount,
            &smart_cheque,
            Some(milestone_id),
            &result.tx_id,
            result.ledger_index,
            Some(offer_sequence),
        )
        .await?;

        if smart_cheque.all_milestones_verified() {
            smart_cheque.transition_to(SmartChequeStatus::Completed)?;
        } else if smart_cheque.status == SmartChequeStatus::Locked {
            smart_cheque.transition_to(SmartChequeStatus::InProgress)?;
        }

        self.events.publish(events::escrow_finished(smart_cheque_id, milestone_id)).await;

        let _ = currency;
        self.repositories.smart_cheques.update_smart_cheque(smart_cheque).await
    }

    /// Refund is the sum of unverified-milestone amounts when milestones
    /// are individually priced and balanced against the total; otherwise
    /// the full amount.
    fn compute_cancel_refund(smart_cheque: &SmartCheque) -> Decimal {
        if smart_cheque.milestones_balanced() && smart_cheque.milestones.iter().all(|m| m.amount.is_some()) {
            smart_cheque
                .milestones
                .iter()
                .filter(|m| !m.is_verified())
                .filter_map(|m| m.amount)
                .sum()
        } else {
            smart_cheque.amount
        }
    }

    /// Not permitted when `completed`, or when there is no escrow.
    #[instrument(skip(self))]
    pub async fn cancel_smart_cheque_escrow(
        &self,
        smart_cheque_id: &str,
        reason: &str,
        notes: &str,
    ) -> Result<(SmartCheque, Decimal)> {
        let mut smart_cheque = self.repositories.smart_cheques.get_smart_cheque(smart_cheque_id).await?;

        if smart_cheque.status == SmartChequeStatus::Completed {
            return Err(EscrowError::CancelNotAllowed {
                id: smart_cheque_id.to_string(),
                status: format!("{:?}", smart_cheque.status),
            }
            .into());
        }
        if smart_cheque.escrow_address.is_none() {
            return Err(EscrowError::NoEscrow(smart_cheque_id.to_string()).into());
        }

        let refund_amount = Self::compute_cancel_refund(&smart_cheque);
        let payer = smart_cheque.owner_address.clone().unwrap_or_else(|| smart_cheque.payer_id.clone());

        let mut last_result = None;
        for milestone in smart_cheque.milestones.iter().filter(|m| !m.is_verified()) {
            if let Some(offer_sequence) = milestone.offer_sequence {
                let result = self
                    .ledger
                    .cancel_escrow(CancelEscrowRequest {
                        account: payer.clone(),
                        owner: payer.clone(),
                        offer_sequence,
                    })
                    .await?;
                last_result = Some(result);
            }
        }

        smart_cheque.transition_to(SmartChequeStatus::Disputed)?;

        if let Some(result) = last_result {
            let mut tx = Transaction::new(
                TransactionType::EscrowCancel,
                &payer,
                &smart_cheque.payee_id,
                refund_amount,
                smart_cheque.currency,
                &smart_cheque.payer_id,
                &smart_cheque.payee_id,
                TransactionPriority::High,
            );
            tx.smart_cheque_id = Some(smart_cheque.id.clone());
            tx.tx_hash = Some(result.tx_id);
            tx.ledger_index = Some(result.ledger_index);
            tx.last_error = Some(format!("cancelled: reason={reason}, notes={notes}, refund_amount={refund_amount}"));
            let _ = tx.transition_to(crate::types::TransactionStatus::Confirmed);
            self.repositories.transactions.create_transaction(tx).await?;
        }

        self.events.publish(events::escrow_cancelled(smart_cheque_id, refund_amount, reason)).await;

        let updated = self.repositories.smart_cheques.update_smart_cheque(smart_cheque).await?;
        Ok((updated, refund_amount))
    }

    /// Requires `0 < pct <= 100`, at least one completed milestone, and not
    /// every milestone completed. `refund = amount * pct / 100`.
    #[instrument(skip(self))]
    pub async fn partial_refund_escrow(&self, smart_cheque_id: &str, pct: Decimal) -> Result<(SmartCheque, Decimal)> {
        if pct <= Decimal::ZERO || pct > Decimal::new(100, 0) {
            return Err(EscrowError::InvalidPercentage(pct).into());
        }

        let mut smart_cheque = self.repositories.smart_cheques.get_smart_cheque(smart_cheque_id).await?;
        let completed = smart_cheque.milestones.iter().filter(|m| m.is_verified()).count();
        if completed == 0 {
            return Err(EscrowError::NoCompletedMilestones(smart_cheque_id.to_string()).into());
        }
        if completed == smart_cheque.milestones.len() {
            return Err(EscrowError::NoRemainingMilestones(smart_cheque_id.to_string()).into());
        }

        let refund = smart_cheque.amount * pct / Decimal::new(100, 0);
        let remaining = smart_cheque.amount - refund;

        smart_cheque.transition_to(SmartChequeStatus::Disputed)?;

        let mut tx = Transaction::new(
            TransactionType::EscrowCancel,
            &smart_cheque.payer_id,
            &smart_cheque.payee_id,
            refund,
            smart_cheque.currency,
            &smart_cheque.payer_id,
            &smart_cheque.payee_id,
            TransactionPriority::High,
        );
        tx.smart_cheque_id = Some(smart_cheque.id.clone());
        tx.last_error = Some(format!("partial refund: percentage={pct}, remaining={remaining}"));
        let _ = tx.transition_to(crate::types::TransactionStatus::Confirmed);
        self.repositories.transactions.create_transaction(tx).await?;

        self.events.publish(events::escrow_partially_refunded(smart_cheque_id, refund, pct)).await;

        let updated = self.repositories.smart_cheques.update_smart_cheque(smart_cheque).await?;
        Ok((updated, refund))
    }

    /// Reads escrow health from the ledger and reconciles SmartCheque
    /// status: if every escrow is inactive and every milestone verified,
    /// transitions to `completed`; if inactive with unverified milestones,
    /// to `disputed`.
    #[instrument(skip(self))]
    pub async fn sync_escrow_status(&self, smart_cheque_id: &str) -> Result<SmartCheque> {
        let mut smart_cheque = self.repositories.smart_cheques.get_smart_cheque(smart_cheque_id).await?;
        let owner = smart_cheque.owner_address.clone().unwrap_or_else(|| smart_cheque.payer_id.clone());

        let mut any_active = false;
        for milestone in &smart_cheque.milestones {
            if milestone.is_verified() {
                continue;
            }
            if let Some(sequence) = milestone.offer_sequence {
                match self.ledger.get_escrow_status(&owner, sequence).await {
                    Ok(status) if status.active => any_active = true,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "failed to read escrow status during sync");
                        return Ok(smart_cheque);
                    }
                }
            }
        }

        if !any_active {
            if smart_cheque.all_milestones_verified() {
                if smart_cheque.status != SmartChequeStatus::Completed {
                    smart_cheque.transition_to(SmartChequeStatus::Completed)?;
                }
            } else if !matches!(smart_cheque.status, SmartChequeStatus::Disputed | SmartChequeStatus::Completed) {
                smart_cheque.transition_to(SmartChequeStatus::Disputed)?;
            }
        }

        self.repositories.smart_cheques.update_smart_cheque(smart_cheque).await
    }

    /// Derives a health label from escrow activity, the cancel-after
    /// window, and milestone verification progress.
    #[instrument(skip(self))]
    pub async fn get_escrow_health_status(&self, smart_cheque_id: &str) -> Result<EscrowHealth> {
        let smart_cheque = self.repositories.smart_cheques.get_smart_cheque(smart_cheque_id).await?;
        if smart_cheque.escrow_address.is_none() {
            return Ok(EscrowHealth::NoEscrow);
        }

        let owner = smart_cheque.owner_address.clone().unwrap_or_else(|| smart_cheque.payer_id.clone());
        let now_ripple = crate::ledger::to_ripple_time(Utc::now());
        let verified_count = smart_cheque.milestones.iter().filter(|m| m.is_verified()).count();

        if smart_cheque.status == SmartChequeStatus::Completed {
            return Ok(EscrowHealth::Inactive);
        }

        let mut saw_expired = false;
        let mut saw_active = false;
        for milestone in smart_cheque.milestones.iter().filter(|m| !m.is_verified()) {
            let Some(sequence) = milestone.offer_sequence else { continue };
            match self.ledger.get_escrow_status(&owner, sequence).await {
                Ok(status) if status.active && status.cancel_after <= now_ripple => saw_expired = true,
                Ok(status) if status.active => saw_active = true,
                Ok(_) => {}
                Err(_) => return Ok(EscrowHealth::SyncError),
            }
        }

        if saw_expired {
            Ok(EscrowHealth::Expired)
        } else if verified_count == smart_cheque.milestones.len() && !smart_cheque.milestones.is_empty() {
            Ok(EscrowHealth::ReadyForRelease)
        } else if verified_count > 0 {
            Ok(EscrowHealth::PartiallyComplete)
        } else if saw_active {
            Ok(EscrowHealth::Active)
        } else {
            Ok(EscrowHealth::Inactive)
        }
    }
}

/// Per-SmartCheque statistics for the monitoring service.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MonitoringStats {
    pub active: usize,
    pub total_started: u64,
    pub total_stopped: u64,
}

/// Maintains a map of active per-SmartCheque monitor tasks, each owning
/// its own cancel handle.
pub struct MonitoringService {
    controller: Arc<EscrowController>,
    monitors: RwLock<HashMap<String, CancellationToken>>,
    total_started: std::sync::atomic::AtomicU64,
    total_stopped: std::sync::atomic::AtomicU64,
}

impl MonitoringService {
    pub fn new(controller: Arc<EscrowController>) -> Arc<Self> {
        Arc::new(Self {
            controller,
            monitors: RwLock::new(HashMap::new()),
            total_started: std::sync::atomic::AtomicU64::new(0),
            total_stopped: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Cooperative task that calls `sync_escrow_status` at `interval`
    /// until its cancel token fires.
    async fn monitor_one(controller: Arc<EscrowController>, smart_cheque_id: String, interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(%smart_cheque_id, "escrow monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = controller.sync_escrow_status(&smart_cheque_id).await {
                        warn!(%smart_cheque_id, error = %err, "escrow sync failed");
                    }
                }
            }
        }
    }

    pub async fn start_monitoring(&self, smart_cheque_id: &str, interval: std::time::Duration) {
        let mut monitors = self.monitors.write().await;
        if monitors.contains_key(smart_cheque_id) {
            return;
        }
        let cancel = CancellationToken::new();
        monitors.insert(smart_cheque_id.to_string(), cancel.clone());
        self.total_started.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tokio::spawn(Self::monitor_one(self.controller.clone(), smart_cheque_id.to_string(), interval, cancel));
    }

    /// Starts a monitor for every SmartCheque not already `completed`.
    pub async fn start_monitoring_all_active_escrows(&self, smart_cheque_ids: &[String], interval: std::time::Duration) {
        for id in smart_cheque_ids {
            self.start_monitoring(id, interval).await;
        }
    }

    /// Idempotent: cancelling an already-stopped monitor is a no-op.
    pub async fn stop(&self, smart_cheque_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(cancel) = monitors.remove(smart_cheque_id) {
            cancel.cancel();
            self.total_stopped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (_, cancel) in monitors.drain() {
            cancel.cancel();
            self.total_stopped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    pub async fn get_monitoring_stats(&self) -> MonitoringStats {
        let monitors = self.monitors.read().await;
        MonitoringStats {
            active: monitors.len(),
            total_started: self.total_started.load(std::sync::atomic::Ordering::Relaxed),
            total_stopped: self.total_stopped.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::mock::InMemoryEventBus;
    use crate::ledger::mock::MockLedgerDriver;
    use crate::repository::mock::InMemoryRepositories;
    use crate::types::{Currency, Milestone};

    fn seeded() -> (Arc<EscrowController>, String) {
        let (repos, repositories) = InMemoryRepositories::bundle();
        let ledger: Arc<dyn LedgerDriver> = Arc::new(MockLedgerDriver::new());
        let events = Arc::new(InMemoryEventBus::new());

        let m1 = Milestone::new("design", Some(Decimal::new(400, 0)));
        let m2 = Milestone::new("build", Some(Decimal::new(600, 0)));
        let smart_cheque = SmartCheque::new("rPayer", "rPayee", Decimal::new(1_000, 0), Currency::Xrp, vec![m1, m2], "contract-hash-1");
        let id = smart_cheque.id.clone();
        repos.smart_cheques.insert(id.clone(), smart_cheque);

        (EscrowController::new(Arc::new(repositories), ledger, events), id)
    }

    #[tokio::test]
    async fn create_escrow_locks_smart_cheque_and_stamps_milestones() {
        let (controller, id) = seeded();
        let updated = controller.create_escrow_for_smart_cheque(&id, "rPayer", "rPayee").await.unwrap();
        assert_eq!(updated.status, SmartChequeStatus::Locked);
        assert!(updated.escrow_address.is_some());
        assert!(updated.milestones.iter().all(|m| m.offer_sequence.is_some()));
    }

    #[tokio::test]
    async fn completing_all_milestones_marks_smart_cheque_completed() {
        let (controller, id) = seeded();
        let updated = controller.create_escrow_for_smart_cheque(&id, "rPayer", "rPayee").await.unwrap();
        let milestone_ids: Vec<String> = updated.milestones.iter().map(|m| m.id.clone()).collect();

        for milestone_id in &milestone_ids {
            controller.complete_milestone_payment(&id, milestone_id).await.unwrap();
        }

        let repositories = controller.repositories.clone();
        let final_state = repositories.smart_cheques.get_smart_cheque(&id).await.unwrap();
        assert_eq!(final_state.status, SmartChequeStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_without_escrow_is_rejected() {
        let (controller, id) = seeded();
        let err = controller.cancel_smart_cheque_escrow(&id, "breach", "no delivery").await;
        assert!(matches!(err, Err(SmartChequeError::Escrow(EscrowError::NoEscrow(_)))));
    }

    #[tokio::test]
    async fn partial_refund_requires_at_least_one_completed_milestone() {
        let (controller, id) = seeded();
        controller.create_escrow_for_smart_cheque(&id, "rPayer", "rPayee").await.unwrap();
        let err = controller.partial_refund_escrow(&id, Decimal::new(50, 0)).await;
        assert!(matches!(err, Err(SmartChequeError::Escrow(EscrowError::NoCompletedMilestones(_)))));
    }
}
