/*!
Payment Execution Engine.

Given an approved authorization, drives a deterministic, resumable
four-step sequence (`validation`, `fulfillment_generation`, `ledger_submit`,
`confirmation`) that culminates in submission of an escrow-finish
transaction and a handoff to the Confirmation Tracker.
*/

use crate::authorization::AuthorizationEngine;
use crate::config::ExecutionConfig;
use crate::error::{AuthorizationError, ExecutionError, Result, SmartChequeError};
use crate::events::{self, EventBus};
use crate::ledger::{FinishEscrowRequest, LedgerDriver};
use crate::repository::Repositories;
use crate::types::{AuthorizationStatus, ExecutionStatus, ExecutionStep, PaymentExecution, StepStatus, StepType};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

/// Narrow capability the Confirmation Tracker is injected through, so
/// `ExecutionEngine` can register a submitted transaction for monitoring
/// without owning the tracker outright.
#[async_trait]
pub trait ConfirmationRegistrar: Send + Sync {
    async fn start(&self, tx_id: &str, execution_id: &str) -> Result<()>;
}

/// Narrow capability the Confirmation Tracker calls back into once a
/// tracked transaction reaches a terminal confirmation state.
#[async_trait]
pub trait ExecutionStatusSink: Send + Sync {
    async fn mark_confirmed(&self, execution_id: &str, tx_id: &str) -> Result<()>;
    async fn mark_failed(&self, execution_id: &str, reason: &str) -> Result<()>;
}

/// Drives approved authorizations through to a submitted ledger
/// transaction, then hands confirmation off to the tracker.
pub struct ExecutionEngine {
    config: ExecutionConfig,
    authorization: Arc<AuthorizationEngine>,
    repositories: Arc<Repositories>,
    ledger: Arc<dyn LedgerDriver>,
    events: Arc<dyn EventBus>,
    confirmation: OnceCell<Arc<dyn ConfirmationRegistrar>>,
    active: DashMap<String, PaymentExecution>,
    semaphore: Arc<Semaphore>,
}

impl ExecutionEngine {
    pub fn new(
        config: ExecutionConfig,
        authorization: Arc<AuthorizationEngine>,
        repositories: Arc<Repositories>,
        ledger: Arc<dyn LedgerDriver>,
        events: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        let max_concurrent = config.max_concurrent_executions;
        Arc::new(Self {
            config,
            authorization,
            repositories,
            ledger,
            events,
            confirmation: OnceCell::new(),
            active: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        })
    }

    /// Wire the Confirmation Tracker in after both have been constructed,
    /// breaking the otherwise-circular construction order between the two
    /// engines. Calling this twice is an internal error.
    pub fn set_confirmation_registrar(&self, registrar: Arc<dyn ConfirmationRegistrar>) -> Result<()> {
        self.confirmation
            .set(registrar)
            .map_err(|_| SmartChequeError::internal("confirmation registrar already set"))
    }

    fn new_step(step_type: StepType, attempt: u32) -> ExecutionStep {
        ExecutionStep {
            step_type,
            status: StepStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            attempt,
        }
    }

    fn complete_step(step: &mut ExecutionStep) {
        step.status = StepStatus::Completed;
        step.completed_at = Some(Utc::now());
    }

    fn fail_step(step: &mut ExecutionStep, error: String) {
        step.status = StepStatus::Failed;
        step.completed_at = Some(Utc::now());
        step.error = Some(error);
    }

    /// Run authorization -> fulfillment -> ledger submit -> confirmation
    /// registration for a fresh attempt. Any step failure marks the whole
    /// execution `failed` without advancing further steps.
    #[instrument(skip(self))]
    pub async fn execute(&self, authorization_id: &str) -> Result<PaymentExecution> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| SmartChequeError::internal("execution semaphore closed"))?;

        let now = Utc::now();
        let mut execution = PaymentExecution {
            id: crate::types::new_id(),
            authorization_id: authorization_id.to_string(),
            status: ExecutionStatus::Processing,
            steps: Vec::new(),
            attempts: 1,
            transaction_id: None,
            fulfillment: None,
            last_error: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.events
            .publish(events::execution_started(&execution.id, authorization_id, "processing"))
            .await;

        if let Err(err) = self.run_attempt(&mut execution).await {
            execution.status = ExecutionStatus::Failed;
            execution.last_error = Some(err.to_string());
            self.active.insert(execution.id.clone(), execution.clone());
            return Ok(execution);
        }

        self.active.insert(execution.id.clone(), execution.clone());
        Ok(execution)
    }

    /// Bounded-concurrency fan-out of `execute`, fully joined before return
    /// so `pending == 0` always holds on return.
    #[instrument(skip(self, authorization_ids))]
    pub async fn execute_bulk(&self, authorization_ids: &[String]) -> Vec<(String, Result<PaymentExecution>)> {
        let mut futures = FuturesUnordered::new();
        for id in authorization_ids {
            let id = id.clone();
            futures.push(async move { (id.clone(), self.execute(&id).await) });
        }

        let mut results = Vec::with_capacity(authorization_ids.len());
        while let Some(outcome) = futures.next().await {
            results.push(outcome);
        }
        results
    }

    async fn run_attempt(&self, execution: &mut PaymentExecution) -> Result<()> {
        // Step 1: validation — require the authorization to be approved.
        let mut step = Self::new_step(StepType::Validation, execution.attempts);
        let auth = self.authorization.get(&execution.authorization_id);
        let auth = match auth {
            Ok(auth) if auth.status == AuthorizationStatus::Approved => {
                Self::complete_step(&mut step);
                execution.steps.push(step);
                auth
            }
            Ok(_) => {
                let err = ExecutionError::AuthorizationNotApproved(execution.authorization_id.clone());
                Self::fail_step(&mut step, err.to_string());
                execution.steps.push(step);
                return Err(err.into());
            }
            Err(err) => {
                Self::fail_step(&mut step, err.to_string());
                execution.steps.push(step);
                return Err(AuthorizationError::NotFound(execution.authorization_id.clone()).into());
            }
        };

        // Step 2: fulfillment_generation — read the condition/fulfillment
        // material persisted when the escrow was created.
        let mut step = Self::new_step(StepType::FulfillmentGeneration, execution.attempts);
        let milestone = self.repositories.milestones.get_milestone(&auth.smart_cheque_id, &auth.milestone_id).await;
        let milestone = match milestone {
            Ok(m) if m.condition.is_some() && m.fulfillment.is_some() && m.offer_sequence.is_some() => {
                Self::complete_step(&mut step);
                execution.steps.push(step);
                execution.fulfillment = m.fulfillment.clone();
                m
            }
            Ok(_) => {
                let err = ExecutionError::StepFailed("fulfillment_generation", "milestone has no escrow condition material".into());
                Self::fail_step(&mut step, err.to_string());
                execution.steps.push(step);
                return Err(err.into());
            }
            Err(err) => {
                Self::fail_step(&mut step, err.to_string());
                execution.steps.push(step);
                return Err(err);
            }
        };

        // Step 3: ledger_submit — submit the escrow-finish transaction.
        let mut step = Self::new_step(StepType::LedgerSubmit, execution.attempts);
        let smart_cheque = self.repositories.smart_cheques.get_smart_cheque(&auth.smart_cheque_id).await?;
        let owner = smart_cheque.owner_address.clone().unwrap_or_else(|| smart_cheque.payer_id.clone());
        let submit = self
            .ledger
            .finish_escrow(FinishEscrowRequest {
                account: smart_cheque.payee_id.clone(),
                owner,
                offer_sequence: milestone.offer_sequence.expect("checked above"),
                condition: milestone.condition.clone().expect("checked above"),
                fulfillment: milestone.fulfillment.clone().expect("checked above"),
            })
            .await;

        let submit = match submit {
            Ok(result) => {
                Self::complete_step(&mut step);
                execution.steps.push(step);
                execution.transaction_id = Some(result.tx_id.clone());
                result
            }
            Err(err) => {
                Self::fail_step(&mut step, err.to_string());
                execution.steps.push(step);
                return Err(err);
            }
        };

        // Step 4: confirmation — hand off to the tracker; does not block.
        let mut step = Self::new_step(StepType::Confirmation, execution.attempts);
        match self.confirmation.get() {
            Some(registrar) => match registrar.start(&submit.tx_id, &execution.id).await {
                Ok(()) => {
                    execution.status = ExecutionStatus::Confirming;
                    execution.steps.push(step);
                    Ok(())
                }
                Err(err) => {
                    Self::fail_step(&mut step, err.to_string());
                    execution.steps.push(step);
                    Err(err)
                }
            },
            None => {
                let err = ExecutionError::StepFailed("confirmation", "no confirmation registrar configured".into());
                Self::fail_step(&mut step, err.to_string());
                execution.steps.push(step);
                Err(err.into())
            }
        }
    }

    /// Permitted only when `status == failed ∧ attempts < max_retries`.
    /// Sleeps `retry_delay`, then resumes from step 1 in a new attempt.
    #[instrument(skip(self))]
    pub async fn retry(&self, execution_id: &str) -> Result<PaymentExecution> {
        let mut entry = self
            .active
            .get_mut(execution_id)
            .ok_or_else(|| ExecutionError::NotFound(execution_id.to_string()))?;

        if entry.status != ExecutionStatus::Failed || entry.attempts >= self.config.retry_attempts {
            return Err(ExecutionError::RetryNotAllowed {
                id: execution_id.to_string(),
                status: format!("{:?}", entry.status),
                attempts: entry.attempts,
                max: self.config.retry_attempts,
            }
            .into());
        }

        entry.attempts += 1;
        entry.status = ExecutionStatus::Retry;
        entry.last_error = None;
        let mut execution = entry.clone();
        drop(entry);

        tokio::time::sleep(self.config.retry_delay).await;

        execution.status = ExecutionStatus::Processing;
        if let Err(err) = self.run_attempt(&mut execution).await {
            execution.status = ExecutionStatus::Failed;
            execution.last_error = Some(err.to_string());
        }
        execution.updated_at = Utc::now();
        self.active.insert(execution.id.clone(), execution.clone());
        Ok(execution)
    }

    /// Allowed only when `status ∉ {completed, failed}`.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: &str, reason: &str) -> Result<PaymentExecution> {
        let mut entry = self
            .active
            .get_mut(execution_id)
            .ok_or_else(|| ExecutionError::NotFound(execution_id.to_string()))?;

        if matches!(entry.status, ExecutionStatus::Completed | ExecutionStatus::Failed) {
            return Err(ExecutionError::CancelNotAllowed {
                id: execution_id.to_string(),
                status: format!("{:?}", entry.status),
            }
            .into());
        }

        entry.status = ExecutionStatus::Cancelled;
        entry.cancellation_reason = Some(reason.to_string());
        entry.updated_at = Utc::now();
        let result = entry.clone();
        drop(entry);

        self.events.publish(events::execution_cancelled(&result.id, &result.authorization_id)).await;
        Ok(result)
    }

    pub fn get_status(&self, execution_id: &str) -> Result<PaymentExecution> {
        self.active
            .get(execution_id)
            .map(|e| e.clone())
            .ok_or_else(|| ExecutionError::NotFound(execution_id.to_string()).into())
    }

    /// Evict executions that haven't changed in `eviction_age`, so the
    /// active map doesn't grow unbounded. Terminal state is assumed to have
    /// already been persisted by the caller before eviction.
    pub fn evict_stale(&self) -> usize {
        let cutoff = Utc::now() - self.config.eviction_age;
        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|e| e.updated_at < cutoff && matches!(e.status, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled))
            .map(|e| e.id.clone())
            .collect();
        let count = stale.len();
        for id in stale {
            self.active.remove(&id);
        }
        count
    }
}

#[async_trait]
impl ExecutionStatusSink for ExecutionEngine {
    #[instrument(skip(self))]
    async fn mark_confirmed(&self, execution_id: &str, tx_id: &str) -> Result<()> {
        let mut entry = self
            .active
            .get_mut(execution_id)
            .ok_or_else(|| ExecutionError::NotFound(execution_id.to_string()))?;

        if entry.status == ExecutionStatus::Completed {
            return Ok(());
        }

        entry.status = ExecutionStatus::Completed;
        entry.updated_at = Utc::now();
        if let Some(step) = entry.steps.iter_mut().rev().find(|s| s.step_type == StepType::Confirmation) {
            Self::complete_step(step);
        }
        let authorization_id = entry.authorization_id.clone();
        let execution_id = entry.id.clone();
        drop(entry);

        info!(%execution_id, %tx_id, "execution confirmed");
        self.events.publish(events::payment_confirmed(&execution_id, &authorization_id, Some(tx_id))).await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_failed(&self, execution_id: &str, reason: &str) -> Result<()> {
        let mut entry = self
            .active
            .get_mut(execution_id)
            .ok_or_else(|| ExecutionError::NotFound(execution_id.to_string()))?;

        if matches!(entry.status, ExecutionStatus::Completed | ExecutionStatus::Failed) {
            return Ok(());
        }

        entry.status = ExecutionStatus::Failed;
        entry.last_error = Some(reason.to_string());
        entry.updated_at = Utc::now();
        if let Some(step) = entry.steps.iter_mut().rev().find(|s| s.step_type == StepType::Confirmation) {
            Self::fail_step(step, reason.to_string());
        }
        drop(entry);

        warn!(%execution_id, %reason, "execution confirmation failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::AuthorizationEngine;
    use crate::config::AuthorizationConfig;
    use crate::events::mock::InMemoryEventBus;
    use crate::ledger::mock::MockLedgerDriver;
    use crate::repository::mock::InMemoryRepositories;
    use crate::types::{Currency, Milestone, SmartCheque};
    use rust_decimal::Decimal;

    struct AlwaysConfirms;

    #[async_trait]
    impl ConfirmationRegistrar for AlwaysConfirms {
        async fn start(&self, _tx_id: &str, _execution_id: &str) -> Result<()> {
            Ok(())
        }
    }

    async fn seeded_engine() -> (Arc<ExecutionEngine>, Arc<AuthorizationEngine>, String, String) {
        let (repos, repositories) = InMemoryRepositories::bundle();
        let repositories = Arc::new(repositories);
        let ledger: Arc<dyn LedgerDriver> = Arc::new(MockLedgerDriver::new());
        let events = Arc::new(InMemoryEventBus::new());

        let mut milestone = Milestone::new("deliver v1", Some(Decimal::new(1_000, 0)));
        milestone.condition = Some("cond-1".into());
        milestone.fulfillment = Some("fulfill-1".into());
        milestone.offer_sequence = Some(7);
        let milestone_id = milestone.id.clone();

        let mut smart_cheque = SmartCheque::new(
            "rPayer",
            "rPayee",
            Decimal::new(1_000, 0),
            Currency::Xrp,
            vec![milestone],
            "contract-hash-1",
        );
        smart_cheque.owner_address = Some("rPayer".into());
        let smart_cheque_id = smart_cheque.id.clone();
        repos.smart_cheques.insert(smart_cheque_id.clone(), smart_cheque);

        let authorization = Arc::new(AuthorizationEngine::new(AuthorizationConfig::default(), repositories.clone(), events.clone()));
        let engine = ExecutionEngine::new(ExecutionConfig::default(), authorization.clone(), repositories, ledger, events);
        engine.set_confirmation_registrar(Arc::new(AlwaysConfirms)).unwrap();

        (engine, authorization, smart_cheque_id, milestone_id)
    }

    #[tokio::test]
    async fn execute_requires_approved_authorization() {
        let (engine, authorization, smart_cheque_id, milestone_id) = seeded_engine().await;
        let auth = authorization
            .create_authorization(&smart_cheque_id, &milestone_id, "ent-1", Decimal::new(10_000, 0), Currency::Xrp)
            .await
            .unwrap();

        let execution = engine.execute(&auth.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(matches!(
            execution.last_error.as_deref(),
            Some(s) if s.contains("not approved")
        ));
    }

    #[tokio::test]
    async fn approved_authorization_reaches_confirming() {
        let (engine, authorization, smart_cheque_id, milestone_id) = seeded_engine().await;
        let auth = authorization
            .create_authorization(&smart_cheque_id, &milestone_id, "ent-1", Decimal::new(500, 0), Currency::Xrp)
            .await
            .unwrap();
        assert!(auth.auto_approved);

        let execution = engine.execute(&auth.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Confirming);
        assert_eq!(execution.steps.len(), 4);
        assert!(execution.transaction_id.is_some());
    }

    #[tokio::test]
    async fn cancel_is_rejected_once_completed() {
        let (engine, authorization, smart_cheque_id, milestone_id) = seeded_engine().await;
        let auth = authorization
            .create_authorization(&smart_cheque_id, &milestone_id, "ent-1", Decimal::new(500, 0), Currency::Xrp)
            .await
            .unwrap();
        let execution = engine.execute(&auth.id).await.unwrap();
        engine.mark_confirmed(&execution.id, "TX123").await.unwrap();

        let err = engine.cancel(&execution.id, "changed my mind").await;
        assert!(matches!(err, Err(SmartChequeError::Execution(ExecutionError::CancelNotAllowed { .. }))));
    }
}
