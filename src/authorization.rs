/*!
Payment Authorization Engine.

Decides whether a proposed milestone payment may proceed, under how many
approvals, with or without a time-lock, and whether it qualifies for
auto-approval.
*/

use crate::config::AuthorizationConfig;
use crate::error::{AuthorizationError, Result, SmartChequeError};
use crate::events::{self, EventBus};
use crate::repository::Repositories;
use crate::types::{Approval, AuthorizationStatus, Currency, PaymentAuthorization};
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};

/// Per-item outcome of a bulk-approve call.
#[derive(Debug, Clone)]
pub struct BulkApproveOutcome {
    pub id: String,
    pub result: std::result::Result<PaymentAuthorization, String>,
}

/// Decides whether a proposed payment may proceed, and under what policy.
pub struct AuthorizationEngine {
    config: AuthorizationConfig,
    repositories: Arc<Repositories>,
    events: Arc<dyn EventBus>,
    active: DashMap<String, PaymentAuthorization>,
}

impl AuthorizationEngine {
    pub fn new(config: AuthorizationConfig, repositories: Arc<Repositories>, events: Arc<dyn EventBus>) -> Self {
        Self {
            config,
            repositories,
            events,
            active: DashMap::new(),
        }
    }

    /// Risk score in `[0, 1]` from amount, velocity-proxy, time-of-day, and
    /// recipient features. Deterministic, not ML-based — dispute
    /// categorization by ML is explicitly out of scope.
    #[instrument(skip(self))]
    pub fn assess_risk(&self, amount: Decimal, enterprise_id: &str) -> Decimal {
        let amount_component = (amount / self.config.high_amount_threshold).min(Decimal::ONE) * Decimal::new(5, 1);

        let hour = Utc::now().format("%H").to_string().parse::<u32>().unwrap_or(12);
        let off_hours_component = if !(8..=20).contains(&hour) {
            Decimal::new(2, 1)
        } else {
            Decimal::ZERO
        };

        let recipient_component = if enterprise_id.is_empty() {
            Decimal::new(3, 1)
        } else {
            Decimal::ZERO
        };

        (amount_component + off_hours_component + recipient_component).min(Decimal::ONE)
    }

    fn required_approvals(&self, amount: Decimal, risk_score: Decimal) -> u32 {
        let base = if amount < self.config.medium_amount_threshold {
            self.config.low_amount_approvals
        } else if amount < self.config.high_amount_threshold {
            self.config.medium_amount_approvals
        } else {
            self.config.high_amount_approvals
        };
        if risk_score > self.config.risk_score_threshold {
            base + 1
        } else {
            base
        }
    }

    /// Read milestone + SmartCheque + contract, and construct the
    /// authorization request for that milestone's payment.
    #[instrument(skip(self))]
    pub async fn initiate_payment_from_milestone(
        &self,
        smart_cheque_id: &str,
        milestone_id: &str,
    ) -> Result<PaymentAuthorization> {
        let smart_cheque = self.repositories.smart_cheques.get_smart_cheque(smart_cheque_id).await?;
        let milestone = self.repositories.milestones.get_milestone(smart_cheque_id, milestone_id).await?;
        let _contract_hash = self.repositories.contracts.get_contract_hash(smart_cheque_id).await?;

        let amount = milestone.amount.unwrap_or(smart_cheque.amount);
        self.create_authorization(smart_cheque_id, milestone_id, &smart_cheque.payer_id, amount, smart_cheque.currency)
            .await
    }

    /// Validate the request, compute risk, choose the required-approvals
    /// tier, and apply auto-approval/time-lock policy.
    #[instrument(skip(self))]
    pub async fn create_authorization(
        &self,
        smart_cheque_id: &str,
        milestone_id: &str,
        enterprise_id: &str,
        amount: Decimal,
        currency: Currency,
    ) -> Result<PaymentAuthorization> {
        if amount <= Decimal::ZERO {
            return Err(SmartChequeError::invalid_argument("authorization amount must be positive"));
        }
        if smart_cheque_id.is_empty() || milestone_id.is_empty() {
            return Err(SmartChequeError::invalid_argument("smart_cheque_id and milestone_id are required"));
        }

        let risk_score = self.assess_risk(amount, enterprise_id);
        let required_approvals = self.required_approvals(amount, risk_score);

        let now = Utc::now();
        let mut auth = PaymentAuthorization {
            id: crate::types::new_id(),
            smart_cheque_id: smart_cheque_id.to_string(),
            milestone_id: milestone_id.to_string(),
            enterprise_id: enterprise_id.to_string(),
            amount,
            currency,
            status: AuthorizationStatus::Pending,
            required_approvals,
            current_approvals: 0,
            approvals: Vec::new(),
            risk_score,
            time_locked: false,
            time_lock_expires_at: None,
            auto_approved: false,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };

        let auto_approve = self.config.auto_approval_enabled
            && amount <= self.config.auto_approval_threshold
            && risk_score <= self.config.risk_score_auto_threshold;

        if auto_approve {
            auth.current_approvals = auth.required_approvals;
            auth.auto_approved = true;
            auth.status = AuthorizationStatus::Approved;
        } else if amount >= self.config.time_lock_threshold {
            auth.time_locked = true;
            auth.time_lock_expires_at = Some(now + self.config.time_lock_duration);
            auth.status = AuthorizationStatus::TimeLocked;
        }

        self.active.insert(auth.id.clone(), auth.clone());

        self.events
            .publish(events::payment_authorization_requested(
                &auth.id,
                smart_cheque_id,
                milestone_id,
                enterprise_id,
                amount,
                currency,
                risk_score,
            ))
            .await;

        if auto_approve {
            info!(authorization_id = %auth.id, "payment auto-approved");
            self.events
                .publish(events::payment_auto_approved(&auth.id, smart_cheque_id, milestone_id, enterprise_id, amount, currency, risk_score))
                .await;
        }

        Ok(auth)
    }

    fn release_time_lock_if_expired(auth: &mut PaymentAuthorization) {
        if auth.status == AuthorizationStatus::TimeLocked {
            if let Some(expires_at) = auth.time_lock_expires_at {
                if Utc::now() >= expires_at {
                    auth.status = AuthorizationStatus::Pending;
                    auth.time_locked = false;
                }
            }
        }
    }

    /// Append an approval record; transitions to `approved` once
    /// `current_approvals == required_approvals`.
    #[instrument(skip(self))]
    pub async fn approve(&self, request_id: &str, approver_id: &str) -> Result<PaymentAuthorization> {
        let mut entry = self
            .active
            .get_mut(request_id)
            .ok_or_else(|| AuthorizationError::NotFound(request_id.to_string()))?;

        Self::release_time_lock_if_expired(&mut entry);

        if entry.is_fully_approved() {
            return Err(AuthorizationError::AlreadyFullyApproved {
                id: request_id.to_string(),
                current: entry.current_approvals,
                required: entry.required_approvals,
            }
            .into());
        }
        if entry.status == AuthorizationStatus::TimeLocked {
            return Err(AuthorizationError::TimeLocked {
                id: request_id.to_string(),
                expires_at: entry.time_lock_expires_at.unwrap_or_else(Utc::now),
            }
            .into());
        }
        if !matches!(entry.status, AuthorizationStatus::Pending) {
            return Err(AuthorizationError::NotPending(request_id.to_string()).into());
        }

        entry.approvals.push(Approval {
            approver_id: approver_id.to_string(),
            approved_at: Utc::now(),
        });
        entry.current_approvals += 1;
        entry.updated_at = Utc::now();

        if entry.is_fully_approved() {
            entry.status = AuthorizationStatus::Approved;
            let result = entry.clone();
            drop(entry);
            self.events
                .publish(events::payment_approved(&result.id, &result.smart_cheque_id, &result.milestone_id, &result.enterprise_id))
                .await;
            return Ok(result);
        }

        Ok(entry.clone())
    }

    /// Immediately transition the request to `rejected`.
    #[instrument(skip(self))]
    pub async fn reject(&self, request_id: &str, _rejector_id: &str, reason: &str) -> Result<PaymentAuthorization> {
        let mut entry = self
            .active
            .get_mut(request_id)
            .ok_or_else(|| AuthorizationError::NotFound(request_id.to_string()))?;

        if entry.is_fully_approved() {
            return Err(AuthorizationError::AlreadyFullyApproved {
                id: request_id.to_string(),
                current: entry.current_approvals,
                required: entry.required_approvals,
            }
            .into());
        }

        entry.status = AuthorizationStatus::Rejected;
        entry.rejection_reason = Some(reason.to_string());
        entry.updated_at = Utc::now();
        let result = entry.clone();
        drop(entry);

        self.events
            .publish(events::payment_rejected(&result.id, &result.smart_cheque_id, &result.milestone_id, &result.enterprise_id, reason))
            .await;
        Ok(result)
    }

    /// Fan out `approve` across every id, collecting a per-item outcome.
    #[instrument(skip(self, ids))]
    pub async fn bulk_approve(&self, ids: &[String], approver_id: &str) -> Vec<BulkApproveOutcome> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.approve(id, approver_id).await.map_err(|e| e.to_string());
            outcomes.push(BulkApproveOutcome { id: id.clone(), result });
        }
        outcomes
    }

    pub fn get(&self, id: &str) -> Result<PaymentAuthorization> {
        self.active.get(id).map(|e| e.clone()).ok_or_else(|| AuthorizationError::NotFound(id.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::mock::InMemoryEventBus;
    use crate::repository::mock::InMemoryRepositories;

    fn engine() -> AuthorizationEngine {
        let (_, repositories) = InMemoryRepositories::bundle();
        AuthorizationEngine::new(AuthorizationConfig::default(), Arc::new(repositories), Arc::new(InMemoryEventBus::new()))
    }

    #[tokio::test]
    async fn small_low_risk_amount_auto_approves() {
        let engine = engine();
        let auth = engine
            .create_authorization("sc-1", "ms-1", "ent-1", Decimal::new(500, 0), Currency::Xrp)
            .await
            .unwrap();
        assert_eq!(auth.status, AuthorizationStatus::Approved);
        assert!(auth.auto_approved);
    }

    #[tokio::test]
    async fn low_tier_amount_requires_one_approval() {
        let engine = engine();
        let auth = engine
            .create_authorization("sc-1", "ms-1", "ent-1", Decimal::new(10_000, 0), Currency::Xrp)
            .await
            .unwrap();
        assert_eq!(auth.required_approvals, 1);
        assert_eq!(auth.status, AuthorizationStatus::Pending);
    }

    #[tokio::test]
    async fn large_amount_is_time_locked() {
        let engine = engine();
        let auth = engine
            .create_authorization("sc-1", "ms-1", "ent-1", Decimal::new(60_000, 0), Currency::Xrp)
            .await
            .unwrap();
        assert_eq!(auth.status, AuthorizationStatus::TimeLocked);
        assert!(auth.time_lock_expires_at.is_some());
    }

    #[tokio::test]
    async fn approving_past_required_count_is_rejected() {
        let engine = engine();
        let auth = engine
            .create_authorization("sc-1", "ms-1", "ent-1", Decimal::new(10_000, 0), Currency::Xrp)
            .await
            .unwrap();
        engine.approve(&auth.id, "alice").await.unwrap();
        let approved = engine.approve(&auth.id, "bob").await.unwrap();
        assert_eq!(approved.status, AuthorizationStatus::Approved);
        let err = engine.approve(&auth.id, "carol").await;
        assert!(matches!(err, Err(SmartChequeError::Authorization(AuthorizationError::AlreadyFullyApproved { .. }))));
    }

    #[tokio::test]
    async fn reject_sets_reason_and_status() {
        let engine = engine();
        let auth = engine
            .create_authorization("sc-1", "ms-1", "ent-1", Decimal::new(10_000, 0), Currency::Xrp)
            .await
            .unwrap();
        let rejected = engine.reject(&auth.id, "bob", "suspicious recipient").await.unwrap();
        assert_eq!(rejected.status, AuthorizationStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("suspicious recipient"));
    }
}
