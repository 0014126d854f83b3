//! End-to-end scenarios exercising the seed cases against in-memory fakes:
//! happy-path release, authorization tiering, auto-approval, time-lock,
//! batch fee optimization, reconciliation severity, and partial refund.

use rust_decimal::Decimal;
use smartcheque_core::authorization::AuthorizationEngine;
use smartcheque_core::config::{AuthorizationConfig, ReconciliationConfig};
use smartcheque_core::escrow::EscrowController;
use smartcheque_core::events::mock::InMemoryEventBus;
use smartcheque_core::ledger::mock::MockLedgerDriver;
use smartcheque_core::ledger::LedgerDriver;
use smartcheque_core::queue::fee::FeeCalculator;
use smartcheque_core::reconciliation::{ReconciliationEngine, ReconciliationRequest};
use smartcheque_core::repository::mock::InMemoryRepositories;
use smartcheque_core::types::{AuthorizationStatus, Currency, DiscrepancySeverity, Milestone, SmartCheque, SmartChequeStatus, Transaction, TransactionPriority, TransactionType};
use std::sync::Arc;

fn fixture() -> (Arc<InMemoryRepositories>, smartcheque_core::repository::Repositories, Arc<dyn LedgerDriver>, Arc<InMemoryEventBus>) {
    let (repos, repositories) = InMemoryRepositories::bundle();
    let ledger: Arc<dyn LedgerDriver> = Arc::new(MockLedgerDriver::new());
    let events = Arc::new(InMemoryEventBus::new());
    (repos, repositories, ledger, events)
}

/// Scenario 1: happy path — a single-milestone SmartCheque is escrowed,
/// the milestone is verified, and the SmartCheque reaches `completed`.
#[tokio::test]
async fn happy_path_milestone_release() {
    let (repos, repositories, ledger, events) = fixture();
    let repositories = Arc::new(repositories);

    let milestone = Milestone::new("deliver v1", Some(Decimal::new(1_000, 0)));
    let smart_cheque = SmartCheque::new("rPayer", "rPayee", Decimal::new(1_000, 0), Currency::Xrp, vec![milestone], "contract-hash-1");
    let id = smart_cheque.id.clone();
    repos.smart_cheques.insert(id.clone(), smart_cheque);

    let controller = EscrowController::new(repositories.clone(), ledger, events);
    let locked = controller.create_escrow_for_smart_cheque(&id, "rPayer", "rPayee").await.unwrap();
    assert_eq!(locked.status, SmartChequeStatus::Locked);

    let milestone_id = locked.milestones[0].id.clone();
    let completed = controller.complete_milestone_payment(&id, &milestone_id).await.unwrap();
    assert_eq!(completed.status, SmartChequeStatus::Completed);
    assert!(completed.milestones[0].is_verified());
}

/// Scenario 2: authorization tiering — required approvals scale with
/// amount, independent of auto-approval or time-lock policy.
#[tokio::test]
async fn authorization_tiering_scales_with_amount() {
    let (_repos, repositories, _ledger, events) = fixture();
    let engine = AuthorizationEngine::new(AuthorizationConfig::default(), Arc::new(repositories), events);

    let low = engine.create_authorization("sc-1", "ms-1", "ent-1", Decimal::new(2_000, 0), Currency::Xrp).await.unwrap();
    assert_eq!(low.required_approvals, 1);

    let medium = engine.create_authorization("sc-1", "ms-2", "ent-1", Decimal::new(30_000, 0), Currency::Xrp).await.unwrap();
    assert_eq!(medium.required_approvals, 2);

    let high = engine.create_authorization("sc-1", "ms-3", "ent-1", Decimal::new(120_000, 0), Currency::Xrp).await.unwrap();
    assert_eq!(high.required_approvals, 3);
}

/// Scenario 3: auto-approval gate — only amounts at/under the
/// auto-approval threshold with low enough risk skip manual approval.
#[tokio::test]
async fn auto_approval_gate_respects_threshold_and_risk() {
    let (_repos, repositories, _ledger, events) = fixture();
    let repositories = Arc::new(repositories);
    let engine = AuthorizationEngine::new(AuthorizationConfig::default(), repositories.clone(), events.clone());

    let within_threshold = engine.create_authorization("sc-1", "ms-1", "ent-1", Decimal::new(900, 0), Currency::Xrp).await.unwrap();
    assert!(within_threshold.auto_approved);
    assert_eq!(within_threshold.status, AuthorizationStatus::Approved);

    let over_threshold = engine.create_authorization("sc-1", "ms-2", "ent-1", Decimal::new(5_000, 0), Currency::Xrp).await.unwrap();
    assert!(!over_threshold.auto_approved);
    assert_eq!(over_threshold.status, AuthorizationStatus::Pending);
}

/// Scenario 4: time-lock — amounts at/above the time-lock threshold enter
/// `time_locked` with a future expiry rather than `pending`.
#[tokio::test]
async fn large_amount_enters_time_lock() {
    let (_repos, repositories, _ledger, events) = fixture();
    let engine = AuthorizationEngine::new(AuthorizationConfig::default(), Arc::new(repositories), events);

    let auth = engine.create_authorization("sc-1", "ms-1", "ent-1", Decimal::new(75_000, 0), Currency::Xrp).await.unwrap();
    assert_eq!(auth.status, AuthorizationStatus::TimeLocked);
    assert!(auth.time_locked);
    assert!(auth.time_lock_expires_at.unwrap() > chrono::Utc::now());
}

/// Scenario 5: batch fee optimization — batching several transactions of
/// the same priority costs strictly less than paying each fee individually.
#[test]
fn batch_fee_optimization_reduces_total_cost() {
    let calculator = FeeCalculator::default();
    let transactions: Vec<Transaction> = (0..5)
        .map(|_| {
            Transaction::new(
                TransactionType::EscrowFinish,
                "rFrom",
                "rTo",
                Decimal::new(100, 0),
                Currency::Xrp,
                "ent-1",
                "user-1",
                TransactionPriority::Normal,
            )
        })
        .collect();

    let (total, optimized, savings) = calculator.batch_fees(&transactions);
    assert!(optimized < total);
    assert!(savings > Decimal::ZERO);
}

/// Scenario 6: reconciliation severity — divergence beyond the critical
/// percentage/absolute thresholds is classified `critical` and alerted.
#[tokio::test]
async fn reconciliation_classifies_large_divergence_as_critical() {
    let (repos, repositories, _ledger, events) = fixture();
    repos.set_internal_balance("acme-corp", Currency::Xrp, Decimal::new(50_000, 0)).await;
    repos.set_ledger_balance("acme-corp", Currency::Xrp, Decimal::new(40_000, 0)).await;

    let engine = ReconciliationEngine::new(ReconciliationConfig::default(), Arc::new(repositories), events.clone());
    let (summary, discrepancies) = engine.perform_reconciliation(ReconciliationRequest::default()).await.unwrap();

    assert_eq!(summary.discrepancies_found, 1);
    assert_eq!(discrepancies[0].severity, DiscrepancySeverity::Critical);
    assert_eq!(events.count_of_type("reconciliation.discrepancy.alert").await, 1);
}

/// Scenario 7: partial refund — refunding a percentage of a SmartCheque
/// with at least one (but not all) verified milestones computes the
/// expected pro-rated amount and moves the SmartCheque to `disputed`.
#[tokio::test]
async fn partial_refund_after_one_of_two_milestones_completed() {
    let (repos, repositories, ledger, events) = fixture();
    let repositories = Arc::new(repositories);

    let m1 = Milestone::new("design", Some(Decimal::new(400, 0)));
    let m2 = Milestone::new("build", Some(Decimal::new(600, 0)));
    let smart_cheque = SmartCheque::new("rPayer", "rPayee", Decimal::new(1_000, 0), Currency::Xrp, vec![m1, m2], "contract-hash-1");
    let id = smart_cheque.id.clone();
    repos.smart_cheques.insert(id.clone(), smart_cheque);

    let controller = EscrowController::new(repositories.clone(), ledger, events);
    let locked = controller.create_escrow_for_smart_cheque(&id, "rPayer", "rPayee").await.unwrap();
    let first_milestone_id = locked.milestones[0].id.clone();
    controller.complete_milestone_payment(&id, &first_milestone_id).await.unwrap();

    let (disputed, refund) = controller.partial_refund_escrow(&id, Decimal::new(30, 0)).await.unwrap();
    assert_eq!(disputed.status, SmartChequeStatus::Disputed);
    assert_eq!(refund, Decimal::new(1_000, 0) * Decimal::new(30, 0) / Decimal::new(100, 0));
}
