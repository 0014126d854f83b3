/*!
Event bus capability: fire-and-forget publish of typed events.

The bus itself is an external collaborator (out of scope per the top-level
design); this module defines the trait call sites depend on plus typed
constructor functions for every required event family so a caller can't
typo a field name or event type string.
*/

use crate::types::{Currency, Event, Utc};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;

/// Capability for publishing typed events. Implementations are expected to
/// be fire-and-forget: publish failures are logged by the caller and never
/// block a primary state transition.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event);
}

fn data(pairs: Vec<(&str, serde_json::Value)>) -> HashMap<String, serde_json::Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn event(event_type: &str, source: &str, data: HashMap<String, serde_json::Value>) -> Event {
    Event {
        event_type: event_type.to_string(),
        source: source.to_string(),
        timestamp: Utc::now(),
        data,
    }
}

pub fn transaction_queued(
    transaction_id: &str,
    tx_type: &str,
    status: &str,
    enterprise_id: &str,
    user_id: &str,
    amount: Decimal,
    currency: Currency,
    batch_id: Option<&str>,
) -> Event {
    event(
        "transaction_queued",
        "queue",
        data(vec![
            ("transaction_id", json!(transaction_id)),
            ("type", json!(tx_type)),
            ("status", json!(status)),
            ("enterprise_id", json!(enterprise_id)),
            ("user_id", json!(user_id)),
            ("amount", json!(amount.to_string())),
            ("currency", json!(currency.to_string())),
            ("batch_id", json!(batch_id)),
        ]),
    )
}

pub fn transaction_confirmed(
    transaction_id: &str,
    tx_type: &str,
    enterprise_id: &str,
    user_id: &str,
    amount: Decimal,
    currency: Currency,
    batch_id: Option<&str>,
) -> Event {
    event(
        "transaction_confirmed",
        "queue",
        data(vec![
            ("transaction_id", json!(transaction_id)),
            ("type", json!(tx_type)),
            ("status", json!("confirmed")),
            ("enterprise_id", json!(enterprise_id)),
            ("user_id", json!(user_id)),
            ("amount", json!(amount.to_string())),
            ("currency", json!(currency.to_string())),
            ("batch_id", json!(batch_id)),
        ]),
    )
}

pub fn transaction_failed(
    transaction_id: &str,
    tx_type: &str,
    enterprise_id: &str,
    user_id: &str,
    amount: Decimal,
    currency: Currency,
    batch_id: Option<&str>,
) -> Event {
    event(
        "transaction_failed",
        "queue",
        data(vec![
            ("transaction_id", json!(transaction_id)),
            ("type", json!(tx_type)),
            ("status", json!("failed")),
            ("enterprise_id", json!(enterprise_id)),
            ("user_id", json!(user_id)),
            ("amount", json!(amount.to_string())),
            ("currency", json!(currency.to_string())),
            ("batch_id", json!(batch_id)),
        ]),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn batch_completed(
    batch_id: &str,
    status: &str,
    transaction_count: usize,
    success_count: u32,
    failure_count: u32,
    total_fee: Decimal,
    optimized_fee: Decimal,
    fee_savings: Decimal,
) -> Event {
    event(
        "batch_completed",
        "batcher",
        data(vec![
            ("batch_id", json!(batch_id)),
            ("status", json!(status)),
            ("transaction_count", json!(transaction_count)),
            ("success_count", json!(success_count)),
            ("failure_count", json!(failure_count)),
            ("total_fee", json!(total_fee.to_string())),
            ("optimized_fee", json!(optimized_fee.to_string())),
            ("fee_savings", json!(fee_savings.to_string())),
        ]),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn payment_authorization_requested(
    request_id: &str,
    smart_cheque_id: &str,
    milestone_id: &str,
    enterprise_id: &str,
    amount: Decimal,
    currency: Currency,
    risk_score: Decimal,
) -> Event {
    event(
        "payment.authorization_requested",
        "authorization",
        data(vec![
            ("request_id", json!(request_id)),
            ("smart_check_id", json!(smart_cheque_id)),
            ("milestone_id", json!(milestone_id)),
            ("enterprise_id", json!(enterprise_id)),
            ("amount", json!(amount.to_string())),
            ("currency", json!(currency.to_string())),
            ("risk_score", json!(risk_score.to_string())),
        ]),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn payment_auto_approved(
    request_id: &str,
    smart_cheque_id: &str,
    milestone_id: &str,
    enterprise_id: &str,
    amount: Decimal,
    currency: Currency,
    risk_score: Decimal,
) -> Event {
    event(
        "payment.auto_approved",
        "authorization",
        data(vec![
            ("request_id", json!(request_id)),
            ("smart_check_id", json!(smart_cheque_id)),
            ("milestone_id", json!(milestone_id)),
            ("enterprise_id", json!(enterprise_id)),
            ("amount", json!(amount.to_string())),
            ("currency", json!(currency.to_string())),
            ("risk_score", json!(risk_score.to_string())),
            ("auto_approved", json!(true)),
        ]),
    )
}

pub fn payment_approved(request_id: &str, smart_cheque_id: &str, milestone_id: &str, enterprise_id: &str) -> Event {
    event(
        "payment.approved",
        "authorization",
        data(vec![
            ("request_id", json!(request_id)),
            ("smart_check_id", json!(smart_cheque_id)),
            ("milestone_id", json!(milestone_id)),
            ("enterprise_id", json!(enterprise_id)),
        ]),
    )
}

pub fn payment_rejected(
    request_id: &str,
    smart_cheque_id: &str,
    milestone_id: &str,
    enterprise_id: &str,
    reason: &str,
) -> Event {
    event(
        "payment.rejected",
        "authorization",
        data(vec![
            ("request_id", json!(request_id)),
            ("smart_check_id", json!(smart_cheque_id)),
            ("milestone_id", json!(milestone_id)),
            ("enterprise_id", json!(enterprise_id)),
            ("reason", json!(reason)),
        ]),
    )
}

pub fn execution_started(execution_id: &str, payment_request_id: &str, status: &str) -> Event {
    event(
        "payment.execution.started",
        "execution",
        data(vec![
            ("execution_id", json!(execution_id)),
            ("payment_request_id", json!(payment_request_id)),
            ("status", json!(status)),
        ]),
    )
}

pub fn execution_cancelled(execution_id: &str, payment_request_id: &str) -> Event {
    event(
        "payment.execution.cancelled",
        "execution",
        data(vec![
            ("execution_id", json!(execution_id)),
            ("payment_request_id", json!(payment_request_id)),
            ("status", json!("cancelled")),
        ]),
    )
}

pub fn payment_confirmed(execution_id: &str, payment_request_id: &str, transaction_id: Option<&str>) -> Event {
    event(
        "payment.confirmed",
        "confirmation",
        data(vec![
            ("execution_id", json!(execution_id)),
            ("payment_request_id", json!(payment_request_id)),
            ("transaction_id", json!(transaction_id)),
            ("status", json!("confirmed")),
        ]),
    )
}

pub fn confirmation_started(transaction_id: &str, payment_execution_id: &str, required_confirmations: u32) -> Event {
    event(
        "payment.confirmation.started",
        "confirmation",
        data(vec![
            ("transaction_id", json!(transaction_id)),
            ("payment_execution_id", json!(payment_execution_id)),
            ("required_confirmations", json!(required_confirmations)),
        ]),
    )
}

pub fn escrow_created(smart_cheque_id: &str, milestone_id: &str, offer_sequence: u32) -> Event {
    event(
        "escrow.created",
        "escrow",
        data(vec![
            ("smart_cheque_id", json!(smart_cheque_id)),
            ("milestone_id", json!(milestone_id)),
            ("offer_sequence", json!(offer_sequence)),
        ]),
    )
}

pub fn escrow_finished(smart_cheque_id: &str, milestone_id: &str) -> Event {
    event(
        "escrow.finished",
        "escrow",
        data(vec![
            ("smart_cheque_id", json!(smart_cheque_id)),
            ("milestone_id", json!(milestone_id)),
        ]),
    )
}

pub fn escrow_cancelled(smart_cheque_id: &str, refund_amount: Decimal, reason: &str) -> Event {
    event(
        "escrow.cancelled",
        "escrow",
        data(vec![
            ("smart_cheque_id", json!(smart_cheque_id)),
            ("refund_amount", json!(refund_amount.to_string())),
            ("reason", json!(reason)),
        ]),
    )
}

pub fn escrow_partially_refunded(smart_cheque_id: &str, refund_amount: Decimal, percentage: Decimal) -> Event {
    event(
        "escrow.partially_refunded",
        "escrow",
        data(vec![
            ("smart_cheque_id", json!(smart_cheque_id)),
            ("refund_amount", json!(refund_amount.to_string())),
            ("percentage", json!(percentage.to_string())),
        ]),
    )
}

pub fn reconciliation_completed(discrepancy_count: usize, enterprise_count: usize) -> Event {
    event(
        "reconciliation.completed",
        "reconciliation",
        data(vec![
            ("discrepancy_count", json!(discrepancy_count)),
            ("enterprise_count", json!(enterprise_count)),
        ]),
    )
}

pub fn reconciliation_discrepancy_alert(discrepancy_id: &str, severity: &str, amount: Decimal) -> Event {
    event(
        "reconciliation.discrepancy.alert",
        "reconciliation",
        data(vec![
            ("discrepancy_id", json!(discrepancy_id)),
            ("severity", json!(severity)),
            ("amount", json!(amount.to_string())),
        ]),
    )
}

pub fn reconciliation_discrepancy_resolved(discrepancy_id: &str, resolution: &str) -> Event {
    event(
        "reconciliation.discrepancy.resolved",
        "reconciliation",
        data(vec![
            ("discrepancy_id", json!(discrepancy_id)),
            ("resolution", json!(resolution)),
        ]),
    )
}

pub fn reconciliation_manual_performed(enterprise_count: usize, currency_count: usize) -> Event {
    event(
        "reconciliation.manual.performed",
        "reconciliation",
        data(vec![
            ("enterprise_count", json!(enterprise_count)),
            ("currency_count", json!(currency_count)),
        ]),
    )
}

/// In-memory event bus used by tests and standalone demos.
pub mod mock {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryEventBus {
        published: Mutex<Vec<Event>>,
    }

    impl InMemoryEventBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn events(&self) -> Vec<Event> {
            self.published.lock().await.clone()
        }

        pub async fn count_of_type(&self, event_type: &str) -> usize {
            self.published
                .lock()
                .await
                .iter()
                .filter(|e| e.event_type == event_type)
                .count()
        }
    }

    #[async_trait]
    impl EventBus for InMemoryEventBus {
        async fn publish(&self, event: Event) {
            tracing::debug!(event_type = %event.event_type, "publishing event");
            self.published.lock().await.push(event);
        }
    }
}
