/*!
Metrics facade for the SmartCheque payment infrastructure.

Thin wrappers over the `metrics` crate's recording macros so call sites
name a fixed set of series instead of inventing labels ad hoc. No exporter
is wired up here (no HTTP surface per scope) — a binary embedding this
crate attaches one (e.g. a Prometheus exporter) before these calls start
producing visible series.
*/

/// Record a transaction entering the queue.
pub fn record_transaction_queued(priority: &str) {
    metrics::counter!("smartcheque_transactions_queued_total", "priority" => priority.to_string()).increment(1);
}

/// Record a transaction reaching a terminal status.
pub fn record_transaction_terminal(status: &str) {
    metrics::counter!("smartcheque_transactions_terminal_total", "status" => status.to_string()).increment(1);
}

/// Record the current depth of the processing queue.
pub fn record_queue_depth(depth: usize) {
    metrics::gauge!("smartcheque_queue_depth").set(depth as f64);
}

/// Record a batch dispatch with its realized fee savings.
pub fn record_batch_dispatched(size: usize, fee_savings: f64) {
    metrics::histogram!("smartcheque_batch_size").record(size as f64);
    metrics::histogram!("smartcheque_batch_fee_savings").record(fee_savings);
}

/// Record an authorization decision outcome.
pub fn record_authorization_decision(outcome: &str) {
    metrics::counter!("smartcheque_authorization_decisions_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record execution step latency in milliseconds.
pub fn record_execution_step_latency(step: &str, millis: f64) {
    metrics::histogram!("smartcheque_execution_step_latency_ms", "step" => step.to_string()).record(millis);
}

/// Record the number of active confirmation-tracking entries.
pub fn record_confirmation_backlog(count: usize) {
    metrics::gauge!("smartcheque_confirmation_backlog").set(count as f64);
}

/// Record a reconciliation discrepancy at a given severity.
pub fn record_discrepancy(severity: &str) {
    metrics::counter!("smartcheque_discrepancies_total", "severity" => severity.to_string()).increment(1);
}
