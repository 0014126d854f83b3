/*!
Configuration surface for the SmartCheque payment infrastructure.

One aggregate config assembled from per-subsystem config structs, matching
the names and effects enumerated for the queue/batcher, authorization,
execution, confirmation, and reconciliation subsystems.
*/

use crate::error::{Result, SmartChequeError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue and batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    pub batch_timeout_seconds: u64,
    pub max_wait_time_seconds: u64,
    pub fee_optimization_enabled: bool,
    pub max_concurrent_executions: usize,
    pub max_queue_depth: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub default_expiry: chrono::Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            min_batch_size: 3,
            batch_timeout_seconds: 30,
            max_wait_time_seconds: 2,
            fee_optimization_enabled: true,
            max_concurrent_executions: 16,
            max_queue_depth: 10_000,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            default_expiry: chrono::Duration::hours(24),
        }
    }
}

/// Authorization engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    pub low_amount_threshold: Decimal,
    pub medium_amount_threshold: Decimal,
    pub high_amount_threshold: Decimal,
    pub low_amount_approvals: u32,
    pub medium_amount_approvals: u32,
    pub high_amount_approvals: u32,
    pub auto_approval_enabled: bool,
    pub auto_approval_threshold: Decimal,
    pub risk_score_auto_threshold: Decimal,
    pub time_lock_threshold: Decimal,
    pub time_lock_duration: chrono::Duration,
    pub risk_score_threshold: Decimal,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            low_amount_threshold: Decimal::new(5_000, 0),
            medium_amount_threshold: Decimal::new(25_000, 0),
            high_amount_threshold: Decimal::new(100_000, 0),
            low_amount_approvals: 1,
            medium_amount_approvals: 2,
            high_amount_approvals: 3,
            auto_approval_enabled: true,
            auto_approval_threshold: Decimal::new(1_000, 0),
            risk_score_auto_threshold: Decimal::new(3, 1),
            time_lock_threshold: Decimal::new(50_000, 0),
            time_lock_duration: chrono::Duration::hours(24),
            risk_score_threshold: Decimal::new(7, 1),
        }
    }
}

/// Execution engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub max_concurrent_executions: usize,
    pub execution_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub monitoring_interval: Duration,
    pub confirmation_timeout: Duration,
    pub eviction_age: chrono::Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 16,
            execution_timeout: Duration::from_secs(60),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            monitoring_interval: Duration::from_secs(5),
            confirmation_timeout: Duration::from_secs(300),
            eviction_age: chrono::Duration::hours(24),
        }
    }
}

/// Confirmation tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    pub default_required_confirmations: u32,
    pub confirmation_timeout: Duration,
    pub monitoring_interval: Duration,
    pub enable_background_monitoring: bool,
    pub completed_entry_eviction: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            default_required_confirmations: 6,
            confirmation_timeout: Duration::from_secs(300),
            monitoring_interval: Duration::from_secs(5),
            enable_background_monitoring: true,
            completed_entry_eviction: Duration::from_secs(3600),
        }
    }
}

/// Reconciliation engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    pub tolerance_threshold: Decimal,
    pub critical_threshold: Decimal,
    pub auto_reconcile_interval: Duration,
    pub batch_size: usize,
    pub alert_on_discrepancy: bool,
    pub alert_threshold: Decimal,
    pub escalation_threshold: Decimal,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            tolerance_threshold: Decimal::new(1, 0),
            critical_threshold: Decimal::new(1_000, 0),
            auto_reconcile_interval: Duration::from_secs(3600),
            batch_size: 50,
            alert_on_discrepancy: true,
            alert_threshold: Decimal::new(500, 0),
            escalation_threshold: Decimal::new(5_000, 0),
        }
    }
}

/// Top-level configuration aggregating every subsystem's settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartChequeConfig {
    pub queue: QueueConfig,
    pub authorization: AuthorizationConfig,
    pub execution: ExecutionConfig,
    pub confirmation: ConfirmationConfig,
    pub reconciliation: ReconciliationConfig,
}

impl SmartChequeConfig {
    /// Load configuration from a TOML or JSON file, falling back to defaults
    /// for any field the file omits.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SmartChequeError::invalid_argument(format!("reading config {path:?}: {e}")))?;
        let config = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&content)
                .map_err(|e| SmartChequeError::invalid_argument(format!("parsing toml config: {e}")))?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    /// Sanity-check cross-field invariants the individual defaults can't express.
    pub fn validate(&self) -> Result<()> {
        if self.queue.min_batch_size == 0 || self.queue.min_batch_size > self.queue.max_batch_size {
            return Err(SmartChequeError::invalid_argument(
                "queue.min_batch_size must be in (0, max_batch_size]",
            ));
        }
        let auth = &self.authorization;
        if !(auth.low_amount_threshold < auth.medium_amount_threshold
            && auth.medium_amount_threshold < auth.high_amount_threshold)
        {
            return Err(SmartChequeError::invalid_argument(
                "authorization amount thresholds must be strictly increasing",
            ));
        }
        if self.reconciliation.tolerance_threshold < Decimal::ZERO {
            return Err(SmartChequeError::invalid_argument(
                "reconciliation.tolerance_threshold must be non-negative",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(SmartChequeConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_batch_sizes() {
        let mut config = SmartChequeConfig::default();
        config.queue.min_batch_size = 20;
        config.queue.max_batch_size = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_monotonic_authorization_tiers() {
        let mut config = SmartChequeConfig::default();
        config.authorization.medium_amount_threshold = Decimal::new(1, 0);
        assert!(config.validate().is_err());
    }
}
