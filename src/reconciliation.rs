/*!
Reconciliation Engine.

Periodically or on demand, compares internal balances against ledger
balances per enterprise and currency, classifies any divergence beyond
tolerance as a discrepancy, and produces resolution/report workflows
over the results.
*/

use crate::config::ReconciliationConfig;
use crate::error::{ReconciliationError, Result};
use crate::events::{self, EventBus};
use crate::repository::Repositories;
use crate::types::{Currency, Discrepancy, DiscrepancySeverity, DiscrepancyStatus, ResolutionType};
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Scopes a reconciliation run to a subset of enterprises/currencies;
/// `None` means "every enterprise"/"every currency for that enterprise".
#[derive(Debug, Clone, Default)]
pub struct ReconciliationRequest {
    pub enterprise_ids: Option<Vec<String>>,
    pub currencies: Option<Vec<Currency>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationSummary {
    pub enterprises_checked: usize,
    pub pairs_checked: usize,
    pub discrepancies_found: usize,
}

#[derive(Debug, Clone)]
pub struct BulkResolveOutcome {
    pub id: String,
    pub result: std::result::Result<Discrepancy, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub summary: ReconciliationSummary,
    pub counts_by_severity: Vec<(String, usize)>,
    pub counts_by_resolution: Vec<(String, usize)>,
    pub recommendations: Vec<String>,
}

pub struct ReconciliationEngine {
    config: ReconciliationConfig,
    repositories: Arc<Repositories>,
    events: Arc<dyn EventBus>,
    discrepancies: DashMap<String, Discrepancy>,
}

impl ReconciliationEngine {
    pub fn new(config: ReconciliationConfig, repositories: Arc<Repositories>, events: Arc<dyn EventBus>) -> Arc<Self> {
        Arc::new(Self {
            config,
            repositories,
            events,
            discrepancies: DashMap::new(),
        })
    }

    fn severity_for(&self, abs_delta: Decimal, percent: Decimal) -> DiscrepancySeverity {
        if abs_delta >= self.config.critical_threshold || percent >= Decimal::new(10, 0) {
            DiscrepancySeverity::Critical
        } else if percent >= Decimal::new(5, 0) || abs_delta >= Decimal::new(1000, 0) {
            DiscrepancySeverity::High
        } else if percent >= Decimal::ONE || abs_delta >= Decimal::new(100, 0) {
            DiscrepancySeverity::Medium
        } else {
            DiscrepancySeverity::Low
        }
    }

    /// Sign of Δ picks a canonical list of likely causes, plus generic causes
    /// that apply regardless of direction.
    fn causes_for(delta: Decimal) -> Vec<String> {
        let mut causes = Vec::new();
        if delta > Decimal::ZERO {
            causes.push("internal ledger credited a payment not yet confirmed on-chain".to_string());
            causes.push("a ledger transaction failed silently after internal state was updated".to_string());
        } else if delta < Decimal::ZERO {
            causes.push("an on-chain payment was not reflected in internal balances".to_string());
            causes.push("a duplicate or unexpected ledger transaction occurred".to_string());
        }
        causes.push("timing skew between internal settlement and ledger confirmation".to_string());
        causes.push("rounding or fee accounting mismatch".to_string());
        causes
    }

    async fn reconcile_pair(&self, enterprise_id: &str, currency: Currency) -> Result<Option<Discrepancy>> {
        let internal_balance = self.repositories.compliance.get_internal_balance(enterprise_id, currency).await?;
        let ledger_balance = self.repositories.compliance.get_ledger_balance(enterprise_id, currency).await?;

        let delta = internal_balance - ledger_balance;
        let abs_delta = delta.abs();

        if abs_delta <= self.config.tolerance_threshold {
            return Ok(None);
        }

        let percent = if internal_balance > Decimal::ZERO {
            (abs_delta / internal_balance) * Decimal::new(100, 0)
        } else {
            Decimal::ZERO
        };

        let severity = self.severity_for(abs_delta, percent);

        let discrepancy = Discrepancy {
            id: crate::types::new_id(),
            enterprise_id: enterprise_id.to_string(),
            currency,
            internal_balance,
            ledger_balance,
            amount: delta,
            percent,
            severity,
            status: DiscrepancyStatus::Pending,
            possible_causes: Self::causes_for(delta),
            resolution: None,
            resolution_notes: None,
            created_at: Utc::now(),
            resolved_at: None,
        };

        self.discrepancies.insert(discrepancy.id.clone(), discrepancy.clone());

        if self.config.alert_on_discrepancy
            && (abs_delta >= self.config.alert_threshold || matches!(severity, DiscrepancySeverity::High | DiscrepancySeverity::Critical))
        {
            self.events
                .publish(events::reconciliation_discrepancy_alert(&discrepancy.id, &format!("{severity:?}").to_lowercase(), abs_delta))
                .await;
        }

        Ok(Some(discrepancy))
    }

    /// Iterates the selected enterprises × currencies, reading internal and
    /// ledger balances for each pair and classifying any divergence beyond
    /// `tolerance_threshold`. Enterprise/currency enumeration always comes
    /// from the injected repositories, never a hardcoded list.
    #[instrument(skip(self, req))]
    pub async fn perform_reconciliation(&self, req: ReconciliationRequest) -> Result<(ReconciliationSummary, Vec<Discrepancy>)> {
        let enterprise_ids = match req.enterprise_ids {
            Some(ids) => ids,
            None => self.repositories.compliance.list_enterprises().await?,
        };

        let mut found = Vec::new();
        let mut pairs_checked = 0usize;

        for enterprise_id in &enterprise_ids {
            let currencies = match &req.currencies {
                Some(c) => c.clone(),
                None => self.repositories.compliance.list_currencies_for_enterprise(enterprise_id).await?,
            };

            for currency in currencies {
                pairs_checked += 1;
                match self.reconcile_pair(enterprise_id, currency).await {
                    Ok(Some(discrepancy)) => found.push(discrepancy),
                    Ok(None) => {}
                    Err(err) => warn!(%enterprise_id, ?currency, error = %err, "reconciliation pair failed"),
                }
            }
        }

        let summary = ReconciliationSummary {
            enterprises_checked: enterprise_ids.len(),
            pairs_checked,
            discrepancies_found: found.len(),
        };

        self.events
            .publish(events::reconciliation_completed(summary.discrepancies_found, summary.enterprises_checked))
            .await;

        info!(discrepancies = summary.discrepancies_found, "reconciliation run complete");
        Ok((summary, found))
    }

    /// On-demand reconciliation triggered by an operator rather than the
    /// periodic scheduler; emits `reconciliation.manual.performed` in
    /// addition to the usual `reconciliation.completed`.
    #[instrument(skip(self, req))]
    pub async fn perform_manual_reconciliation(&self, req: ReconciliationRequest) -> Result<(ReconciliationSummary, Vec<Discrepancy>)> {
        let (summary, discrepancies) = self.perform_reconciliation(req).await?;
        self.events
            .publish(events::reconciliation_manual_performed(summary.enterprises_checked, summary.pairs_checked))
            .await;
        Ok((summary, discrepancies))
    }

    /// Cooperative loop on `auto_reconcile_interval` that performs a full
    /// reconciliation until cancelled.
    pub async fn run_periodic(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.auto_reconcile_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconciliation scheduler shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.perform_reconciliation(ReconciliationRequest::default()).await {
                        warn!(error = %err, "periodic reconciliation failed");
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub fn resolve_discrepancy(&self, id: &str, resolution: ResolutionType, notes: Option<String>) -> Result<Discrepancy> {
        let mut entry = self
            .discrepancies
            .get_mut(id)
            .ok_or_else(|| ReconciliationError::DiscrepancyNotFound(id.to_string()))?;

        if entry.status == DiscrepancyStatus::Resolved {
            return Err(ReconciliationError::AlreadyResolved(id.to_string()).into());
        }

        entry.resolution = Some(resolution);
        entry.resolution_notes = notes;
        entry.status = match resolution {
            ResolutionType::Ignore => DiscrepancyStatus::Ignored,
            ResolutionType::Investigate => DiscrepancyStatus::Investigating,
            ResolutionType::AdjustInternal | ResolutionType::AdjustLedger => DiscrepancyStatus::Resolved,
        };
        entry.resolved_at = Some(Utc::now());
        Ok(entry.clone())
    }

    /// Fans out `resolve_discrepancy` across every id, returning a per-item
    /// outcome rather than failing the whole batch on the first error.
    pub async fn bulk_resolve_discrepancies(&self, resolutions: Vec<(String, ResolutionType, Option<String>)>) -> Vec<BulkResolveOutcome> {
        let mut outcomes = Vec::with_capacity(resolutions.len());
        for (id, resolution, notes) in resolutions {
            let result = self.resolve_discrepancy(&id, resolution, notes).map_err(|e| e.to_string());
            if let Ok(discrepancy) = &result {
                self.events
                    .publish(events::reconciliation_discrepancy_resolved(&discrepancy.id, &format!("{resolution:?}").to_lowercase()))
                    .await;
            }
            outcomes.push(BulkResolveOutcome { id, result });
        }
        outcomes
    }

    pub fn get_discrepancy(&self, id: &str) -> Result<Discrepancy> {
        self.discrepancies
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| ReconciliationError::DiscrepancyNotFound(id.to_string()).into())
    }

    /// Produces a summary report over every discrepancy currently tracked:
    /// counts by severity and resolution type, plus recommendations derived
    /// from what's still pending.
    pub fn generate_report(&self) -> ReconciliationReport {
        let all: Vec<Discrepancy> = self.discrepancies.iter().map(|e| e.clone()).collect();

        let mut by_severity: Vec<(String, usize)> = Vec::new();
        for severity in [
            DiscrepancySeverity::Low,
            DiscrepancySeverity::Medium,
            DiscrepancySeverity::High,
            DiscrepancySeverity::Critical,
        ] {
            let count = all.iter().filter(|d| d.severity == severity).count();
            by_severity.push((format!("{severity:?}").to_lowercase(), count));
        }

        let mut by_resolution: Vec<(String, usize)> = Vec::new();
        for (label, predicate) in [
            ("unresolved", (|d: &Discrepancy| d.resolution.is_none()) as fn(&Discrepancy) -> bool),
            ("adjust_internal", |d| matches!(d.resolution, Some(ResolutionType::AdjustInternal))),
            ("adjust_ledger", |d| matches!(d.resolution, Some(ResolutionType::AdjustLedger))),
            ("ignored", |d| matches!(d.resolution, Some(ResolutionType::Ignore))),
            ("investigating", |d| matches!(d.resolution, Some(ResolutionType::Investigate))),
        ] {
            by_resolution.push((label.to_string(), all.iter().filter(|d| predicate(d)).count()));
        }

        let critical_count = all.iter().filter(|d| d.severity == DiscrepancySeverity::Critical).count();
        let unresolved_count = all.iter().filter(|d| d.status == DiscrepancyStatus::Pending).count();

        let mut recommendations = Vec::new();
        if critical_count > 0 {
            recommendations.push(format!("{critical_count} critical discrepancies require immediate escalation"));
        }
        if unresolved_count > self.config.batch_size {
            recommendations.push(format!(
                "{unresolved_count} unresolved discrepancies exceed the reconciliation batch size ({}); consider increasing run frequency",
                self.config.batch_size
            ));
        }
        if recommendations.is_empty() {
            recommendations.push("no outstanding action required".to_string());
        }

        ReconciliationReport {
            summary: ReconciliationSummary {
                enterprises_checked: 0,
                pairs_checked: 0,
                discrepancies_found: all.len(),
            },
            counts_by_severity: by_severity,
            counts_by_resolution: by_resolution,
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::mock::InMemoryEventBus;
    use crate::repository::mock::InMemoryRepositories;

    async fn engine_with(internal: Decimal, ledger: Decimal) -> (Arc<ReconciliationEngine>, Arc<InMemoryEventBus>) {
        let (repos, repositories) = InMemoryRepositories::bundle();
        repos.set_internal_balance("acme-corp", Currency::Xrp, internal).await;
        repos.set_ledger_balance("acme-corp", Currency::Xrp, ledger).await;

        let events = Arc::new(InMemoryEventBus::new());
        let engine = ReconciliationEngine::new(ReconciliationConfig::default(), Arc::new(repositories), events.clone());
        (engine, events)
    }

    #[tokio::test]
    async fn balances_within_tolerance_produce_no_discrepancy() {
        let (engine, _events) = engine_with(Decimal::new(10_000, 0), Decimal::new(10_000, 0)).await;
        let (summary, discrepancies) = engine.perform_reconciliation(ReconciliationRequest::default()).await.unwrap();
        assert_eq!(summary.discrepancies_found, 0);
        assert!(discrepancies.is_empty());
    }

    #[tokio::test]
    async fn large_percentage_divergence_is_classified_critical() {
        let (engine, events) = engine_with(Decimal::new(10_000, 0), Decimal::new(8_000, 0)).await;
        let (_summary, discrepancies) = engine.perform_reconciliation(ReconciliationRequest::default()).await.unwrap();
        assert_eq!(discrepancies.len(), 1);
        assert_eq!(discrepancies[0].severity, DiscrepancySeverity::Critical);
        assert_eq!(events.count_of_type("reconciliation.discrepancy.alert").await, 1);
    }

    #[tokio::test]
    async fn small_absolute_divergence_is_classified_medium() {
        let (engine, _events) = engine_with(Decimal::new(10_000, 0), Decimal::new(9_900, 0)).await;
        let (_summary, discrepancies) = engine.perform_reconciliation(ReconciliationRequest::default()).await.unwrap();
        assert_eq!(discrepancies.len(), 1);
        assert_eq!(discrepancies[0].severity, DiscrepancySeverity::Medium);
    }

    #[tokio::test]
    async fn manual_reconciliation_emits_manual_performed_event() {
        let (engine, events) = engine_with(Decimal::new(10_000, 0), Decimal::new(10_000, 0)).await;
        engine.perform_manual_reconciliation(ReconciliationRequest::default()).await.unwrap();
        assert_eq!(events.count_of_type("reconciliation.manual.performed").await, 1);
    }

    #[tokio::test]
    async fn bulk_resolve_reports_per_item_outcomes() {
        let (engine, _events) = engine_with(Decimal::new(10_000, 0), Decimal::new(8_000, 0)).await;
        let (_summary, discrepancies) = engine.perform_reconciliation(ReconciliationRequest::default()).await.unwrap();
        let id = discrepancies[0].id.clone();

        let outcomes = engine
            .bulk_resolve_discrepancies(vec![
                (id.clone(), ResolutionType::AdjustInternal, Some("manual correction".to_string())),
                ("missing-id".to_string(), ResolutionType::Ignore, None),
            ])
            .await;

        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
        assert_eq!(engine.get_discrepancy(&id).unwrap().status, DiscrepancyStatus::Resolved);
    }
}
