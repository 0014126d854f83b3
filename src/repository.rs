/*!
Repository capabilities: CRUD on the crate's entities.

Persistence schemas and the actual database engine are out of scope; these
traits are the seam every subsystem reads and writes through, with an
in-memory implementation backing the test suite.
*/

use crate::error::Result;
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait SmartChequeRepository: Send + Sync {
    async fn create_smart_cheque(&self, smart_cheque: SmartCheque) -> Result<SmartCheque>;
    async fn get_smart_cheque(&self, id: &str) -> Result<SmartCheque>;
    async fn update_smart_cheque(&self, smart_cheque: SmartCheque) -> Result<SmartCheque>;
    async fn list_smart_cheques_by_enterprise(&self, enterprise_id: &str) -> Result<Vec<SmartCheque>>;
}

#[async_trait]
pub trait MilestoneRepository: Send + Sync {
    async fn get_milestone(&self, smart_cheque_id: &str, milestone_id: &str) -> Result<Milestone>;
}

#[async_trait]
pub trait ContractRepository: Send + Sync {
    async fn get_contract_hash(&self, smart_cheque_id: &str) -> Result<String>;
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn create_transaction(&self, tx: Transaction) -> Result<Transaction>;
    async fn get_transaction(&self, id: &str) -> Result<Transaction>;
    async fn update_transaction(&self, tx: Transaction) -> Result<Transaction>;
    async fn list_transactions_by_status(&self, status: TransactionStatus) -> Result<Vec<Transaction>>;
}

#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn create_batch(&self, batch: TransactionBatch) -> Result<TransactionBatch>;
    async fn get_batch(&self, id: &str) -> Result<TransactionBatch>;
    async fn update_batch(&self, batch: TransactionBatch) -> Result<TransactionBatch>;
}

#[async_trait]
pub trait ComplianceRepository: Send + Sync {
    async fn get_internal_balance(&self, enterprise_id: &str, currency: Currency) -> Result<rust_decimal::Decimal>;
    /// The ledger-observed balance for reconciliation. Enterprises are not
    /// mapped 1:1 to a single XRPL address in this crate, so this is sourced
    /// the same way as `get_internal_balance` rather than via the ledger
    /// driver (which only exposes per-address/per-escrow operations).
    async fn get_ledger_balance(&self, enterprise_id: &str, currency: Currency) -> Result<rust_decimal::Decimal>;
    async fn list_enterprises(&self) -> Result<Vec<String>>;
    async fn list_currencies_for_enterprise(&self, enterprise_id: &str) -> Result<Vec<Currency>>;
}

#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    async fn record(&self, entry: AuditLogEntry) -> Result<()>;
}

/// A single audit trail entry recorded for every ledger-affecting action.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub action: String,
    pub details: std::collections::HashMap<String, serde_json::Value>,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl AuditLogEntry {
    pub fn new(entity_kind: impl Into<String>, entity_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            entity_kind: entity_kind.into(),
            entity_id: entity_id.into(),
            action: action.into(),
            details: Default::default(),
            at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Bundle of every repository capability, the shape components are
/// constructed with.
pub struct Repositories {
    pub smart_cheques: Arc<dyn SmartChequeRepository>,
    pub milestones: Arc<dyn MilestoneRepository>,
    pub contracts: Arc<dyn ContractRepository>,
    pub transactions: Arc<dyn TransactionRepository>,
    pub batches: Arc<dyn BatchRepository>,
    pub compliance: Arc<dyn ComplianceRepository>,
    pub audit_log: Arc<dyn AuditLogRepository>,
}

/// In-memory implementations backing the test suite.
pub mod mock {
    use super::*;
    use crate::error::SmartChequeError;
    use dashmap::DashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryRepositories {
        pub smart_cheques: DashMap<String, SmartCheque>,
        pub transactions: DashMap<String, Transaction>,
        pub batches: DashMap<String, TransactionBatch>,
        pub internal_balances: DashMap<(String, &'static str), rust_decimal::Decimal>,
        pub ledger_balances: DashMap<(String, &'static str), rust_decimal::Decimal>,
        pub enterprises: Mutex<Vec<String>>,
        pub audit_log: Mutex<Vec<AuditLogEntry>>,
    }

    impl InMemoryRepositories {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Build a full `Repositories` bundle backed by a single shared
        /// in-memory instance, coercing it to each capability trait object.
        pub fn bundle() -> (Arc<Self>, Repositories) {
            let repos = Self::new();
            let bundle = Repositories {
                smart_cheques: repos.clone(),
                milestones: repos.clone(),
                contracts: repos.clone(),
                transactions: repos.clone(),
                batches: repos.clone(),
                compliance: repos.clone(),
                audit_log: repos.clone(),
            };
            (repos, bundle)
        }

        fn currency_key(currency: Currency) -> &'static str {
            match currency {
                Currency::Xrp => "XRP",
                Currency::Usdt => "USDT",
                Currency::Usdc => "USDC",
                Currency::ERupee => "ERUPEE",
            }
        }

        pub async fn set_internal_balance(&self, enterprise_id: &str, currency: Currency, balance: rust_decimal::Decimal) {
            self.internal_balances
                .insert((enterprise_id.to_string(), Self::currency_key(currency)), balance);
            let mut enterprises = self.enterprises.lock().await;
            if !enterprises.iter().any(|e| e == enterprise_id) {
                enterprises.push(enterprise_id.to_string());
            }
        }

        pub async fn set_ledger_balance(&self, enterprise_id: &str, currency: Currency, balance: rust_decimal::Decimal) {
            self.ledger_balances
                .insert((enterprise_id.to_string(), Self::currency_key(currency)), balance);
            let mut enterprises = self.enterprises.lock().await;
            if !enterprises.iter().any(|e| e == enterprise_id) {
                enterprises.push(enterprise_id.to_string());
            }
        }
    }

    #[async_trait]
    impl SmartChequeRepository for InMemoryRepositories {
        async fn create_smart_cheque(&self, smart_cheque: SmartCheque) -> Result<SmartCheque> {
            self.smart_cheques.insert(smart_cheque.id.clone(), smart_cheque.clone());
            Ok(smart_cheque)
        }

        async fn get_smart_cheque(&self, id: &str) -> Result<SmartCheque> {
            self.smart_cheques
                .get(id)
                .map(|e| e.clone())
                .ok_or_else(|| SmartChequeError::not_found("smart_cheque", id))
        }

        async fn update_smart_cheque(&self, smart_cheque: SmartCheque) -> Result<SmartCheque> {
            self.smart_cheques.insert(smart_cheque.id.clone(), smart_cheque.clone());
            Ok(smart_cheque)
        }

        async fn list_smart_cheques_by_enterprise(&self, enterprise_id: &str) -> Result<Vec<SmartCheque>> {
            Ok(self
                .smart_cheques
                .iter()
                .filter(|e| e.payer_id == enterprise_id || e.payee_id == enterprise_id)
                .map(|e| e.clone())
                .collect())
        }
    }

    #[async_trait]
    impl MilestoneRepository for InMemoryRepositories {
        async fn get_milestone(&self, smart_cheque_id: &str, milestone_id: &str) -> Result<Milestone> {
            let sc = self.get_smart_cheque(smart_cheque_id).await?;
            sc.milestones
                .into_iter()
                .find(|m| m.id == milestone_id)
                .ok_or_else(|| SmartChequeError::not_found("milestone", milestone_id))
        }
    }

    #[async_trait]
    impl ContractRepository for InMemoryRepositories {
        async fn get_contract_hash(&self, smart_cheque_id: &str) -> Result<String> {
            Ok(self.get_smart_cheque(smart_cheque_id).await?.contract_hash)
        }
    }

    #[async_trait]
    impl TransactionRepository for InMemoryRepositories {
        async fn create_transaction(&self, tx: Transaction) -> Result<Transaction> {
            self.transactions.insert(tx.id.clone(), tx.clone());
            Ok(tx)
        }

        async fn get_transaction(&self, id: &str) -> Result<Transaction> {
            self.transactions
                .get(id)
                .map(|e| e.clone())
                .ok_or_else(|| SmartChequeError::not_found("transaction", id))
        }

        async fn update_transaction(&self, tx: Transaction) -> Result<Transaction> {
            self.transactions.insert(tx.id.clone(), tx.clone());
            Ok(tx)
        }

        async fn list_transactions_by_status(&self, status: TransactionStatus) -> Result<Vec<Transaction>> {
            Ok(self
                .transactions
                .iter()
                .filter(|e| e.status == status)
                .map(|e| e.clone())
                .collect())
        }
    }

    #[async_trait]
    impl BatchRepository for InMemoryRepositories {
        async fn create_batch(&self, batch: TransactionBatch) -> Result<TransactionBatch> {
            self.batches.insert(batch.id.clone(), batch.clone());
            Ok(batch)
        }

        async fn get_batch(&self, id: &str) -> Result<TransactionBatch> {
            self.batches
                .get(id)
                .map(|e| e.clone())
                .ok_or_else(|| SmartChequeError::not_found("batch", id))
        }

        async fn update_batch(&self, batch: TransactionBatch) -> Result<TransactionBatch> {
            self.batches.insert(batch.id.clone(), batch.clone());
            Ok(batch)
        }
    }

    #[async_trait]
    impl ComplianceRepository for InMemoryRepositories {
        async fn get_internal_balance(&self, enterprise_id: &str, currency: Currency) -> Result<rust_decimal::Decimal> {
            Ok(self
                .internal_balances
                .get(&(enterprise_id.to_string(), Self::currency_key(currency)))
                .map(|e| *e)
                .unwrap_or(rust_decimal::Decimal::ZERO))
        }

        async fn get_ledger_balance(&self, enterprise_id: &str, currency: Currency) -> Result<rust_decimal::Decimal> {
            Ok(self
                .ledger_balances
                .get(&(enterprise_id.to_string(), Self::currency_key(currency)))
                .map(|e| *e)
                .unwrap_or(rust_decimal::Decimal::ZERO))
        }

        async fn list_enterprises(&self) -> Result<Vec<String>> {
            Ok(self.enterprises.lock().await.clone())
        }

        async fn list_currencies_for_enterprise(&self, _enterprise_id: &str) -> Result<Vec<Currency>> {
            Ok(vec![Currency::Xrp, Currency::Usdt, Currency::Usdc, Currency::ERupee])
        }
    }

    #[async_trait]
    impl AuditLogRepository for InMemoryRepositories {
        async fn record(&self, entry: AuditLogEntry) -> Result<()> {
            self.audit_log.lock().await.push(entry);
            Ok(())
        }
    }
}
