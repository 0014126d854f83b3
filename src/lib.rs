/*!
# SmartCheque Core - Milestone Escrow Payment Infrastructure

Smart-payment infrastructure that escrows funds on an external ledger
(XRP Ledger) against contractual milestones, releases them on verified
milestone completion, and manages the surrounding lifecycle: authorization,
execution, confirmation, dispute, reconciliation.

## Architecture

```text
┌──────────────┐   enqueue   ┌───────────────────┐
│ Queue &      │────────────▶│ Authorization     │
│ Batcher      │             │ Engine            │
└──────────────┘             └─────────┬─────────┘
       ▲                               │ approved
       │ dispatch                      ▼
┌──────┴───────┐             ┌───────────────────┐
│ Ledger       │◀────────────│ Execution Engine  │
│ Driver       │   submit    └─────────┬─────────┘
└──────┬───────┘                       │ registers
       │ confirmations                 ▼
       │                     ┌───────────────────┐
       └────────────────────▶│ Confirmation      │
                             │ Tracker           │
                             └───────────────────┘

┌───────────────────┐       ┌───────────────────┐
│ Escrow /           │       │ Reconciliation    │
│ SmartCheque        │       │ Engine            │
│ Controller         │       └───────────────────┘
└───────────────────┘
```

## Quick Start

```rust
use smartcheque_core::{init, SmartChequeConfig};

fn main() {
    init();
    let config = SmartChequeConfig::default();
    config.validate().expect("default config is valid");
}
```

The ledger driver, event bus, and repositories are external collaborators
modeled as trait objects (see [`ledger::LedgerDriver`], [`events::EventBus`],
[`repository::Repositories`]); in-memory implementations under each
module's `mock` submodule back the test suite and can seed a standalone
demo binary.
*/

#![warn(missing_docs, rust_2018_idioms)]

pub use config::SmartChequeConfig;
pub use error::{Result, SmartChequeError};
pub use types::*;

/// Transaction Queue & Batcher (§4.1): priority-aware queue with
/// fee-optimizing batching, bounded concurrency, retry/expiry.
pub mod queue;

/// Payment Authorization Engine (§4.2): risk scoring, multi-approver
/// thresholds, auto-approval, time-locks.
pub mod authorization;

/// Payment Execution Engine (§4.3): stepwise execution of escrow-finish
/// workflows with per-step state and cancellation.
pub mod execution;

/// Confirmation Tracker (§4.4): background poller mapping on-ledger
/// confirmations to execution status.
pub mod confirmation;

/// Escrow / SmartCheque Controller (§4.5): creates, finishes, cancels,
/// and partially refunds ledger escrows; enforces status invariants.
pub mod escrow;

/// Reconciliation Engine (§4.6): compares internal balances to ledger
/// balances; classifies, resolves, and reports discrepancies.
pub mod reconciliation;

/// Core entity types, closed enums for tagged variants, and invariants.
pub mod types;

/// Crate-wide error taxonomy.
pub mod error;

/// Aggregate, per-subsystem configuration.
pub mod config;

/// External ledger driver capability (address validation, escrow CRUD,
/// transaction submission/status).
pub mod ledger;

/// External event bus capability and typed event constructors.
pub mod events;

/// External repository capabilities (CRUD on every persisted entity).
pub mod repository;

/// Metrics facade over the `metrics` crate's recording macros.
pub mod metrics;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize SmartCheque with default tracing configuration.
pub fn init() {
    init_with_tracing("info")
}

/// Initialize SmartCheque with a custom tracing filter.
pub fn init_with_tracing(filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(filter, "smartcheque-core initialized");
}

/// Get the library version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Get the library name.
pub fn name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(name(), "smartcheque-core");
    }

    #[test]
    fn default_config_is_valid() {
        assert!(SmartChequeConfig::default().validate().is_ok());
    }
}
