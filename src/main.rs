/*!
SmartCheque CLI binary

Thin operability shell for the SmartCheque payment infrastructure. This is
not the deliverable surface — the library crate is — but a runnable binary
demonstrating the pipeline end-to-end against in-memory fakes, since no
real ledger/DB wiring is in scope for this crate.
*/

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use smartcheque_core::authorization::AuthorizationEngine;
use smartcheque_core::escrow::EscrowController;
use smartcheque_core::events::mock::InMemoryEventBus;
use smartcheque_core::ledger::mock::MockLedgerDriver;
use smartcheque_core::ledger::LedgerDriver;
use smartcheque_core::repository::mock::InMemoryRepositories;
use smartcheque_core::types::{Currency, Milestone, SmartCheque};
use smartcheque_core::{init_with_tracing, SmartChequeConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "smartcheque-core")]
#[command(about = "SmartCheque - Milestone Escrow Payment Infrastructure")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML or JSON).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved per-subsystem configuration thresholds.
    Status,
    /// Check that the configuration loads and validates cleanly.
    Health,
    /// Run the happy-path escrow-release scenario against in-memory fakes.
    Test,
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    init_with_tracing(log_level);

    let config = match cli.config {
        Some(path) => load_config_from_file(&path)?,
        None => SmartChequeConfig::default(),
    };

    match cli.command {
        Commands::Status => show_status(&config),
        Commands::Health => check_health(&config)?,
        Commands::Test => run_test_scenario(config).await?,
        Commands::Version => {
            println!("smartcheque-core v{}", smartcheque_core::version());
        }
    }

    Ok(())
}

fn show_status(config: &SmartChequeConfig) {
    println!("SmartCheque Configuration");
    println!("-------------------------");
    println!(
        "queue: min_batch_size={} max_batch_size={} fee_optimization={}",
        config.queue.min_batch_size, config.queue.max_batch_size, config.queue.fee_optimization_enabled
    );
    println!(
        "authorization: tiers={}/{}/{} approvals={}/{}/{} auto_approval={}",
        config.authorization.low_amount_threshold,
        config.authorization.medium_amount_threshold,
        config.authorization.high_amount_threshold,
        config.authorization.low_amount_approvals,
        config.authorization.medium_amount_approvals,
        config.authorization.high_amount_approvals,
        config.authorization.auto_approval_enabled,
    );
    println!(
        "execution: max_concurrent={} retry_attempts={}",
        config.execution.max_concurrent_executions, config.execution.retry_attempts
    );
    println!(
        "confirmation: required={} background_monitoring={}",
        config.confirmation.default_required_confirmations, config.confirmation.enable_background_monitoring
    );
    println!(
        "reconciliation: tolerance={} critical={}",
        config.reconciliation.tolerance_threshold, config.reconciliation.critical_threshold
    );
}

fn check_health(config: &SmartChequeConfig) -> Result<()> {
    match config.validate() {
        Ok(()) => {
            println!("configuration is valid");
            Ok(())
        }
        Err(err) => {
            println!("configuration error: {err}");
            std::process::exit(1);
        }
    }
}

/// Exercises the happy-path seed scenario: create an escrow for a
/// single-milestone SmartCheque, authorize and complete the milestone, and
/// print the resulting status.
async fn run_test_scenario(config: SmartChequeConfig) -> Result<()> {
    let (repos, repositories) = InMemoryRepositories::bundle();
    let repositories = Arc::new(repositories);
    let ledger: Arc<dyn LedgerDriver> = Arc::new(MockLedgerDriver::new());
    let events = Arc::new(InMemoryEventBus::new());

    let milestone = Milestone::new("deliver v1", Some(Decimal::new(100, 0)));
    let smart_cheque = SmartCheque::new(
        "rPayerAddress",
        "rPayeeAddress",
        Decimal::new(100, 0),
        Currency::Xrp,
        vec![milestone],
        "contract-hash-demo",
    );
    let smart_cheque_id = smart_cheque.id.clone();
    repos.smart_cheques.insert(smart_cheque_id.clone(), smart_cheque);

    let controller = EscrowController::new(repositories.clone(), ledger.clone(), events.clone());
    let locked = controller
        .create_escrow_for_smart_cheque(&smart_cheque_id, "rPayerAddress", "rPayeeAddress")
        .await?;
    println!("escrow created: status={:?} escrow_address={:?}", locked.status, locked.escrow_address);

    let milestone_id = locked.milestones[0].id.clone();
    let authorization = AuthorizationEngine::new(config.authorization.clone(), repositories.clone(), events.clone());
    let auth = authorization
        .create_authorization(&smart_cheque_id, &milestone_id, "acme-corp", Decimal::new(100, 0), Currency::Xrp)
        .await?;
    println!("authorization: status={:?} auto_approved={}", auth.status, auth.auto_approved);

    let completed = controller.complete_milestone_payment(&smart_cheque_id, &milestone_id).await?;
    println!("milestone completed: smart_cheque_status={:?}", completed.status);

    println!("events published: {}", events.events().await.len());
    Ok(())
}

fn load_config_from_file(path: &PathBuf) -> Result<SmartChequeConfig> {
    Ok(SmartChequeConfig::from_file(path)?)
}
