//! Retainer billing command line entry point.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use retainer_billing::config::BillingConfig;
use retainer_billing::models::InvoiceStatus;
use retainer_billing::services::{get_metrics, init_metrics, InvoiceOrchestrator, PgStore};
use serde::Serialize;
use service_core::observability::init_tracing;

#[derive(Parser)]
#[command(name = "retainer-billing", version, about = "Retainer invoicing with hour rollover")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate (or regenerate) the invoice for a period
    Generate {
        #[arg(long)]
        company: i64,
        /// First day of the period (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// Last day of the period, inclusive
        #[arg(long)]
        end: NaiveDate,
    },
    /// Merge unlinked fragments of a company back together
    Recombine {
        #[arg(long)]
        company: i64,
    },
    /// Issue a draft invoice
    Issue {
        #[arg(long)]
        invoice: i64,
    },
    /// Void an invoice and release its time records
    Void {
        #[arg(long)]
        invoice: i64,
    },
    /// Restore a voided invoice
    Unvoid {
        #[arg(long)]
        invoice: i64,
        /// draft, issued or paid
        #[arg(long, default_value = "draft")]
        status: String,
    },
    /// Print Prometheus metrics
    Metrics,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = BillingConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    init_tracing(&config.service_name, &config.log_level);
    init_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        db_max_connections = %config.database.max_connections,
        bill_excess_immediately = config.policy.bill_excess_immediately,
        "Starting retainer-billing"
    );

    if let Command::Metrics = cli.cmd {
        print!("{}", get_metrics());
        return Ok(());
    }

    let store = PgStore::new(
        &config.database.url,
        config.database.max_connections,
        config.database.min_connections,
    )
    .await?;
    store.run_migrations().await?;

    let orchestrator = InvoiceOrchestrator::new(store, config.policy);

    match cli.cmd {
        Command::Generate {
            company,
            start,
            end,
        } => print_json(&orchestrator.generate_for_period(company, start, end).await?)?,
        Command::Recombine { company } => {
            let eliminated = orchestrator.recombine_unlinked_fragments(company).await?;
            print_json(&serde_json::json!({ "company_id": company, "eliminated": eliminated }))?
        }
        Command::Issue { invoice } => print_json(&orchestrator.issue(invoice).await?)?,
        Command::Void { invoice } => print_json(&orchestrator.void(invoice).await?)?,
        Command::Unvoid { invoice, status } => {
            let target = InvoiceStatus::parse(&status)
                .ok_or(retainer_billing::BillingError::InvalidTargetStatus(status))?;
            print_json(&orchestrator.unvoid(invoice, target).await?)?
        }
        Command::Metrics => print!("{}", get_metrics()),
    }

    Ok(())
}
