//! Services module for retainer-billing.

pub mod allocator;
pub mod balance;
pub mod database;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod reconciler;
pub mod repository;

pub use allocator::{allocate, split_entry, AllocationPlan};
pub use balance::{
    calculate_closing_balance, calculate_multiple_months, calculate_opening_balance,
    ClosingBalance, MonthInput, MonthSummary, OpeningBalance, RolloverLedger,
};
pub use database::{PgSession, PgStore};
pub use memory::{InMemorySession, InMemoryStore};
pub use metrics::{get_metrics, init_metrics};
pub use orchestrator::{BillingPolicy, InvoiceDocument, InvoiceOrchestrator};
pub use reconciler::recombine_unlinked_fragments;
pub use repository::{
    AgreementProvider, BillingSession, BillingStore, InvoiceRepository, TimeRecordRepository,
};
