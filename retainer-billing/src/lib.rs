//! Retainer-with-rollover billing engine.
//!
//! Balances are computed by [`services::balance`], worked time is spread over
//! capacity pools by [`services::allocator`], and
//! [`services::InvoiceOrchestrator`] ties both to a [`services::BillingStore`].

pub mod config;
pub mod error;
pub mod hours;
pub mod models;
pub mod services;

pub use error::{BillingError, Result};
