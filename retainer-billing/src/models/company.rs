//! Company model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A billed client.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Company {
    pub id: i64,
    pub name: String,
    /// Prefix used for invoice numbers, e.g. `ACME` in `ACME-202401-001`.
    pub invoice_prefix: String,
}

impl Company {
    /// Normalized prefix for invoice numbering.
    pub fn number_prefix(&self) -> String {
        let prefix = self.invoice_prefix.trim().to_uppercase();
        if prefix.is_empty() {
            format!("C{}", self.id)
        } else {
            prefix
        }
    }
}
