//! Configuration for retainer-billing.

use crate::services::BillingPolicy;
use serde::Deserialize;
use service_core::config::load_settings;
use service_core::error::AppError;

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub policy: BillingPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_service_name() -> String {
    "retainer-billing".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

impl BillingConfig {
    /// Load from `configuration.*` and `BILLING__*` environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        load_settings("configuration", "BILLING")
    }
}
