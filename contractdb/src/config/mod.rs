// Kernel configuration

use crate::error::{ContractDbError, Result};
use crate::sql::Tables;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for a kernel. Every field has a default, so a partial document
/// (or none at all) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Contracts table the compiled statements read.
    pub table: String,
    pub links_table: String,
    /// Largest page a query may ask for.
    pub max_limit: usize,
    /// Page size of queries that do not ask for one.
    pub default_limit: usize,
    /// SQLite database file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            table: "cards".to_string(),
            links_table: "links".to_string(),
            max_limit: 1000,
            default_limit: 100,
            database_path: None,
            busy_timeout_ms: 5000,
        }
    }
}

impl KernelConfig {
    /// Parse a configuration document, already read from JSON or YAML.
    pub fn from_value(value: Value) -> Result<Self> {
        let config: KernelConfig = match value {
            Value::Null => KernelConfig::default(),
            other => serde_json::from_value(other)
                .map_err(|e| ContractDbError::Config(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() || self.links_table.is_empty() {
            return Err(ContractDbError::Config("Table names must not be empty".into()));
        }
        if self.table == self.links_table {
            return Err(ContractDbError::Config(format!(
                "Contracts and links cannot share the table {}",
                self.table
            )));
        }
        if self.max_limit == 0 {
            return Err(ContractDbError::Config("max_limit must be positive".into()));
        }
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            return Err(ContractDbError::Config(format!(
                "default_limit must be between 1 and {}",
                self.max_limit
            )));
        }
        Ok(())
    }

    pub fn tables(&self) -> Tables {
        Tables {
            contracts: self.table.clone(),
            links: self.links_table.clone(),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// The page size to use for a requested limit.
    pub fn effective_limit(&self, requested: Option<usize>) -> Result<usize> {
        let limit = requested.unwrap_or(self.default_limit);
        if limit == 0 || limit > self.max_limit {
            return Err(ContractDbError::InvalidLimit(format!(
                "Query limit must be between 1 and {}, got {limit}",
                self.max_limit
            )));
        }
        Ok(limit)
    }
}
