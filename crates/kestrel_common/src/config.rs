use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Top-level query subsystem configuration (the `[planner]`, `[sql]` and
/// `[executor]` sections of the backend's TOML file).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub sql: SqlConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl QueryConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Push `metric <op> threshold` comparisons into the leaf query instead of
    /// planning a separate Filter step (default: true).
    #[serde(default = "default_true")]
    pub enable_filter_pushdown: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            enable_filter_pushdown: true,
        }
    }
}

/// Which SQL engine the metric store speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    #[default]
    ClickHouse,
    H2,
    MySql,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlConfig {
    #[serde(default)]
    pub dialect: DialectKind,
    /// Raw row timestamp column of every metric table.
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    /// Column counted by the `{instanceCount}` macro.
    #[serde(default = "default_instance_column")]
    pub instance_column: String,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            dialect: DialectKind::default(),
            timestamp_column: default_timestamp_column(),
            instance_column: default_instance_column(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Queries slower than this are logged at WARN (0 = never).
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

fn default_instance_column() -> String {
    "instanceName".to_string()
}

fn default_slow_query_threshold_ms() -> u64 {
    1000
}
