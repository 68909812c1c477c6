//! File configuration of a storage node.
//!
//! ```toml
//! log_level = "info"
//!
//! [storage]
//! storage_path = "/var/lib/strata"
//! page_split_size = 16384
//! page_storage_mode = "column"
//!
//! [transaction]
//! redo_log_path = "/var/lib/strata/redo.log"
//! lock_wait_timeout_ms = 500
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::StorageConfig;
use crate::txn::TransactionConfig;
use crate::types::{Result, StrataError};

/// Everything a node reads at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filter passed to [`crate::logging::init_logging`].
    pub log_level: String,
    /// Storage layer settings.
    pub storage: StorageConfig,
    /// Transaction engine settings.
    pub transaction: TransactionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage: StorageConfig::default(),
            transaction: TransactionConfig::default(),
        }
    }
}

impl Config {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(contents).map_err(|e| StrataError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| StrataError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    /// Renders the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| StrataError::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.storage.handler_count == 0 {
            return Err(StrataError::Config("storage.handler_count must be positive".into()));
        }
        if self.storage.page_split_size == 0 {
            return Err(StrataError::Config("storage.page_split_size must be positive".into()));
        }
        if self.transaction.flush_threshold == 0 {
            return Err(StrataError::Config(
                "transaction.flush_threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PageStorageMode, RunMode};
    use crate::txn::IsolationLevel;

    #[test]
    fn partial_documents_use_defaults() -> Result<()> {
        let config = Config::from_toml(
            r#"
            log_level = "strata=debug"

            [storage]
            storage_path = "/tmp/strata"
            page_storage_mode = "column"
            run_mode = "sharding"
            local_host = "n1:9000"

            [transaction]
            default_isolation = "repeatable_read"
            "#,
        )?;
        assert_eq!(config.log_level, "strata=debug");
        assert_eq!(config.storage.page_storage_mode, PageStorageMode::Column);
        assert_eq!(config.storage.run_mode, RunMode::Sharding);
        assert_eq!(config.storage.local_host.as_deref(), Some("n1:9000"));
        assert_eq!(config.transaction.default_isolation, IsolationLevel::RepeatableRead);
        assert!(config.transaction.redo_log_path.is_none());
        Ok(())
    }

    #[test]
    fn rendered_config_parses_back() -> Result<()> {
        let mut config = Config::default();
        config.storage.page_split_size = 4096;
        let again = Config::from_toml(&config.to_toml()?)?;
        assert_eq!(again.storage.page_split_size, 4096);
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            Config::from_toml("[storage]\nhandler_count = 0\n"),
            Err(StrataError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[storage]\npage_split_size = \"big\"\n"),
            Err(StrataError::Config(_))
        ));
    }
}
