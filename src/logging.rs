//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, StrataError};

/// Installs a global `fmt` subscriber filtered by `level`, which accepts
/// any `EnvFilter` directive (`"info"`, `"strata::storage=debug"`, ...).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| StrataError::Config(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| StrataError::Config("logging already initialized".into()))
}
