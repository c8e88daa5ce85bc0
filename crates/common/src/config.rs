use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TsqError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Reduce coordinator behavior/configuration knobs.
pub struct ReduceConfig {
    /// Rows per page requested from participants when the query does not set one.
    pub default_page_size: u32,
    /// Attempt `k` sleeps `k * retry_delay_base_ms` before resolving participants.
    pub retry_delay_base_ms: u64,
    /// Bounded wait between participant liveness checks while awaiting replies.
    pub liveness_check_interval_ms: u64,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            default_page_size: 1000,
            retry_delay_base_ms: 10,
            liveness_check_interval_ms: 500,
        }
    }
}

impl ReduceConfig {
    /// Load overrides from `TSQ_*` environment variables on top of defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let cfg = Self {
            default_page_size: env_parse("TSQ_DEFAULT_PAGE_SIZE", defaults.default_page_size)?,
            retry_delay_base_ms: env_parse(
                "TSQ_RETRY_DELAY_BASE_MS",
                defaults.retry_delay_base_ms,
            )?,
            liveness_check_interval_ms: env_parse(
                "TSQ_LIVENESS_CHECK_INTERVAL_MS",
                defaults.liveness_check_interval_ms,
            )?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_page_size == 0 {
            return Err(TsqError::InvalidConfig(
                "default_page_size must be positive".to_string(),
            ));
        }
        if self.liveness_check_interval_ms == 0 {
            return Err(TsqError::InvalidConfig(
                "liveness_check_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Page size to use for a query, substituting the default for `0`.
    pub fn effective_page_size(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.default_page_size
        } else {
            requested
        }
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_base_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms)
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| TsqError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}
