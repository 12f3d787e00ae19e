//! Configuration for the strike ledger service
//!
//! Values come from environment variables (a `.env` file is loaded first if
//! present), with defaults for everything.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use shared::observability::{LogConfig, LogFormat, LogLevel};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::ledger_service::DEFAULT_PENALTY_TTL_DAYS;
use crate::workers::reclamation::DEFAULT_RECLAIM_INTERVAL;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub ledger: LedgerConfig,
    pub reclamation: ReclamationConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            ledger: LedgerConfig::from_env()?,
            reclamation: ReclamationConfig::from_env()?,
            logging: LoggingConfig::from_env(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.ledger.validate()?;
        self.reclamation.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Where strikes live and how long writes may take
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub data_file: PathBuf,
    pub persist_timeout_secs: u64,
    pub default_ttl_days: i64,
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            data_file: env::var("STRIKE_DATA_FILE")
                .unwrap_or_else(|_| "strikes.json".to_string())
                .into(),
            persist_timeout_secs: env::var("STRIKE_PERSIST_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid STRIKE_PERSIST_TIMEOUT_SECS")?,
            default_ttl_days: env::var("STRIKE_DEFAULT_TTL_DAYS")
                .unwrap_or_else(|_| DEFAULT_PENALTY_TTL_DAYS.to_string())
                .parse()
                .context("Invalid STRIKE_DEFAULT_TTL_DAYS")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_file.as_os_str().is_empty() {
            bail!("STRIKE_DATA_FILE must not be empty");
        }
        if self.persist_timeout_secs == 0 {
            bail!("STRIKE_PERSIST_TIMEOUT_SECS must be greater than 0");
        }
        if self.default_ttl_days <= 0 {
            bail!("STRIKE_DEFAULT_TTL_DAYS must be greater than 0");
        }
        Ok(())
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_secs(self.persist_timeout_secs)
    }

    pub fn default_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.default_ttl_days)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("strikes.json"),
            persist_timeout_secs: 5,
            default_ttl_days: DEFAULT_PENALTY_TTL_DAYS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclamationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl ReclamationConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            enabled: env::var("STRIKE_RECLAIM_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            interval_secs: env::var("STRIKE_RECLAIM_INTERVAL_SECS")
                .unwrap_or_else(|_| DEFAULT_RECLAIM_INTERVAL.as_secs().to_string())
                .parse()
                .context("Invalid STRIKE_RECLAIM_INTERVAL_SECS")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("STRIKE_RECLAIM_INTERVAL_SECS must be greater than 0");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReclamationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_RECLAIM_INTERVAL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.to_log_config("strike-ledger").map(|_| ())
    }

    pub fn to_log_config(&self, service_name: &str) -> Result<LogConfig> {
        let level: LogLevel = self.level.parse().context("Invalid LOG_LEVEL")?;
        let format: LogFormat = self.format.parse().context("Invalid LOG_FORMAT")?;

        Ok(LogConfig {
            level,
            format,
            service_name: service_name.to_string(),
            include_thread_ids: matches!(format, LogFormat::Json),
            ..Default::default()
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
