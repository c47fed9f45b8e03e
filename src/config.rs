//! Ledger configuration
//!
//! Loaded from an optional TOML file, overridden by `AUDIT_LEDGER__*`
//! environment variables (e.g. `AUDIT_LEDGER__ANCHORING__TSA_URL`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{LedgerError, Result};

pub const ENV_PREFIX: &str = "AUDIT_LEDGER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub ledger: StoreConfig,
    #[serde(default)]
    pub anchoring: AnchoringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchoringConfig {
    /// RFC 3161 authority; local non-authoritative timestamps when unset
    pub tsa_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    250
}

fn default_filter() -> String {
    "audit_ledger=info".to_string()
}

impl Default for AnchoringConfig {
    fn default() -> Self {
        Self {
            tsa_url: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

impl AnchoringConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl LedgerConfig {
    /// Load from `path` (if given) layered under the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!("Loading ledger configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: LedgerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.backend == StoreBackend::File && self.ledger.path.is_none() {
            return Err(LedgerError::Config(
                "ledger.backend = \"file\" requires ledger.path".to_string(),
            ));
        }

        if self.anchoring.timeout_secs == 0 {
            return Err(LedgerError::Config(
                "anchoring.timeout_secs must be greater than zero".to_string(),
            ));
        }

        if let Some(url) = &self.anchoring.tsa_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(LedgerError::Config(format!(
                    "anchoring.tsa_url must be an http(s) URL, got {}",
                    url
                )));
            }
        }

        Ok(())
    }
}
