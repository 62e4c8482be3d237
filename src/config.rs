use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::store::{CallbackStore, FileStorage, MemoryStorage, SessionStorage};

/// Main configuration structure for the workflow controllers
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Session storage and the pending-callback record
    pub storage: StorageConfig,
    /// Identity verification settings
    pub identity: IdentityConfig,
    /// Delivery / consignment settings
    pub disposition: DispositionConfig,
    /// Payment hand-off settings
    pub payment: PaymentConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Key the pending callback record is stored under
    pub callback_key: String,
    /// Age after which a pending callback is discarded
    pub callback_ttl_minutes: u64,
    /// Persist the session to this file instead of memory
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Where the verification provider sends the user back to
    pub return_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispositionConfig {
    /// Minimum holding time before delivery
    pub holding_hours: u32,
    /// Consignment countdown tick
    pub countdown_tick_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// Lifetime of a payment link
    pub link_timeout_seconds: u64,
    /// How often the payment window is checked
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON log lines
    pub json_logs: bool,
    /// Log every attempted state transition, including ignored ones
    pub debug_transitions: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            callback_key: crate::store::callback::DEFAULT_CALLBACK_KEY.to_string(),
            callback_ttl_minutes: 30,
            file_path: None,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            return_url: "http://localhost:3000/verify".to_string(),
        }
    }
}

impl Default for DispositionConfig {
    fn default() -> Self {
        Self {
            holding_hours: 48,
            countdown_tick_ms: 1000,
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            link_timeout_seconds: 300, // 5 minutes
            poll_interval_ms: 500,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            debug_transitions: false,
        }
    }
}

impl StorageConfig {
    pub fn callback_ttl(&self) -> Duration {
        Duration::from_secs(self.callback_ttl_minutes * 60)
    }

    /// Backend selected by `file_path`.
    pub fn open_storage(&self) -> Arc<dyn SessionStorage> {
        match &self.file_path {
            Some(path) => Arc::new(FileStorage::new(path)),
            None => Arc::new(MemoryStorage::new()),
        }
    }

    pub fn callback_store(&self) -> CallbackStore {
        CallbackStore::new(self.open_storage())
            .with_key(self.callback_key.clone())
            .with_ttl(self.callback_ttl())
    }
}

impl DispositionConfig {
    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }
}

impl PaymentConfig {
    pub fn link_timeout(&self) -> Duration {
        Duration::from_secs(self.link_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl WorkflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (workflows.toml, .workflows-rc)
    /// 3. Environment variables (prefixed with RESUMABLE_WORKFLOWS_)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`WorkflowConfig::load`] with config files looked up in `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&WorkflowConfig::default())?);

        let toml_file = dir.join("workflows.toml");
        if toml_file.exists() {
            builder = builder.add_source(File::from(toml_file));
        }

        let rc_file = dir.join(".workflows-rc");
        if rc_file.exists() {
            builder = builder.add_source(File::from(rc_file).format(config::FileFormat::Toml));
        }

        // Override with environment variables, e.g. RESUMABLE_WORKFLOWS_PAYMENT__POLL_INTERVAL_MS
        builder = builder.add_source(
            Environment::with_prefix("RESUMABLE_WORKFLOWS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Process-wide configuration, loaded once from `.env`, files and environment.
static CONFIG: LazyLock<Result<WorkflowConfig>> = LazyLock::new(|| {
    WorkflowConfig::load_env_file()?;
    WorkflowConfig::load()
});

pub fn config() -> Result<&'static WorkflowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e:#}"))
}

/// Force the global load at startup so a broken config fails fast.
pub fn init_config() -> Result<&'static WorkflowConfig> {
    let config = config()?;
    tracing::debug!(
        holding_hours = config.disposition.holding_hours,
        link_timeout_secs = config.payment.link_timeout_seconds,
        "Configuration loaded"
    );
    Ok(config)
}
