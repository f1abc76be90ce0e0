//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use crate::llm::{Credential, ModelSlot, RetryPolicy};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Prefix marking a credential that should be read from the environment.
const ENV_CREDENTIAL_PREFIX: &str = "env:";

/// Murmur configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub coalesce: CoalesceConfig,
    pub retry: RetryConfig,
    pub pool: PoolConfig,
    pub ledger: LedgerConfig,
    pub backend: BackendConfig,
    pub reply: ReplyConfig,
}

/// Inbound batching and presence indicator timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// Quiet period after the last inbound message before a batch is flushed.
    pub debounce_ms: u64,
    /// How often the typing indicator is re-sent while a thread is busy.
    pub typing_refresh_ms: u64,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1500,
            typing_refresh_ms: 5000,
        }
    }
}

impl CoalesceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn typing_refresh(&self) -> Duration {
        Duration::from_millis(self.typing_refresh_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay_ms,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }
}

/// Rotation pool: models in priority order, each with its own credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub block_duration_secs: u64,
    pub models: Vec<ModelConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_duration_secs: 24 * 60 * 60,
            models: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModelConfig {
    pub name: String,
    /// Literal keys or `env:VAR` references.
    #[serde(default)]
    pub credentials: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Sent messages remembered per thread for quote/undo.
    pub capacity: usize,
    /// Received messages and turns remembered per thread.
    pub history_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: crate::conversation::ledger::DEFAULT_LEDGER_CAPACITY,
            history_capacity: crate::conversation::history::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    /// Longest silence tolerated between two reads of a streamed response.
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            timeout_secs: 120,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// Sent to the thread when a generation fails for good. Nothing is sent
    /// when unset.
    pub apology: Option<String>,
    pub system_prompt: Option<String>,
}

impl Config {
    /// Load configuration from `path`, or from the default location when no
    /// path is given, then apply environment overrides and validate.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load_from_path(&path)?,
                _ => {
                    tracing::debug!("no config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without applying overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(error),
        })?;
        let config = Self::from_toml(&text)?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|error| ConfigError::Parse(error.to_string()).into())
    }

    /// Apply `MURMUR_*` overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("MURMUR_DEBOUNCE_MS") {
            self.coalesce.debounce_ms = value.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("MURMUR_DEBOUNCE_MS is not a number: {value}"))
            })?;
        }
        if let Some(base_url) = lookup("MURMUR_BASE_URL") {
            self.backend.base_url = base_url;
        }
        if let Some(api_key) = lookup("MURMUR_API_KEY") {
            for model in self.pool.models.iter_mut().filter(|model| model.credentials.is_empty()) {
                model.credentials.push(api_key.clone());
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.models.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[pool.models]] entry is required".into(),
            )
            .into());
        }
        if let Some(model) = self
            .pool
            .models
            .iter()
            .find(|model| model.credentials.is_empty())
        {
            let reason = format!("model {} has no credentials", model.name);
            return Err(ConfigError::Invalid(reason).into());
        }
        if self.coalesce.typing_refresh_ms == 0 {
            return Err(ConfigError::Invalid(
                "coalesce.typing_refresh_ms must be positive".into(),
            )
            .into());
        }
        if self.ledger.capacity == 0 {
            return Err(ConfigError::Invalid("ledger.capacity must be positive".into()).into());
        }
        Ok(())
    }

    /// Build rotation pool slots, resolving `env:VAR` credentials through `lookup`.
    pub fn model_slots(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Vec<ModelSlot>> {
        self.pool
            .models
            .iter()
            .map(|model| {
                let credentials = model
                    .credentials
                    .iter()
                    .map(|raw| resolve_credential(raw, &lookup))
                    .collect::<Result<Vec<_>>>()?;
                Ok(ModelSlot::new(model.name.clone(), credentials))
            })
            .collect()
    }
}

fn resolve_credential(raw: &str, lookup: &impl Fn(&str) -> Option<String>) -> Result<Credential> {
    match raw.strip_prefix(ENV_CREDENTIAL_PREFIX) {
        Some(variable) => lookup(variable)
            .map(Credential::new)
            .ok_or_else(|| ConfigError::MissingEnv(variable.to_string()).into()),
        None => Ok(Credential::new(raw)),
    }
}

/// `<config dir>/murmur/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("murmur").join("config.toml"))
}

/// Settings that can be swapped while the gateway is running.
///
/// Readers call `.load()` on every use, so a `reload` takes effect for the
/// next inbound message or generation.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub coalesce: ArcSwap<CoalesceConfig>,
    pub retry: ArcSwap<RetryConfig>,
    pub reply: ArcSwap<ReplyConfig>,
}

impl RuntimeConfig {
    pub fn new(config: &Config) -> Self {
        Self {
            coalesce: ArcSwap::from_pointee(config.coalesce),
            retry: ArcSwap::from_pointee(config.retry),
            reply: ArcSwap::from_pointee(config.reply.clone()),
        }
    }

    pub fn reload(&self, config: &Config) {
        self.coalesce.store(Arc::new(config.coalesce));
        self.retry.store(Arc::new(config.retry));
        self.reply.store(Arc::new(config.reply.clone()));
        tracing::info!("runtime config reloaded");
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}
