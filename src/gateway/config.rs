use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dispatch::{DispatchConfig, QueueMode};
use super::limits::{FailureMode, RateLimitTable};
use super::providers::{ProviderName, ProviderTable};
use super::request::{DEFAULT_MAX_LOOP_DEPTH, NormalizeConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("parse json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config format for {0} (expected .toml or .json)")]
    UnsupportedFormat(PathBuf),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tiers: RateLimitTable,
    pub failure_mode: FailureMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub store_ms: u64,
    pub kv_ms: u64,
    pub rate_limit_ms: u64,
    pub wallet_ms: u64,
    /// Bounds each upstream attempt up to its response headers (and full body when buffered).
    pub forward_ms: u64,
    pub connect_ms: u64,
    /// Longest gap between two chunks of a streamed upstream body.
    pub stream_idle_ms: u64,
    pub dispatch_ms: u64,
    pub shutdown_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            store_ms: 2_000,
            kv_ms: 1_000,
            rate_limit_ms: 1_000,
            wallet_ms: 2_000,
            forward_ms: 120_000,
            connect_ms: 10_000,
            stream_idle_ms: 120_000,
            dispatch_ms: 10_000,
            shutdown_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }

    pub fn kv(&self) -> Duration {
        Duration::from_millis(self.kv_ms)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn wallet(&self) -> Duration {
        Duration::from_millis(self.wallet_ms)
    }

    pub fn forward(&self) -> Duration {
        Duration::from_millis(self.forward_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn stream_idle(&self) -> Duration {
        Duration::from_millis(self.stream_idle_ms)
    }

    pub fn dispatch(&self) -> Duration {
        Duration::from_millis(self.dispatch_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "cache".to_string(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: String,
    pub queue_mode: QueueMode,
    pub cloud_billing_enabled: bool,
    pub rate_limits: RateLimitConfig,
    /// Base URL template overrides keyed by provider name.
    pub providers: BTreeMap<String, String>,
    pub logging: DispatchConfig,
    pub timeouts: TimeoutConfig,
    pub cache: CacheSettings,
    pub max_loop_depth: u32,
    pub store_seed: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".to_string(),
            queue_mode: QueueMode::default(),
            cloud_billing_enabled: false,
            rate_limits: RateLimitConfig::default(),
            providers: BTreeMap::new(),
            logging: DispatchConfig::default(),
            timeouts: TimeoutConfig::default(),
            cache: CacheSettings::default(),
            max_loop_depth: DEFAULT_MAX_LOOP_DEPTH,
            store_seed: None,
            redis_url: None,
            redis_prefix: "llm-relay".to_string(),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("listen", &self.listen)
            .field("queue_mode", &self.queue_mode)
            .field("cloud_billing_enabled", &self.cloud_billing_enabled)
            .field("rate_limits", &self.rate_limits)
            .field("providers", &self.providers)
            .field("logging", &self.logging)
            .field("timeouts", &self.timeouts)
            .field("cache", &self.cache)
            .field("max_loop_depth", &self.max_loop_depth)
            .field("store_seed", &self.store_seed)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "<redacted>"),
            )
            .field("redis_prefix", &self.redis_prefix)
            .finish()
    }
}

impl GatewayConfig {
    /// Loads a `.toml` or `.json` file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let config: Self = match extension.as_deref() {
            Some("toml") => toml::from_str(&raw)?,
            Some("json") => serde_json::from_str(&raw)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_loop_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_loop_depth must be at least 1".to_string(),
            ));
        }
        let tiers = &self.rate_limits.tiers;
        for (tier, policy) in [
            ("free", tiers.free),
            ("pro", tiers.pro),
            ("growth", tiers.growth),
            ("enterprise", tiers.enterprise),
        ] {
            if policy.max_count == 0 || policy.window_seconds == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate_limits.tiers.{tier} needs a positive max_count and window_seconds"
                )));
            }
        }
        if self.logging.attempts == 0 {
            return Err(ConfigError::Invalid(
                "logging.attempts must be at least 1".to_string(),
            ));
        }
        self.provider_table()?;
        Ok(())
    }

    pub fn provider_table(&self) -> Result<ProviderTable, ConfigError> {
        let mut overrides = BTreeMap::new();
        for (name, base_url) in &self.providers {
            let provider = ProviderName::from_str(name)
                .map_err(|err| ConfigError::Invalid(format!("providers: {err}")))?;
            overrides.insert(provider, base_url.clone());
        }
        Ok(ProviderTable::new(overrides))
    }

    pub fn normalize_config(&self) -> NormalizeConfig {
        NormalizeConfig {
            max_loop_depth: self.max_loop_depth,
        }
    }
}
