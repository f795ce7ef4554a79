//! agentgrid.toml configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable single-host configuration. Environment variables override the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridConfig {
    /// Directory holding the state store.
    pub data_dir: PathBuf,
    /// Root under which each tenant gets `<id>/` with its descriptor and secrets.
    pub tenants_dir: PathBuf,
    /// Workspace template root (contains `personal-assistant/*.md.tmpl`).
    pub templates_dir: PathBuf,
    pub max_tenants: u32,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub base_domain: String,
    /// Reverse-proxy admin endpoint. Registration is skipped when unset.
    pub proxy_admin_url: Option<String>,
    /// Server block routes are registered under.
    pub proxy_server: String,
    pub gateway_token_prefix: String,
    /// Upper bound for a single container-runtime call.
    pub runtime_timeout_secs: u64,
    /// Upper bound for a single bot-token validation call.
    pub validation_timeout_secs: u64,
    pub validation_api_base: String,
    pub breaker: BreakerSettings,
    /// Provider credentials keyed by the provider's `env_key`.
    pub provider_keys: HashMap<String, String>,
}

/// Circuit breaker thresholds for the bot-token validation dependency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    pub max_failures: u32,
    pub open_timeout_secs: u64,
    pub half_open_max_probes: u32,
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: 5,
            open_timeout_secs: 30,
            half_open_max_probes: 3,
            success_threshold: 2,
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./tmp/platform"),
            tenants_dir: PathBuf::from("./tmp/tenants"),
            templates_dir: PathBuf::from("./templates"),
            max_tenants: 20,
            port_range_start: 30000,
            port_range_end: 30999,
            base_domain: "localhost".to_string(),
            proxy_admin_url: None,
            proxy_server: "srv0".to_string(),
            gateway_token_prefix: "agentgrid_".to_string(),
            runtime_timeout_secs: 120,
            validation_timeout_secs: 10,
            validation_api_base: "https://api.telegram.org".to_string(),
            breaker: BreakerSettings::default(),
            provider_keys: HashMap::new(),
        }
    }
}

/// Credentials picked up from the process environment when present.
const PROVIDER_ENV_KEYS: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GROQ_API_KEY",
    "OLLAMA_HOST",
];

impl GridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay `AGENTGRID_*` variables and provider credentials from the
    /// process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("AGENTGRID_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("AGENTGRID_TENANTS_DIR") {
            self.tenants_dir = PathBuf::from(v);
        }
        if let Some(v) = get("AGENTGRID_TEMPLATES_DIR") {
            self.templates_dir = PathBuf::from(v);
        }
        if let Some(v) = get("AGENTGRID_MAX_TENANTS") {
            self.max_tenants = parse_env("AGENTGRID_MAX_TENANTS", &v)?;
        }
        if let Some(v) = get("AGENTGRID_PORT_RANGE_START") {
            self.port_range_start = parse_env("AGENTGRID_PORT_RANGE_START", &v)?;
        }
        if let Some(v) = get("AGENTGRID_PORT_RANGE_END") {
            self.port_range_end = parse_env("AGENTGRID_PORT_RANGE_END", &v)?;
        }
        if let Some(v) = get("AGENTGRID_BASE_DOMAIN") {
            self.base_domain = v;
        }
        if let Some(v) = get("AGENTGRID_PROXY_ADMIN_URL") {
            self.proxy_admin_url = Some(v);
        }
        for key in PROVIDER_ENV_KEYS {
            if let Some(v) = get(key) {
                self.provider_keys.insert((*key).to_string(), v);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tenants == 0 {
            return Err(ConfigError::Invalid("max_tenants must be positive".into()));
        }
        if self.port_range_end <= self.port_range_start {
            return Err(ConfigError::Invalid(
                "port_range_end must be greater than port_range_start".into(),
            ));
        }
        let width = u32::from(self.port_range_end - self.port_range_start);
        if width < self.max_tenants {
            return Err(ConfigError::Invalid(
                "port range must accommodate max_tenants".into(),
            ));
        }
        if self.breaker.max_failures == 0
            || self.breaker.half_open_max_probes == 0
            || self.breaker.success_threshold == 0
        {
            return Err(ConfigError::Invalid(
                "breaker thresholds must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("agentgrid.redb")
    }

    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_timeout_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    /// Credential for a provider, looked up by its `env_key`.
    pub fn provider_key(&self, env_key: &str) -> Option<&str> {
        self.provider_keys.get(env_key).map(String::as_str)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}
