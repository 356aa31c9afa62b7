//! Configuration management for the capsule client
//!
//! Loads configuration with priority:
//! 1. capsule.toml (or specified config file)
//! 2. Environment variables (fallback)
//! 3. Defaults

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "capsule.toml";
pub const TOKEN_ENV_VAR: &str = "CAPSULE_API_TOKEN";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub api: ApiConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Backend endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP base URL, e.g. `https://studio.example.com`
    pub base_url: String,

    /// Explicit WebSocket base URL. Derived from `base_url` when absent.
    pub ws_base_url: Option<String>,

    /// Bearer token (can reference env var with ${VAR_NAME})
    pub token: Option<String>,
}

/// Transport selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_prefer_websocket")]
    pub prefer_websocket: bool,
}

/// Session defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_agent_model")]
    pub agent_model: String,
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Used when RUST_LOG is not set
    #[serde(default = "default_filter")]
    pub filter: String,

    pub service_name: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            prefer_websocket: default_prefer_websocket(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent_model: default_agent_model(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            filter: default_filter(),
            service_name: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration with the following priority:
    /// 1. Specified config file (if provided)
    /// 2. capsule.toml in current directory or a parent
    /// 3. Environment variables (fallback)
    /// 4. Defaults
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p.to_path_buf()
        } else {
            Self::find_config_file()?
        };

        tracing::debug!("Loading configuration from: {:?}", config_path);

        let contents = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))
    }

    /// Parse, resolve env references and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: ClientConfig = toml::from_str(contents)?;
        config.resolve_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Find capsule.toml by searching current directory and parents
    fn find_config_file() -> Result<PathBuf> {
        let mut current = env::current_dir()?;

        loop {
            let config_path = current.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Ok(config_path);
            }

            if !current.pop() {
                break;
            }
        }

        Err(anyhow!(
            "{} not found. Create one with: cp capsule.toml.example {}",
            CONFIG_FILE_NAME,
            CONFIG_FILE_NAME
        ))
    }

    /// Resolve ${VAR_NAME} references to environment variables
    fn resolve_env_vars(&mut self) {
        if let Some(resolved) = Self::resolve_env_var(&self.api.base_url) {
            self.api.base_url = resolved;
        }

        if let Some(ref url) = self.api.ws_base_url {
            self.api.ws_base_url = Self::resolve_env_var(url);
        }

        // Unresolved references fall back to the well-known variable.
        self.api.token = match self.api.token {
            Some(ref token) => {
                Self::resolve_env_var(token).or_else(|| env::var(TOKEN_ENV_VAR).ok())
            }
            None => env::var(TOKEN_ENV_VAR).ok(),
        };
    }

    /// Resolve a single ${VAR_NAME} reference
    fn resolve_env_var(value: &str) -> Option<String> {
        if value.starts_with("${") && value.ends_with('}') {
            let var_name = &value[2..value.len() - 1];
            env::var(var_name).ok()
        } else {
            Some(value.to_string())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(anyhow!("api.base_url must not be empty"));
        }
        match self.observability.log_format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(anyhow!(
                "observability.log_format must be \"text\" or \"json\", got {:?}",
                other
            )),
        }
    }

    /// Create test-friendly defaults pointing at a local backend
    pub fn test_defaults() -> Self {
        Self::for_base_url("http://127.0.0.1:8000")
    }

    /// Defaults around a given base URL
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self {
            api: ApiConfig {
                base_url: base_url.into(),
                ws_base_url: None,
                token: None,
            },
            transport: TransportConfig::default(),
            session: SessionConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

fn default_prefer_websocket() -> bool {
    true
}

fn default_agent_model() -> String {
    "capsule-director-v1".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_filter() -> String {
    "info".to_string()
}
