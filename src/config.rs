//! Runner configuration.
//!
//! Environment variables (all optional):
//! - `CUA_VIEWPORT_WIDTH` / `CUA_VIEWPORT_HEIGHT` - logical viewport, default 1280x720
//! - `CUA_MAX_STEPS` - step ceiling per attempt, default 10
//! - `CUA_MAX_CONCURRENT` - concurrent attempts, default 5
//! - `CUA_POOL_IDLE` - idle browsers kept for reuse, default 3
//! - `CUA_POOL_MAX_LIVE` - live browser ceiling, default 5
//! - `CUA_SETTLE_MS` - delay after every browser action, default 500
//! - `CUA_SCREENSHOT_TIMEOUT_SECS` - default 30
//! - `CUA_RETRY_UNIT_MS` - backoff time unit, default 1000
//! - `CUA_HEADLESS` - default true
//! - `CUA_ARTIFACTS_DIR` - trajectory output, default `$TMPDIR/cua_runs`

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::action::{NormalizationParams, IMAGE_FACTOR};
use crate::decode::ProtocolKind;
use crate::gateway::Locality;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Static description of one model taking part in a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Name used in the (model x task) matrix and in artifact paths.
    pub id: String,
    /// Identifier sent to the provider (model name or deployment).
    pub model: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub locality: Locality,
    pub protocol: ProtocolKind,
    #[serde(default = "default_resize_factor")]
    pub resize_factor: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_resize_factor() -> u32 {
    IMAGE_FACTOR
}

fn default_max_tokens() -> u32 {
    16384
}

fn default_temperature() -> f32 {
    0.3
}

impl ModelDescriptor {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        locality: Locality,
        protocol: ProtocolKind,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            base_url: base_url.into(),
            api_key: String::new(),
            locality,
            protocol,
            resize_factor: default_resize_factor(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    /// Resolves an `api_key` of the form `${VAR}` from the environment.
    pub fn resolve_env(mut self) -> Result<Self, ConfigError> {
        let key = self.api_key.trim();
        if let Some(var) = key.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            self.api_key =
                env::var(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))?;
        }
        Ok(self)
    }

    /// How this model's coordinates map onto the given viewport.
    pub fn normalization(&self, viewport: (u32, u32)) -> NormalizationParams {
        match self.protocol {
            ProtocolKind::TextGrammar => {
                NormalizationParams::resized(viewport.0, viewport.1, self.resize_factor)
            }
            ProtocolKind::StructuredObject => NormalizationParams::identity(viewport.0, viewport.1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub viewport: (u32, u32),
    pub max_steps: usize,
    pub max_concurrent: usize,
    pub pool_idle: usize,
    pub pool_max_live: usize,
    pub settle_delay: Duration,
    pub screenshot_timeout: Duration,
    pub retry_unit: Duration,
    pub headless: bool,
    pub artifacts_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let base = Self::builtin();
        Self::from_env().unwrap_or(base)
    }
}

impl RunnerConfig {
    fn builtin() -> Self {
        Self {
            viewport: (1280, 720),
            max_steps: 10,
            max_concurrent: 5,
            pool_idle: 3,
            pool_max_live: 5,
            settle_delay: Duration::from_millis(500),
            screenshot_timeout: Duration::from_secs(30),
            retry_unit: Duration::from_secs(1),
            headless: true,
            artifacts_dir: env::temp_dir().join("cua_runs"),
        }
    }

    /// Like `default()` but rejects malformed values instead of ignoring them.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let b = Self::builtin();
        let cfg = Self {
            viewport: (
                parse_or(&get, "CUA_VIEWPORT_WIDTH", b.viewport.0)?,
                parse_or(&get, "CUA_VIEWPORT_HEIGHT", b.viewport.1)?,
            ),
            max_steps: parse_or(&get, "CUA_MAX_STEPS", b.max_steps)?,
            max_concurrent: parse_or(&get, "CUA_MAX_CONCURRENT", b.max_concurrent)?,
            pool_idle: parse_or(&get, "CUA_POOL_IDLE", b.pool_idle)?,
            pool_max_live: parse_or(&get, "CUA_POOL_MAX_LIVE", b.pool_max_live)?,
            settle_delay: Duration::from_millis(parse_or(&get, "CUA_SETTLE_MS", 500u64)?),
            screenshot_timeout: Duration::from_secs(parse_or(&get, "CUA_SCREENSHOT_TIMEOUT_SECS", 30u64)?),
            retry_unit: Duration::from_millis(parse_or(&get, "CUA_RETRY_UNIT_MS", 1000u64)?),
            headless: parse_or(&get, "CUA_HEADLESS", b.headless)?,
            artifacts_dir: get("CUA_ARTIFACTS_DIR").map(PathBuf::from).unwrap_or(b.artifacts_dir),
        };
        if cfg.max_steps == 0 {
            return Err(ConfigError::InvalidValue("CUA_MAX_STEPS".into(), "0".into()));
        }
        if cfg.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue("CUA_MAX_CONCURRENT".into(), "0".into()));
        }
        if cfg.pool_max_live < cfg.pool_idle {
            return Err(ConfigError::InvalidValue(
                "CUA_POOL_MAX_LIVE".into(),
                format!("{} is below CUA_POOL_IDLE {}", cfg.pool_max_live, cfg.pool_idle),
            ));
        }
        Ok(cfg)
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw)),
        _ => Ok(default),
    }
}
