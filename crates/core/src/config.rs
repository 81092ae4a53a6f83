//! Runtime configuration, composed of one section per component:
//! `Config { rate_limit, breaker, pool, retrieval, workflow, ... }`,
//! each with `#[serde(default)]` so a config file can override only the
//! sections it cares about.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { capacity: 60, refill_per_sec: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub fail_threshold: u32,
    #[serde(with = "humantime_serde_duration")]
    pub window: Duration,
    #[serde(with = "humantime_serde_duration")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { fail_threshold: 5, window: Duration::from_secs(30), cooldown: Duration::from_secs(15) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub size: usize,
    #[serde(with = "humantime_serde_duration")]
    pub acquire_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde_duration")]
    pub base_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { size: 8, acquire_timeout: Duration::from_secs(5), max_retries: 3, base_backoff: Duration::from_millis(100) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub enabled: bool,
    pub top_k: usize,
    pub rerank_enabled: bool,
    pub rerank_top_k: usize,
    pub query_expansion: bool,
    pub max_expansions: usize,
    pub token_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 8,
            rerank_enabled: false,
            rerank_top_k: 16,
            query_expansion: false,
            max_expansions: 3,
            token_budget: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub max_concurrent: usize,
    #[serde(with = "humantime_serde_duration")]
    pub cancel_grace: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { max_concurrent: 4, cancel_grace: Duration::from_secs(2) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationConfig {
    pub consensus_threshold: f64,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self { consensus_threshold: 0.85 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub ttl_seconds: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { ttl_seconds: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub streams: Vec<String>,
    pub dir: std::path::PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            streams: vec!["governance".into(), "tool-invocation".into(), "policy-change".into()],
            dir: std::path::PathBuf::from("./audit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyProfile {
    Production,
    Staging,
    Development,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub profile: SafetyProfile,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { profile: SafetyProfile::Production }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mode_scope_tags: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub arbitration: ArbitrationConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.arbitration.consensus_threshold) {
            return Err(ConfigError::Validation("arbitration.consensus_threshold must be in [0,1]".into()));
        }
        if self.pool.size == 0 {
            return Err(ConfigError::Validation("pool.size must be > 0".into()));
        }
        Ok(())
    }
}

mod humantime_serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
