//! Worker configuration.
//!
//! Resolution order: defaults → config file → environment overrides.
//!
//! Config file location:
//!   1. the path given by the caller (`--config`)
//!   2. $CONVEYOR_CONFIG
//!   3. none: defaults only
//!
//! Environment overrides use `CONVEYOR_<SECTION>__<KEY>`, e.g.
//! `CONVEYOR_WORKER__THREADS=8` or `CONVEYOR_WORKER__PREFETCH__INGEST=16`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::domain::Stage;

pub const CONFIG_ENV: &str = "CONVEYOR_CONFIG";
pub const ENV_PREFIX: &str = "CONVEYOR_";

/// Prefetch used for a stage missing from the prefetch map.
pub const DEFAULT_PREFETCH: u16 = 1;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub broker: BrokerSettings,
    pub worker: WorkerSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Highest message priority. Publish picks uniformly from `1..=max_priority`.
    pub max_priority: u8,
    /// How long a publish waits for the broker confirm.
    pub confirm_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Consumers per stage.
    pub threads: usize,
    /// Stages this process consumes.
    pub stages: Vec<Stage>,
    /// Unsettled deliveries allowed per consumer, by stage name.
    pub prefetch: BTreeMap<String, u16>,
    pub on_publish_failure: PublishFailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    /// Total deliveries before a failing task is dead-lettered.
    pub max_attempts: u32,
}

/// What to do when the continuation of a finished task cannot be published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishFailurePolicy {
    /// Fail the current task so it is retried; its handler may run again.
    #[default]
    Redeliver,
    /// Log and acknowledge; the lineage ends here.
    Drop,
}

impl FromStr for PublishFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redeliver" => Ok(Self::Redeliver),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown publish failure policy '{other}'")),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_priority: 10,
            confirm_timeout_ms: 5_000,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            stages: Stage::ALL.to_vec(),
            prefetch: BTreeMap::from([
                (Stage::Ingest.as_str().to_string(), 4),
                (Stage::Analyze.as_str().to_string(), 1),
            ]),
            on_publish_failure: PublishFailurePolicy::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value '{value}' for {key}")]
    InvalidOverride { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl WorkerConfig {
    /// Load config: defaults → file → env, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match &path {
            Some(path) => Self::read_file(path)?,
            None => WorkerConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        Self::from_toml_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)
    }

    /// Apply `CONVEYOR_*` overrides. `lookup` resolves a variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            let key = format!("{ENV_PREFIX}{key}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("BROKER__MAX_PRIORITY") {
            self.broker.max_priority = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("BROKER__CONFIRM_TIMEOUT_MS") {
            self.broker.confirm_timeout_ms = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("WORKER__THREADS") {
            self.worker.threads = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("WORKER__STAGES") {
            self.worker.stages = value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| parse::<Stage>(&key, name))
                .collect::<Result<_, _>>()?;
        }
        if let Some((key, value)) = get("WORKER__ON_PUBLISH_FAILURE") {
            self.worker.on_publish_failure = parse(&key, &value)?;
        }
        for stage in Stage::ALL {
            let suffix = format!("WORKER__PREFETCH__{}", stage.as_str().to_ascii_uppercase());
            if let Some((key, value)) = get(&suffix) {
                self.worker
                    .prefetch
                    .insert(stage.as_str().to_string(), parse(&key, &value)?);
            }
        }
        if let Some((key, value)) = get("RETRY__BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("RETRY__MULTIPLIER") {
            self.retry.multiplier = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("RETRY__MAX_ATTEMPTS") {
            self.retry.max_attempts = parse(&key, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.max_priority == 0 {
            return Err(ConfigError::Invalid(
                "broker.max_priority must be between 1 and 255".to_string(),
            ));
        }
        if self.worker.threads == 0 {
            return Err(ConfigError::Invalid(
                "worker.threads must be at least 1".to_string(),
            ));
        }
        if self.worker.stages.is_empty() {
            return Err(ConfigError::Invalid(
                "worker.stages must name at least one stage".to_string(),
            ));
        }
        for (i, stage) in self.worker.stages.iter().enumerate() {
            if self.worker.stages[..i].contains(stage) {
                return Err(ConfigError::Invalid(format!(
                    "worker.stages lists '{stage}' more than once"
                )));
            }
        }
        for (name, prefetch) in &self.worker.prefetch {
            if name.parse::<Stage>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "worker.prefetch names unknown stage '{name}'"
                )));
            }
            if *prefetch == 0 {
                return Err(ConfigError::Invalid(format!(
                    "worker.prefetch.{name} must be at least 1"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn prefetch_for(&self, stage: Stage) -> u16 {
        self.worker
            .prefetch
            .get(stage.as_str())
            .copied()
            .unwrap_or(DEFAULT_PREFETCH)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.confirm_timeout_ms)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        })
}
