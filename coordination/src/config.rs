//! Coordinator tuning knobs.
//!
//! Defaults are compiled in. [`CoordinatorConfig::from_toml_str`] only
//! parses a `[coordinator]` table; [`CoordinatorConfig::from_file`] and
//! [`CoordinatorConfig::from_env`] then apply `SIM_COORD_*` environment
//! variables on top, so the environment wins over the file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse coordinator TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Workers engaged when a request does not say
    pub default_max_workers: usize,
    /// Overall budget when a request does not say
    pub default_time_budget_ms: u64,
    /// Upper bound for any single worker's timeout
    pub per_worker_timeout_ceiling_ms: u64,
    /// Supporting responses below this confidence are dropped
    pub min_confidence_floor: f32,
    /// Consensus reduction at 100% conflicting pairs
    pub conflict_penalty: f32,
    /// Relative difference above which two numeric recommendations conflict
    pub numeric_tolerance: f64,
    pub session_idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long closed sessions linger before being purged
    pub closed_session_retention_secs: u64,
    /// Per-session mailbox bound
    pub mailbox_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_max_workers: 3,
            default_time_budget_ms: 60_000,
            per_worker_timeout_ceiling_ms: 30_000,
            min_confidence_floor: 0.2,
            conflict_penalty: 0.5,
            numeric_tolerance: 0.05,
            session_idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
            closed_session_retention_secs: 10 * 60,
            mailbox_capacity: 256,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    coordinator: CoordinatorConfig,
}

impl CoordinatorConfig {
    /// Defaults with `SIM_COORD_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse the `[coordinator]` table of a TOML document. Missing keys
    /// keep their defaults; the environment is not consulted.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        file.coordinator.validate()?;
        Ok(file.coordinator)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_value(&lookup, "SIM_COORD_MAX_WORKERS", &mut self.default_max_workers)?;
        override_value(&lookup, "SIM_COORD_TIME_BUDGET_MS", &mut self.default_time_budget_ms)?;
        override_value(
            &lookup,
            "SIM_COORD_WORKER_TIMEOUT_MS",
            &mut self.per_worker_timeout_ceiling_ms,
        )?;
        override_value(&lookup, "SIM_COORD_MIN_CONFIDENCE", &mut self.min_confidence_floor)?;
        override_value(&lookup, "SIM_COORD_CONFLICT_PENALTY", &mut self.conflict_penalty)?;
        override_value(&lookup, "SIM_COORD_NUMERIC_TOLERANCE", &mut self.numeric_tolerance)?;
        override_value(
            &lookup,
            "SIM_COORD_SESSION_IDLE_SECS",
            &mut self.session_idle_timeout_secs,
        )?;
        override_value(&lookup, "SIM_COORD_SWEEP_INTERVAL_SECS", &mut self.sweep_interval_secs)?;
        override_value(
            &lookup,
            "SIM_COORD_CLOSED_RETENTION_SECS",
            &mut self.closed_session_retention_secs,
        )?;
        override_value(&lookup, "SIM_COORD_MAILBOX_CAPACITY", &mut self.mailbox_capacity)?;
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_workers == 0 {
            return Err(ConfigError::Invalid("default_max_workers must be at least 1".into()));
        }
        if self.default_time_budget_ms == 0 || self.per_worker_timeout_ceiling_ms == 0 {
            return Err(ConfigError::Invalid("time budgets must be positive".into()));
        }
        for (name, value) in [
            ("min_confidence_floor", self.min_confidence_floor),
            ("conflict_penalty", self.conflict_penalty),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1]")));
            }
        }
        if !self.numeric_tolerance.is_finite() || self.numeric_tolerance < 0.0 {
            return Err(ConfigError::Invalid("numeric_tolerance must be >= 0".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn default_time_budget(&self) -> Duration {
        Duration::from_millis(self.default_time_budget_ms)
    }

    pub fn per_worker_timeout_ceiling(&self) -> Duration {
        Duration::from_millis(self.per_worker_timeout_ceiling_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn closed_session_retention(&self) -> Duration {
        Duration::from_secs(self.closed_session_retention_secs)
    }
}

fn override_value<T, F>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}
