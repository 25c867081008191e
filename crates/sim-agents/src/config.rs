use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sim_coordination::ScoringWeights;

use crate::agents::SpecialistKind;

const DEFAULT_RUNNER_TIMEOUT_SECS: u64 = 30;

/// External interpreter used by the Debug specialist to reproduce errors.
///
/// The snippet is written to the program's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Interpreter to launch (e.g. "python3"). No runner when unset.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["-".to_string()],
            timeout_secs: DEFAULT_RUNNER_TIMEOUT_SECS,
        }
    }
}

impl RunnerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-specialist scoring weights plus runner settings.
///
/// Loaded from the `[physics]`, `[visualization]`, `[optimization]`,
/// `[debug]` and `[runner]` tables; other tables (e.g. `[coordinator]`)
/// are ignored. Keys left out of a specialist table take the generic
/// [`ScoringWeights`] defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub physics: ScoringWeights,
    pub visualization: ScoringWeights,
    pub optimization: ScoringWeights,
    pub debug: ScoringWeights,
    pub runner: RunnerSettings,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        // Physics ≈ 0.9, Visualization ≈ 0.3 for "set up a rigid body simulation"
        Self {
            physics: ScoringWeights {
                weight_per_match: 0.3,
                ..Default::default()
            },
            visualization: ScoringWeights {
                weight_per_match: 0.2,
                ..Default::default()
            },
            optimization: ScoringWeights::default(),
            debug: ScoringWeights::default(),
            runner: RunnerSettings::default(),
        }
    }
}

impl AgentsConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse agents config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Apply `SIM_RUNNER_PROGRAM` / `SIM_RUNNER_TIMEOUT_SECS` overrides.
    pub fn with_env(mut self) -> Self {
        if let Some(program) = std::env::var("SIM_RUNNER_PROGRAM")
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            self.runner.program = Some(program);
        }
        if let Some(secs) = std::env::var("SIM_RUNNER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
        {
            self.runner.timeout_secs = secs;
        }
        self
    }

    pub fn weights(&self, kind: SpecialistKind) -> ScoringWeights {
        match kind {
            SpecialistKind::Physics => self.physics,
            SpecialistKind::Visualization => self.visualization,
            SpecialistKind::Optimization => self.optimization,
            SpecialistKind::Debug => self.debug,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for kind in SpecialistKind::ALL {
            let w = self.weights(kind);
            let values = [
                ("weight_per_match", w.weight_per_match),
                ("domain_boost", w.domain_boost),
                ("competing_penalty", w.competing_penalty),
                ("baseline", w.baseline),
            ];
            for (key, value) in values {
                if !value.is_finite() || value < 0.0 {
                    bail!("[{kind}] {key} must be a non-negative number, got {value}");
                }
            }
        }
        if self.runner.timeout_secs == 0 {
            bail!("[runner] timeout_secs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AgentsConfig::default();
        config.validate().unwrap();
        assert_eq!(config.physics.weight_per_match, 0.3);
        assert!(config.runner.program.is_none());
    }

    #[test]
    fn test_toml_tables_override_per_specialist() {
        let config = AgentsConfig::from_toml_str(
            r#"
            [coordinator]
            default_max_workers = 2

            [debug]
            weight_per_match = 0.4
            domain_boost = 0.3

            [runner]
            program = "python3"
            timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.debug.weight_per_match, 0.4);
        assert_eq!(config.debug.domain_boost, 0.3);
        assert_eq!(config.physics, AgentsConfig::default().physics);
        assert_eq!(config.runner.program.as_deref(), Some("python3"));
        assert_eq!(config.runner.args, vec!["-"]);
        assert_eq!(config.runner.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_negative_weight_rejected() {
        let err = AgentsConfig::from_toml_str("[physics]\nbaseline = -0.5\n").unwrap_err();
        assert!(err.to_string().contains("[physics] baseline"));
    }
}
