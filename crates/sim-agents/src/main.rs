//! `sim-assist`: ask the simulation specialists from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Route a question to the best specialists
//! sim-assist ask "help me set up a rigid body simulation" \
//!     --require physics-simulation --require 3d-visualization
//!
//! # Ask one specialist about a file, overriding a parameter
//! sim-assist single debug "why does this explode?" --code-file sim.py --param timestep=0.02
//!
//! # Tuned weights, a local interpreter and an interaction log
//! SIM_RUNNER_PROGRAM=python3 sim-assist --config sim.toml --interactions log.jsonl ask "..."
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sim_agents::{register_builtin, AgentsConfig, CommandRunner, SpecialistKind};
use sim_coordination::{
    ContextPatch, CoordinationRequest, Coordinator, CoordinatorConfig, JsonlInteractionSink,
    SharedCodeRunner, WorkerRegistry,
};
use tracing::info;

const CLI_SESSION: &str = "cli";

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "sim-assist", author, version, about, long_about = None)]
struct Cli {
    /// TOML file with [coordinator], [physics], [visualization], [optimization], [debug] and [runner] tables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append every interaction to this JSONL file
    #[arg(long, global = true)]
    interactions: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Route a question to the best specialists and print the reconciled result
    Ask {
        query: String,

        /// Required capability (repeatable)
        #[arg(long = "require")]
        require: Vec<String>,

        /// Specialist to include regardless of capability (repeatable)
        #[arg(long = "prefer")]
        prefer: Vec<String>,

        #[arg(long)]
        max_workers: Option<usize>,

        /// Overall time budget in milliseconds
        #[arg(long)]
        budget_ms: Option<u64>,

        #[command(flatten)]
        context: ContextArgs,
    },
    /// Ask one specialist directly
    Single {
        #[arg(value_enum)]
        worker: SpecialistKind,

        query: String,

        #[command(flatten)]
        context: ContextArgs,
    },
    /// List registered specialists with their health counters
    Workers,
    /// List capabilities and the specialists declaring them
    Capabilities,
}

#[derive(clap::Args, Debug, Default)]
struct ContextArgs {
    /// File holding the code under discussion
    #[arg(long)]
    code_file: Option<PathBuf>,

    /// Domain parameter as name=value (repeatable)
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, f64)>,
}

impl ContextArgs {
    fn to_patch(&self) -> Result<ContextPatch> {
        let mut patch = ContextPatch::new();
        if let Some(path) = &self.code_file {
            let code = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            patch = patch.code(code);
        }
        for (name, value) in &self.params {
            patch = patch.param(name.clone(), *value);
        }
        Ok(patch)
    }
}

fn parse_param(raw: &str) -> Result<(String, f64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid value for {}: {e}", name.trim()))?;
    Ok((name.trim().to_string(), value))
}

fn load_configs(path: Option<&Path>) -> Result<(CoordinatorConfig, AgentsConfig)> {
    let Some(path) = path else {
        let coordinator = CoordinatorConfig::from_env().context("Invalid SIM_COORD_* override")?;
        return Ok((coordinator, AgentsConfig::default().with_env()));
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut coordinator = CoordinatorConfig::from_toml_str(&content)
        .with_context(|| format!("Invalid [coordinator] table in {}", path.display()))?;
    coordinator
        .apply_overrides(|key| std::env::var(key).ok())
        .context("Invalid SIM_COORD_* override")?;
    let agents = AgentsConfig::from_toml_str(&content)
        .with_context(|| format!("Invalid specialist tables in {}", path.display()))?
        .with_env();
    Ok((coordinator, agents))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (coordinator_config, agents_config) = load_configs(cli.config.as_deref())?;

    let runner = CommandRunner::from_settings(&agents_config.runner)
        .map(|r| Arc::new(r) as SharedCodeRunner);
    let registry = WorkerRegistry::new();
    register_builtin(&registry, &agents_config, runner)?;

    let mut coordinator = Coordinator::new(registry.shared(), coordinator_config);
    if let Some(path) = &cli.interactions {
        coordinator = coordinator.with_sink(Arc::new(JsonlInteractionSink::new(path)));
    }
    info!(
        workers = coordinator.list_worker_types().len(),
        interactions = ?cli.interactions,
        "sim-assist ready"
    );

    match cli.command {
        Commands::Ask {
            query,
            require,
            prefer,
            max_workers,
            budget_ms,
            context,
        } => {
            coordinator
                .create_session(CLI_SESSION, None, Some(context.to_patch()?))
                .await?;
            let mut request = CoordinationRequest::new(query);
            for capability in require {
                request = request.require(capability);
            }
            for worker in prefer {
                request = request.prefer(worker);
            }
            if let Some(max) = max_workers {
                request = request.max_workers(max);
            }
            if let Some(ms) = budget_ms {
                request = request.time_budget(Duration::from_millis(ms));
            }
            let result = coordinator.coordinate(CLI_SESSION, request).await;
            coordinator.end_session(CLI_SESSION).await?;
            print_json(&result?)?;
        }
        Commands::Single {
            worker,
            query,
            context,
        } => {
            coordinator.create_session(CLI_SESSION, None, None).await?;
            let overlay = context.to_patch()?;
            let overlay = (!overlay.is_empty()).then_some(overlay);
            let response = coordinator
                .query_single(CLI_SESSION, worker.name(), &query, overlay)
                .await;
            coordinator.end_session(CLI_SESSION).await?;
            print_json(&response?)?;
        }
        Commands::Workers => print_json(&coordinator.list_worker_types())?,
        Commands::Capabilities => print_json(&coordinator.list_capabilities())?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("timestep=0.01"), Ok(("timestep".to_string(), 0.01)));
        assert_eq!(parse_param(" dt = 2 "), Ok(("dt".to_string(), 2.0)));
        assert!(parse_param("timestep").is_err());
        assert!(parse_param("timestep=fast").is_err());
    }

    #[test]
    fn test_cli_parses_ask() {
        let cli = Cli::try_parse_from([
            "sim-assist",
            "ask",
            "help me set up a rigid body simulation",
            "--require",
            "physics-simulation",
            "--param",
            "timestep=0.01",
        ])
        .unwrap();
        match cli.command {
            Commands::Ask {
                require, context, ..
            } => {
                assert_eq!(require, vec!["physics-simulation"]);
                assert_eq!(context.params, vec![("timestep".to_string(), 0.01)]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_config_file_feeds_both_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.toml");
        std::fs::write(
            &path,
            "[coordinator]\ndefault_max_workers = 2\n\n[physics]\nweight_per_match = 0.5\n",
        )
        .unwrap();
        let (coordinator, agents) = load_configs(Some(&path)).unwrap();
        assert_eq!(coordinator.default_max_workers, 2);
        assert_eq!(agents.physics.weight_per_match, 0.5);
    }
}
