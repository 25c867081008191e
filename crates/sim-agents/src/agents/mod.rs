//! The builtin simulation specialists.
//!
//! Each specialist is a keyword profile (for `score`) plus a small rule set
//! that turns the query and session context into advice (for `answer`).
//! They are registered by name; the coordinator never sees the concrete
//! types.

pub mod debug;
pub mod optimization;
pub mod physics;
pub mod visualization;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use sim_coordination::coordinator::extract_assignments;
use sim_coordination::{
    tags, Capability, Context, KeywordProfile, RegistryError, ScoringWeights, SharedCodeRunner,
    WorkerRegistry,
};
use tracing::{debug, info};

use crate::config::AgentsConfig;

pub use debug::DebugWorker;
pub use optimization::OptimizationWorker;
pub use physics::PhysicsWorker;
pub use visualization::VisualizationWorker;

/// Symptom name used when claiming a definitive fix for blow-ups.
pub const INSTABILITY: &str = "numerical_instability";

/// Physics timestep recommended for rigid body scenes (240 Hz).
pub const STABLE_TIMESTEP: f64 = 1.0 / 240.0;

const TIMESTEP_KEYS: &[&str] = &["timestep", "time_step", "dt"];

static INSTABILITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(nan|inf|explod\w*|blow(s|ing)? up|blew up|unstable|instabilit\w*|diverg\w*|overflow\w*)\b",
    )
    .expect("instability regex should compile")
});

/// The closed set of builtin specialists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum SpecialistKind {
    Physics,
    Visualization,
    Optimization,
    Debug,
}

impl SpecialistKind {
    /// Registration order, which is also the tie-break order.
    pub const ALL: [SpecialistKind; 4] = [
        SpecialistKind::Physics,
        SpecialistKind::Visualization,
        SpecialistKind::Optimization,
        SpecialistKind::Debug,
    ];

    /// Registry name
    pub fn name(self) -> &'static str {
        match self {
            SpecialistKind::Physics => "physics",
            SpecialistKind::Visualization => "visualization",
            SpecialistKind::Optimization => "optimization",
            SpecialistKind::Debug => "debug",
        }
    }

    /// Variant name reported in responses
    pub fn variant(self) -> &'static str {
        match self {
            SpecialistKind::Physics => "Physics",
            SpecialistKind::Visualization => "Visualization",
            SpecialistKind::Optimization => "Optimization",
            SpecialistKind::Debug => "Debug",
        }
    }

    pub fn capability(self) -> &'static str {
        match self {
            SpecialistKind::Physics => tags::PHYSICS_SIMULATION,
            SpecialistKind::Visualization => tags::VISUALIZATION_3D,
            SpecialistKind::Optimization => tags::PERFORMANCE_TUNING,
            SpecialistKind::Debug => tags::ERROR_ANALYSIS,
        }
    }
}

impl std::fmt::Display for SpecialistKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Register all four specialists. Registering again replaces them.
///
/// Only the Debug specialist holds `runner`.
pub fn register_builtin(
    registry: &WorkerRegistry,
    config: &AgentsConfig,
    runner: Option<SharedCodeRunner>,
) -> Result<(), RegistryError> {
    let weights = config.physics;
    registry.register_worker(SpecialistKind::Physics.name(), move || {
        PhysicsWorker::new(weights)
    })?;

    let weights = config.visualization;
    registry.register_worker(SpecialistKind::Visualization.name(), move || {
        VisualizationWorker::new(weights)
    })?;

    let weights = config.optimization;
    registry.register_worker(SpecialistKind::Optimization.name(), move || {
        OptimizationWorker::new(weights)
    })?;

    let weights = config.debug;
    let has_runner = runner.is_some();
    registry.register_worker(SpecialistKind::Debug.name(), move || {
        DebugWorker::new(weights).with_runner(runner.clone())
    })?;

    info!(
        count = SpecialistKind::ALL.len(),
        runner = has_runner,
        "Builtin specialists registered"
    );
    Ok(())
}

pub(crate) fn capability_set(kind: SpecialistKind) -> BTreeSet<Capability> {
    BTreeSet::from([Capability::from(kind.capability())])
}

/// Score with `profile`, logging how the score was reached.
pub(crate) fn profile_score(
    kind: SpecialistKind,
    profile: &KeywordProfile,
    weights: &ScoringWeights,
    query: &str,
    context: &Context,
) -> f32 {
    let breakdown = profile.evaluate(weights, query, context.code());
    debug!(
        specialist = %kind,
        session_id = %context.session_id,
        query_matches = breakdown.query_matches,
        code_matches = breakdown.code_matches,
        domain_named = breakdown.domain_named,
        competing = breakdown.competing_signal,
        score = breakdown.score,
        "Scored query"
    );
    breakdown.score
}

/// Timestep in use, from domain parameters first, then from the code.
pub fn current_timestep(context: &Context) -> Option<f64> {
    TIMESTEP_KEYS
        .iter()
        .find_map(|k| context.domain_f64(k))
        .or_else(|| {
            let assignments = extract_assignments(context.code()?);
            TIMESTEP_KEYS
                .iter()
                .find_map(|k| assignments.get(*k).copied())
        })
        .filter(|v| v.is_finite() && *v > 0.0)
}

/// Whether `text` describes a simulation blowing up.
pub fn mentions_instability(text: &str) -> bool {
    INSTABILITY_RE.is_match(text)
}

/// Format a value so it survives a round trip through `name = value`.
pub(crate) fn fmt_value(value: f64) -> String {
    let s = format!("{value:.6}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() || s == "-" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_coordination::ContextPatch;

    #[test]
    fn test_current_timestep_prefers_params() {
        let mut ctx = Context::new("s1");
        ctx.apply(ContextPatch::new().code("dt = 0.01\n"));
        assert_eq!(current_timestep(&ctx), Some(0.01));

        ctx.apply(ContextPatch::new().param("timestep", 0.002));
        assert_eq!(current_timestep(&ctx), Some(0.002));
    }

    #[test]
    fn test_current_timestep_ignores_nonsense() {
        let mut ctx = Context::new("s1");
        ctx.apply(ContextPatch::new().param("dt", -1.0));
        assert_eq!(current_timestep(&ctx), None);
    }

    #[test]
    fn test_instability_vocabulary() {
        assert!(mentions_instability("my simulation explodes after 3 seconds"));
        assert!(mentions_instability("positions become NaN"));
        assert!(mentions_instability("the solver diverges"));
        assert!(!mentions_instability("set up a rigid body simulation"));
        assert!(!mentions_instability("plot the infinite plane"));
    }

    #[test]
    fn test_fmt_value_is_parseable() {
        assert_eq!(fmt_value(0.0041666), "0.004167");
        assert_eq!(fmt_value(60.0), "60");
        assert_eq!(fmt_value(-9.81), "-9.81");
        assert_eq!(fmt_value(0.0), "0");
    }

    #[test]
    fn test_profile_score_counts_query_and_code_hits() {
        let profile = KeywordProfile::builder()
            .keywords(&["rigid body"])
            .build()
            .unwrap();
        let weights = ScoringWeights::default();
        let mut ctx = Context::new("s1");
        ctx.apply(ContextPatch::new().code("# rigid body drop test\n"));

        let score = profile_score(SpecialistKind::Physics, &profile, &weights, "a rigid body", &ctx);
        assert!((score - 0.6).abs() < 1e-6);
        assert_eq!(
            score,
            profile.evaluate(&weights, "a rigid body", ctx.code()).score
        );
    }

    #[test]
    fn test_kind_names() {
        let names: Vec<_> = SpecialistKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names, vec!["physics", "visualization", "optimization", "debug"]);
        assert_eq!(SpecialistKind::Debug.capability(), "error-analysis");
    }
}
