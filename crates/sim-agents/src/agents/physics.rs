//! Physics specialist: scene setup, integrators, timesteps, stability.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use serde_json::json;
use sim_coordination::{
    CallContext, Capability, Context, KeywordProfile, ScoringWeights, Worker, WorkerError,
    WorkerReply,
};

use super::{
    capability_set, current_timestep, fmt_value, mentions_instability, profile_score,
    SpecialistKind, INSTABILITY, STABLE_TIMESTEP,
};

const STANDARD_GRAVITY: f64 = -9.81;
const DEFAULT_SUBSTEPS: f64 = 4.0;
const STABILITY_SUBSTEPS: f64 = 8.0;

static PROFILE: LazyLock<KeywordProfile> = LazyLock::new(|| {
    KeywordProfile::builder()
        .keywords(&[
            "simulation",
            "rigid body",
            "collision",
            "gravity",
            "force",
            "velocity",
            "integrat",
            "timestep",
            "time step",
            "constraint",
            "joint",
            "friction",
            "inertia",
            "particle",
            "solver",
        ])
        .domain_terms(&["physics", "rigid body", "dynamics", "mechanics"])
        .code_patterns(&[
            r"(?i)\bset_?gravity\s*\(",
            r"(?i)\bstep_?simulation\s*\(",
            r"(?i)\b(add|create)_?(rigid_?)?body\s*\(",
        ])
        .competing_terms(&["render", "plot", "visualiz", "profil", "traceback"])
        .build()
        .expect("physics keyword profile should compile")
});

/// Rigid body and integrator advice.
pub struct PhysicsWorker {
    weights: ScoringWeights,
    capabilities: BTreeSet<Capability>,
}

impl PhysicsWorker {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights,
            capabilities: capability_set(SpecialistKind::Physics),
        }
    }
}

#[async_trait]
impl Worker for PhysicsWorker {
    fn variant(&self) -> &str {
        SpecialistKind::Physics.variant()
    }

    fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    fn score(&self, query: &str, context: &Context) -> Result<f32, WorkerError> {
        Ok(profile_score(
            SpecialistKind::Physics,
            &PROFILE,
            &self.weights,
            query,
            context,
        ))
    }

    async fn answer(&self, query: &str, call: &CallContext) -> Result<WorkerReply, WorkerError> {
        let context = call.context();
        let confidence = PROFILE.score(&self.weights, query, context.code());
        let current = current_timestep(context);
        let unstable =
            mentions_instability(query) || context.code().is_some_and(mentions_instability);

        let timestep = current.map_or(STABLE_TIMESTEP, |c| c.min(STABLE_TIMESTEP));
        let substeps = if unstable {
            STABILITY_SUBSTEPS
        } else {
            DEFAULT_SUBSTEPS
        };

        let mut code = format!(
            "timestep = {}\nsubsteps = {}\n",
            fmt_value(timestep),
            fmt_value(substeps)
        );
        let mut reply = WorkerReply::new(String::new(), confidence)
            .with_capability(SpecialistKind::Physics.capability())
            .with_parameter("timestep", timestep)
            .with_parameter("substeps", substeps);

        if context.domain_f64("gravity").is_none() {
            code.push_str(&format!("gravity = {}\n", fmt_value(STANDARD_GRAVITY)));
            reply = reply.with_parameter("gravity", STANDARD_GRAVITY);
        }

        let answer = if unstable {
            reply = reply.claiming_fix_for(INSTABILITY);
            format!(
                "The integration is unstable. Use a fixed timestep of at most {} s with {} \
                 substeps per frame, and switch to a semi-implicit (symplectic) Euler \
                 integrator so energy does not grow between steps.",
                fmt_value(timestep),
                fmt_value(substeps)
            )
        } else {
            format!(
                "Set up the rigid body world with a fixed timestep of {} s ({} substeps per \
                 frame), gravity along -z, and collision shapes that match the visual \
                 meshes. Keep masses within a few orders of magnitude of each other.",
                fmt_value(timestep),
                fmt_value(substeps)
            )
        };
        reply.answer = answer;

        call.scratch().put("physics.timestep", json!(timestep));

        Ok(reply
            .with_code(code)
            .with_explanation(match current {
                Some(c) if c > STABLE_TIMESTEP => format!(
                    "The current timestep {} s is coarser than the {} s needed for stable \
                     contact resolution.",
                    fmt_value(c),
                    fmt_value(STABLE_TIMESTEP)
                ),
                Some(c) => format!("The current timestep {} s is already fine enough.", fmt_value(c)),
                None => "No timestep found in the context; using the 240 Hz default.".to_string(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sim_coordination::{ContextPatch, Scratchpad};

    fn call(context: Context) -> CallContext {
        CallContext::new(Arc::new(context), Scratchpad::new())
    }

    #[test]
    fn test_rigid_body_setup_scores_high() {
        let worker = PhysicsWorker::new(crate::AgentsConfig::default().physics);
        let score = worker
            .score("help me set up a rigid body simulation", &Context::new("s"))
            .unwrap();
        assert!((score - 0.9).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_setup_answer_recommends_stable_timestep() {
        let worker = PhysicsWorker::new(ScoringWeights::default());
        let reply = worker
            .answer("set up a rigid body simulation", &call(Context::new("s")))
            .await
            .unwrap();
        assert_eq!(reply.recommended_parameters["timestep"], STABLE_TIMESTEP);
        assert_eq!(reply.recommended_parameters["gravity"], STANDARD_GRAVITY);
        assert!(reply.definitive_fix_for.is_none());
        assert!(reply.code_suggestions[0].contains("timestep = 0.004167"));
    }

    #[tokio::test]
    async fn test_instability_claims_fix_and_keeps_finer_step() {
        let worker = PhysicsWorker::new(ScoringWeights::default());
        let mut context = Context::new("s");
        context.apply(ContextPatch::new().param("timestep", 0.001).param("gravity", -1.62));
        let reply = worker
            .answer("my simulation explodes", &call(context))
            .await
            .unwrap();
        assert_eq!(reply.recommended_parameters["timestep"], 0.001);
        assert_eq!(reply.recommended_parameters["substeps"], STABILITY_SUBSTEPS);
        assert!(!reply.recommended_parameters.contains_key("gravity"));
        assert_eq!(reply.definitive_fix_for.as_deref(), Some(INSTABILITY));
    }
}
