//! Optimization specialist: throughput and wall-clock cost.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use sim_coordination::{
    CallContext, Capability, Context, KeywordProfile, ScoringWeights, Worker, WorkerError,
    WorkerReply,
};

use super::{
    capability_set, current_timestep, fmt_value, profile_score, SpecialistKind, STABLE_TIMESTEP,
};

/// Coarsest step worth suggesting for interactive rigid body scenes
const MAX_TIMESTEP: f64 = 1.0 / 60.0;

static PROFILE: LazyLock<KeywordProfile> = LazyLock::new(|| {
    KeywordProfile::builder()
        .keywords(&[
            "slow",
            "speed",
            "fast",
            "performance",
            "optimi",
            "profil",
            "parallel",
            "vectori",
            "gpu",
            "memory",
            "bottleneck",
            "throughput",
            "real-time",
            "real time",
        ])
        .domain_terms(&["performance", "optimi", "speed up"])
        .code_patterns(&[
            r"(?m)^\s*for\s+\w+\s+in\s+range\s*\(",
            r"(?i)\b(numba|jit|multiprocessing|rayon|cuda)\b",
        ])
        .competing_terms(&["crash", "traceback", "exception", "nan"])
        .build()
        .expect("optimization keyword profile should compile")
});

/// Cost-reduction advice.
pub struct OptimizationWorker {
    weights: ScoringWeights,
    capabilities: BTreeSet<Capability>,
}

impl OptimizationWorker {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights,
            capabilities: capability_set(SpecialistKind::Optimization),
        }
    }
}

#[async_trait]
impl Worker for OptimizationWorker {
    fn variant(&self) -> &str {
        SpecialistKind::Optimization.variant()
    }

    fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    fn score(&self, query: &str, context: &Context) -> Result<f32, WorkerError> {
        Ok(profile_score(
            SpecialistKind::Optimization,
            &PROFILE,
            &self.weights,
            query,
            context,
        ))
    }

    async fn answer(&self, query: &str, call: &CallContext) -> Result<WorkerReply, WorkerError> {
        let context = call.context();
        let confidence = PROFILE.score(&self.weights, query, context.code());
        let reply = WorkerReply::new(String::new(), confidence)
            .with_capability(SpecialistKind::Optimization.capability());

        if !PROFILE.mentions(query) {
            let mut reply = reply;
            reply.answer = "Profile one frame before changing anything; most simulation time \
                            usually goes to broad-phase collision and Python-level loops."
                .to_string();
            return Ok(reply);
        }

        // Fewer, larger steps are the cheapest speedup available
        let timestep = current_timestep(context)
            .map_or(2.0 * STABLE_TIMESTEP, |c| 2.0 * c)
            .min(MAX_TIMESTEP);

        let mut reply = reply
            .with_parameter("timestep", timestep)
            .with_code(format!("timestep = {}\n", fmt_value(timestep)));
        reply.answer = format!(
            "Double the timestep to {} s to halve the number of solver steps, vectorize \
             per-body updates instead of looping in Python, and enable sleeping for bodies \
             at rest.",
            fmt_value(timestep)
        );
        if context
            .code()
            .is_some_and(|c| c.contains("for ") && c.contains("range("))
        {
            reply = reply.with_explanation(
                "The snippet steps bodies one at a time in an interpreted loop; batching \
                 them into array operations removes most of that overhead.",
            );
        }
        Ok(reply)
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

    #[tokio::test]
    async fn test_slow_query_doubles_timestep() {
        let mut context = Context::new("s");
        context.apply(ContextPatch::new().param("timestep", 0.005));
        let reply = OptimizationWorker::new(ScoringWeights::default())
            .answer("my simulation is too slow", &call(context))
            .await
            .unwrap();
        assert_eq!(reply.recommended_parameters["timestep"], 0.01);
    }

    #[tokio::test]
    async fn test_timestep_is_capped() {
        let mut context = Context::new("s");
        context.apply(ContextPatch::new().param("timestep", 0.05));
        let reply = OptimizationWorker::new(ScoringWeights::default())
            .answer("speed this up", &call(context))
            .await
            .unwrap();
        assert_eq!(reply.recommended_parameters["timestep"], MAX_TIMESTEP);
    }

    #[tokio::test]
    async fn test_unrelated_query_makes_no_recommendation() {
        let reply = OptimizationWorker::new(ScoringWeights::default())
            .answer("set up a rigid body simulation", &call(Context::new("s")))
            .await
            .unwrap();
        assert!(reply.recommended_parameters.is_empty());
        assert!((reply.confidence - 0.1).abs() < 1e-6);
    }
}
