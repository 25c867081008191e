//! Visualization specialist: how to look at simulation output.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use sim_coordination::{
    CallContext, Capability, Context, KeywordProfile, ScoringWeights, Worker, WorkerError,
    WorkerReply,
};

use super::{capability_set, current_timestep, fmt_value, profile_score, SpecialistKind};

const TARGET_FPS: f64 = 60.0;

static PROFILE: LazyLock<KeywordProfile> = LazyLock::new(|| {
    KeywordProfile::builder()
        .keywords(&[
            "visualiz",
            "render",
            "plot",
            "mesh",
            "camera",
            "animat",
            "3d",
            "scene",
            "color",
            "frame",
            "simulation",
        ])
        .domain_terms(&["visualiz", "render", "plot", "3d view"])
        .code_patterns(&[
            r"(?i)\b(matplotlib|pyvista|vtk|three|plotly)\b",
            r"(?i)\b(imshow|add_mesh|show)\s*\(",
        ])
        .competing_terms(&["nan", "traceback", "exception", "crash"])
        .build()
        .expect("visualization keyword profile should compile")
});

/// Rendering cadence and scene presentation advice.
pub struct VisualizationWorker {
    weights: ScoringWeights,
    capabilities: BTreeSet<Capability>,
}

impl VisualizationWorker {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights,
            capabilities: capability_set(SpecialistKind::Visualization),
        }
    }
}

#[async_trait]
impl Worker for VisualizationWorker {
    fn variant(&self) -> &str {
        SpecialistKind::Visualization.variant()
    }

    fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    fn score(&self, query: &str, context: &Context) -> Result<f32, WorkerError> {
        Ok(profile_score(
            SpecialistKind::Visualization,
            &PROFILE,
            &self.weights,
            query,
            context,
        ))
    }

    async fn answer(&self, query: &str, call: &CallContext) -> Result<WorkerReply, WorkerError> {
        let context = call.context();
        let confidence = PROFILE.score(&self.weights, query, context.code());

        // Render every Nth physics step so the viewer stays at TARGET_FPS
        let stride = current_timestep(context)
            .map(|dt| ((1.0 / TARGET_FPS) / dt).round().max(1.0))
            .unwrap_or(1.0);

        let answer = format!(
            "Decouple rendering from the physics loop: draw every {} step(s) to hold \
             about {} fps, reuse mesh buffers between frames, and color bodies by speed \
             so unstable regions stand out.",
            fmt_value(stride),
            fmt_value(TARGET_FPS)
        );

        Ok(WorkerReply::new(answer, confidence)
            .with_capability(SpecialistKind::Visualization.capability())
            .with_parameter("render_fps", TARGET_FPS)
            .with_parameter("frame_stride", stride)
            .with_code(format!(
                "render_fps = {}\nframe_stride = {}\n",
                fmt_value(TARGET_FPS),
                fmt_value(stride)
            )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sim_coordination::{ContextPatch, Scratchpad};

    #[test]
    fn test_generic_simulation_query_scores_low() {
        let worker = VisualizationWorker::new(crate::AgentsConfig::default().visualization);
        let score = worker
            .score("help me set up a rigid body simulation", &Context::new("s"))
            .unwrap();
        assert!((score - 0.3).abs() < 1e-5);
    }

    #[test]
    fn test_render_query_scores_higher() {
        let worker = VisualizationWorker::new(ScoringWeights::default());
        let render = worker
            .score("render the mesh in a 3d view", &Context::new("s"))
            .unwrap();
        let generic = worker.score("how do I start", &Context::new("s")).unwrap();
        assert!(render > 0.7);
        assert!(render > generic);
    }

    #[tokio::test]
    async fn test_stride_follows_timestep() {
        let mut context = Context::new("s");
        context.apply(ContextPatch::new().param("dt", 1.0 / 240.0));
        let call = CallContext::new(Arc::new(context), Scratchpad::new());
        let reply = VisualizationWorker::new(ScoringWeights::default())
            .answer("show it", &call)
            .await
            .unwrap();
        assert_eq!(reply.recommended_parameters["frame_stride"], 4.0);
    }
}
