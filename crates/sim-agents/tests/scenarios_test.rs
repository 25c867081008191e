//! End-to-end scenarios with the builtin specialists.
//!
//! Every specialist is deterministic, so these run the real scoring and
//! answering paths. The code runner is a canned fake.

use std::sync::Arc;

use async_trait::async_trait;
use sim_agents::agents::INSTABILITY;
use sim_agents::{register_builtin, AgentsConfig};
use sim_coordination::{
    CodeRunner, ConflictReason, ContextPatch, CoordinationRequest, Coordinator, CoordinatorConfig,
    CoordinatorError, MessageKind, RunOutput, RunnerError, WorkerRegistry,
};

struct CannedRunner(RunOutput);

#[async_trait]
impl CodeRunner for CannedRunner {
    async fn run(&self, _code: &str) -> Result<RunOutput, RunnerError> {
        Ok(self.0.clone())
    }
}

async fn builtin_coordinator(initial: Option<ContextPatch>) -> Coordinator {
    let registry = WorkerRegistry::new();
    register_builtin(&registry, &AgentsConfig::default(), None).unwrap();
    let coordinator = Coordinator::new(registry.shared(), CoordinatorConfig::default());
    coordinator.create_session("s1", None, initial).await.unwrap();
    coordinator
}

// ── Scenario A: rigid body setup ────────────────────────────────────

#[tokio::test]
async fn test_rigid_body_setup_is_answered_by_physics() {
    let coordinator = builtin_coordinator(None).await;

    let result = coordinator
        .coordinate(
            "s1",
            CoordinationRequest::new("help me set up a rigid body simulation")
                .require("physics-simulation")
                .require("3d-visualization"),
        )
        .await
        .unwrap();

    assert_eq!(result.primary.variant, "Physics");
    assert!(!result.partial);
    assert!(result.conflicts.is_empty());
    let scores: Vec<_> = result
        .selected
        .iter()
        .map(|s| (s.worker_id.as_str(), (s.score * 10.0).round() / 10.0))
        .collect();
    assert_eq!(scores, vec![("physics", 0.9), ("visualization", 0.3)]);
    assert_eq!(result.supporting.len(), 1);
    assert_eq!(result.supporting[0].variant, "Visualization");
}

#[tokio::test]
async fn test_unconstrained_query_breaks_ties_by_registration_order() {
    let coordinator = builtin_coordinator(None).await;

    let result = coordinator
        .coordinate(
            "s1",
            CoordinationRequest::new("help me set up a rigid body simulation"),
        )
        .await
        .unwrap();

    // Optimization and Debug both score 0.1; Optimization registered first
    let selected: Vec<_> = result.selected.iter().map(|s| s.worker_id.as_str()).collect();
    assert_eq!(selected, vec!["physics", "visualization", "optimization"]);
    assert_eq!(result.primary.variant, "Physics");
    // Optimization has nothing to add and falls under the floor
    assert_eq!(result.dropped.len(), 1);
    assert_eq!(result.dropped[0].worker_id, "optimization");
}

// ── Scenario C: contradictory recommendations ───────────────────────

#[tokio::test]
async fn test_speed_versus_accuracy_conflict() {
    let coordinator =
        builtin_coordinator(Some(ContextPatch::new().param("timestep", 0.005))).await;

    let result = coordinator
        .coordinate("s1", CoordinationRequest::new("my simulation is too slow"))
        .await
        .unwrap();

    assert_eq!(result.conflicts.len(), 1);
    let conflict = &result.conflicts[0];
    assert!(conflict.involves("physics") && conflict.involves("optimization"));
    assert!(conflict.reasons.iter().any(|r| matches!(
        r,
        ConflictReason::ParameterMismatch { parameter, .. } if parameter == "timestep"
    )));

    let physics = result.responses().find(|r| r.worker_id == "physics").unwrap();
    let optimization = result
        .responses()
        .chain(result.dropped.iter())
        .find(|r| r.worker_id == "optimization")
        .unwrap();
    assert!(result.consensus < (physics.confidence + optimization.confidence) / 2.0);
}

#[tokio::test]
async fn test_competing_instability_fixes() {
    let runner = Arc::new(CannedRunner(RunOutput {
        stderr: "RuntimeWarning: overflow encountered in multiply\n".into(),
        ..Default::default()
    }));
    let registry = WorkerRegistry::new();
    register_builtin(&registry, &AgentsConfig::default(), Some(runner)).unwrap();
    let coordinator = Coordinator::new(registry.shared(), CoordinatorConfig::default());
    coordinator
        .create_session("s1", None, Some(ContextPatch::new().code("dt = 0.02\nrun()\n")))
        .await
        .unwrap();

    let result = coordinator
        .coordinate(
            "s1",
            CoordinationRequest::new("my simulation explodes after a few seconds")
                .require("error-analysis")
                .prefer("physics"),
        )
        .await
        .unwrap();

    let conflict = result
        .conflicts
        .iter()
        .find(|c| c.involves("physics") && c.involves("debug"))
        .expect("physics and debug should disagree");
    assert!(conflict.reasons.iter().any(|r| matches!(
        r,
        ConflictReason::CompetingFix { symptom } if symptom == INSTABILITY
    )));

    // The run reproduced the blow-up, so Debug is the more confident voice
    assert_eq!(result.primary.worker_id, "debug");
    assert_eq!(result.primary.recommended_parameters["timestep"], 0.01);

    let session = coordinator.session("s1").await.unwrap();
    assert!(session.context.scratch.contains_key("debug.last_run"));
    assert!(session.context.scratch.contains_key("physics.timestep"));
}

// ── Scenarios D and E: fatal errors ─────────────────────────────────

#[tokio::test]
async fn test_coordinate_after_end_session() {
    let coordinator = builtin_coordinator(None).await;
    coordinator.end_session("s1").await.unwrap();

    let err = coordinator
        .coordinate("s1", CoordinationRequest::new("anything"))
        .await
        .unwrap_err();
    assert_eq!(err, CoordinatorError::SessionClosed("s1".into()));
}

#[tokio::test]
async fn test_unknown_capability_invokes_nobody() {
    let coordinator = builtin_coordinator(None).await;
    let mailbox = coordinator.subscribe("s1");

    let err = coordinator
        .coordinate(
            "s1",
            CoordinationRequest::new("anything").require("nonexistent-capability"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoordinatorError::NoCapableAgent { .. }));
    assert!(mailbox
        .drain()
        .iter()
        .all(|m| m.kind() != MessageKind::WorkerStatus));
    for info in coordinator.list_worker_types() {
        assert_eq!(info.health.success_count + info.health.failure_count, 0);
    }
}

// ── Catalogue ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_catalogue_lists_builtin_specialists() {
    let coordinator = builtin_coordinator(None).await;

    let names: Vec<_> = coordinator
        .list_worker_types()
        .into_iter()
        .map(|info| (info.name, info.variant))
        .collect();
    assert_eq!(
        names,
        vec![
            ("physics".to_string(), "Physics".to_string()),
            ("visualization".to_string(), "Visualization".to_string()),
            ("optimization".to_string(), "Optimization".to_string()),
            ("debug".to_string(), "Debug".to_string()),
        ]
    );

    let capabilities = coordinator.list_capabilities();
    assert_eq!(capabilities.len(), 4);
    assert!(capabilities
        .values()
        .all(|workers| workers.len() == 1));
}

#[tokio::test]
async fn test_registering_builtins_twice_keeps_one_of_each() {
    let registry = WorkerRegistry::new();
    register_builtin(&registry, &AgentsConfig::default(), None).unwrap();
    register_builtin(&registry, &AgentsConfig::default(), None).unwrap();
    assert_eq!(registry.len(), 4);
    assert!(registry.infos().iter().all(|info| info.generation == 2));
}
