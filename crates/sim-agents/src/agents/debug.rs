//! Debug specialist: reproduces the failure when a runner is available and
//! names the symptom.

use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sim_coordination::{
    CallContext, Capability, Context, KeywordProfile, RunOutput, ScoringWeights,
    SharedCodeRunner, Worker, WorkerError, WorkerReply,
};
use tracing::{debug, warn};

use super::{
    capability_set, current_timestep, fmt_value, mentions_instability, profile_score,
    SpecialistKind, INSTABILITY, STABLE_TIMESTEP,
};

/// Confidence added when a run reproduced the problem
const REPRODUCED_BONUS: f32 = 0.3;

/// Part of the call deadline kept back from the runner
const ANSWER_MARGIN: Duration = Duration::from_millis(50);

static PROFILE: LazyLock<KeywordProfile> = LazyLock::new(|| {
    KeywordProfile::builder()
        .keywords(&[
            "error",
            "bug",
            "crash",
            "nan",
            "exception",
            "traceback",
            "diverg",
            "explod",
            "unstable",
            "instabil",
            "fail",
            "wrong",
            "broken",
            "overflow",
        ])
        .domain_terms(&["debug", "error", "bug"])
        .code_patterns(&[r"(?i)\braise\b", r"(?i)\bexcept\b", r"(?i)\bassert\b"])
        .competing_terms(&["render", "plot"])
        .build()
        .expect("debug keyword profile should compile")
});

/// What went wrong, as far as the evidence shows.
#[derive(Debug, Clone, PartialEq)]
enum Finding {
    /// Values blew up; fixable by shrinking the step
    Instability { evidence: String },
    /// Runner reported a typed error
    Error {
        kind: String,
        message: String,
        line: Option<u32>,
    },
    Nothing,
}

/// Error analysis, optionally backed by a code runner.
pub struct DebugWorker {
    weights: ScoringWeights,
    capabilities: BTreeSet<Capability>,
    runner: Option<SharedCodeRunner>,
}

impl DebugWorker {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights,
            capabilities: capability_set(SpecialistKind::Debug),
            runner: None,
        }
    }

    pub fn with_runner(mut self, runner: Option<SharedCodeRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Run the code under discussion, leaving `ANSWER_MARGIN` of the call
    /// deadline for the static answer.
    async fn reproduce(&self, call: &CallContext) -> Option<RunOutput> {
        let runner = self.runner.as_ref()?;
        let context = call.context();
        let code = context.code()?;
        let run = runner.run(code);
        let outcome = match call.remaining() {
            Some(remaining) => {
                let window = remaining.saturating_sub(ANSWER_MARGIN);
                if window.is_zero() {
                    debug!(session_id = %context.session_id, "No time left for a debug run");
                    return None;
                }
                match tokio::time::timeout(window, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            session_id = %context.session_id,
                            window_ms = window.as_millis() as u64,
                            "Debug run outlived the call deadline, analysing statically"
                        );
                        return None;
                    }
                }
            }
            None => run.await,
        };
        match outcome {
            Ok(output) => {
                debug!(
                    session_id = %context.session_id,
                    succeeded = output.succeeded(),
                    "Debug run finished"
                );
                Some(output)
            }
            Err(e) => {
                warn!(session_id = %context.session_id, error = %e, "Debug run unavailable, analysing statically");
                None
            }
        }
    }
}

fn classify(query: &str, code: Option<&str>, run: Option<&RunOutput>) -> Finding {
    if let Some(run) = run {
        if let Some(err) = &run.structured_error {
            if mentions_instability(&err.kind) || mentions_instability(&err.message) {
                return Finding::Instability {
                    evidence: format!("{}: {}", err.kind, err.message),
                };
            }
            return Finding::Error {
                kind: err.kind.clone(),
                message: err.message.clone(),
                line: err.line,
            };
        }
        if let Some(line) = run
            .stdout
            .lines()
            .chain(run.stderr.lines())
            .find(|l| mentions_instability(l))
        {
            return Finding::Instability {
                evidence: line.trim().to_string(),
            };
        }
    }
    if mentions_instability(query) || code.is_some_and(mentions_instability) {
        return Finding::Instability {
            evidence: "described in the question".to_string(),
        };
    }
    Finding::Nothing
}

#[async_trait]
impl Worker for DebugWorker {
    fn variant(&self) -> &str {
        SpecialistKind::Debug.variant()
    }

    fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    fn score(&self, query: &str, context: &Context) -> Result<f32, WorkerError> {
        Ok(profile_score(
            SpecialistKind::Debug,
            &PROFILE,
            &self.weights,
            query,
            context,
        ))
    }

    async fn answer(&self, query: &str, call: &CallContext) -> Result<WorkerReply, WorkerError> {
        let context = call.context();
        let mut confidence = PROFILE.score(&self.weights, query, context.code());
        let run = self.reproduce(call).await;
        let finding = classify(query, context.code(), run.as_ref());
        let reproduced = run.is_some() && finding != Finding::Nothing;
        if reproduced {
            confidence = (confidence + REPRODUCED_BONUS).min(1.0);
        }
        if let Some(run) = &run {
            call.scratch().put(
                "debug.last_run",
                json!({ "succeeded": run.succeeded(), "error": run.structured_error }),
            );
        }

        let reply = WorkerReply::new(String::new(), confidence)
            .with_capability(SpecialistKind::Debug.capability());

        let mut reply = match finding {
            Finding::Instability { evidence } => {
                let timestep = current_timestep(context).map_or(STABLE_TIMESTEP / 2.0, |c| c / 2.0);
                let mut reply = reply
                    .claiming_fix_for(INSTABILITY)
                    .with_parameter("timestep", timestep)
                    .with_code(format!("timestep = {}\n", fmt_value(timestep)))
                    .with_explanation(format!("Evidence: {evidence}"));
                reply.answer = format!(
                    "Values grow without bound, which is the signature of a timestep too \
                     large for the stiffest contact. Halve the timestep to {} s and check \
                     for NaN after each step to catch the first bad frame.",
                    fmt_value(timestep)
                );
                reply
            }
            Finding::Error {
                kind,
                message,
                line,
            } => {
                let location = line.map(|l| format!(" on line {l}")).unwrap_or_default();
                let mut reply = reply.with_explanation(format!("{kind}: {message}"));
                reply.answer = format!(
                    "Running the snippet raises {kind}{location}: {message}. Fix that first; \
                     the simulation never reaches its main loop."
                );
                reply
            }
            Finding::Nothing => {
                let mut reply = reply;
                reply.answer = if run.is_some() {
                    "The snippet runs cleanly; add assertions on energy and position bounds to \
                     catch the issue when it appears."
                        .to_string()
                } else {
                    "No failure to analyse yet. Share the traceback or the code that misbehaves."
                        .to_string()
                };
                reply
            }
        };
        if run.is_some() {
            reply = reply.with_capability("code-execution");
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sim_coordination::{CodeRunner, ContextPatch, RunnerError, Scratchpad, StructuredError};

    struct FixedRunner(Result<RunOutput, RunnerError>);

    #[async_trait]
    impl CodeRunner for FixedRunner {
        async fn run(&self, _code: &str) -> Result<RunOutput, RunnerError> {
            self.0.clone()
        }
    }

    fn context_with_code(code: &str) -> Context {
        let mut context = Context::new("s");
        context.apply(ContextPatch::new().code(code));
        context
    }

    fn worker(runner: Result<RunOutput, RunnerError>) -> DebugWorker {
        DebugWorker::new(ScoringWeights::default()).with_runner(Some(Arc::new(FixedRunner(runner))))
    }

    #[tokio::test]
    async fn test_overflow_from_runner_claims_instability_fix() {
        let output = RunOutput {
            stderr: "RuntimeWarning: overflow encountered in multiply".into(),
            ..Default::default()
        };
        let scratch = Scratchpad::new();
        let call = CallContext::new(Arc::new(context_with_code("dt = 0.02\nstep()\n")), scratch.clone());
        let reply = worker(Ok(output)).answer("why is this wrong", &call).await.unwrap();

        assert_eq!(reply.definitive_fix_for.as_deref(), Some(INSTABILITY));
        assert_eq!(reply.recommended_parameters["timestep"], 0.01);
        assert!(reply.capabilities_used.iter().any(|c| c.as_str() == "code-execution"));
        assert_eq!(scratch.get("debug.last_run").unwrap()["succeeded"], false);
        // "wrong" keyword plus the reproduction bonus
        assert!((reply.confidence - 0.65).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_structured_error_is_reported_without_fix_claim() {
        let output = RunOutput {
            structured_error: Some(StructuredError {
                kind: "ZeroDivisionError".into(),
                message: "float division by zero".into(),
                line: Some(3),
            }),
            ..Default::default()
        };
        let call = CallContext::new(Arc::new(context_with_code("x = 1 / 0\n")), Scratchpad::new());
        let reply = worker(Ok(output)).answer("it crashes", &call).await.unwrap();
        assert!(reply.definitive_fix_for.is_none());
        assert!(reply.answer.contains("ZeroDivisionError on line 3"));
    }

    #[tokio::test]
    async fn test_runner_failure_falls_back_to_static_analysis() {
        let call = CallContext::new(Arc::new(context_with_code("dt = 0.1\n")), Scratchpad::new());
        let reply = worker(Err(RunnerError::Unavailable("no sandbox".into())))
            .answer("positions become nan", &call)
            .await
            .unwrap();
        assert_eq!(reply.definitive_fix_for.as_deref(), Some(INSTABILITY));
        assert_eq!(reply.recommended_parameters["timestep"], 0.05);
        assert!(reply.capabilities_used.iter().all(|c| c.as_str() != "code-execution"));
    }

    struct StuckRunner;

    #[async_trait]
    impl CodeRunner for StuckRunner {
        async fn run(&self, _code: &str) -> Result<RunOutput, RunnerError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(RunOutput::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_is_cut_short_by_call_deadline() {
        let worker = DebugWorker::new(ScoringWeights::default())
            .with_runner(Some(Arc::new(StuckRunner)));
        let started = tokio::time::Instant::now();
        let call = CallContext::new(Arc::new(context_with_code("dt = 0.1\n")), Scratchpad::new())
            .with_deadline(started + Duration::from_secs(1));

        let reply = worker.answer("positions become nan", &call).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(reply.definitive_fix_for.as_deref(), Some(INSTABILITY));
        assert!(reply.capabilities_used.iter().all(|c| c.as_str() != "code-execution"));
    }

    #[test]
    fn test_baseline_score_without_symptoms() {
        let worker = DebugWorker::new(ScoringWeights::default());
        let score = worker
            .score("help me set up a rigid body simulation", &Context::new("s"))
            .unwrap();
        assert!((score - 0.1).abs() < 1e-6);
    }
}
