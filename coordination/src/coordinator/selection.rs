//! Candidate filtering, scoring and ranking.
//!
//! Ranking is a pure function of scores and registration order, so two
//! calls with the same scores always select the same workers in the same
//! order.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::registry::WorkerRegistry;
use crate::session::Context;
use crate::worker::{Capability, SharedWorker, WorkerFailure, WorkerId};

use super::types::{CoordinationRequest, RankedWorker};

/// A candidate bound to the calling session.
#[derive(Clone)]
pub(crate) struct Candidate {
    pub name: WorkerId,
    pub order: u64,
    pub worker: SharedWorker,
}

/// A candidate that made the cut.
#[derive(Clone)]
pub(crate) struct Selected {
    pub name: WorkerId,
    pub score: f32,
    pub worker: SharedWorker,
}

impl Selected {
    pub fn ranked(&self) -> RankedWorker {
        RankedWorker {
            worker_id: self.name.clone(),
            score: self.score,
        }
    }
}

pub(crate) struct Selection {
    pub selected: Vec<Selected>,
    pub failures: Vec<WorkerFailure>,
    /// Candidates that scored but fell outside the cut
    pub passed_over: usize,
}

/// Names of every candidate for `request`, in registration order.
///
/// Workers whose capabilities intersect the required set (all workers when
/// the set is empty), plus every preferred worker.
pub(crate) fn candidate_names(
    registry: &WorkerRegistry,
    request: &CoordinationRequest,
) -> CoordinatorResult<Vec<WorkerId>> {
    let mut names: BTreeSet<(u64, WorkerId)> = BTreeSet::new();

    if request.required_capabilities.is_empty() {
        for name in registry.list_names() {
            if let Some(order) = registry.order_of(&name) {
                names.insert((order, name));
            }
        }
    } else {
        for capability in &request.required_capabilities {
            for name in registry.list_by_capability(capability) {
                if let Some(order) = registry.order_of(&name) {
                    names.insert((order, name));
                }
            }
        }
    }

    for preferred in &request.preferred_workers {
        let order = registry
            .order_of(preferred)
            .ok_or_else(|| CoordinatorError::UnknownWorker(preferred.clone()))?;
        names.insert((order, preferred.clone()));
    }

    if names.is_empty() {
        return Err(CoordinatorError::NoCapableAgent {
            required: request
                .required_capabilities
                .iter()
                .cloned()
                .collect::<Vec<Capability>>(),
        });
    }

    Ok(names.into_iter().map(|(_, name)| name).collect())
}

/// Score every candidate and keep the best `max_workers`.
///
/// Scoring errors and non-finite scores exclude the candidate with a soft
/// failure. Ties go to the earlier registration.
pub(crate) fn rank(
    candidates: Vec<Candidate>,
    query: &str,
    context: &Context,
    max_workers: usize,
) -> Selection {
    let mut scored: Vec<(f32, u64, Candidate)> = Vec::with_capacity(candidates.len());
    let mut failures = Vec::new();

    for candidate in candidates {
        match candidate.worker.score(query, context) {
            Ok(raw) if raw.is_finite() => {
                let score = raw.clamp(0.0, 1.0);
                debug!(worker = %candidate.name, score, "Candidate scored");
                scored.push((score, candidate.order, candidate));
            }
            Ok(raw) => {
                warn!(worker = %candidate.name, score = raw, "Non-finite score, excluding");
                failures.push(WorkerFailure::scoring(
                    &candidate.name,
                    format!("non-finite score {raw}"),
                ));
            }
            Err(e) => {
                warn!(worker = %candidate.name, error = %e, "Scoring failed, excluding");
                failures.push(WorkerFailure::scoring(&candidate.name, e.to_string()));
            }
        }
    }

    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

    let keep = max_workers.max(1);
    let passed_over = scored.len().saturating_sub(keep);
    let selected = scored
        .into_iter()
        .take(keep)
        .map(|(score, _, c)| Selected {
            name: c.name,
            score,
            worker: c.worker,
        })
        .collect();

    Selection {
        selected,
        failures,
        passed_over,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{CallContext, Worker, WorkerError, WorkerReply};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Scored {
        capabilities: BTreeSet<Capability>,
        score: Result<f32, String>,
    }

    #[async_trait]
    impl Worker for Scored {
        fn variant(&self) -> &str {
            "Scored"
        }

        fn capabilities(&self) -> &BTreeSet<Capability> {
            &self.capabilities
        }

        fn score(&self, _query: &str, _context: &Context) -> Result<f32, WorkerError> {
            self.score.clone().map_err(WorkerError::Scoring)
        }

        async fn answer(&self, _query: &str, _call: &CallContext) -> Result<WorkerReply, WorkerError> {
            Ok(WorkerReply::new("ok", 0.5))
        }
    }

    fn candidate(name: &str, order: u64, score: Result<f32, String>) -> Candidate {
        Candidate {
            name: name.to_string(),
            order,
            worker: Arc::new(Scored {
                capabilities: BTreeSet::new(),
                score,
            }),
        }
    }

    #[test]
    fn test_rank_breaks_ties_by_registration_order() {
        let ctx = Context::new("s1");
        let selection = rank(
            vec![
                candidate("c", 2, Ok(0.5)),
                candidate("a", 0, Ok(0.5)),
                candidate("top", 3, Ok(0.9)),
                candidate("b", 1, Ok(0.5)),
            ],
            "q",
            &ctx,
            3,
        );
        let names: Vec<_> = selection.selected.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["top", "a", "b"]);
        assert_eq!(selection.passed_over, 1);
    }

    #[test]
    fn test_rank_excludes_failed_and_non_finite_scores() {
        let ctx = Context::new("s1");
        let selection = rank(
            vec![
                candidate("nan", 0, Ok(f32::NAN)),
                candidate("err", 1, Err("boom".into())),
                candidate("high", 2, Ok(7.0)),
            ],
            "q",
            &ctx,
            3,
        );
        assert_eq!(selection.selected.len(), 1);
        assert_eq!(selection.selected[0].score, 1.0);
        let failed: Vec<_> = selection.failures.iter().map(|f| f.worker_id.as_str()).collect();
        assert_eq!(failed, vec!["nan", "err"]);
        assert!(selection.failures.iter().all(|f| !f.was_dispatched()));
    }

    #[test]
    fn test_zero_max_still_selects_one() {
        let ctx = Context::new("s1");
        let selection = rank(vec![candidate("a", 0, Ok(0.2))], "q", &ctx, 0);
        assert_eq!(selection.selected.len(), 1);
    }
}
