//! Conflict detection, consensus and the primary/supporting split.
//!
//! Two responses conflict when either
//!
//! - they recommend the same parameter with values whose relative
//!   difference exceeds the tolerance, or
//! - both claim to be the definitive fix for the same symptom while
//!   proposing different code.
//!
//! A response's parameters are the `name = <number>` assignments found in
//! its code suggestions, overridden by its explicit recommendations.
//! Parameter names and symptoms are compared case-insensitively with `-`
//! and spaces treated as `_`.
//!
//! ```text
//! consensus = clamp(mean(confidence) - penalty * conflicting_pairs / pairs, 0, 1)
//! ```

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::worker::WorkerResponse;

use super::types::{Conflict, ConflictReason};

/// Numbers that drive reconciliation.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilePolicy {
    pub min_confidence_floor: f32,
    pub conflict_penalty: f32,
    pub numeric_tolerance: f64,
}

/// Outcome of reconciling collected responses.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub primary: WorkerResponse,
    pub supporting: Vec<WorkerResponse>,
    pub dropped: Vec<WorkerResponse>,
    pub consensus: f32,
    pub conflicts: Vec<Conflict>,
}

/// `name = <number>`; `==`, `<=` and `*=` never match
static ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)\b")
        .expect("ASSIGNMENT_RE regex should compile")
});

fn normalize(name: &str) -> String {
    name.trim()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// Numeric assignments (`name = 1.5`) found in a code snippet. Later
/// assignments to the same name win.
pub fn extract_assignments(code: &str) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for line in code.lines() {
        let line = line.split('#').next().unwrap_or("");
        let line = line.split("//").next().unwrap_or("");
        for cap in ASSIGNMENT_RE.captures_iter(line) {
            if let Ok(value) = cap[2].parse::<f64>() {
                if value.is_finite() {
                    out.insert(normalize(&cap[1]), value);
                }
            }
        }
    }
    out
}

/// Parameters a response effectively recommends.
pub fn effective_parameters(response: &WorkerResponse) -> BTreeMap<String, f64> {
    let mut params = BTreeMap::new();
    for code in &response.code_suggestions {
        params.extend(extract_assignments(code));
    }
    for (name, value) in &response.recommended_parameters {
        if value.is_finite() {
            params.insert(normalize(name), *value);
        }
    }
    params
}

fn relative_difference(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        0.0
    } else {
        (a - b).abs() / scale
    }
}

fn same_code(a: &WorkerResponse, b: &WorkerResponse) -> bool {
    a.code_suggestions.len() == b.code_suggestions.len()
        && a
            .code_suggestions
            .iter()
            .zip(&b.code_suggestions)
            .all(|(x, y)| x.trim() == y.trim())
}

/// Why `a` and `b` contradict each other; empty when they don't.
pub fn conflict_reasons(a: &WorkerResponse, b: &WorkerResponse, tolerance: f64) -> Vec<ConflictReason> {
    conflict_reasons_with(a, &effective_parameters(a), b, &effective_parameters(b), tolerance)
}

fn conflict_reasons_with(
    a: &WorkerResponse,
    a_params: &BTreeMap<String, f64>,
    b: &WorkerResponse,
    b_params: &BTreeMap<String, f64>,
    tolerance: f64,
) -> Vec<ConflictReason> {
    let mut reasons = Vec::new();

    for (name, left) in a_params {
        if let Some(right) = b_params.get(name) {
            if relative_difference(*left, *right) > tolerance {
                reasons.push(ConflictReason::ParameterMismatch {
                    parameter: name.clone(),
                    left: *left,
                    right: *right,
                });
            }
        }
    }

    if let (Some(x), Some(y)) = (&a.definitive_fix_for, &b.definitive_fix_for) {
        let symptom = normalize(x);
        if !symptom.is_empty() && symptom == normalize(y) && !same_code(a, b) {
            reasons.push(ConflictReason::CompetingFix { symptom });
        }
    }

    reasons
}

/// Every conflicting pair among `responses`, `left` ranked before `right`.
pub fn detect_conflicts(responses: &[WorkerResponse], tolerance: f64) -> Vec<Conflict> {
    let params: Vec<_> = responses.iter().map(effective_parameters).collect();
    let mut conflicts = Vec::new();
    for i in 0..responses.len() {
        for j in (i + 1)..responses.len() {
            let reasons =
                conflict_reasons_with(&responses[i], &params[i], &responses[j], &params[j], tolerance);
            if !reasons.is_empty() {
                conflicts.push(Conflict {
                    left: responses[i].worker_id.clone(),
                    right: responses[j].worker_id.clone(),
                    reasons,
                });
            }
        }
    }
    conflicts
}

/// Mean confidence reduced in proportion to the share of conflicting pairs.
pub fn consensus_score(confidences: &[f32], conflicting_pairs: usize, penalty: f32) -> f32 {
    if confidences.is_empty() {
        return 0.0;
    }
    let n = confidences.len();
    let mean = confidences.iter().sum::<f32>() / n as f32;
    let pairs = n * (n - 1) / 2;
    let fraction = if pairs == 0 {
        0.0
    } else {
        conflicting_pairs.min(pairs) as f32 / pairs as f32
    };
    let score = mean - penalty * fraction;
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Reconcile responses given in rank order. `None` when there are none.
pub fn reconcile(responses: Vec<WorkerResponse>, policy: &ReconcilePolicy) -> Option<Reconciled> {
    if responses.is_empty() {
        return None;
    }
    let n = responses.len();
    let conflicts = detect_conflicts(&responses, policy.numeric_tolerance);

    let mut conflict_count = vec![0usize; n];
    for conflict in &conflicts {
        for (i, r) in responses.iter().enumerate() {
            if conflict.involves(&r.worker_id) {
                conflict_count[i] += 1;
            }
        }
    }
    // Conflicts with more than half of the others
    let in_majority_cluster = |i: usize| conflict_count[i] * 2 > n - 1;

    let confidences: Vec<f32> = responses.iter().map(|r| r.confidence).collect();
    let consensus = consensus_score(&confidences, conflicts.len(), policy.conflict_penalty);

    let best = |eligible: &dyn Fn(usize) -> bool| -> Option<usize> {
        let mut best: Option<usize> = None;
        for i in (0..n).filter(|&i| eligible(i)) {
            match best {
                Some(b) if responses[b].confidence >= responses[i].confidence => {}
                _ => best = Some(i),
            }
        }
        best
    };
    let primary_idx = best(&|i| !in_majority_cluster(i)).or_else(|| best(&|_| true))?;

    let mut primary = None;
    let mut rest = Vec::with_capacity(n - 1);
    for (i, response) in responses.into_iter().enumerate() {
        if i == primary_idx {
            primary = Some(response);
        } else {
            rest.push(response);
        }
    }
    let primary = primary?;

    let (mut supporting, dropped): (Vec<_>, Vec<_>) = rest
        .into_iter()
        .partition(|r| r.confidence >= policy.min_confidence_floor);
    // Stable: equal confidences keep rank order
    supporting.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    Some(Reconciled {
        primary,
        supporting,
        dropped,
        consensus,
        conflicts,
    })
}
