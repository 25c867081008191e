//! Keyword relevance scoring shared by all worker variants.
//!
//! A hand-tuned heuristic, not a learned model. Every number that shapes
//! the score lives in [`ScoringWeights`] so deployments can retune it
//! without touching the variants:
//!
//! ```text
//! matches  = keyword hits in query + keyword/pattern hits in context code
//! base     = min(1.0, matches * weight_per_match)
//! score    = baseline + base
//!          + domain_boost       (query names the domain explicitly)
//!          - competing_penalty  (another domain's strong signal, own domain not named)
//! score    = clamp(score, 0, 1)
//! ```
//!
//! Keywords match case-insensitively at word starts, so "visualiz" covers
//! "visualize" and "visualization". Each keyword counts at most once per
//! text, which lets a single strong term dominate through its weight.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Tunable parameters of the saturating relevance function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Contribution of each distinct keyword or pattern hit
    pub weight_per_match: f32,
    /// Added when the query explicitly names the worker's domain
    pub domain_boost: f32,
    /// Subtracted when a competing domain's strong signal is present
    pub competing_penalty: f32,
    /// Floor relevance before any match is counted
    pub baseline: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            weight_per_match: 0.25,
            domain_boost: 0.2,
            competing_penalty: 0.15,
            baseline: 0.1,
        }
    }
}

/// How a score was reached; handy for logs and tuning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub query_matches: usize,
    pub code_matches: usize,
    pub domain_named: bool,
    pub competing_signal: bool,
    pub score: f32,
}

/// Compiled keyword sets describing one domain.
#[derive(Debug, Clone)]
pub struct KeywordProfile {
    keywords: Vec<Regex>,
    domain_terms: Vec<Regex>,
    code_patterns: Vec<Regex>,
    competing_terms: Vec<Regex>,
}

impl KeywordProfile {
    pub fn builder() -> KeywordProfileBuilder {
        KeywordProfileBuilder::default()
    }

    /// Score `query` (and optionally the code under discussion).
    pub fn evaluate(
        &self,
        weights: &ScoringWeights,
        query: &str,
        code: Option<&str>,
    ) -> ScoreBreakdown {
        let query_matches = count_hits(&self.keywords, query);
        let code_matches = code
            .map(|c| count_hits(&self.keywords, c) + count_hits(&self.code_patterns, c))
            .unwrap_or(0);

        let domain_named = any_hit(&self.domain_terms, query);
        let competing_signal = !domain_named
            && (any_hit(&self.competing_terms, query)
                || code.is_some_and(|c| any_hit(&self.competing_terms, c)));

        let matches = (query_matches + code_matches) as f32;
        let mut raw = weights.baseline + (matches * weights.weight_per_match).min(1.0);
        if domain_named {
            raw += weights.domain_boost;
        }
        if competing_signal {
            raw -= weights.competing_penalty;
        }

        let score = if raw.is_finite() {
            raw.clamp(0.0, 1.0)
        } else {
            0.0
        };

        ScoreBreakdown {
            query_matches,
            code_matches,
            domain_named,
            competing_signal,
            score,
        }
    }

    /// Shorthand for `evaluate(..).score`.
    pub fn score(&self, weights: &ScoringWeights, query: &str, code: Option<&str>) -> f32 {
        self.evaluate(weights, query, code).score
    }

    /// Whether any of this profile's keywords occur in `text`.
    pub fn mentions(&self, text: &str) -> bool {
        any_hit(&self.keywords, text)
    }
}

fn count_hits(patterns: &[Regex], text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    patterns.iter().filter(|p| p.is_match(text)).count()
}

fn any_hit(patterns: &[Regex], text: &str) -> bool {
    !text.is_empty() && patterns.iter().any(|p| p.is_match(text))
}

/// Builder for [`KeywordProfile`].
#[derive(Debug, Default)]
pub struct KeywordProfileBuilder {
    keywords: Vec<String>,
    domain_terms: Vec<String>,
    code_patterns: Vec<String>,
    competing_terms: Vec<String>,
}

impl KeywordProfileBuilder {
    /// Domain vocabulary, counted in both query and code.
    pub fn keywords(mut self, words: &[&str]) -> Self {
        self.keywords.extend(words.iter().map(|w| w.to_string()));
        self
    }

    /// Terms that name the domain outright; trigger the boost.
    pub fn domain_terms(mut self, words: &[&str]) -> Self {
        self.domain_terms.extend(words.iter().map(|w| w.to_string()));
        self
    }

    /// Raw regexes matched against code only (API names, imports).
    pub fn code_patterns(mut self, patterns: &[&str]) -> Self {
        self.code_patterns
            .extend(patterns.iter().map(|p| p.to_string()));
        self
    }

    /// Strong signals of other domains; trigger the penalty.
    pub fn competing_terms(mut self, words: &[&str]) -> Self {
        self.competing_terms
            .extend(words.iter().map(|w| w.to_string()));
        self
    }

    pub fn build(self) -> Result<KeywordProfile, regex::Error> {
        Ok(KeywordProfile {
            keywords: compile_words(&self.keywords)?,
            domain_terms: compile_words(&self.domain_terms)?,
            code_patterns: self
                .code_patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
            competing_terms: compile_words(&self.competing_terms)?,
        })
    }
}

fn compile_words(words: &[String]) -> Result<Vec<Regex>, regex::Error> {
    words
        .iter()
        .map(|w| Regex::new(&format!(r"(?i)\b{}", regex::escape(w))))
        .collect()
}
