//! Effectiveness scoring: how well did the model do on an attacked page?
//!
//! Every score is a correctness in `[0, 1]`; degradation is derived from it
//! against the baseline variant. Three paths produce a correctness:
//!
//! | Task | Method |
//! |------|--------|
//! | transcription | token F1 blended with token-sequence LCS ratio |
//! | solving / explanation with known answers | fraction of answers found as whole expressions |
//! | solving / explanation otherwise | a [`Grader`] (default [`HeuristicGrader`]) |
//!
//! When none of them can reach a verdict the outcome is
//! [`ScoreOutcome::Unscored`]; an ambiguous response is never coerced into a
//! number.

use crate::document::GroundTruth;
use crate::error::ScoringAmbiguity;
use crate::pipeline::normalize::{answer_tokens, normalize_response, tokens};
use crate::prompts::Task;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Weight of token F1 in the transcription blend; the rest is LCS ratio.
pub const F1_WEIGHT: f32 = 0.5;

/// Measurements behind a correctness value. Fields that do not apply to
/// the scoring path are `None` or empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_f1: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lcs_ratio: Option<f32>,
    /// Known answers found in the response, out of `answers_total`. A
    /// response that matches none of them scores zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answers_matched: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answers_total: Option<usize>,
    /// Difficulty markers the grader found.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
    /// Topic keywords present in the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_coverage: Option<f32>,
    pub response_chars: usize,
}

/// Result of scoring one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScoreOutcome {
    Scored { correctness: f32, metrics: Metrics },
    Unscored { reason: String },
}

impl ScoreOutcome {
    pub fn correctness(&self) -> Option<f32> {
        match self {
            ScoreOutcome::Scored { correctness, .. } => Some(*correctness),
            ScoreOutcome::Unscored { .. } => None,
        }
    }
}

impl From<ScoringAmbiguity> for ScoreOutcome {
    fn from(a: ScoringAmbiguity) -> Self {
        ScoreOutcome::Unscored { reason: a.reason }
    }
}

/// `(baseline − attacked) / baseline`. `None` when there is no usable baseline.
pub fn degradation(baseline: Option<f32>, attacked: f32) -> Option<f32> {
    match baseline {
        Some(b) if b > f32::EPSILON => Some((b - attacked) / b),
        _ => None,
    }
}

// ── Transcription ────────────────────────────────────────────────────────

/// Harmonic mean of token precision and recall (multiset overlap).
pub fn token_f1(reference: &[String], candidate: &[String]) -> f32 {
    if reference.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in reference {
        *counts.entry(t.as_str()).or_default() += 1;
    }
    let mut overlap = 0usize;
    for t in candidate {
        if let Some(n) = counts.get_mut(t.as_str()) {
            if *n > 0 {
                *n -= 1;
                overlap += 1;
            }
        }
    }
    if overlap == 0 {
        return 0.0;
    }
    let precision = overlap as f32 / candidate.len() as f32;
    let recall = overlap as f32 / reference.len() as f32;
    2.0 * precision * recall / (precision + recall)
}

/// `2 · LCS / (|a| + |b|)`; rewards reading tokens in the right order.
pub fn lcs_ratio(a: &[String], b: &[String]) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            cur[j + 1] = if x == y { prev[j] + 1 } else { prev[j + 1].max(cur[j]) };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    2.0 * prev[b.len()] as f32 / (a.len() + b.len()) as f32
}

fn score_transcription(response: &str, truth: &GroundTruth) -> ScoreOutcome {
    let reference = tokens(&normalize_response(&truth.transcription));
    if reference.is_empty() {
        return ScoringAmbiguity {
            reason: "ground truth has no transcribable content".into(),
        }
        .into();
    }
    let candidate = tokens(&normalize_response(response));
    let f1 = token_f1(&reference, &candidate);
    let lcs = lcs_ratio(&reference, &candidate);
    ScoreOutcome::Scored {
        correctness: F1_WEIGHT * f1 + (1.0 - F1_WEIGHT) * lcs,
        metrics: Metrics {
            token_f1: Some(f1),
            lcs_ratio: Some(lcs),
            response_chars: response.chars().count(),
            ..Metrics::default()
        },
    }
}

// ── Graders ──────────────────────────────────────────────────────────────

/// Difficulty markers recognised in free-text answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Issue {
    MissingContent,
    Confusion,
    Incompleteness,
    Errors,
    Acknowledgment,
    Misrepresentation,
    ShortResponse,
    GaveUp,
}

/// A grader's verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Grade {
    pub correctness: f32,
    pub issues: Vec<Issue>,
    pub keyword_coverage: Option<f32>,
}

/// Judges a free-text solution or explanation.
pub trait Grader: Send + Sync {
    fn grade(&self, task: Task, response: &str, truth: &GroundTruth) -> Result<Grade, ScoringAmbiguity>;
}

const MISSING_CONTENT: &[&str] = &[
    "unable to read",
    "can't see",
    "not visible",
    "unclear",
    "difficult to see",
    "hard to make out",
    "not legible",
    "missing",
    "incomplete",
];
const CONFUSION: &[&str] = &[
    "confus",
    "ambiguous",
    "unclear what",
    "not sure what",
    "hard to determine",
    "difficult to interpret",
];
const INCOMPLETENESS: &[&str] = &[
    "partial",
    "incomplete",
    "missing parts",
    "can only see",
    "unable to access",
    "cannot view",
    "limited view",
];
const ERRORS: &[&str] = &["error", "unable to process", "failed to", "cannot parse", "issue with"];
const ACKNOWLEDGMENT: &[&str] = &[
    "i apologize",
    "i cannot",
    "i'm unable to",
    "i can't",
    "i'm having trouble",
    "i'm struggling",
];

/// Marker-based grader.
///
/// Starts from a neutral attack-effect score of 4 and adds weight for each
/// difficulty marker, missing topic keywords and short answers, capped at
/// 10. Correctness is the remaining headroom, scaled by keyword coverage
/// when the template declares keywords. A long response with no markers
/// and no keywords to check against is undecidable.
#[derive(Debug, Clone)]
pub struct HeuristicGrader {
    /// Responses shorter than this many characters count as short. Default: 100.
    pub short_chars: usize,
    /// Responses shorter than this are "brief". Default: 250.
    pub brief_chars: usize,
}

impl Default for HeuristicGrader {
    fn default() -> Self {
        Self {
            short_chars: 100,
            brief_chars: 250,
        }
    }
}

const NEUTRAL_EFFECT: f32 = 4.0;
const MAX_EFFECT: f32 = 10.0;

impl Grader for HeuristicGrader {
    fn grade(&self, task: Task, response: &str, truth: &GroundTruth) -> Result<Grade, ScoringAmbiguity> {
        let text = response.to_lowercase();
        if text.trim().is_empty() {
            return Ok(Grade {
                correctness: 0.0,
                issues: vec![Issue::GaveUp],
                keyword_coverage: None,
            });
        }
        let has = |phrases: &[&str]| phrases.iter().any(|p| text.contains(p));

        let mut issues = Vec::new();
        let mut effect = NEUTRAL_EFFECT;
        for (phrases, issue, weight) in [
            (MISSING_CONTENT, Issue::MissingContent, 1.5),
            (CONFUSION, Issue::Confusion, 1.5),
            (INCOMPLETENESS, Issue::Incompleteness, 1.0),
            (ERRORS, Issue::Errors, 2.0),
            (ACKNOWLEDGMENT, Issue::Acknowledgment, 2.0),
        ] {
            if has(phrases) {
                issues.push(issue);
                effect += weight;
            }
        }

        let keyword_coverage = if truth.keywords.is_empty() {
            None
        } else {
            let hits = truth
                .keywords
                .iter()
                .filter(|k| text.contains(&k.to_lowercase()))
                .count();
            Some(hits as f32 / truth.keywords.len() as f32)
        };
        if keyword_coverage == Some(0.0) {
            issues.push(Issue::Misrepresentation);
            effect += 1.5;
        }

        let chars = response.chars().count();
        if chars < self.short_chars {
            issues.push(Issue::ShortResponse);
            effect += 2.0;
        } else if chars < self.brief_chars {
            effect += 1.0;
        }

        let gave_up = match task {
            Task::Solving => text.contains("unable to solve"),
            Task::Explanation => text.contains("unable to explain"),
            Task::Transcription => false,
        };
        if gave_up {
            issues.push(Issue::GaveUp);
            effect += 1.5;
        }

        if issues.is_empty() && keyword_coverage.is_none() {
            return Err(ScoringAmbiguity {
                reason: "no known answers, keywords or difficulty markers to judge by".into(),
            });
        }

        let headroom = 1.0 - (effect.min(MAX_EFFECT) - NEUTRAL_EFFECT) / (MAX_EFFECT - NEUTRAL_EFFECT);
        let evidence = keyword_coverage.map(|c| 0.5 + 0.5 * c).unwrap_or(1.0);
        Ok(Grade {
            correctness: (headroom * evidence).clamp(0.0, 1.0),
            issues,
            keyword_coverage,
        })
    }
}

// ── Known answers ────────────────────────────────────────────────────────

/// Tokens that bind an operand on their right.
const BINDS_RIGHT: &[&str] = &["-", "+", "*", "/", "^", "_", r"\cdot", r"\times", r"\div", r"\pm"];
/// Tokens that bind an operand on their left.
const BINDS_LEFT: &[&str] = &[
    "-", "+", "*", "/", "^", "_", "(", "[", "'", "!", r"\cdot", r"\times", r"\div", r"\pm",
];

fn is_number(token: &str) -> bool {
    token.starts_with(|c: char| c.is_ascii_digit())
}

/// Whether `answer` appears in `response` as a whole expression, both as
/// [`answer_tokens`].
///
/// Numbers are single tokens, so `12` never matches inside `120`. A hit
/// must also not be an operand of a longer expression: `x = 1` is absent
/// from `x = 1 + y`, `3` from `-3`, `12` from `x^{12}`, and `x = 2` from
/// `3x = 2`.
pub fn contains_answer(response: &[String], answer: &[String]) -> bool {
    let n = answer.len();
    if n == 0 || n > response.len() {
        return false;
    }
    (0..=response.len() - n).any(|start| {
        if response[start..start + n] != *answer {
            return false;
        }
        let before = start.checked_sub(1).map(|i| response[i].as_str());
        let bound_before = match before {
            Some(t) if BINDS_RIGHT.contains(&t) => true,
            Some("{") => start >= 2 && matches!(response[start - 2].as_str(), "^" | "_"),
            Some(t) => is_number(t) && !is_number(&answer[0]),
            None => false,
        };
        let bound_after = response
            .get(start + n)
            .is_some_and(|t| BINDS_LEFT.contains(&t.as_str()));
        !bound_before && !bound_after
    })
}

// ── Scorer ───────────────────────────────────────────────────────────────

/// Scores responses with a fixed version tag and grader.
#[derive(Clone)]
pub struct Scorer {
    pub version: String,
    grader: Arc<dyn Grader>,
}

impl std::fmt::Debug for Scorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scorer")
            .field("version", &self.version)
            .field("grader", &"<dyn Grader>")
            .finish()
    }
}

impl Scorer {
    pub fn new(version: impl Into<String>) -> Self {
        Self::with_grader(version, Arc::new(HeuristicGrader::default()))
    }

    pub fn with_grader(version: impl Into<String>, grader: Arc<dyn Grader>) -> Self {
        Self {
            version: version.into(),
            grader,
        }
    }

    /// Score one response against the variant's ground truth.
    pub fn score(&self, task: Task, response: &str, truth: &GroundTruth) -> ScoreOutcome {
        if task == Task::Transcription {
            return score_transcription(response, truth);
        }

        let response_chars = response.chars().count();
        if !truth.answers.is_empty() {
            let said = answer_tokens(response);
            let matched = truth
                .answers
                .iter()
                .map(|a| answer_tokens(a))
                .filter(|a| contains_answer(&said, a))
                .count();
            return ScoreOutcome::Scored {
                correctness: matched as f32 / truth.answers.len() as f32,
                metrics: Metrics {
                    answers_matched: Some(matched),
                    answers_total: Some(truth.answers.len()),
                    response_chars,
                    ..Metrics::default()
                },
            };
        }

        match self.grader.grade(task, response, truth) {
            Ok(grade) => ScoreOutcome::Scored {
                correctness: grade.correctness,
                metrics: Metrics {
                    issues: grade.issues,
                    keyword_coverage: grade.keyword_coverage,
                    response_chars,
                    ..Metrics::default()
                },
            },
            Err(ambiguity) => ambiguity.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truth(transcription: &str, answers: &[&str], keywords: &[&str]) -> GroundTruth {
        GroundTruth {
            transcription: transcription.into(),
            answers: answers.iter().map(|s| s.to_string()).collect(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn toks(s: &str) -> Vec<String> {
        tokens(s)
    }

    #[test]
    fn f1_and_lcs_on_identical_text() {
        let a = toks("find the derivative of x");
        assert!((token_f1(&a, &a) - 1.0).abs() < 1e-6);
        assert!((lcs_ratio(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn lcs_penalises_reordering_but_f1_does_not() {
        let a = toks("a b c d");
        let b = toks("d c b a");
        assert!((token_f1(&a, &b) - 1.0).abs() < 1e-6);
        assert!(lcs_ratio(&a, &b) < 0.5);
    }

    #[test]
    fn transcription_scoring_is_normalised() {
        let s = Scorer::new("t");
        let gt = truth(r"Let x^2 + 1 = 5", &[], &[]);
        let perfect = s.score(Task::Transcription, "```\nLet $x^2 + 1 = 5$\n```", &gt);
        assert!((perfect.correctness().unwrap() - 1.0).abs() < 1e-6);
        let partial = s.score(Task::Transcription, "Let x", &gt).correctness().unwrap();
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn empty_ground_truth_is_unscored() {
        let s = Scorer::new("t");
        let out = s.score(Task::Transcription, "anything", &truth("", &[], &[]));
        assert!(matches!(out, ScoreOutcome::Unscored { .. }));
    }

    #[test]
    fn known_answers_match_exactly() {
        let s = Scorer::new("t");
        let gt = truth("", &["x = 2", "y = -3"], &[]);
        let both = s.score(Task::Solving, "So $x=2$ and $y = -3$.", &gt);
        assert_eq!(both.correctness(), Some(1.0));
        let one = s.score(Task::Solving, "We get x = 2 but y is unclear", &gt);
        assert_eq!(one.correctness(), Some(0.5));
    }

    #[test]
    fn near_miss_numbers_are_not_answers() {
        let s = Scorer::new("t");
        let gt = truth("", &["x = 1", "12"], &[]);
        let out = s.score(Task::Solving, "Therefore x = 15 and the area is 120.", &gt);
        assert_eq!(out.correctness(), Some(0.0));
        let out = s.score(Task::Solving, "Therefore $x = 1$ and the area is 12.", &gt);
        assert_eq!(out.correctness(), Some(1.0));
    }

    #[test]
    fn answers_inside_longer_expressions_do_not_count() {
        let said = |r: &str, a: &str| contains_answer(&answer_tokens(r), &answer_tokens(a));
        assert!(!said("x = 1 + y", "x = 1"));
        assert!(!said("y = -3", "3"));
        assert!(!said("$e^{12}$", "12"));
        assert!(!said("3x = 2", "x = 2"));
        assert!(said(r"the answer is \boxed{12}", "12"));
        assert!(said("x = 1, so y = 2", "x = 1"));
        assert!(said("y = -3", "y = -3"));
    }

    #[test]
    fn fluent_wrong_solution_scores_zero() {
        let s = Scorer::new("t");
        let gt = truth("", &["x = 1"], &["derivative", "tangent"]);
        let wrong = "Taking the derivative and setting it to zero, the tangent is horizontal at \
                     x = 4, which is therefore the critical point of the function."
            .repeat(2);
        match s.score(Task::Solving, &wrong, &gt) {
            ScoreOutcome::Scored { correctness, metrics } => {
                assert_eq!(correctness, 0.0);
                assert_eq!(metrics.answers_matched, Some(0));
                assert_eq!(metrics.answers_total, Some(1));
                assert!(metrics.issues.is_empty());
            }
            other => panic!("expected scored, got {other:?}"),
        }
    }

    #[test]
    fn heuristic_grader_reads_difficulty_markers() {
        let s = Scorer::new("t");
        let gt = truth("", &[], &["derivative"]);
        let fine = "The derivative of the function is computed by the power rule, giving a slope \
                    that depends on x; evaluating at the point yields the tangent line. "
            .repeat(3);
        let good = s.score(Task::Solving, &fine, &gt).correctness().unwrap();
        let bad = s
            .score(Task::Solving, "I apologize, the image is not legible and I am unable to solve it.", &gt)
            .correctness()
            .unwrap();
        assert!(good > 0.9, "good = {good}");
        assert!(bad < 0.2, "bad = {bad}");
    }

    #[test]
    fn undecidable_response_is_unscored() {
        let s = Scorer::new("t");
        let long = "The problem asks for a value and the working is shown step by step. ".repeat(5);
        let out = s.score(Task::Explanation, &long, &truth("", &[], &[]));
        match out {
            ScoreOutcome::Unscored { reason } => assert!(reason.contains("judge")),
            other => panic!("expected unscored, got {other:?}"),
        }
    }

    #[test]
    fn degradation_needs_a_baseline() {
        assert_eq!(degradation(Some(0.5), 0.25), Some(0.5));
        assert_eq!(degradation(Some(0.0), 0.2), None);
        assert_eq!(degradation(None, 0.2), None);
    }
}
