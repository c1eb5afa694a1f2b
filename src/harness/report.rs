//! Aggregation of a ledger into `report.json`.
//!
//! Statistics are grouped twice: per combination × reproduction path (the
//! headline table) and per combination × path × model × task (the cells
//! behind it). Only `Scored` outcomes feed means and variances; failed and
//! unscored trials are counted and listed individually so nothing is
//! silently averaged away.

use crate::attack::BASELINE_NAME;
use crate::config::DEFAULT_SCORER_VERSION;
use crate::error::{ExamShieldError, OperatorError};
use crate::harness::ledger::{replay, LedgerState};
use crate::output::{FailureStage, TrialFailure};
use crate::pipeline::render::ReproductionPath;
use crate::pipeline::score::ScoreOutcome;
use crate::prompts::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Aggregated results of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub scorer_version: String,
    pub totals: Totals,
    pub combinations: Vec<CombinationSummary>,
    /// Attacked combinations per path, most degrading first.
    #[serde(default)]
    pub ranking: Vec<RankedCombination>,
    pub cells: Vec<CellSummary>,
    /// Every trial that ended without a response.
    pub failed: Vec<TrialFailure>,
    /// Every response the scorer could not judge.
    pub unscored: Vec<UnscoredTrial>,
    /// Variants on which some operator application was skipped.
    pub operator_failures: Vec<VariantFailures>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    /// Responses plus recorded failures.
    pub trials: usize,
    pub valid: usize,
    pub failed: usize,
    pub unscored: usize,
    /// Responses without a score under this scorer version.
    pub pending: usize,
}

/// Counts and moments over a group of trials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialStats {
    pub valid: usize,
    pub failed: usize,
    pub unscored: usize,
    pub mean_correctness: Option<f32>,
    pub mean_degradation: Option<f32>,
    /// Population variance of correctness across valid trials.
    pub variance: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationSummary {
    pub combination: String,
    pub by_path: BTreeMap<ReproductionPath, TrialStats>,
    /// Mean physical correctness minus mean digital correctness.
    pub physical_minus_digital: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCombination {
    pub combination: String,
    pub path: ReproductionPath,
    pub mean_degradation: f32,
    pub valid: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSummary {
    pub combination: String,
    pub path: ReproductionPath,
    pub model: String,
    pub task: Task,
    #[serde(flatten)]
    pub stats: TrialStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnscoredTrial {
    pub trial_id: String,
    pub combination: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantFailures {
    pub variant_id: String,
    pub combination: String,
    pub failures: Vec<OperatorError>,
}

#[derive(Default)]
struct Acc {
    valid: usize,
    failed: usize,
    unscored: usize,
    correctness: Vec<f32>,
    degradation: Vec<f32>,
}

impl Acc {
    fn stats(&self) -> TrialStats {
        let mean_correctness = mean(&self.correctness);
        let variance = mean_correctness.map(|m| {
            self.correctness.iter().map(|c| (c - m) * (c - m)).sum::<f32>() / self.correctness.len() as f32
        });
        TrialStats {
            valid: self.valid,
            failed: self.failed,
            unscored: self.unscored,
            mean_correctness,
            mean_degradation: mean(&self.degradation),
            variance,
        }
    }
}

fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

type CellKey = (String, ReproductionPath, String, Task);

/// Aggregate `state` under scorer `version`.
pub fn build(state: &LedgerState, version: &str) -> Report {
    let mut totals = Totals::default();
    let mut cells: BTreeMap<CellKey, Acc> = BTreeMap::new();
    let mut by_path: BTreeMap<(String, ReproductionPath), Acc> = BTreeMap::new();
    let mut unscored = Vec::new();

    for response in state.responses.values() {
        totals.trials += 1;
        let Some(record) = state.score(&response.trial_id, version) else {
            totals.pending += 1;
            continue;
        };
        let cell = cells
            .entry((
                response.combination.clone(),
                response.path,
                response.model.clone(),
                response.task,
            ))
            .or_default();
        let group = by_path.entry((response.combination.clone(), response.path)).or_default();
        match &record.outcome {
            ScoreOutcome::Scored { correctness: c, .. } => {
                let c = *c;
                totals.valid += 1;
                for acc in [&mut *cell, &mut *group] {
                    acc.valid += 1;
                    acc.correctness.push(c);
                    if let Some(d) = record.degradation {
                        acc.degradation.push(d);
                    }
                }
            }
            ScoreOutcome::Unscored { reason } => {
                totals.unscored += 1;
                cell.unscored += 1;
                group.unscored += 1;
                unscored.push(UnscoredTrial {
                    trial_id: response.trial_id.clone(),
                    combination: response.combination.clone(),
                    reason: reason.clone(),
                });
            }
        }
    }

    let mut failed: Vec<TrialFailure> = state.failures.values().cloned().collect();
    for f in &failed {
        totals.trials += 1;
        totals.failed += 1;
        cells
            .entry((f.combination.clone(), f.path, f.model.clone(), f.task))
            .or_default()
            .failed += 1;
        by_path.entry((f.combination.clone(), f.path)).or_default().failed += 1;
    }
    failed.sort_by(|a, b| a.trial_id.cmp(&b.trial_id));
    unscored.sort_by(|a, b| a.trial_id.cmp(&b.trial_id));

    let mut combinations: BTreeMap<String, BTreeMap<ReproductionPath, TrialStats>> = BTreeMap::new();
    for ((combination, path), acc) in &by_path {
        combinations
            .entry(combination.clone())
            .or_default()
            .insert(*path, acc.stats());
    }
    let combinations: Vec<CombinationSummary> = combinations
        .into_iter()
        .map(|(combination, by_path)| {
            let physical_minus_digital = match (
                by_path.get(&ReproductionPath::Physical).and_then(|s| s.mean_correctness),
                by_path.get(&ReproductionPath::Digital).and_then(|s| s.mean_correctness),
            ) {
                (Some(p), Some(d)) => Some(p - d),
                _ => None,
            };
            CombinationSummary {
                combination,
                by_path,
                physical_minus_digital,
            }
        })
        .collect();

    let ranking = rank(&combinations);

    let cells = cells
        .into_iter()
        .map(|((combination, path, model, task), acc)| CellSummary {
            combination,
            path,
            model,
            task,
            stats: acc.stats(),
        })
        .collect();

    let mut operator_failures: Vec<VariantFailures> = state
        .variants
        .values()
        .filter(|v| !v.failures.is_empty())
        .map(|v| VariantFailures {
            variant_id: v.id.clone(),
            combination: v.combination.clone(),
            failures: v.failures.clone(),
        })
        .collect();
    operator_failures.sort_by(|a, b| a.variant_id.cmp(&b.variant_id));

    Report {
        generated_at: Utc::now(),
        scorer_version: version.to_string(),
        totals,
        combinations,
        ranking,
        cells,
        failed,
        unscored,
        operator_failures,
    }
}

/// Order attacked combinations by mean degradation, descending. Groups with
/// no degradation (baseline, or no usable baseline mean) are left out;
/// ties fall back to name and path order.
fn rank(combinations: &[CombinationSummary]) -> Vec<RankedCombination> {
    let mut ranking: Vec<RankedCombination> = combinations
        .iter()
        .filter(|c| c.combination != BASELINE_NAME)
        .flat_map(|c| {
            c.by_path.iter().filter_map(|(path, s)| {
                s.mean_degradation.map(|d| RankedCombination {
                    combination: c.combination.clone(),
                    path: *path,
                    mean_degradation: d,
                    valid: s.valid,
                })
            })
        })
        .collect();
    ranking.sort_by(|a, b| {
        b.mean_degradation
            .total_cmp(&a.mean_degradation)
            .then_with(|| a.combination.cmp(&b.combination))
            .then_with(|| a.path.cmp(&b.path))
    });
    ranking
}

impl Report {
    /// Trials lost to compile or reproduction failures.
    pub fn render_failures(&self) -> usize {
        self.failed.iter().filter(|f| f.stage == FailureStage::Render).count()
    }
}

/// Rebuild a report from a ledger file without running anything.
///
/// With no `scorer_version` the most recently recorded one is used.
pub async fn report_from_ledger(path: &Path, scorer_version: Option<&str>) -> Result<Report, ExamShieldError> {
    let state = replay(path).await?;
    let version = scorer_version
        .or(state.latest_scorer_version())
        .unwrap_or(DEFAULT_SCORER_VERSION)
        .to_string();
    Ok(build(&state, &version))
}
