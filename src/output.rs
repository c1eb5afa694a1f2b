//! Records produced by a run.
//!
//! Everything here is written once and never edited: responses, failures
//! and scores are appended to the ledger as they happen, and a later scorer
//! version adds new score records beside the old ones.

use crate::attack::AuditEntry;
use crate::error::{OperatorError, RenderError};
use crate::pipeline::compose::{AppliedOperator, VariantDocument};
use crate::pipeline::render::{RenderedArtifact, ReproductionPath};
use crate::pipeline::score::ScoreOutcome;
use crate::prompts::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Coordinates of one trial: a variant seen through one path, asked one
/// task by one model, repeated `index` times.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialKey {
    pub variant_id: String,
    pub combination: String,
    pub path: ReproductionPath,
    pub model: String,
    pub task: Task,
    pub index: u32,
}

impl TrialKey {
    /// `<variant>@<path>/<model>/<task>#<index>`, unique within a run.
    pub fn trial_id(&self) -> String {
        format!(
            "{}@{}/{}/{}#{}",
            self.variant_id, self.path, self.model, self.task, self.index
        )
    }

    pub fn artifact_id(&self) -> String {
        RenderedArtifact::artifact_id(&self.variant_id, self.path)
    }
}

impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.trial_id())
    }
}

/// A variant as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub id: String,
    pub combination: String,
    pub seed: u64,
    pub content_hash: String,
    /// Where the variant's LaTeX was written.
    pub tex: PathBuf,
    pub applied: Vec<AppliedOperator>,
    pub failures: Vec<OperatorError>,
    pub audit: Vec<AuditEntry>,
}

impl VariantRecord {
    pub fn new(variant: &VariantDocument, audit: Vec<AuditEntry>, tex: PathBuf) -> Self {
        Self {
            id: variant.id.clone(),
            combination: variant.combination.clone(),
            seed: variant.seed,
            content_hash: variant.content_hash.clone(),
            tex,
            applied: variant.applied.clone(),
            failures: variant.failures.clone(),
            audit,
        }
    }
}

/// Outcome of rendering one variant for one reproduction path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRecord {
    pub variant_id: String,
    pub path: ReproductionPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<RenderedArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RenderError>,
    pub retries: u32,
}

/// A model's raw answer for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub trial_id: String,
    pub artifact_id: String,
    pub model: String,
    pub task: Task,
    pub combination: String,
    pub path: ReproductionPath,
    pub text: String,
    pub retries: u32,
    pub timestamp: DateTime<Utc>,
}

impl ModelResponse {
    pub fn new(key: &TrialKey, text: String, retries: u32) -> Self {
        Self {
            trial_id: key.trial_id(),
            artifact_id: key.artifact_id(),
            model: key.model.clone(),
            task: key.task,
            combination: key.combination.clone(),
            path: key.path,
            text,
            retries,
            timestamp: Utc::now(),
        }
    }
}

/// Where a failed trial broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// The variant never produced an artifact for this path.
    Render,
    /// The model call failed permanently or ran out of retries.
    Query,
}

/// A trial that ended without a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialFailure {
    pub trial_id: String,
    pub model: String,
    pub task: Task,
    pub combination: String,
    pub path: ReproductionPath,
    pub stage: FailureStage,
    pub error: String,
    pub retries: u32,
    pub timestamp: DateTime<Utc>,
}

impl TrialFailure {
    pub fn new(key: &TrialKey, stage: FailureStage, error: impl Into<String>, retries: u32) -> Self {
        Self {
            trial_id: key.trial_id(),
            model: key.model.clone(),
            task: key.task,
            combination: key.combination.clone(),
            path: key.path,
            stage,
            error: error.into(),
            retries,
            timestamp: Utc::now(),
        }
    }
}

/// Score of one response under one scorer version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub trial_id: String,
    pub scorer_version: String,
    pub outcome: ScoreOutcome,
    /// Relative to the baseline mean for the same model, task and path.
    pub degradation: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TrialKey {
        TrialKey {
            variant_id: "exam__kerning".into(),
            combination: "kerning".into(),
            path: ReproductionPath::Physical,
            model: "openai:gpt-4o".into(),
            task: Task::Solving,
            index: 2,
        }
    }

    #[test]
    fn trial_ids_are_readable_and_unique() {
        let k = key();
        assert_eq!(k.trial_id(), "exam__kerning@physical/openai:gpt-4o/solving#2");
        let mut other = k.clone();
        other.index = 3;
        assert_ne!(k.trial_id(), other.trial_id());
        assert_eq!(k.artifact_id(), "exam__kerning@physical");
    }

    #[test]
    fn response_carries_trial_coordinates() {
        let r = ModelResponse::new(&key(), "x = 2".into(), 1);
        assert_eq!(r.trial_id, key().trial_id());
        assert_eq!(r.task, Task::Solving);
        assert_eq!(r.combination, "kerning");
        let json = serde_json::to_string(&r).unwrap();
        let back: ModelResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
