//! Append-only JSONL ledger of everything a run produced.
//!
//! One tagged record per line:
//!
//! ```text
//! {"record":"variant","id":"exam__kerning",...}
//! {"record":"render","variant_id":"exam__kerning","path":"digital",...}
//! {"record":"response","trial_id":"exam__kerning@digital/openai:gpt-4o/solving#0",...}
//! {"record":"score","trial_id":"...","scorer_version":"heuristic-1",...}
//! ```
//!
//! Each append writes the full line and calls `sync_data` before the lock
//! is released, so a record that was reported as written survives a crash.
//! A crash in the middle of a write leaves at most one torn final line;
//! replay ignores it and the trial simply runs again.

use crate::error::ExamShieldError;
use crate::output::{ModelResponse, RenderRecord, ScoreRecord, TrialFailure, VariantRecord};
use crate::pipeline::render::ReproductionPath;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Ledger file name inside a run directory.
pub const LEDGER_FILE: &str = "ledger.jsonl";

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LedgerRecord {
    Variant(VariantRecord),
    Render(RenderRecord),
    Response(ModelResponse),
    TrialFailure(TrialFailure),
    Score(ScoreRecord),
}

/// What the ledger says has happened so far.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    pub variants: HashMap<String, VariantRecord>,
    pub renders: HashMap<(String, ReproductionPath), RenderRecord>,
    pub responses: HashMap<String, ModelResponse>,
    pub failures: HashMap<String, TrialFailure>,
    /// Keyed by `(trial_id, scorer_version)`.
    pub scores: HashMap<(String, String), ScoreRecord>,
    /// Insertion order of scorer versions, oldest first.
    pub scorer_versions: Vec<String>,
}

impl LedgerState {
    pub fn apply(&mut self, record: LedgerRecord) {
        match record {
            LedgerRecord::Variant(v) => {
                self.variants.insert(v.id.clone(), v);
            }
            LedgerRecord::Render(r) => {
                self.renders.insert((r.variant_id.clone(), r.path), r);
            }
            LedgerRecord::Response(r) => {
                self.responses.insert(r.trial_id.clone(), r);
            }
            LedgerRecord::TrialFailure(f) => {
                self.failures.insert(f.trial_id.clone(), f);
            }
            LedgerRecord::Score(s) => {
                if !self.scorer_versions.contains(&s.scorer_version) {
                    self.scorer_versions.push(s.scorer_version.clone());
                }
                self.scores.insert((s.trial_id.clone(), s.scorer_version.clone()), s);
            }
        }
    }

    /// A trial is finished once it has a response or a recorded failure.
    pub fn is_terminal(&self, trial_id: &str) -> bool {
        self.responses.contains_key(trial_id) || self.failures.contains_key(trial_id)
    }

    pub fn score(&self, trial_id: &str, version: &str) -> Option<&ScoreRecord> {
        self.scores.get(&(trial_id.to_string(), version.to_string()))
    }

    pub fn latest_scorer_version(&self) -> Option<&str> {
        self.scorer_versions.last().map(String::as_str)
    }
}

/// Read and parse every complete line of a ledger file.
pub async fn replay(path: &Path) -> Result<LedgerState, ExamShieldError> {
    let mut state = LedgerState::default();
    let text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(state),
        Err(e) => {
            return Err(ExamShieldError::LedgerIo {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    let torn_tail = !text.is_empty() && !text.ends_with('\n');
    let lines: Vec<&str> = text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerRecord>(line) {
            Ok(record) => state.apply(record),
            Err(e) if torn_tail && i + 1 == lines.len() => {
                warn!("{}: ignoring torn final line: {}", path.display(), e);
            }
            Err(e) => {
                return Err(ExamShieldError::CorruptLedger {
                    path: path.to_path_buf(),
                    line: i + 1,
                    detail: e.to_string(),
                })
            }
        }
    }
    Ok(state)
}

/// Appending handle on a ledger file.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    file: Mutex<File>,
}

impl Ledger {
    /// Open for appending, creating the file if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ExamShieldError> {
        let path = path.into();
        let io_err = |source| ExamShieldError::LedgerIo {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        // Cut a torn final line so the next record starts cleanly.
        let bytes = tokio::fs::read(&path).await.map_err(io_err)?;
        if bytes.last().is_some_and(|b| *b != b'\n') {
            let keep = bytes.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0);
            warn!("{}: truncating torn final line", path.display());
            file.set_len(keep as u64).await.map_err(io_err)?;
            file.sync_data().await.map_err(io_err)?;
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one record durably.
    pub async fn append(&self, record: &LedgerRecord) -> Result<(), ExamShieldError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        let io_err = |source| ExamShieldError::LedgerIo {
            path: self.path.clone(),
            source,
        };
        file.write_all(&line).await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{FailureStage, TrialKey};
    use crate::prompts::Task;

    fn key(index: u32) -> TrialKey {
        TrialKey {
            variant_id: "exam__baseline_clean".into(),
            combination: "baseline_clean".into(),
            path: ReproductionPath::Digital,
            model: "openai:gpt-4o".into(),
            task: Task::Transcription,
            index,
        }
    }

    #[tokio::test]
    async fn append_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE);
        let ledger = Ledger::open(&path).await.unwrap();
        ledger
            .append(&LedgerRecord::Response(ModelResponse::new(&key(0), "text".into(), 0)))
            .await
            .unwrap();
        ledger
            .append(&LedgerRecord::TrialFailure(TrialFailure::new(&key(1), FailureStage::Query, "401", 0)))
            .await
            .unwrap();

        let state = replay(&path).await.unwrap();
        assert!(state.is_terminal(&key(0).trial_id()));
        assert!(state.is_terminal(&key(1).trial_id()));
        assert!(!state.is_terminal(&key(2).trial_id()));
    }

    #[tokio::test]
    async fn missing_ledger_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = replay(&dir.path().join("none.jsonl")).await.unwrap();
        assert!(state.responses.is_empty());
    }

    #[tokio::test]
    async fn torn_tail_is_ignored_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE);
        let good = serde_json::to_string(&LedgerRecord::Response(ModelResponse::new(&key(0), "a".into(), 0)))
            .unwrap();
        tokio::fs::write(&path, format!("{good}\n{{\"record\":\"resp")).await.unwrap();

        let state = replay(&path).await.unwrap();
        assert_eq!(state.responses.len(), 1);

        let ledger = Ledger::open(&path).await.unwrap();
        ledger
            .append(&LedgerRecord::Response(ModelResponse::new(&key(1), "b".into(), 0)))
            .await
            .unwrap();
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(text.lines().count(), 2);
        assert_eq!(replay(&path).await.unwrap().responses.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_middle_line_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE);
        tokio::fs::write(&path, "not json\n").await.unwrap();
        let err = replay(&path).await.unwrap_err();
        assert!(matches!(err, ExamShieldError::CorruptLedger { line: 1, .. }));
    }
}
