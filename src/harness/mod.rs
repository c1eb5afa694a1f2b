//! Experiment harness: drives a configured experiment from template to report.
//!
//! ```text
//! Configured
//!  ├─ GeneratingVariants  analyze → select → compose, one variant per template
//!  ├─ Rendering           compile (digital) and reproduce (physical)
//!  ├─ QueryingModels      variant × path × model × task × trial, concurrent
//!  ├─ Scoring             every response, once per scorer version
//!  └─ Aggregated          report.json
//! ```
//!
//! The current stage is persisted in `run.json` together with the config
//! fingerprint; everything the run produces is appended to
//! `ledger.jsonl` (see [`ledger`]). Reopening the same run directory
//! replays the ledger and skips finished variants, renders, trials and
//! scores, so an interrupted run resumes where it stopped.
//!
//! Scoring starts only once every trial is terminal: degradation needs the
//! baseline mean for the same model, task and path.

pub mod ledger;
pub mod report;

use crate::attack::{AuditEntry, BASELINE_NAME};
use crate::config::ExperimentConfig;
use crate::document::{GroundTruth, SourceDocument};
use crate::error::ExamShieldError;
use crate::output::{FailureStage, ModelResponse, RenderRecord, ScoreRecord, TrialFailure, TrialKey, VariantRecord};
use crate::pipeline::analyze::analyze;
use crate::pipeline::compose::{compose, VariantDocument};
use crate::pipeline::query::{LlmModelQuery, ModelQuery};
use crate::pipeline::render::{LatexRenderer, RenderedArtifact, Renderer, ReproductionPath};
use crate::pipeline::reproduce::{CapturedPhotos, Reproducer, SimulatedPrintScan};
use crate::pipeline::score::{degradation, ScoreOutcome, Scorer};
use crate::pipeline::select::select;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts::Task;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use ledger::{replay, Ledger, LedgerRecord, LedgerState, LEDGER_FILE};
use report::Report;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Run state file inside the run directory.
pub const RUN_STATE_FILE: &str = "run.json";
/// Aggregated report inside the run directory.
pub const REPORT_FILE: &str = "report.json";
/// Variant LaTeX sources.
pub const VARIANTS_DIR: &str = "variants";
/// Rendered and reproduced page images.
pub const ARTIFACTS_DIR: &str = "artifacts";

// ── Run state ────────────────────────────────────────────────────────────

/// Where a run is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Configured,
    GeneratingVariants,
    Rendering,
    QueryingModels,
    Scoring,
    Aggregated,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Configured => "configured",
            Stage::GeneratingVariants => "generating variants",
            Stage::Rendering => "rendering",
            Stage::QueryingModels => "querying models",
            Stage::Scoring => "scoring",
            Stage::Aggregated => "aggregated",
        };
        f.write_str(s)
    }
}

/// Persisted in `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub fingerprint: String,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Load the run state of `run_dir`, or start a new one.
    ///
    /// Fails with [`ExamShieldError::RunMismatch`] when the directory holds a
    /// run with a different fingerprint.
    pub async fn open(run_dir: &Path, fingerprint: &str) -> Result<Self, ExamShieldError> {
        let path = run_dir.join(RUN_STATE_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let state: RunState = serde_json::from_str(&text)
                    .map_err(|e| ExamShieldError::InvalidConfig(format!("{}: {e}", path.display())))?;
                if state.fingerprint != fingerprint {
                    return Err(ExamShieldError::RunMismatch {
                        run_dir: run_dir.to_path_buf(),
                        expected: state.fingerprint,
                        found: fingerprint.to_string(),
                    });
                }
                info!("Resuming run in {} (last stage: {})", run_dir.display(), state.stage);
                Ok(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let now = Utc::now();
                let state = RunState {
                    fingerprint: fingerprint.to_string(),
                    stage: Stage::Configured,
                    created_at: now,
                    updated_at: now,
                };
                state.save(run_dir).await?;
                Ok(state)
            }
            Err(e) => Err(ExamShieldError::OutputWriteFailed { path, source: e }),
        }
    }

    pub async fn advance(&mut self, run_dir: &Path, stage: Stage) -> Result<(), ExamShieldError> {
        self.stage = stage;
        self.updated_at = Utc::now();
        self.save(run_dir).await
    }

    async fn save(&self, run_dir: &Path) -> Result<(), ExamShieldError> {
        write_atomic(&run_dir.join(RUN_STATE_FILE), &serde_json::to_vec_pretty(self)?).await
    }
}

/// Write `bytes` to `path` through a temp file and a rename, so readers
/// never see a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ExamShieldError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExamShieldError::OutputWriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_default();
    let tmp_path = path.with_extension(format!("{ext}.tmp"));
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| ExamShieldError::OutputWriteFailed {
            path: tmp_path.clone(),
            source: e,
        })?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| ExamShieldError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(())
}

/// Stops a run from dispatching new trials. Trials already in flight
/// finish and are recorded.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Variant generation ───────────────────────────────────────────────────

/// A composed variant and the selector's audit trail for it.
#[derive(Debug, Clone)]
pub struct PlannedVariant {
    pub variant: VariantDocument,
    pub audit: Vec<AuditEntry>,
}

/// Load the template and compose one variant per resolved combination
/// template, baseline first.
pub async fn plan_variants(config: &ExperimentConfig) -> Result<(SourceDocument, Vec<PlannedVariant>), ExamShieldError> {
    let doc = SourceDocument::load(&config.template).await?;
    let profile = analyze(&doc);
    for w in &profile.warnings {
        warn!("{}: region {}: {}", doc.id, w.region, w.message);
    }
    let opts = config.select_options();
    let planned = config
        .attacks
        .resolve()?
        .iter()
        .map(|template| {
            let spec = select(&profile, template, &opts);
            let variant = compose(&doc, &spec);
            debug!(
                "{}: {} applied, {} failed, {} audit entries",
                variant.id,
                variant.applied.len(),
                variant.failures.len(),
                spec.audit.len()
            );
            PlannedVariant {
                variant,
                audit: spec.audit,
            }
        })
        .collect();
    Ok((doc, planned))
}

/// Path of a variant's LaTeX source under `run_dir`.
pub fn variant_tex_path(run_dir: &Path, variant_id: &str) -> PathBuf {
    run_dir.join(VARIANTS_DIR).join(format!("{variant_id}.tex"))
}

// ── Experiment ───────────────────────────────────────────────────────────

/// One experiment over one template.
pub struct Experiment {
    config: ExperimentConfig,
    renderer: Arc<dyn Renderer>,
    query: Arc<dyn ModelQuery>,
    reproducer: Option<Arc<dyn Reproducer>>,
    scorer: Scorer,
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("config", &self.config)
            .field("renderer", &"<dyn Renderer>")
            .field("query", &"<dyn ModelQuery>")
            .field("reproducer", &self.reproducer.as_ref().map(|_| "<dyn Reproducer>"))
            .field("scorer", &self.scorer)
            .finish()
    }
}

/// What became of one dispatched trial.
enum TrialOutcome {
    Answered,
    Failed,
    Cancelled,
}

impl Experiment {
    pub fn new(config: ExperimentConfig, renderer: Arc<dyn Renderer>, query: Arc<dyn ModelQuery>) -> Self {
        let scorer = Scorer::new(config.scorer_version.clone());
        Self {
            config,
            renderer,
            query,
            reproducer: None,
            scorer,
        }
    }

    /// Stock adapters: LaTeX + pdfium rendering and `edgequake-llm` queries.
    pub fn from_config(config: ExperimentConfig) -> Self {
        let renderer = Arc::new(LatexRenderer::new(
            config.render.clone(),
            config.run_dir.join(ARTIFACTS_DIR),
        ));
        let query: Arc<dyn ModelQuery> = match &config.provider {
            Some(p) => Arc::new(LlmModelQuery::with_provider(config.query.clone(), Arc::clone(p))),
            None => Arc::new(LlmModelQuery::new(config.query.clone())),
        };
        Self::new(config, renderer, query)
    }

    /// Replace the physical-path adapter. Without one, photos from
    /// `photos_dir` are used when configured, else a print-scan simulation.
    pub fn with_reproducer(mut self, reproducer: Arc<dyn Reproducer>) -> Self {
        self.reproducer = Some(reproducer);
        self
    }

    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    fn progress(&self) -> ProgressCallback {
        self.config
            .progress
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback))
    }

    fn reproducer(&self) -> Result<Arc<dyn Reproducer>, ExamShieldError> {
        if let Some(r) = &self.reproducer {
            return Ok(Arc::clone(r));
        }
        Ok(match &self.config.photos_dir {
            Some(dir) => Arc::new(CapturedPhotos::new(dir)?),
            None => Arc::new(SimulatedPrintScan::new(self.config.run_dir.join(ARTIFACTS_DIR))),
        })
    }

    /// Run (or resume) the experiment to its report.
    ///
    /// Returns [`ExamShieldError::Cancelled`] when `cancel` fired before
    /// every trial was dispatched; the ledger keeps everything recorded so
    /// far and the next call picks up the rest.
    pub async fn run(&self, cancel: &CancelHandle) -> Result<Report, ExamShieldError> {
        let run_dir = self.config.run_dir.as_path();
        let progress = self.progress();
        tokio::fs::create_dir_all(run_dir)
            .await
            .map_err(|e| ExamShieldError::OutputWriteFailed {
                path: run_dir.to_path_buf(),
                source: e,
            })?;
        let mut run_state = RunState::open(run_dir, &self.config.fingerprint()).await?;
        let ledger_path = run_dir.join(LEDGER_FILE);
        let mut state = replay(&ledger_path).await?;
        let ledger = Ledger::open(&ledger_path).await?;

        // ── Variants ──
        run_state.advance(run_dir, Stage::GeneratingVariants).await?;
        progress.on_stage(Stage::GeneratingVariants);
        let (doc, planned) = plan_variants(&self.config).await?;
        for p in &planned {
            let v = &p.variant;
            match state.variants.get(&v.id) {
                Some(recorded) if recorded.content_hash != v.content_hash => {
                    return Err(ExamShieldError::RunMismatch {
                        run_dir: run_dir.to_path_buf(),
                        expected: recorded.content_hash.clone(),
                        found: v.content_hash.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    let tex = variant_tex_path(run_dir, &v.id);
                    write_atomic(&tex, v.latex.as_bytes()).await?;
                    let record = LedgerRecord::Variant(VariantRecord::new(v, p.audit.clone(), tex));
                    ledger.append(&record).await?;
                    state.apply(record);
                }
            }
            progress.on_variant(&v.id, v.applied.len(), v.failures.len());
        }
        info!("{} variant(s) of '{}'", planned.len(), doc.id);

        // ── Rendering ──
        run_state.advance(run_dir, Stage::Rendering).await?;
        progress.on_stage(Stage::Rendering);
        let renders = self.render_all(&planned, &state, &ledger).await?;
        for r in &renders {
            state.renders.insert((r.variant_id.clone(), r.path), r.clone());
        }

        // ── Trials ──
        run_state.advance(run_dir, Stage::QueryingModels).await?;
        progress.on_stage(Stage::QueryingModels);
        let keys = self.plan_trials(&planned);
        let total = keys.len();
        let skipped = keys.iter().filter(|k| state.is_terminal(&k.trial_id())).count();
        progress.on_trials_start(total, skipped);
        let done = AtomicUsize::new(skipped);

        let mut pending = Vec::new();
        for key in keys.into_iter().filter(|k| !state.is_terminal(&k.trial_id())) {
            let render = state.renders.get(&(key.variant_id.clone(), key.path));
            match render.and_then(|r| r.artifact.clone()) {
                Some(artifact) => pending.push((key, artifact)),
                None => {
                    let reason = render
                        .and_then(|r| r.error.as_ref())
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no artifact".to_string());
                    let failure = TrialFailure::new(&key, FailureStage::Render, reason.clone(), 0);
                    ledger.append(&LedgerRecord::TrialFailure(failure)).await?;
                    let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                    progress.on_trial_error(&key.trial_id(), &reason, n, total);
                }
            }
        }

        let (ledger_ref, progress_ref, done_ref) = (&ledger, &progress, &done);
        let outcomes: Vec<Result<TrialOutcome, ExamShieldError>> =
            stream::iter(pending.iter().map(move |(key, artifact)| async move {
                if cancel.is_cancelled() {
                    return Ok(TrialOutcome::Cancelled);
                }
                self.run_trial(key, artifact, ledger_ref, progress_ref, done_ref, total)
                    .await
            }))
        .buffer_unordered(self.config.concurrency)
        .collect()
        .await;

        let mut cancelled = 0;
        for outcome in outcomes {
            if let TrialOutcome::Cancelled = outcome? {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!("Run cancelled with {} trial(s) not dispatched", cancelled);
            return Err(ExamShieldError::Cancelled { pending: cancelled });
        }

        // ── Scoring ──
        run_state.advance(run_dir, Stage::Scoring).await?;
        progress.on_stage(Stage::Scoring);
        let mut state = replay(&ledger_path).await?;
        for record in score_pending(&state, &self.scorer, &doc.ground_truth) {
            let record = LedgerRecord::Score(record);
            ledger.append(&record).await?;
            state.apply(record);
        }

        // ── Report ──
        let report = report::build(&state, &self.scorer.version);
        write_atomic(&run_dir.join(REPORT_FILE), &serde_json::to_vec_pretty(&report)?).await?;
        run_state.advance(run_dir, Stage::Aggregated).await?;
        progress.on_stage(Stage::Aggregated);
        progress.on_run_complete(report.totals.valid, report.totals.failed, report.totals.unscored);
        info!(
            "Run complete: {} valid, {} failed, {} unscored",
            report.totals.valid, report.totals.failed, report.totals.unscored
        );
        Ok(report)
    }

    /// Renders every variant on every configured path, reusing renders the
    /// ledger already holds. Returns the records produced in this session.
    async fn render_all(
        &self,
        planned: &[PlannedVariant],
        state: &LedgerState,
        ledger: &Ledger,
    ) -> Result<Vec<RenderRecord>, ExamShieldError> {
        let want_physical = self.config.reproduction.contains(&ReproductionPath::Physical);
        let reproducer = if want_physical { Some(self.reproducer()?) } else { None };
        let progress = self.progress();

        let progress = &progress;
        let results: Vec<Result<Vec<RenderRecord>, ExamShieldError>> = stream::iter(planned.iter().map(move |p| {
            let reproducer = reproducer.clone();
            async move {
                let v = &p.variant;
                let mut produced = Vec::new();
                let digital = match state.renders.get(&(v.id.clone(), ReproductionPath::Digital)) {
                    Some(r) => r.clone(),
                    None => {
                        let record = self.render_digital(v).await;
                        ledger.append(&LedgerRecord::Render(record.clone())).await?;
                        produced.push(record.clone());
                        record
                    }
                };
                if let Some(e) = &digital.error {
                    progress.on_render_error(&v.id, &e.to_string());
                }

                if let Some(reproducer) = reproducer {
                    if !state.renders.contains_key(&(v.id.clone(), ReproductionPath::Physical)) {
                        let record = match &digital.artifact {
                            Some(artifact) => reproduce(reproducer.as_ref(), artifact, v).await,
                            None => RenderRecord {
                                variant_id: v.id.clone(),
                                path: ReproductionPath::Physical,
                                artifact: None,
                                error: digital.error.clone(),
                                retries: 0,
                            },
                        };
                        if digital.artifact.is_some() {
                            if let Some(e) = &record.error {
                                progress.on_render_error(&v.id, &e.to_string());
                            }
                        }
                        ledger.append(&LedgerRecord::Render(record.clone())).await?;
                        produced.push(record);
                    }
                }
                Ok::<_, ExamShieldError>(produced)
            }
        }))
        .buffer_unordered(self.config.concurrency)
        .collect()
        .await;

        let mut out = Vec::new();
        for r in results {
            out.extend(r?);
        }
        Ok(out)
    }

    async fn render_digital(&self, v: &VariantDocument) -> RenderRecord {
        let renderer = self.renderer.as_ref();
        let label = format!("render {}", v.id);
        match self.config.retry.run(&label, move |_| renderer.compile(v)).await {
            Ok(done) => RenderRecord {
                variant_id: v.id.clone(),
                path: ReproductionPath::Digital,
                artifact: Some(done.value),
                error: None,
                retries: done.retries,
            },
            Err(failed) => {
                warn!("{}: render failed: {}", v.id, failed.error);
                RenderRecord {
                    variant_id: v.id.clone(),
                    path: ReproductionPath::Digital,
                    artifact: None,
                    error: Some(failed.error),
                    retries: failed.retries,
                }
            }
        }
    }

    /// Every trial the config asks for, in a stable order.
    fn plan_trials(&self, planned: &[PlannedVariant]) -> Vec<TrialKey> {
        let c = &self.config;
        let mut keys = Vec::new();
        for p in planned {
            for &path in &c.reproduction {
                for model in &c.models {
                    for &task in &c.tasks {
                        for index in 0..c.trials {
                            keys.push(TrialKey {
                                variant_id: p.variant.id.clone(),
                                combination: p.variant.combination.clone(),
                                path,
                                model: model.clone(),
                                task,
                                index,
                            });
                        }
                    }
                }
            }
        }
        keys
    }

    async fn run_trial(
        &self,
        key: &TrialKey,
        artifact: &RenderedArtifact,
        ledger: &Ledger,
        progress: &ProgressCallback,
        done: &AtomicUsize,
        total: usize,
    ) -> Result<TrialOutcome, ExamShieldError> {
        let trial_id = key.trial_id();
        let prompt = key.task.prompt();
        let query = self.query.as_ref();
        let (prompt_ref, model) = (prompt.as_str(), key.model.as_str());
        let result = self
            .config
            .retry
            .run(&trial_id, move |_| query.query(artifact, prompt_ref, model))
            .await;

        match result {
            Ok(answered) => {
                let response = ModelResponse::new(key, answered.value, answered.retries);
                ledger.append(&LedgerRecord::Response(response)).await?;
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("{}: answered after {} retries", trial_id, answered.retries);
                progress.on_trial_complete(&trial_id, n, total);
                Ok(TrialOutcome::Answered)
            }
            Err(failed) => {
                let message = failed.error.to_string();
                warn!("{}: failed after {} retries: {}", trial_id, failed.retries, message);
                let failure = TrialFailure::new(key, FailureStage::Query, message.clone(), failed.retries);
                ledger.append(&LedgerRecord::TrialFailure(failure)).await?;
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                progress.on_trial_error(&trial_id, &message, n, total);
                Ok(TrialOutcome::Failed)
            }
        }
    }
}

async fn reproduce(reproducer: &dyn Reproducer, digital: &RenderedArtifact, v: &VariantDocument) -> RenderRecord {
    let (artifact, error) = match reproducer.reproduce(digital, v, v.seed).await {
        Ok(a) => (Some(a), None),
        Err(e) => {
            warn!("{}: physical reproduction failed: {}", v.id, e);
            (None, Some(e))
        }
    };
    RenderRecord {
        variant_id: v.id.clone(),
        path: ReproductionPath::Physical,
        artifact,
        error,
        retries: 0,
    }
}

/// Score records for every response that has none under `scorer`'s version.
///
/// Degradation is measured against the mean correctness of the baseline
/// variant's scored responses for the same model, task and path.
pub fn score_pending(state: &LedgerState, scorer: &Scorer, truth: &GroundTruth) -> Vec<ScoreRecord> {
    let version = scorer.version.as_str();
    let mut responses: Vec<&ModelResponse> = state.responses.values().collect();
    responses.sort_by(|a, b| a.trial_id.cmp(&b.trial_id));

    let outcomes: Vec<(&ModelResponse, Option<ScoreRecord>, ScoreOutcome)> = responses
        .into_iter()
        .map(|r| match state.score(&r.trial_id, version) {
            Some(existing) => (r, None, existing.outcome.clone()),
            None => {
                let outcome = scorer.score(r.task, &r.text, truth);
                let record = ScoreRecord {
                    trial_id: r.trial_id.clone(),
                    scorer_version: version.to_string(),
                    outcome: outcome.clone(),
                    degradation: None,
                };
                (r, Some(record), outcome)
            }
        })
        .collect();

    let mut sums: HashMap<(&str, Task, ReproductionPath), (f32, usize)> = HashMap::new();
    for (r, _, outcome) in &outcomes {
        if r.combination != BASELINE_NAME {
            continue;
        }
        if let Some(c) = outcome.correctness() {
            let e = sums.entry((r.model.as_str(), r.task, r.path)).or_insert((0.0, 0));
            e.0 += c;
            e.1 += 1;
        }
    }

    outcomes
        .into_iter()
        .filter_map(|(r, record, outcome)| {
            let mut record = record?;
            if let Some(c) = outcome.correctness() {
                let baseline = sums
                    .get(&(r.model.as_str(), r.task, r.path))
                    .map(|(sum, n)| sum / *n as f32);
                record.degradation = degradation(baseline, c);
            }
            Some(record)
        })
        .collect()
}
