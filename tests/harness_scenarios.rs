//! End-to-end runs of the experiment harness with in-process adapters.
//!
//! The renderer writes tiny PNG pages into a temp directory and the model
//! query answers from a script, so no LaTeX engine, pdfium or API key is
//! needed.

use async_trait::async_trait;
use examshield::attack::BASELINE_NAME;
use examshield::config::{ExperimentConfigBuilder, DEFAULT_SCORER_VERSION};
use examshield::harness::ledger::{replay, LEDGER_FILE};
use examshield::harness::{RUN_STATE_FILE, VARIANTS_DIR};
use examshield::output::FailureStage;
use examshield::pipeline::query::ModelQuery;
use examshield::pipeline::reproduce::Reproducer;
use examshield::{
    AttackSelection, CancelHandle, ExamShieldError, Experiment, ExperimentConfig, ExperimentProgressCallback, QueryError,
    RenderError, RenderedArtifact, Renderer, Report, ReproductionPath, RetryPolicy, SourceDocument, Stage, Task,
    VariantDocument,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Fakes ────────────────────────────────────────────────────────────────────

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/calculus_exam.tex")
}

/// Writes one blank page per variant; fails to compile one combination.
struct PageRenderer {
    dir: PathBuf,
    fail: Option<&'static str>,
    calls: AtomicUsize,
}

impl PageRenderer {
    fn new(dir: &Path, fail: Option<&'static str>) -> Arc<Self> {
        std::fs::create_dir_all(dir).unwrap();
        Arc::new(Self {
            dir: dir.to_path_buf(),
            fail,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Renderer for PageRenderer {
    async fn compile(&self, variant: &VariantDocument) -> Result<RenderedArtifact, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail == Some(variant.combination.as_str()) {
            return Err(RenderError::Compile {
                region: None,
                detail: "Undefined control sequence".into(),
            });
        }
        let page = self.dir.join(format!("{}-1.png", variant.id));
        image::RgbImage::from_pixel(8, 8, image::Rgb([255, 255, 255]))
            .save(&page)
            .map_err(|e| RenderError::Io(e.to_string()))?;
        RenderedArtifact::from_files(&variant.id, ReproductionPath::Digital, vec![page], None).await
    }
}

/// Relabels the digital pages as a physical capture.
struct Photocopier;

#[async_trait]
impl Reproducer for Photocopier {
    async fn reproduce(
        &self,
        digital: &RenderedArtifact,
        variant: &VariantDocument,
        _seed: u64,
    ) -> Result<RenderedArtifact, RenderError> {
        Ok(RenderedArtifact {
            id: RenderedArtifact::artifact_id(&variant.id, ReproductionPath::Physical),
            path: ReproductionPath::Physical,
            ..digital.clone()
        })
    }
}

/// Answers the baseline with the exact transcription and everything else
/// with noise.
struct ScriptedModel {
    truth: String,
    calls: AtomicUsize,
    transient_failures: Mutex<u32>,
    cancel_on_first_call: Option<CancelHandle>,
}

impl ScriptedModel {
    fn new(truth: &str) -> Self {
        Self {
            truth: truth.to_string(),
            calls: AtomicUsize::new(0),
            transient_failures: Mutex::new(0),
            cancel_on_first_call: None,
        }
    }

    fn flaky(self, failures: u32) -> Self {
        *self.transient_failures.lock().unwrap() = failures;
        self
    }

    fn cancelling(mut self, handle: &CancelHandle) -> Self {
        self.cancel_on_first_call = Some(handle.clone());
        self
    }
}

#[async_trait]
impl ModelQuery for ScriptedModel {
    async fn query(&self, artifact: &RenderedArtifact, _prompt: &str, _model: &str) -> Result<String, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = &self.cancel_on_first_call {
            handle.cancel();
        }
        {
            let mut left = self.transient_failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(QueryError::Transient("429 Too Many Requests".into()));
            }
        }
        if artifact.variant_id.ends_with(BASELINE_NAME) {
            Ok(self.truth.clone())
        } else {
            Ok("zzz".to_string())
        }
    }
}

#[derive(Default)]
struct Recorder {
    stages: Mutex<Vec<Stage>>,
    completed: Mutex<Option<(usize, usize, usize)>>,
}

impl ExperimentProgressCallback for Recorder {
    fn on_stage(&self, stage: Stage) {
        self.stages.lock().unwrap().push(stage);
    }

    fn on_run_complete(&self, valid: usize, failed: usize, unscored: usize) {
        *self.completed.lock().unwrap() = Some((valid, failed, unscored));
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// `RUST_LOG=examshield=debug cargo test -- --nocapture` shows the harness log.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn truth() -> String {
    init_logging();
    SourceDocument::load(fixture()).await.unwrap().ground_truth.transcription
}

fn builder(run_dir: &Path) -> ExperimentConfigBuilder {
    ExperimentConfig::builder()
        .template(fixture())
        .run_dir(run_dir)
        .attacks(AttackSelection::Presets(vec!["kerning".into(), "watermark_tiled".into()]))
        .models(["mock:vision"])
        .tasks(&[Task::Transcription])
        .trials(1)
        .concurrency(1)
        .retry(RetryPolicy {
            max_retries: 3,
            backoff_ms: 1,
            max_backoff_ms: 4,
        })
}

fn ledger_lines(run_dir: &Path) -> usize {
    std::fs::read_to_string(run_dir.join(LEDGER_FILE))
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count()
}

fn digital<'a>(report: &'a Report, combination: &str) -> &'a examshield::harness::report::TrialStats {
    let summary = report
        .combinations
        .iter()
        .find(|c| c.combination == combination)
        .unwrap_or_else(|| panic!("no summary for {combination}"));
    &summary.by_path[&ReproductionPath::Digital]
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn compile_failure_is_recorded_and_the_rest_is_scored() {
    let tmp = tempfile::tempdir().unwrap();
    let run_dir = tmp.path().join("run");
    let recorder = Arc::new(Recorder::default());
    let config = builder(&run_dir).progress_callback(recorder.clone()).build().unwrap();
    let renderer = PageRenderer::new(&tmp.path().join("pages"), Some("kerning"));
    let model = Arc::new(ScriptedModel::new(&truth().await));

    let report = Experiment::new(config, renderer.clone(), model.clone())
        .run(&CancelHandle::new())
        .await
        .unwrap();

    assert_eq!(report.totals.trials, 3);
    assert_eq!(report.totals.valid, 2);
    assert_eq!(report.totals.failed, 1);
    assert_eq!(report.totals.pending, 0);
    assert_eq!(report.render_failures(), 1);
    assert_eq!(report.failed[0].combination, "kerning");
    assert_eq!(report.failed[0].stage, FailureStage::Render);
    assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.scorer_version, DEFAULT_SCORER_VERSION);

    assert!(digital(&report, BASELINE_NAME).mean_degradation.unwrap().abs() < 1e-6);
    assert!(digital(&report, "watermark_tiled").mean_degradation.unwrap() > 0.5);

    assert!(run_dir.join("report.json").exists());
    let state: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join(RUN_STATE_FILE)).unwrap()).unwrap();
    assert_eq!(state["stage"], "aggregated");
    let tex_files = std::fs::read_dir(run_dir.join(VARIANTS_DIR)).unwrap().count();
    assert_eq!(tex_files, 3);

    assert_eq!(
        *recorder.stages.lock().unwrap(),
        [
            Stage::GeneratingVariants,
            Stage::Rendering,
            Stage::QueryingModels,
            Stage::Scoring,
            Stage::Aggregated
        ]
    );
    assert_eq!(*recorder.completed.lock().unwrap(), Some((2, 1, 0)));
}

#[tokio::test]
async fn resume_skips_finished_work_and_rescoring_appends_only_scores() {
    let tmp = tempfile::tempdir().unwrap();
    let run_dir = tmp.path().join("run");
    let pages = tmp.path().join("pages");
    let truth = truth().await;

    let first = Experiment::new(
        builder(&run_dir).build().unwrap(),
        PageRenderer::new(&pages, Some("kerning")),
        Arc::new(ScriptedModel::new(&truth)),
    )
    .run(&CancelHandle::new())
    .await
    .unwrap();
    let lines = ledger_lines(&run_dir);

    let renderer = PageRenderer::new(&pages, Some("kerning"));
    let model = Arc::new(ScriptedModel::new(&truth));
    let again = Experiment::new(builder(&run_dir).build().unwrap(), renderer.clone(), model.clone())
        .run(&CancelHandle::new())
        .await
        .unwrap();
    assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    assert_eq!(ledger_lines(&run_dir), lines);
    assert_eq!(again.totals, first.totals);

    // A new scorer version keeps the plan, so the run resumes and only
    // adds score records.
    let rescored = Experiment::new(
        builder(&run_dir).scorer_version("heuristic-2").build().unwrap(),
        renderer.clone(),
        model.clone(),
    )
    .run(&CancelHandle::new())
    .await
    .unwrap();
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    assert_eq!(ledger_lines(&run_dir), lines + 2);
    assert_eq!(rescored.scorer_version, "heuristic-2");

    let state = replay(&run_dir.join(LEDGER_FILE)).await.unwrap();
    assert_eq!(state.scores.len(), 4);
    let old = examshield::report_from_ledger(&run_dir.join(LEDGER_FILE), Some(DEFAULT_SCORER_VERSION))
        .await
        .unwrap();
    assert_eq!(old.totals.valid, 2);
}

#[tokio::test]
async fn transient_query_errors_are_retried() {
    let tmp = tempfile::tempdir().unwrap();
    let run_dir = tmp.path().join("run");
    let model = Arc::new(ScriptedModel::new(&truth().await).flaky(2));

    let report = Experiment::new(
        builder(&run_dir).build().unwrap(),
        PageRenderer::new(&tmp.path().join("pages"), None),
        model.clone(),
    )
    .run(&CancelHandle::new())
    .await
    .unwrap();

    assert_eq!(report.totals.valid, 3);
    assert_eq!(model.calls.load(Ordering::SeqCst), 5);
    let state = replay(&run_dir.join(LEDGER_FILE)).await.unwrap();
    let mut retries: Vec<u32> = state.responses.values().map(|r| r.retries).collect();
    retries.sort();
    assert_eq!(retries, [0, 0, 2]);
}

#[tokio::test]
async fn cancelled_run_resumes_where_it_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    let run_dir = tmp.path().join("run");
    let pages = tmp.path().join("pages");
    let truth = truth().await;

    let cancel = CancelHandle::new();
    let err = Experiment::new(
        builder(&run_dir).build().unwrap(),
        PageRenderer::new(&pages, None),
        Arc::new(ScriptedModel::new(&truth).cancelling(&cancel)),
    )
    .run(&cancel)
    .await
    .unwrap_err();
    assert!(matches!(err, ExamShieldError::Cancelled { pending: 2 }), "{err}");
    assert_eq!(replay(&run_dir.join(LEDGER_FILE)).await.unwrap().responses.len(), 1);

    let model = Arc::new(ScriptedModel::new(&truth));
    let report = Experiment::new(builder(&run_dir).build().unwrap(), PageRenderer::new(&pages, None), model.clone())
        .run(&CancelHandle::new())
        .await
        .unwrap();
    assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.totals.valid, 3);
}

#[tokio::test]
async fn changed_plan_in_the_same_directory_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let run_dir = tmp.path().join("run");
    let pages = tmp.path().join("pages");
    let truth = truth().await;

    Experiment::new(
        builder(&run_dir).build().unwrap(),
        PageRenderer::new(&pages, None),
        Arc::new(ScriptedModel::new(&truth)),
    )
    .run(&CancelHandle::new())
    .await
    .unwrap();

    let model = Arc::new(ScriptedModel::new(&truth));
    let err = Experiment::new(
        builder(&run_dir).seed(7).build().unwrap(),
        PageRenderer::new(&pages, None),
        model.clone(),
    )
    .run(&CancelHandle::new())
    .await
    .unwrap_err();
    assert!(matches!(err, ExamShieldError::RunMismatch { .. }), "{err}");
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn physical_path_follows_the_digital_render() {
    let tmp = tempfile::tempdir().unwrap();
    let run_dir = tmp.path().join("run");
    let config = builder(&run_dir)
        .reproduction(&[ReproductionPath::Digital, ReproductionPath::Physical])
        .build()
        .unwrap();

    let report = Experiment::new(
        config,
        PageRenderer::new(&tmp.path().join("pages"), Some("kerning")),
        Arc::new(ScriptedModel::new(&truth().await)),
    )
    .with_reproducer(Arc::new(Photocopier))
    .run(&CancelHandle::new())
    .await
    .unwrap();

    assert_eq!(report.totals.trials, 6);
    assert_eq!(report.totals.valid, 4);
    assert_eq!(report.render_failures(), 2);
    assert!(report
        .failed
        .iter()
        .all(|f| f.combination == "kerning" && f.error.contains("Undefined control sequence")));

    let watermark = report
        .combinations
        .iter()
        .find(|c| c.combination == "watermark_tiled")
        .unwrap();
    assert_eq!(watermark.by_path.len(), 2);
    assert!(watermark.physical_minus_digital.unwrap().abs() < 1e-6);
}
