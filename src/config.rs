//! Configuration types for an attack experiment.
//!
//! Everything a run depends on lives in [`ExperimentConfig`], built via
//! [`ExperimentConfigBuilder`] or loaded from a JSON file. The same config
//! always plans the same variants and trials; [`ExperimentConfig::fingerprint`]
//! is stored with the run so that a resumed run cannot silently switch to a
//! different experiment.
//!
//! Operational knobs (concurrency, retry schedule, render timeout, scorer
//! version) are left out of the fingerprint: changing them on resume is
//! allowed.

use crate::attack::{CombinationTemplate, ContextLevel, PresentationTieBreak};
use crate::catalog::{preset, preset_names, template_in_family};
use crate::error::ExamShieldError;
use crate::pipeline::render::ReproductionPath;
use crate::pipeline::select::{SelectOptions, DEFAULT_BUDGET};
use crate::progress::ProgressCallback;
use crate::prompts::Task;
use crate::retry::RetryPolicy;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default model identifier (`provider:model`).
pub const DEFAULT_MODEL: &str = "openai:gpt-4.1-nano";

/// Default scorer version tag stored on every score record.
pub const DEFAULT_SCORER_VERSION: &str = "heuristic-1";

/// Configuration for one experiment run.
///
/// # Example
/// ```rust
/// use examshield::{ExperimentConfig, AttackSelection};
///
/// let config = ExperimentConfig::builder()
///     .template("exam.tex")
///     .attacks(AttackSelection::Family("watermark".into()))
///     .trials(3)
///     .build()
///     .unwrap();
/// assert_eq!(config.trials, 3);
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// LaTeX template the variants are generated from.
    pub template: PathBuf,

    /// Directory holding `run.json`, `ledger.jsonl`, artifacts and the report.
    pub run_dir: PathBuf,

    /// Which combination templates to run. The baseline is always added.
    pub attacks: AttackSelection,

    /// How much of the document's structure the selector may use. Default: L2.
    pub context_level: ContextLevel,

    /// Models as `provider:model` identifiers, e.g. `"anthropic:claude-sonnet-4-20250514"`.
    pub models: Vec<String>,

    /// Tasks every artifact is queried with. Default: all three.
    pub tasks: Vec<Task>,

    /// Reproduction paths. Default: digital only.
    pub reproduction: Vec<ReproductionPath>,

    /// Photos of printed variants for the physical path. When `None` the
    /// physical path is simulated.
    pub photos_dir: Option<PathBuf>,

    /// Trials per (variant, path, model, task) cell. Range: 1–100. Default: 1.
    pub trials: u32,

    /// Concurrent trials. Default: 4.
    pub concurrency: usize,

    /// Retry schedule for render and query calls.
    pub retry: RetryPolicy,

    /// Per-region legibility budget. Range: 0.05–10. Default: 1.5.
    pub budget: f32,

    /// Variant seed. Every operator seed is derived from it.
    pub seed: u64,

    /// Order in which competing presentation operators are admitted.
    pub tie_break: PresentationTieBreak,

    /// Tag written on every score record.
    pub scorer_version: String,

    pub render: RenderSettings,

    pub query: QuerySettings,

    /// Pre-constructed provider used for every model instead of the factory.
    #[serde(skip)]
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Progress events.
    #[serde(skip)]
    pub progress: Option<ProgressCallback>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            template: PathBuf::new(),
            run_dir: PathBuf::from("runs/latest"),
            attacks: AttackSelection::default(),
            context_level: ContextLevel::MathFocused,
            models: vec![DEFAULT_MODEL.to_string()],
            tasks: Task::ALL.to_vec(),
            reproduction: vec![ReproductionPath::Digital],
            photos_dir: None,
            trials: 1,
            concurrency: 4,
            retry: RetryPolicy::default(),
            budget: DEFAULT_BUDGET,
            seed: 42,
            tie_break: PresentationTieBreak::default(),
            scorer_version: DEFAULT_SCORER_VERSION.to_string(),
            render: RenderSettings::default(),
            query: QuerySettings::default(),
            provider: None,
            progress: None,
        }
    }
}

impl fmt::Debug for ExperimentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentConfig")
            .field("template", &self.template)
            .field("run_dir", &self.run_dir)
            .field("attacks", &self.attacks)
            .field("context_level", &self.context_level)
            .field("models", &self.models)
            .field("tasks", &self.tasks)
            .field("reproduction", &self.reproduction)
            .field("photos_dir", &self.photos_dir)
            .field("trials", &self.trials)
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .field("budget", &self.budget)
            .field("seed", &self.seed)
            .field("tie_break", &self.tie_break)
            .field("scorer_version", &self.scorer_version)
            .field("render", &self.render)
            .field("query", &self.query)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("progress", &self.progress.as_ref().map(|_| "<dyn ExperimentProgressCallback>"))
            .finish()
    }
}

impl ExperimentConfig {
    /// Create a new builder for `ExperimentConfig`.
    pub fn builder() -> ExperimentConfigBuilder {
        ExperimentConfigBuilder {
            config: Self::default(),
        }
    }

    /// Builder seeded with this configuration, for overriding single fields.
    pub fn into_builder(self) -> ExperimentConfigBuilder {
        ExperimentConfigBuilder { config: self }
    }

    /// Load and validate a JSON config file. Missing fields take defaults.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ExamShieldError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ExamShieldError::InvalidConfig(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ExamShieldError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.into_builder().build()
    }

    /// Options handed to the selector for every variant.
    pub fn select_options(&self) -> SelectOptions {
        SelectOptions {
            context_level: self.context_level,
            budget: self.budget,
            seed: self.seed,
            tie_break: self.tie_break,
        }
    }

    /// Hash of the fields that decide what the run plans.
    pub fn fingerprint(&self) -> String {
        #[derive(Serialize)]
        struct Planned<'a> {
            template: &'a Path,
            attacks: &'a AttackSelection,
            context_level: ContextLevel,
            models: &'a [String],
            tasks: &'a [Task],
            reproduction: &'a [ReproductionPath],
            trials: u32,
            budget: f32,
            seed: u64,
            tie_break: PresentationTieBreak,
        }
        let planned = Planned {
            template: &self.template,
            attacks: &self.attacks,
            context_level: self.context_level,
            models: &self.models,
            tasks: &self.tasks,
            reproduction: &self.reproduction,
            trials: self.trials,
            budget: self.budget,
            seed: self.seed,
            tie_break: self.tie_break,
        };
        let bytes = serde_json::to_vec(&planned).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))[..16].to_string()
    }
}

/// Builder for [`ExperimentConfig`].
#[derive(Debug)]
pub struct ExperimentConfigBuilder {
    config: ExperimentConfig,
}

impl ExperimentConfigBuilder {
    pub fn template(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.template = path.into();
        self
    }

    pub fn run_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.run_dir = path.into();
        self
    }

    pub fn attacks(mut self, selection: AttackSelection) -> Self {
        self.config.attacks = selection;
        self
    }

    pub fn context_level(mut self, level: ContextLevel) -> Self {
        self.config.context_level = level;
        self
    }

    pub fn models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn tasks(mut self, tasks: &[Task]) -> Self {
        self.config.tasks = tasks.to_vec();
        self
    }

    pub fn reproduction(mut self, paths: &[ReproductionPath]) -> Self {
        self.config.reproduction = paths.to_vec();
        self
    }

    pub fn photos_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.photos_dir = Some(path.into());
        self
    }

    pub fn trials(mut self, n: u32) -> Self {
        self.config.trials = n.clamp(1, 100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn budget(mut self, budget: f32) -> Self {
        self.config.budget = if budget.is_finite() { budget.clamp(0.05, 10.0) } else { DEFAULT_BUDGET };
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn tie_break(mut self, policy: PresentationTieBreak) -> Self {
        self.config.tie_break = policy;
        self
    }

    pub fn scorer_version(mut self, version: impl Into<String>) -> Self {
        self.config.scorer_version = version.into();
        self
    }

    pub fn render(mut self, settings: RenderSettings) -> Self {
        self.config.render = settings;
        self
    }

    pub fn query(mut self, settings: QuerySettings) -> Self {
        self.config.query = settings;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.config.progress = Some(callback);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(mut self) -> Result<ExperimentConfig, ExamShieldError> {
        let c = &mut self.config;
        if c.template.as_os_str().is_empty() {
            return Err(ExamShieldError::InvalidConfig("A template path is required".into()));
        }
        if c.models.is_empty() {
            return Err(ExamShieldError::InvalidConfig("At least one model is required".into()));
        }
        if let Some(bad) = c.models.iter().find(|m| !m.contains(':')) {
            return Err(ExamShieldError::InvalidConfig(format!(
                "Model '{bad}' must be written as provider:model"
            )));
        }
        if c.tasks.is_empty() {
            return Err(ExamShieldError::InvalidConfig("At least one task is required".into()));
        }
        if c.reproduction.is_empty() {
            return Err(ExamShieldError::InvalidConfig(
                "At least one reproduction path is required".into(),
            ));
        }
        if c.trials == 0 || c.trials > 100 {
            return Err(ExamShieldError::InvalidConfig(format!("Trials must be 1–100, got {}", c.trials)));
        }
        if c.concurrency == 0 {
            return Err(ExamShieldError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if !c.budget.is_finite() || c.budget <= 0.0 {
            return Err(ExamShieldError::InvalidConfig(format!("Budget must be positive, got {}", c.budget)));
        }
        c.tasks.sort();
        c.tasks.dedup();
        c.reproduction.sort();
        c.reproduction.dedup();
        // Resolve once so an unknown preset fails at build time.
        c.attacks.resolve()?;
        Ok(self.config)
    }
}

// ── Attack selection ─────────────────────────────────────────────────────

/// Which combination templates a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum AttackSelection {
    /// Every built-in template. (default)
    #[default]
    All,
    /// Named templates (presets or single operators).
    Presets(Vec<String>),
    /// Templates containing an operator of this family.
    Family(String),
}

impl AttackSelection {
    /// Expand into templates, baseline first and without duplicates.
    pub fn resolve(&self) -> Result<Vec<CombinationTemplate>, ExamShieldError> {
        let mut templates = vec![CombinationTemplate::baseline()];
        let mut push = |t: CombinationTemplate| {
            if !templates.iter().any(|have| have.name == t.name) {
                templates.push(t);
            }
        };
        match self {
            AttackSelection::All => {
                for name in preset_names() {
                    if let Some(t) = preset(&name) {
                        push(t);
                    }
                }
            }
            AttackSelection::Presets(names) => {
                for name in names {
                    let t = preset(name).ok_or_else(|| ExamShieldError::UnknownAttack { name: name.clone() })?;
                    push(t);
                }
            }
            AttackSelection::Family(family) => {
                let matched: Vec<_> = preset_names()
                    .iter()
                    .filter_map(|n| preset(n))
                    .filter(|t| template_in_family(t, family))
                    .collect();
                if matched.is_empty() {
                    return Err(ExamShieldError::UnknownAttack {
                        name: format!("family:{family}"),
                    });
                }
                matched.into_iter().for_each(&mut push);
            }
        }
        Ok(templates)
    }
}

// ── Adapter settings ─────────────────────────────────────────────────────

/// LaTeX engine and rasterisation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Engine binary. Default: `lualatex`.
    pub engine: String,
    /// Compile timeout in seconds. Default: 120.
    pub timeout_secs: u64,
    /// Longest edge of a rasterised page in pixels. Default: 2000.
    pub max_rendered_pixels: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            engine: "lualatex".to_string(),
            timeout_secs: 120,
            max_rendered_pixels: 2000,
        }
    }
}

/// Completion options for model calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,
    /// Maximum tokens per response. Default: 4096.
    pub max_tokens: usize,
    /// Per-call timeout in seconds. Default: 90.
    pub timeout_secs: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 4096,
            timeout_secs: 90,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_and_validates() {
        let c = ExperimentConfig::builder()
            .template("exam.tex")
            .trials(0)
            .concurrency(0)
            .budget(f32::NAN)
            .build()
            .unwrap();
        assert_eq!(c.trials, 1);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.budget, DEFAULT_BUDGET);
    }

    #[test]
    fn template_is_required() {
        let err = ExperimentConfig::builder().build().unwrap_err();
        assert!(matches!(err, ExamShieldError::InvalidConfig(_)));
    }

    #[test]
    fn model_must_name_provider() {
        let err = ExperimentConfig::builder()
            .template("exam.tex")
            .models(["gpt-4o"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("provider:model"));
    }

    #[test]
    fn unknown_preset_fails_at_build() {
        let err = ExperimentConfig::builder()
            .template("exam.tex")
            .attacks(AttackSelection::Presets(vec!["laser".into()]))
            .build()
            .unwrap_err();
        assert!(matches!(err, ExamShieldError::UnknownAttack { .. }));
    }

    #[test]
    fn selection_always_starts_with_baseline() {
        let t = AttackSelection::Presets(vec!["kerning".into(), "kerning".into()])
            .resolve()
            .unwrap();
        let names: Vec<_> = t.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["baseline_clean", "kerning"]);

        let family = AttackSelection::Family("watermark".into()).resolve().unwrap();
        assert!(family.iter().any(|t| t.name == "watermark_tiled"));
        assert!(AttackSelection::Family("nope".into()).resolve().is_err());
    }

    #[test]
    fn fingerprint_ignores_operational_knobs() {
        let a = ExperimentConfig::builder().template("exam.tex").build().unwrap();
        let b = ExperimentConfig::builder()
            .template("exam.tex")
            .concurrency(16)
            .scorer_version("heuristic-2")
            .build()
            .unwrap();
        let c = ExperimentConfig::builder().template("exam.tex").seed(7).build().unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn json_roundtrip_keeps_defaults() {
        let json = r#"{"template": "exam.tex", "attacks": {"kind": "presets", "value": ["light_protection"]}}"#;
        let c: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.trials, 1);
        assert_eq!(c.render.engine, "lualatex");
        assert_eq!(c.attacks, AttackSelection::Presets(vec!["light_protection".into()]));
    }

    #[test]
    fn debug_hides_provider() {
        let c = ExperimentConfig::default();
        assert!(format!("{c:?}").contains("provider: None"));
    }
}
