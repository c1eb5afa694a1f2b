//! # examshield
//!
//! Generate adversarial variants of math exam documents (LaTeX templates)
//! that stay legible to people but degrade what vision-language models
//! (VLMs) can transcribe, solve or explain, and measure by how much.
//!
//! ## Why this crate?
//!
//! Blanket distortions hurt human readers as much as models. The attacks
//! here are chosen per region: the template is analysed structurally
//! (text, math, figures, density), operators are selected under a
//! per-region legibility budget, and every operator touches presentation
//! only. The ground truth of every variant is byte-identical to the
//! source's, so a drop in model accuracy is attributable to the attack.
//!
//! ## Pipeline Overview
//!
//! ```text
//! template.tex
//!  │
//!  ├─ 1. Analyze    regions, density, adjacency, subject
//!  ├─ 2. Select     operators per region under intensity + budget
//!  ├─ 3. Compose    seeded, deterministic variant LaTeX
//!  ├─ 4. Render     LaTeX engine → PDF → page PNGs (pdfium)
//!  ├─ 5. Reproduce  optional print-and-photograph path
//!  ├─ 6. Query      page images + task prompt → VLM (edgequake-llm)
//!  ├─ 7. Score      transcription F1/LCS, known answers, heuristic grader
//!  └─ 8. Aggregate  degradation vs. baseline, physical − digital delta
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use examshield::{AttackSelection, CancelHandle, Experiment, ExperimentConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ExperimentConfig::builder()
//!         .template("exam.tex")
//!         .attacks(AttackSelection::Presets(vec!["medium_protection".into()]))
//!         .models(["openai:gpt-4.1-nano", "anthropic:claude-sonnet-4-20250514"])
//!         .run_dir("runs/exam")
//!         .build()?;
//!     let report = Experiment::from_config(config).run(&CancelHandle::new()).await?;
//!     for c in &report.combinations {
//!         println!("{}: {:?}", c.combination, c.by_path);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Variants alone, without rendering or querying:
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), examshield::ExamShieldError> {
//! use examshield::{analyze, compose, select, CombinationSpec, SelectOptions, SourceDocument};
//!
//! let doc = SourceDocument::load("exam.tex").await?;
//! let profile = analyze(&doc);
//! let template = examshield::catalog::preset("light_protection").expect("built-in preset");
//! let spec: CombinationSpec = select(&profile, &template, &SelectOptions::default());
//! let variant = compose(&doc, &spec);
//! assert_eq!(variant.ground_truth, doc.ground_truth);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `examshield` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! examshield = { version = "0.1", default-features = false }
//! ```
//!
//! ## Runtime requirements
//!
//! Rendering needs a LaTeX engine on `PATH` (`lualatex` by default) and the
//! pdfium shared library (`PDFIUM_LIB_PATH` or the system search path).
//! Queries need the provider's API key (`OPENAI_API_KEY`,
//! `ANTHROPIC_API_KEY`, `GEMINI_API_KEY`, …) as read by `edgequake-llm`.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod attack;
pub mod catalog;
pub mod config;
pub mod document;
pub mod error;
pub mod harness;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use attack::{AttackSpec, CombinationSpec, CombinationTemplate, ContextLevel, IntensityLevel, PresentationTieBreak};
pub use catalog::OperatorKind;
pub use config::{AttackSelection, ExperimentConfig, ExperimentConfigBuilder, QuerySettings, RenderSettings};
pub use document::{GroundTruth, SourceDocument};
pub use error::{ExamShieldError, OperatorError, QueryError, RenderError, ScoringAmbiguity};
pub use harness::report::{report_from_ledger, Report};
pub use harness::{plan_variants, CancelHandle, Experiment, Stage};
pub use output::{ModelResponse, ScoreRecord, TrialKey};
pub use pipeline::analyze::{analyze, StructuralProfile};
pub use pipeline::compose::{compose, VariantDocument};
pub use pipeline::render::{RenderedArtifact, Renderer, ReproductionPath};
pub use pipeline::select::{select, SelectOptions};
pub use pipeline::score::{ScoreOutcome, Scorer};
pub use progress::{ExperimentProgressCallback, NoopProgressCallback, ProgressCallback};
pub use prompts::Task;
pub use retry::RetryPolicy;
