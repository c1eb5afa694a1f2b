//! CLI binary for examshield.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExperimentConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use examshield::catalog::{preset, preset_names, FAMILIES};
use examshield::harness::{plan_variants, write_atomic, REPORT_FILE};
use examshield::harness::ledger::LEDGER_FILE;
use examshield::pipeline::render::LatexRenderer;
use examshield::{
    analyze, report_from_ledger, AttackSelection, CancelHandle, ContextLevel, ExamShieldError, Experiment,
    ExperimentConfig, ExperimentProgressCallback, OperatorKind, PresentationTieBreak, ProgressCallback,
    RenderSettings, Report, ReproductionPath, RetryPolicy, SourceDocument, Stage, Task,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar over trials, with one log line per variant, render
/// failure and failed trial. Trials complete out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize, skipped: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} trials  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_length(total as u64);
        self.bar.set_position(skipped as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Querying");
        self.bar.reset_eta();
    }
}

fn truncate(msg: &str, max: usize) -> String {
    if msg.chars().count() > max {
        let cut: String = msg.chars().take(max - 1).collect();
        format!("{cut}\u{2026}")
    } else {
        msg.to_string()
    }
}

impl ExperimentProgressCallback for CliProgressCallback {
    fn on_stage(&self, stage: Stage) {
        self.bar.set_message(stage.to_string());
        if stage != Stage::QueryingModels {
            self.bar.set_prefix(match stage {
                Stage::GeneratingVariants => "Generating",
                Stage::Rendering => "Rendering",
                Stage::Scoring => "Scoring",
                _ => "Working",
            });
        }
    }

    fn on_variant(&self, variant_id: &str, applied: usize, failed: usize) {
        let failed_note = if failed > 0 {
            red(&format!("{failed} skipped"))
        } else {
            String::new()
        };
        self.bar.println(format!(
            "  {} {:<44} {}  {}",
            cyan("◆"),
            variant_id,
            dim(&format!("{applied:>2} applied")),
            failed_note
        ));
    }

    fn on_render_error(&self, variant_id: &str, error: &str) {
        self.bar.println(format!(
            "  {} {:<44} {}",
            red("✗"),
            variant_id,
            red(&truncate(error, 80))
        ));
    }

    fn on_trials_start(&self, total: usize, skipped: usize) {
        self.activate_bar(total, skipped);
        if skipped > 0 {
            self.bar.println(format!(
                "{} {}",
                cyan("◆"),
                bold(&format!("Resuming: {skipped}/{total} trials already recorded"))
            ));
        }
    }

    fn on_trial_complete(&self, trial_id: &str, _done: usize, _total: usize) {
        self.bar.set_message(trial_id.to_string());
        self.bar.inc(1);
    }

    fn on_trial_error(&self, trial_id: &str, error: &str, _done: usize, _total: usize) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {}  {}",
            red("✗"),
            trial_id,
            red(&truncate(error, 80))
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, valid: usize, failed: usize, unscored: usize) {
        self.bar.finish_and_clear();
        let mark = if failed == 0 && unscored == 0 { green("✔") } else { cyan("⚠") };
        eprintln!(
            "{} {} valid  {} failed  {} unscored",
            mark,
            bold(&valid.to_string()),
            if failed > 0 { red(&failed.to_string()) } else { failed.to_string() },
            unscored
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # List operators, presets and families
  examshield catalog

  # Show the structural profile of a template
  examshield analyze exam.tex

  # Write attacked variants without rendering anything
  examshield generate exam.tex --attacks light_protection,kerning -o variants/

  # Full experiment, two models, digital and physical paths
  examshield run --template exam.tex --family watermark \
      --models openai:gpt-4.1-nano,anthropic:claude-sonnet-4-20250514 \
      --paths digital,physical --trials 3 --run-dir runs/exam

  # Resume an interrupted run (same flags, same run directory)
  examshield run --config runs/exam.json

  # Rebuild the report from a ledger, optionally for an older scorer
  examshield report runs/exam --scorer-version heuristic-1

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY       OpenAI API key
  ANTHROPIC_API_KEY    Anthropic API key
  GEMINI_API_KEY       Google Gemini API key
  PDFIUM_LIB_PATH      Path to libpdfium (file or directory)
  RUST_LOG             Log filter, overrides -v / -q

RUN DIRECTORY:
  run.json       stage and config fingerprint
  ledger.jsonl   one JSON record per variant, render, trial and score
  variants/      LaTeX source of every variant
  artifacts/     compiled PDFs and page images
  report.json    aggregated results
"#;

/// Context-aware adversarial perturbation of math exam documents.
#[derive(Parser, Debug)]
#[command(
    name = "examshield",
    version,
    about = "Generate attacked variants of LaTeX exams and measure how much they degrade VLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "EXAMSHIELD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "EXAMSHIELD_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List operators, presets and families.
    Catalog {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the structural profile of a template.
    Analyze {
        template: PathBuf,
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Compose variants and write their LaTeX without rendering.
    Generate {
        template: PathBuf,
        /// Output directory for `<variant>.tex` files.
        #[arg(short, long, default_value = "variants")]
        output: PathBuf,
        #[command(flatten)]
        plan: PlanArgs,
    },
    /// Run (or resume) a full experiment.
    Run(RunArgs),
    /// Rebuild the report from a run directory or ledger file.
    Report {
        /// Run directory or `ledger.jsonl`.
        path: PathBuf,
        /// Scorer version to report. Default: the latest recorded.
        #[arg(long)]
        scorer_version: Option<String>,
        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Flags deciding which variants are planned.
#[derive(Args, Debug, Default)]
struct PlanArgs {
    /// Comma-separated presets or operator names.
    #[arg(long, value_delimiter = ',', conflicts_with = "family")]
    attacks: Vec<String>,

    /// Every template touching this operator family.
    #[arg(long)]
    family: Option<String>,

    /// Context level 0–3.
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=3))]
    level: Option<u8>,

    /// Per-region legibility budget.
    #[arg(long)]
    budget: Option<f32>,

    /// Variant seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Presentation tie-break: catalog_priority, request_order, lower_cost_first.
    #[arg(long)]
    tie_break: Option<PresentationTieBreak>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON config file; flags below override its fields.
    #[arg(long, env = "EXAMSHIELD_CONFIG")]
    config: Option<PathBuf>,

    /// LaTeX template.
    #[arg(long)]
    template: Option<PathBuf>,

    /// Run directory.
    #[arg(long)]
    run_dir: Option<PathBuf>,

    #[command(flatten)]
    plan: PlanArgs,

    /// Comma-separated `provider:model` identifiers.
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,

    /// Comma-separated tasks: transcription, solving, explanation.
    #[arg(long, value_delimiter = ',')]
    tasks: Vec<Task>,

    /// Comma-separated reproduction paths: digital, physical.
    #[arg(long, value_delimiter = ',')]
    paths: Vec<ReproductionPath>,

    /// Photos of printed variants for the physical path.
    #[arg(long)]
    photos: Option<PathBuf>,

    /// Trials per cell (1–100).
    #[arg(long)]
    trials: Option<u32>,

    /// Concurrent trials.
    #[arg(short, long, env = "EXAMSHIELD_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Retries per render or query on transient failure.
    #[arg(long)]
    max_retries: Option<u32>,

    /// LaTeX engine binary.
    #[arg(long, env = "EXAMSHIELD_ENGINE")]
    engine: Option<String>,

    /// Tag for score records.
    #[arg(long)]
    scorer_version: Option<String>,

    /// Disable progress bar.
    #[arg(long, env = "EXAMSHIELD_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs would interleave with the progress bar; keep them
    // for runs without one.
    let show_progress = match &cli.command {
        Command::Run(args) => !cli.quiet && !args.no_progress,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Catalog { json } => print_catalog(json),
        Command::Analyze { template, json } => run_analyze(&template, json).await,
        Command::Generate { template, output, plan } => run_generate(template, &output, &plan, cli.quiet).await,
        Command::Run(args) => run_experiment(args, show_progress, cli.quiet).await,
        Command::Report {
            path,
            scorer_version,
            json,
        } => run_report(&path, scorer_version.as_deref(), json).await,
    }
}

// ── Subcommands ──────────────────────────────────────────────────────────────

fn print_catalog(json: bool) -> Result<()> {
    if json {
        let operators: Vec<_> = OperatorKind::ALL
            .iter()
            .map(|op| {
                serde_json::json!({
                    "name": op.name(),
                    "presentation": op.is_presentation(),
                    "targets": op.applicable_kinds().iter().map(|k| k.to_string()).collect::<Vec<_>>(),
                    "priority": op.priority(),
                })
            })
            .collect();
        let families: Vec<_> = FAMILIES.iter().map(|(name, _)| *name).collect();
        let value = serde_json::json!({
            "operators": operators,
            "presets": preset_names(),
            "families": families,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{}", bold("OPERATORS"));
    for op in OperatorKind::ALL {
        let class = if op.is_presentation() { "presentation" } else { "content" };
        let targets: Vec<String> = op.applicable_kinds().iter().map(|k| k.to_string()).collect();
        println!("  {:<22} {:<13} {}", op.name(), dim(class), targets.join(", "));
    }
    println!("\n{}", bold("PRESETS"));
    for name in preset_names() {
        let attacks = preset(&name)
            .map(|t| t.attacks.iter().map(|a| a.qualified_name()).collect::<Vec<_>>().join(" + "))
            .unwrap_or_default();
        println!("  {:<22} {}", name, dim(&attacks));
    }
    println!("\n{}", bold("FAMILIES"));
    for (name, ops) in FAMILIES {
        let ops: Vec<&str> = ops.iter().map(|o| o.name()).collect();
        let members = if ops.is_empty() { "templates with several attacks".to_string() } else { ops.join(", ") };
        println!("  {:<22} {}", name, dim(&members));
    }
    Ok(())
}

async fn run_analyze(template: &Path, json: bool) -> Result<()> {
    let doc = SourceDocument::load(template).await.context("Failed to load template")?;
    let profile = analyze(&doc);
    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
        return Ok(());
    }
    println!("Template:     {}", template.display());
    if let Some(ref class) = profile.document_class {
        println!("Class:        {}", class);
    }
    println!("Subject:      {}", profile.subject);
    println!("Pages:        {}", profile.pages);
    println!("Regions:      {} ({} math)", profile.regions.len(), profile.math_region_count());
    println!("Figures:      {}", profile.has_figures());
    println!("Complex math: {}", profile.has_complex_math);
    if !profile.packages.is_empty() {
        println!("Packages:     {}", profile.packages.join(", "));
    }
    if !doc.ground_truth.answers.is_empty() {
        println!("Answers:      {}", doc.ground_truth.answers.join(" | "));
    }
    println!();
    for r in &profile.regions {
        println!(
            "  {:<5} {:<7} p{} density {:.2}  {}{}",
            r.id.to_string(),
            r.kind.to_string(),
            r.bbox.page,
            r.density,
            dim(&format!("adjacent {}", r.adjacent.len())),
            if r.warning { red("  malformed") } else { String::new() }
        );
    }
    for w in &profile.warnings {
        eprintln!("{} region {}: {}", cyan("⚠"), w.region, w.message);
    }
    Ok(())
}

async fn run_generate(template: PathBuf, output: &Path, plan: &PlanArgs, quiet: bool) -> Result<()> {
    let config = apply_plan(ExperimentConfig::builder().template(template), plan)
        .build()
        .context("Invalid configuration")?;
    let (_, planned) = plan_variants(&config).await.context("Failed to compose variants")?;
    for p in &planned {
        let v = &p.variant;
        let path = output.join(format!("{}.tex", v.id));
        write_atomic(&path, v.latex.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        let audit_path = path.with_extension("audit.json");
        let audit = serde_json::json!({
            "variant": v.id,
            "seed": v.seed,
            "content_hash": v.content_hash,
            "applied": v.applied,
            "failures": v.failures,
            "audit": p.audit,
        });
        write_atomic(&audit_path, &serde_json::to_vec_pretty(&audit)?).await?;
        if !quiet {
            let mark = if v.failures.is_empty() { green("✓") } else { cyan("⚠") };
            eprintln!(
                "  {} {:<44} {}  {}",
                mark,
                v.id,
                dim(&format!("{:>2} applied", v.applied.len())),
                dim(&format!("{} audit", p.audit.len()))
            );
        }
    }
    if !quiet {
        eprintln!(
            "{} {} variants  →  {}",
            green("✔"),
            planned.len(),
            bold(&output.display().to_string())
        );
    }
    Ok(())
}

async fn run_experiment(args: RunArgs, show_progress: bool, quiet: bool) -> Result<()> {
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExperimentProgressCallback>)
    } else {
        None
    };
    let config = build_config(&args, progress).await?;

    LatexRenderer::check_pdfium().context("PDF rasteriser unavailable")?;

    let cancel = CancelHandle::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} interrupt: finishing in-flight trials…", cyan("⚠"));
            on_signal.cancel();
        }
    });

    let run_dir = config.run_dir.clone();
    match Experiment::from_config(config).run(&cancel).await {
        Ok(report) => {
            if !quiet {
                print_summary(&report);
                eprintln!("   report  →  {}", bold(&run_dir.join(REPORT_FILE).display().to_string()));
            }
            Ok(())
        }
        Err(ExamShieldError::Cancelled { pending }) => {
            eprintln!(
                "{} stopped with {} trial(s) pending; rerun the same command to resume",
                red("✘"),
                pending
            );
            std::process::exit(130);
        }
        Err(e) => Err(e).context("Experiment failed"),
    }
}

async fn run_report(path: &Path, scorer_version: Option<&str>, json: bool) -> Result<()> {
    let ledger = if path.is_dir() { path.join(LEDGER_FILE) } else { path.to_path_buf() };
    if !ledger.exists() {
        anyhow::bail!("No ledger at {}", ledger.display());
    }
    let report = report_from_ledger(&ledger, scorer_version)
        .await
        .context("Failed to rebuild report")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}

// ── Output ───────────────────────────────────────────────────────────────────

fn fmt_opt(v: Option<f32>) -> String {
    v.map(|v| format!("{v:>7.3}")).unwrap_or_else(|| format!("{:>7}", "-"))
}

fn print_summary(report: &Report) {
    println!(
        "{}  {}",
        bold("RESULTS"),
        dim(&format!("scorer {}", report.scorer_version))
    );
    println!(
        "  {:<28} {:<9} {:>5} {:>5} {:>5} {:>7} {:>7} {:>7} {:>7}",
        "combination", "path", "ok", "fail", "unsc", "correct", "degrad", "var", "Δphys"
    );
    for c in &report.combinations {
        for (path, s) in &c.by_path {
            let delta = if *path == ReproductionPath::Physical {
                fmt_opt(c.physical_minus_digital)
            } else {
                String::new()
            };
            println!(
                "  {:<28} {:<9} {:>5} {:>5} {:>5} {} {} {} {}",
                c.combination,
                path.to_string(),
                s.valid,
                s.failed,
                s.unscored,
                fmt_opt(s.mean_correctness),
                fmt_opt(s.mean_degradation),
                fmt_opt(s.variance),
                delta
            );
        }
    }
    if !report.ranking.is_empty() {
        println!("\n  {}", bold("MOST DEGRADING"));
        for (i, r) in report.ranking.iter().take(5).enumerate() {
            println!(
                "  {:>2}. {:<28} {:<9} {}",
                i + 1,
                r.combination,
                r.path.to_string(),
                fmt_opt(Some(r.mean_degradation))
            );
        }
    }
    let t = &report.totals;
    println!(
        "\n  {} trials: {} valid, {} failed ({} at render), {} unscored, {} pending",
        t.trials,
        green(&t.valid.to_string()),
        if t.failed > 0 { red(&t.failed.to_string()) } else { t.failed.to_string() },
        report.render_failures(),
        t.unscored,
        t.pending
    );
    for f in report.failed.iter().take(10) {
        println!("  {} {}  {}", red("✗"), f.trial_id, dim(&truncate(&f.error, 70)));
    }
    if report.failed.len() > 10 {
        println!("  {}", dim(&format!("… {} more in report.json", report.failed.len() - 10)));
    }
}

// ── Config mapping ───────────────────────────────────────────────────────────

fn apply_plan(
    mut builder: examshield::ExperimentConfigBuilder,
    plan: &PlanArgs,
) -> examshield::ExperimentConfigBuilder {
    if let Some(ref family) = plan.family {
        builder = builder.attacks(AttackSelection::Family(family.clone()));
    } else if !plan.attacks.is_empty() {
        builder = builder.attacks(AttackSelection::Presets(plan.attacks.clone()));
    }
    if let Some(level) = plan.level.and_then(|l| ContextLevel::try_from(l).ok()) {
        builder = builder.context_level(level);
    }
    if let Some(budget) = plan.budget {
        builder = builder.budget(budget);
    }
    if let Some(seed) = plan.seed {
        builder = builder.seed(seed);
    }
    if let Some(tie_break) = plan.tie_break {
        builder = builder.tie_break(tie_break);
    }
    builder
}

/// Map CLI args (over an optional config file) to `ExperimentConfig`.
async fn build_config(args: &RunArgs, progress: Option<ProgressCallback>) -> Result<ExperimentConfig> {
    let base = match &args.config {
        Some(path) => ExperimentConfig::from_json_file(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ExperimentConfig::default(),
    };
    let render = RenderSettings {
        engine: args.engine.clone().unwrap_or_else(|| base.render.engine.clone()),
        ..base.render.clone()
    };
    let retry = match args.max_retries {
        Some(n) => RetryPolicy {
            max_retries: n,
            ..base.retry
        },
        None => base.retry,
    };

    let mut builder = apply_plan(base.into_builder(), &args.plan).render(render).retry(retry);
    if let Some(ref t) = args.template {
        builder = builder.template(t);
    }
    if let Some(ref d) = args.run_dir {
        builder = builder.run_dir(d);
    }
    if !args.models.is_empty() {
        builder = builder.models(args.models.iter().cloned());
    }
    if !args.tasks.is_empty() {
        builder = builder.tasks(&args.tasks);
    }
    if !args.paths.is_empty() {
        builder = builder.reproduction(&args.paths);
    }
    if let Some(ref p) = args.photos {
        builder = builder.photos_dir(p);
    }
    if let Some(n) = args.trials {
        builder = builder.trials(n);
    }
    if let Some(n) = args.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(ref v) = args.scorer_version {
        builder = builder.scorer_version(v);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "examshield",
            "run",
            "--template",
            "exam.tex",
            "--attacks",
            "kerning,watermark",
            "--paths",
            "digital,photo",
            "--tasks",
            "solve",
            "--level",
            "3",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.plan.attacks, ["kerning", "watermark"]);
        assert_eq!(args.paths, [ReproductionPath::Digital, ReproductionPath::Physical]);
        assert_eq!(args.tasks, [Task::Solving]);
        assert_eq!(args.plan.level, Some(3));
    }

    #[test]
    fn level_out_of_range_is_rejected() {
        assert!(Cli::try_parse_from(["examshield", "generate", "exam.tex", "--level", "4"]).is_err());
    }

    #[test]
    fn plan_args_map_to_builder() {
        let plan = PlanArgs {
            family: Some("watermark".into()),
            level: Some(1),
            seed: Some(7),
            ..PlanArgs::default()
        };
        let c = apply_plan(ExperimentConfig::builder().template("exam.tex"), &plan)
            .build()
            .unwrap();
        assert_eq!(c.attacks, AttackSelection::Family("watermark".into()));
        assert_eq!(c.context_level, ContextLevel::FigureAware);
        assert_eq!(c.seed, 7);
    }

    #[test]
    fn long_messages_are_truncated() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 5).chars().count(), 5);
    }
}
