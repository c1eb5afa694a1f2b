//! Properties of analysis, selection and composition on a realistic exam.
//!
//! These run entirely in-process: no LaTeX engine, no pdfium, no API keys.

use examshield::attack::{ApplicationScope, AuditEntry, BASELINE_NAME};
use examshield::catalog::{preset, preset_names};
use examshield::document::RegionKind;
use examshield::pipeline::analyze::Subject;
use examshield::{
    analyze, compose, select, CombinationSpec, ContextLevel, IntensityLevel, OperatorKind, Scorer,
    SelectOptions, SourceDocument, Task,
};
use std::path::PathBuf;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/calculus_exam.tex")
}

fn source_text() -> String {
    std::fs::read_to_string(fixture()).expect("fixture present")
}

fn doc() -> SourceDocument {
    SourceDocument::parse("calculus_exam", &source_text()).expect("fixture parses")
}

const LEVELS: [ContextLevel; 4] = [
    ContextLevel::Uniform,
    ContextLevel::FigureAware,
    ContextLevel::MathFocused,
    ContextLevel::DensityAware,
];

fn opts(level: ContextLevel, seed: u64) -> SelectOptions {
    SelectOptions {
        context_level: level,
        seed,
        ..SelectOptions::default()
    }
}

// ── Analysis ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn load_uses_file_stem_and_round_trips() {
    let d = SourceDocument::load(fixture()).await.unwrap();
    assert_eq!(d.id, "calculus_exam");
    assert_eq!(d.to_latex(), source_text());
    assert_eq!(d.ground_truth.answers, ["x = 1", "12"]);
    assert!(d.ground_truth.keywords.iter().any(|k| k == "critical point"));
}

#[test]
fn regions_partition_the_body() {
    let d = doc();
    let profile = analyze(&d);
    assert_eq!(profile.regions.len(), d.blocks.len());
    for (region, block) in profile.regions.iter().zip(&d.blocks) {
        assert_eq!(region.id, block.id);
        assert_eq!(region.kind, block.kind.region_kind());
        assert!((0.0..=1.0).contains(&region.density));
    }
    for (i, a) in profile.regions.iter().enumerate() {
        for b in &profile.regions[i + 1..] {
            assert!(!a.bbox.overlaps(&b.bbox), "{} overlaps {}", a.id, b.id);
        }
    }
    let body: String = d.blocks.iter().map(|b| b.source.as_str()).collect();
    assert_eq!(body, d.body());
}

#[test]
fn fixture_has_every_region_kind() {
    let profile = analyze(&doc());
    assert!(profile.has_figures());
    assert!(profile.math_region_count() >= 3);
    assert!(profile.regions_of(RegionKind::Text).count() >= 3);
    assert!(profile.warnings.is_empty());
}

#[test]
fn figure_and_preamble_do_not_change_the_subject() {
    // graphicx, \includegraphics and a "Graph of ..." caption all point at
    // discrete maths if read as raw source.
    assert_eq!(analyze(&doc()).subject, Subject::Calculus);
}

// ── Scoring against the fixture's answers ────────────────────────────────────

#[test]
fn near_miss_solutions_score_zero_against_fixture_answers() {
    let truth = doc().ground_truth;
    let scorer = Scorer::new("heuristic-1");
    let right = "The critical points are at $x = 1$ and $x = 3$; the integral equals 12.";
    assert_eq!(scorer.score(Task::Solving, right, &truth).correctness(), Some(1.0));
    let near = "The minimum is at x = 15 and the integral equals 120.";
    assert_eq!(scorer.score(Task::Solving, near, &truth).correctness(), Some(0.0));
    let fluent = "Using the derivative and the second derivative test, the only critical point \
                  that matters is x = 3, and the integral evaluates to 10."
        .repeat(2);
    assert_eq!(scorer.score(Task::Solving, &fluent, &truth).correctness(), Some(0.0));
}

// ── Composition ──────────────────────────────────────────────────────────────

#[test]
fn ground_truth_is_identical_for_every_preset_and_level() {
    let d = doc();
    let profile = analyze(&d);
    for name in preset_names() {
        let template = preset(&name).unwrap();
        for level in LEVELS {
            let spec = select(&profile, &template, &opts(level, 5));
            let v = compose(&d, &spec);
            assert_eq!(v.ground_truth, d.ground_truth, "{name} at {level}");
            assert_eq!(v.combination, name);
        }
    }
}

#[test]
fn same_seed_same_bytes() {
    let d = doc();
    let profile = analyze(&d);
    for name in ["extreme_protection", "visual_noise", "texture", "symbol_confusion"] {
        let template = preset(name).unwrap();
        let a = compose(&d, &select(&profile, &template, &opts(ContextLevel::DensityAware, 99)));
        let b = compose(&d, &select(&profile, &template, &opts(ContextLevel::DensityAware, 99)));
        assert_eq!(a.latex, b.latex, "{name}");
        assert_eq!(a.content_hash, b.content_hash, "{name}");
    }
}

#[test]
fn empty_spec_reproduces_the_source() {
    let d = doc();
    let v = compose(&d, &CombinationSpec::empty(BASELINE_NAME, 1));
    assert_eq!(v.latex, source_text());
    assert!(v.is_baseline());

    let baseline = select(&analyze(&d), &preset(BASELINE_NAME).unwrap(), &SelectOptions::default());
    assert!(baseline.is_empty());
    assert_eq!(compose(&d, &baseline).latex, source_text());
}

#[test]
fn attacked_variants_differ_and_clear_the_trap_marker() {
    let d = doc();
    let spec = select(&analyze(&d), &preset("strong_protection").unwrap(), &SelectOptions::default());
    let v = compose(&d, &spec);
    assert!(!v.is_baseline());
    assert_ne!(v.latex, source_text());
    assert!(!v.latex.contains("%%TRAP_QUESTION_AREA%%"));
    assert!(v.latex.contains(r"\begin{document}"));
}

// ── Selection ────────────────────────────────────────────────────────────────

#[test]
fn figure_aware_watermark_excludes_the_figure() {
    let d = doc();
    let profile = analyze(&d);
    let figure = profile.regions_of(RegionKind::Figure).next().unwrap().id;
    let spec = select(&profile, &preset("watermark_tiled").unwrap(), &opts(ContextLevel::FigureAware, 1));
    assert!(spec
        .audit
        .iter()
        .any(|e| matches!(e, AuditEntry::Excluded { region, .. } if *region == figure)));
    assert_eq!(spec.applications.len(), 1);
    match &spec.applications[0].scope {
        ApplicationScope::Document { excluded } => assert!(excluded.contains(&figure)),
        other => panic!("unexpected scope {other:?}"),
    }

    let uniform = select(&profile, &preset("watermark_tiled").unwrap(), &opts(ContextLevel::Uniform, 1));
    match &uniform.applications[0].scope {
        ApplicationScope::Document { excluded } => assert!(excluded.is_empty()),
        other => panic!("unexpected scope {other:?}"),
    }
}

#[test]
fn content_operators_stay_in_math_from_level_two() {
    let d = doc();
    let profile = analyze(&d);
    let spec = select(&profile, &preset("kerning").unwrap(), &opts(ContextLevel::MathFocused, 1));
    let ApplicationScope::Regions { targets } = &spec.applications[0].scope else {
        panic!("kerning is region-scoped");
    };
    for t in targets {
        assert_eq!(profile.region(t.region).unwrap().kind, RegionKind::Math);
    }
}

#[test]
fn tight_budget_drops_are_audited() {
    let d = doc();
    let profile = analyze(&d);
    let tight = SelectOptions {
        budget: 0.05,
        ..opts(ContextLevel::MathFocused, 1)
    };
    let spec = select(&profile, &preset("extreme_protection").unwrap(), &tight);
    assert!(spec.dropped().count() > 0);
    for entry in spec.dropped() {
        let AuditEntry::Dropped { cost, budget, .. } = entry else {
            unreachable!()
        };
        assert!(*cost > 0.0);
        assert_eq!(*budget, 0.05);
    }
}

#[test]
fn legibility_cost_never_falls_with_intensity() {
    for op in OperatorKind::ALL {
        for density in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let costs: Vec<f32> = IntensityLevel::ALL
                .iter()
                .map(|i| op.legibility_cost(*i, density))
                .collect();
            assert!(costs.windows(2).all(|w| w[0] <= w[1]), "{op} at {density}: {costs:?}");
        }
    }
}
