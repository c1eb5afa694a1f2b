//! Composition: apply a `CombinationSpec` to a `SourceDocument`.
//!
//! Applications run in spec order, each seeing the region sources left by
//! the previous ones. A failed application is skipped and recorded; it
//! never aborts the variant. A spec with nothing applied yields the source
//! text unchanged, which is the experiment's control.

use crate::attack::{ApplicationScope, CombinationSpec, IntensityLevel, PlannedApplication};
use crate::catalog::{DocumentInput, OperatorKind, OperatorOutput, Patch, RegionInput, ShieldedRegion};
use crate::document::{BlockId, BlockKind, GroundTruth, SourceDocument};
use crate::error::OperatorError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Marker line after which preamble additions are inserted.
pub const WATERMARK_MARKER: &str = "%%WATERMARK_AREA%%";
/// Marker line removed from every attacked variant.
pub const TRAP_MARKER: &str = "%%TRAP_QUESTION_AREA%%";

/// One successful operator application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOperator {
    pub attack: String,
    pub operator: OperatorKind,
    /// `None` for document-level applications.
    pub region: Option<BlockId>,
    pub intensity: IntensityLevel,
    pub description: String,
}

/// Lines a region occupies in the variant's LaTeX (1-based, inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpan {
    pub region: BlockId,
    pub first_line: usize,
    pub last_line: usize,
}

/// A composed variant: self-contained LaTeX plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDocument {
    /// `<source id>__<combination name>`.
    pub id: String,
    pub source_id: String,
    pub combination: String,
    pub seed: u64,
    pub latex: String,
    /// Cloned from the source; attacks never change it.
    pub ground_truth: GroundTruth,
    pub applied: Vec<AppliedOperator>,
    pub failures: Vec<OperatorError>,
    pub spans: Vec<RegionSpan>,
    /// SHA-256 of `latex`, hex.
    pub content_hash: String,
}

impl VariantDocument {
    /// Nothing was applied: the variant is the unmodified source.
    pub fn is_baseline(&self) -> bool {
        self.applied.is_empty()
    }

    /// Region whose source covers `line`, if any.
    pub fn region_at_line(&self, line: usize) -> Option<BlockId> {
        self.spans
            .iter()
            .find(|s| s.first_line <= line && line <= s.last_line)
            .map(|s| s.region)
    }
}

/// SHA-256 of `bytes` as lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// ── Composition ──────────────────────────────────────────────────────────

struct Workspace<'d> {
    doc: &'d SourceDocument,
    sources: Vec<String>,
    preamble: Vec<String>,
    applied: Vec<AppliedOperator>,
    failures: Vec<OperatorError>,
}

impl<'d> Workspace<'d> {
    fn unknown_region(&mut self, app: &PlannedApplication, region: BlockId) {
        warn!("{}: {} targets unknown region {}", self.doc.id, app.operator, region);
        self.failures.push(OperatorError::UnknownRegion {
            operator: app.operator.name().to_string(),
            region,
        });
    }

    fn record(&mut self, app: &PlannedApplication, region: Option<BlockId>, intensity: IntensityLevel, result: Result<OperatorOutput, OperatorError>) {
        match result {
            Ok(out) => {
                for patch in out.patches {
                    match patch {
                        Patch::Preamble { latex } => {
                            if !self.preamble.contains(&latex) {
                                self.preamble.push(latex);
                            }
                        }
                        Patch::Region { region, source } => match self.sources.get_mut(region.index()) {
                            Some(slot) => *slot = source,
                            None => self.failures.push(OperatorError::UnknownRegion {
                                operator: app.operator.name().to_string(),
                                region,
                            }),
                        },
                    }
                }
                debug!("{}: applied {} ({})", self.doc.id, app.operator, out.description);
                self.applied.push(AppliedOperator {
                    attack: app.attack.clone(),
                    operator: app.operator,
                    region,
                    intensity,
                    description: out.description,
                });
            }
            Err(e @ OperatorError::NotApplicable { .. }) => {
                debug!("{}: skipped {}: {}", self.doc.id, app.operator, e);
                self.failures.push(e);
            }
            Err(e) => {
                warn!("{}: skipped {}: {}", self.doc.id, app.operator, e);
                self.failures.push(e);
            }
        }
    }

    fn apply(&mut self, app: &PlannedApplication) {
        match &app.scope {
            ApplicationScope::Regions { targets } => {
                for target in targets {
                    let Some(block) = self.doc.block(target.region) else {
                        self.unknown_region(app, target.region);
                        continue;
                    };
                    let result = app.operator.apply_region(&RegionInput {
                        region: target.region,
                        kind: &block.kind,
                        source: &self.sources[target.region.index()],
                        intensity: target.intensity,
                        params: &app.params,
                        seed: target.seed,
                    });
                    self.record(app, Some(target.region), target.intensity, result);
                }
            }
            ApplicationScope::Document { excluded } => {
                let mut missing = Vec::new();
                let result = {
                    let mut shielded = Vec::with_capacity(excluded.len());
                    for id in excluded {
                        match self.doc.block(*id) {
                            Some(block) => shielded.push(ShieldedRegion {
                                region: *id,
                                kind: &block.kind,
                                source: &self.sources[id.index()],
                            }),
                            None => missing.push(*id),
                        }
                    }
                    let floats = self
                        .doc
                        .blocks
                        .iter()
                        .filter(|b| b.kind == BlockKind::Figure && b.source.contains(r"\begin{figure"))
                        .map(|b| b.id)
                        .collect();
                    app.operator.apply_document(&DocumentInput {
                        geometry: &self.doc.geometry,
                        intensity: app.intensity,
                        params: &app.params,
                        seed: app.seed,
                        excluded: shielded,
                        floats,
                    })
                };
                for id in missing {
                    self.unknown_region(app, id);
                }
                self.record(app, None, app.intensity, result);
            }
        }
    }
}

/// Apply `spec` to `doc`.
pub fn compose(doc: &SourceDocument, spec: &CombinationSpec) -> VariantDocument {
    let mut ws = Workspace {
        doc,
        sources: doc.blocks.iter().map(|b| b.source.clone()).collect(),
        preamble: Vec::new(),
        applied: Vec::new(),
        failures: Vec::new(),
    };
    for app in &spec.applications {
        ws.apply(app);
    }

    let preamble = if ws.applied.is_empty() {
        doc.preamble.clone()
    } else {
        insert_preamble(&doc.preamble, &ws.preamble)
    };

    let mut latex = String::with_capacity(preamble.len() + doc.postamble.len() + 8192);
    latex.push_str(&preamble);
    let mut spans = Vec::with_capacity(ws.sources.len());
    let mut line = 1 + preamble.matches('\n').count();
    for (block, source) in doc.blocks.iter().zip(&ws.sources) {
        let visible = source.trim_end();
        spans.push(RegionSpan {
            region: block.id,
            first_line: line,
            last_line: line + visible.matches('\n').count(),
        });
        line += source.matches('\n').count();
        latex.push_str(source);
    }
    latex.push_str(&doc.postamble);

    if !ws.failures.is_empty() {
        debug!(
            "{} / {}: {} applied, {} skipped",
            doc.id,
            spec.name,
            ws.applied.len(),
            ws.failures.len()
        );
    }

    VariantDocument {
        id: format!("{}__{}", doc.id, spec.name),
        source_id: doc.id.clone(),
        combination: spec.name.clone(),
        seed: spec.seed,
        content_hash: content_hash(latex.as_bytes()),
        latex,
        ground_truth: doc.ground_truth.clone(),
        applied: ws.applied,
        failures: ws.failures,
        spans,
    }
}

/// Insert preamble additions after the watermark marker, or just before
/// `\begin{document}` when the template has none. The trap marker line is
/// dropped.
fn insert_preamble(preamble: &str, additions: &[String]) -> String {
    let block = additions.join("\n");
    let mut out = if let Some(at) = preamble.find(WATERMARK_MARKER) {
        let after = at + WATERMARK_MARKER.len();
        format!("{}\n{}{}", &preamble[..after], block, &preamble[after..])
    } else if let Some(at) = preamble.rfind(r"\begin{document}") {
        format!("{}{}\n{}", &preamble[..at], block, &preamble[at..])
    } else {
        format!("{block}\n{preamble}")
    };
    if let Some(at) = out.find(TRAP_MARKER) {
        let mut end = at + TRAP_MARKER.len();
        if out[end..].starts_with('\n') {
            end += 1;
        }
        out.replace_range(at..end, "");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::{AttackSpec, CombinationTemplate, ContextLevel, OperatorParams};
    use crate::pipeline::analyze::analyze;
    use crate::pipeline::select::{select, SelectOptions};

    const EXAM: &str = r"\documentclass{article}
\usepackage{amsmath,graphicx}
%%WATERMARK_AREA%%
%%TRAP_QUESTION_AREA%%
\begin{document}
Let $x + y = 3$ and solve.

\begin{equation}
a^2 + b^2 = c^2
\end{equation}

\includegraphics[width=2in]{tri.png}
\end{document}
";

    fn doc() -> SourceDocument {
        SourceDocument::parse("exam", EXAM).unwrap()
    }

    fn variant(attacks: Vec<AttackSpec>, level: ContextLevel, seed: u64) -> VariantDocument {
        let d = doc();
        let opts = SelectOptions {
            context_level: level,
            seed,
            ..SelectOptions::default()
        };
        let spec = select(&analyze(&d), &CombinationTemplate::new("v", attacks), &opts);
        compose(&d, &spec)
    }

    #[test]
    fn empty_spec_is_the_source() {
        let d = doc();
        let v = compose(&d, &CombinationSpec::empty("baseline_clean", 0));
        assert_eq!(v.latex, EXAM);
        assert!(v.is_baseline());
        assert_eq!(v.ground_truth, d.ground_truth);
    }

    #[test]
    fn ground_truth_survives_attacks() {
        let v = variant(
            vec![
                AttackSpec::new("confuse", OperatorKind::SymbolConfusion, IntensityLevel::Extreme),
                AttackSpec::new("tiled", OperatorKind::WatermarkTiled, IntensityLevel::Strong),
            ],
            ContextLevel::FigureAware,
            3,
        );
        assert_eq!(v.ground_truth, doc().ground_truth);
        assert!(!v.is_baseline());
        assert_ne!(v.latex, EXAM);
    }

    #[test]
    fn composition_is_deterministic() {
        let attacks = || {
            vec![
                AttackSpec::new("noise", OperatorKind::VisualNoise, IntensityLevel::Medium),
                AttackSpec::new("texture", OperatorKind::Texture, IntensityLevel::Medium),
            ]
        };
        let a = variant(attacks(), ContextLevel::MathFocused, 9);
        let b = variant(attacks(), ContextLevel::MathFocused, 9);
        assert_eq!(a, b);
        assert_eq!(a.content_hash, content_hash(a.latex.as_bytes()));
    }

    #[test]
    fn preamble_goes_after_marker_and_trap_is_cleared() {
        let v = variant(
            vec![AttackSpec::new("wm", OperatorKind::Watermark, IntensityLevel::Light)],
            ContextLevel::FigureAware,
            1,
        );
        let marker = v.latex.find(WATERMARK_MARKER).unwrap();
        let added = v.latex.find(r"\AddToShipoutPictureBG").unwrap();
        let body = v.latex.find(r"\begin{document}").unwrap();
        assert!(marker < added && added < body);
        assert!(!v.latex.contains(TRAP_MARKER));
        assert!(v.latex.contains(r"\esshield{\includegraphics"));
    }

    #[test]
    fn later_operators_see_earlier_output() {
        let v = variant(
            vec![
                AttackSpec::new("stretch", OperatorKind::SymbolStretch, IntensityLevel::Light),
                AttackSpec::new("confuse", OperatorKind::SymbolConfusion, IntensityLevel::Strong),
            ],
            ContextLevel::MathFocused,
            1,
        );
        // `=` was already stretched, so confusion finds no `=` left to swap.
        assert!(v.latex.contains(r"\scalebox{1.150}[1]{$=$}"));
        assert!(!v.latex.contains(r"\mathrel{\text{=}}"));
    }

    #[test]
    fn failed_application_is_recorded_not_fatal() {
        let d = SourceDocument::parse("bad", "\\begin{document}\n$\\frac{a}{b$ and $x=1$\n\\end{document}\n").unwrap();
        let spec = select(
            &analyze(&d),
            &CombinationTemplate::new(
                "k",
                vec![AttackSpec::new("kern", OperatorKind::Kerning, IntensityLevel::Light)
                    .params(OperatorParams::default())],
            ),
            &SelectOptions::default(),
        );
        let v = compose(&d, &spec);
        assert!(v.failures.iter().any(|f| matches!(f, OperatorError::MalformedFragment { .. })));
        assert_eq!(v.applied.len(), 1);
    }

    #[test]
    fn spans_map_lines_to_regions() {
        let v = variant(Vec::new(), ContextLevel::Uniform, 0);
        let eq_line = v.latex.lines().position(|l| l == "a^2 + b^2 = c^2").unwrap() + 1;
        let region = v.region_at_line(eq_line).unwrap();
        assert_eq!(doc().block(region).unwrap().kind.region_kind(), crate::document::RegionKind::Math);
    }
}
