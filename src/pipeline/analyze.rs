//! Structural analysis: `SourceDocument` → `StructuralProfile`.
//!
//! The profile is the only view of a document the selector consults. It
//! carries one region per content block, in document order, with:
//!
//! - the block's kind and estimated bounding box,
//! - a density in `[0, 1]`: glyph mass per character cell of the region's
//!   band, which bounds how much visual noise the region can absorb,
//! - the ids of vertically adjacent regions on the same page, so overlays
//!   that bleed past their region can be charged to the neighbours too.
//!
//! Analysis is total and deterministic. Blocks that were segmented from
//! malformed markup are reported as [`AnalysisWarning`]s and classified as
//! text.

use crate::document::{BlockId, BlockKind, BoundingBox, Fragment, PageGeometry, RegionKind, SourceDocument};
use crate::error::AnalysisWarning;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// One analysed region. Region ids equal the ids of their blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: BlockId,
    pub kind: RegionKind,
    pub bbox: BoundingBox,
    pub density: f32,
    pub adjacent: Vec<BlockId>,
    pub warning: bool,
}

/// Broad subject of an exam, used for subject-aware parameter defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Calculus,
    Probability,
    LinearAlgebra,
    ComplexAnalysis,
    DiscreteMath,
    MachineLearning,
    #[default]
    General,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Subject::Calculus => "calculus",
            Subject::Probability => "probability",
            Subject::LinearAlgebra => "linear_algebra",
            Subject::ComplexAnalysis => "complex_analysis",
            Subject::DiscreteMath => "discrete_math",
            Subject::MachineLearning => "machine_learning",
            Subject::General => "general",
        })
    }
}

/// Derived, read-only view of a [`SourceDocument`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralProfile {
    pub document_id: String,
    pub geometry: PageGeometry,
    pub pages: u32,
    pub regions: Vec<Region>,
    pub document_class: Option<String>,
    pub packages: Vec<String>,
    /// Some math region uses fractions, big operators or multi-line layout.
    pub has_complex_math: bool,
    pub subject: Subject,
    pub warnings: Vec<AnalysisWarning>,
}

impl StructuralProfile {
    pub fn region(&self, id: BlockId) -> Option<&Region> {
        self.regions.get(id.index()).filter(|r| r.id == id)
    }

    pub fn regions_of(&self, kind: RegionKind) -> impl Iterator<Item = &Region> {
        self.regions.iter().filter(move |r| r.kind == kind)
    }

    pub fn has_figures(&self) -> bool {
        self.regions_of(RegionKind::Figure).next().is_some()
    }

    pub fn math_region_count(&self) -> usize {
        self.regions_of(RegionKind::Math).count()
    }

    pub fn uses_package(&self, name: &str) -> bool {
        self.packages.iter().any(|p| p == name)
    }
}

static RE_DOCUMENTCLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\documentclass(?:\[[^\]]*\])?\{([^}]*)\}").unwrap());
static RE_USEPACKAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\usepackage(?:\[[^\]]*\])?\{([^}]*)\}").unwrap());

const COMPLEX_MATH_MARKERS: &[&str] = &[r"\frac", r"\int", r"\sum", r"\prod", r"\lim", r"\\"];

/// Analyse a source document.
pub fn analyze(doc: &SourceDocument) -> StructuralProfile {
    let geometry = doc.geometry;
    let mut warnings = Vec::new();

    let mut regions: Vec<Region> = doc
        .blocks
        .iter()
        .map(|block| {
            if let Some(msg) = &block.warning {
                warn!("{}: {} ({})", doc.id, msg, block.id);
                warnings.push(AnalysisWarning {
                    region: block.id,
                    message: msg.clone(),
                });
            }
            Region {
                id: block.id,
                kind: block.kind.region_kind(),
                bbox: block.bbox,
                density: density(&block.kind, &block.source, &block.bbox, &geometry),
                adjacent: Vec::new(),
                warning: block.warning.is_some(),
            }
        })
        .collect();

    let line_h = geometry.line_height();
    let n = regions.len();
    for i in 0..n {
        let mut adjacent = Vec::new();
        for j in 0..n {
            if i == j {
                continue;
            }
            let (a, b) = (&regions[i], &regions[j]);
            let same_page = a.bbox.page == b.bbox.page;
            let gap = if a.bbox.bottom() <= b.bbox.top {
                b.bbox.top - a.bbox.bottom()
            } else {
                (a.bbox.top - b.bbox.bottom()).max(0.0)
            };
            if same_page && gap <= line_h {
                adjacent.push(b.id);
            }
        }
        regions[i].adjacent = adjacent;
    }

    let pages = regions.last().map(|r| last_page(&r.bbox, &geometry)).unwrap_or(1);

    let document_class = RE_DOCUMENTCLASS
        .captures(&doc.preamble)
        .map(|c| c[1].trim().to_string());
    let packages = RE_USEPACKAGE
        .captures_iter(&doc.preamble)
        .flat_map(|c| {
            c[1].split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
        })
        .collect();
    let has_complex_math = doc.blocks.iter().any(|b| match &b.kind {
        BlockKind::Math { env, .. } => {
            env.as_deref().is_some_and(|e| e != "equation" && e != "equation*")
                || COMPLEX_MATH_MARKERS.iter().any(|m| b.source.contains(m))
        }
        _ => false,
    });
    let subject = detect_subject(&doc.ground_truth.transcription);

    debug!(
        "Analysed {}: {} regions, {} page(s), subject {}",
        doc.id,
        regions.len(),
        pages,
        subject
    );

    StructuralProfile {
        document_id: doc.id.clone(),
        geometry,
        pages,
        regions,
        document_class,
        packages,
        has_complex_math,
        subject,
        warnings,
    }
}

fn last_page(bbox: &BoundingBox, geometry: &PageGeometry) -> u32 {
    let bottom = (bbox.bottom() - 0.01).max(bbox.top);
    (bottom / geometry.text_height()).floor() as u32 + 1
}

// ── Density ──────────────────────────────────────────────────────────────

/// Visual weight of the glyphs a fragment will render.
///
/// Control words count as one glyph, large operators as two (they stack
/// vertically), scripts add half a glyph. Braces, whitespace and script
/// markers themselves are invisible.
pub fn glyph_mass(source: &str) -> f32 {
    let bytes = source.as_bytes();
    let mut mass = 0.0f32;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'%' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c == b'\\' {
            let start = i + 1;
            let mut j = start;
            while j < bytes.len() && bytes[j].is_ascii_alphabetic() {
                j += 1;
            }
            if j == start {
                // Escaped symbol or row break.
                mass += if bytes.get(start) == Some(&b'\\') { 0.0 } else { 1.0 };
                i = start + 1;
                continue;
            }
            let word = &source[start..j];
            mass += match word {
                "frac" | "dfrac" | "sum" | "int" | "prod" | "oint" | "binom" | "sqrt" => 2.0,
                "begin" | "end" | "label" | "left" | "right" | "quad" | "qquad" | "limits" => 0.0,
                _ => 1.0,
            };
            if word == "begin" || word == "end" || word == "label" {
                if let Some(end) = crate::document::balanced_group_end(source, j) {
                    i = end;
                    continue;
                }
            }
            i = j;
            continue;
        }
        mass += match c {
            b'{' | b'}' | b'$' | b'&' => 0.0,
            b'^' | b'_' => 0.5,
            c if c.is_ascii_whitespace() => 0.0,
            // Count each UTF-8 scalar once.
            c if (c & 0xC0) == 0x80 => 0.0,
            _ => 1.0,
        };
        i += 1;
    }
    mass
}

fn density(kind: &BlockKind, source: &str, bbox: &BoundingBox, geometry: &PageGeometry) -> f32 {
    let cells = (bbox.width / geometry.char_width()) * (bbox.height / geometry.line_height());
    if cells <= 0.0 {
        return 0.0;
    }
    let mass = match kind {
        BlockKind::Figure => {
            // Images are opaque; they are as dense as a region can be.
            return 1.0;
        }
        BlockKind::Math { .. } => match Fragment::split_source(kind, source) {
            Some(f) => glyph_mass(&f.inner),
            None => glyph_mass(source),
        },
        BlockKind::Text => glyph_mass(&crate::document::plain_text(source)),
    };
    (mass / cells).clamp(0.0, 1.0)
}

// ── Subject detection ────────────────────────────────────────────────────

/// Hint patterns per subject, over lowercased text. Word hints are anchored
/// on word boundaries; command hints must not run into a longer command name.
static SUBJECT_HINTS: Lazy<Vec<(Subject, Regex)>> = Lazy::new(|| {
    [
        (
            Subject::Calculus,
            r"\b(?:calculus|derivatives?|integrals?|integrat\w*|limits?|differentia\w*|tangent)\b|\\(?:int|lim|partial)(?:[^a-z]|$)|\\frac\{d\w?\}\{d|\bf'\(",
        ),
        (
            Subject::Probability,
            r"\b(?:probabilit\w*|random\s+variables?|expected\s+value|expectation|variance|distributions?|bayes)\b|\\mathbb\{e\}|\bp\(x",
        ),
        (
            Subject::LinearAlgebra,
            r"\b(?:linear\s+algebra|matrix|matrices|vectors?|eigen\w*|determinants?|linear\s+maps?|rank)\b|\\(?:vec|det)(?:[^a-z]|$)|\\begin\{[pbv]?matrix\}",
        ),
        (
            Subject::ComplexAnalysis,
            r"\b(?:complex\s+(?:analysis|variables?|plane|numbers?)|analytic|holomorphic|residues?|contour)\b|\bf\(z\)",
        ),
        (
            Subject::DiscreteMath,
            r"\b(?:discrete|graphs?|vertex|vertices|edges?|combinatori\w*|permutations?|induction)\b|\bg\(v,\s*e\)",
        ),
        (
            Subject::MachineLearning,
            r"\b(?:machine\s+learning|gradient\s+descent|loss\s+functions?|neural|training|regression|classifiers?)\b|\\nabla(?:[^a-z]|$)",
        ),
    ]
    .into_iter()
    .map(|(subject, pattern)| (subject, Regex::new(pattern).unwrap()))
    .collect()
});

/// Pick the subject whose hints occur most often in `text`. Ties keep the
/// earlier subject, so calculus wins over everything else; no hits at all
/// means [`Subject::General`].
///
/// `text` should be rendered content, not LaTeX source: package and file
/// names in the preamble would otherwise count.
pub fn detect_subject(text: &str) -> Subject {
    let lower = text.to_lowercase();
    let mut best = (Subject::General, 0usize);
    for (subject, hints) in SUBJECT_HINTS.iter() {
        let hits = hints.find_iter(&lower).count();
        if hits > best.1 {
            best = (*subject, hits);
        }
    }
    best.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAM: &str = r"\documentclass[11pt]{article}
\usepackage{amsmath,graphicx}
\begin{document}
\section{Problem}
Compute the derivative of $g(x) = \sin(x^2)$ using the chain rule.
Explain each step of the limit definition.

\begin{align}
g'(x) &= \cos(x^2) \cdot 2x \\
      &= 2x\cos(x^2)
\end{align}

\begin{figure}[h]
\includegraphics[width=0.5\textwidth]{graph.png}
\end{figure}
\end{document}
";

    fn profile() -> StructuralProfile {
        analyze(&SourceDocument::parse("exam", EXAM).unwrap())
    }

    #[test]
    fn one_region_per_block_in_order() {
        let doc = SourceDocument::parse("exam", EXAM).unwrap();
        let p = analyze(&doc);
        assert_eq!(p.regions.len(), doc.blocks.len());
        for (r, b) in p.regions.iter().zip(&doc.blocks) {
            assert_eq!(r.id, b.id);
            assert_eq!(r.kind, b.kind.region_kind());
        }
    }

    #[test]
    fn regions_do_not_overlap() {
        let p = profile();
        for a in &p.regions {
            for b in &p.regions {
                if a.id != b.id {
                    assert!(!a.bbox.overlaps(&b.bbox), "{} overlaps {}", a.id, b.id);
                }
            }
        }
    }

    #[test]
    fn densities_are_normalised() {
        let p = profile();
        for r in &p.regions {
            assert!((0.0..=1.0).contains(&r.density), "{}: {}", r.id, r.density);
        }
        let fig = p.regions_of(RegionKind::Figure).next().unwrap();
        assert_eq!(fig.density, 1.0);
    }

    #[test]
    fn consecutive_regions_are_adjacent() {
        let p = profile();
        let first = &p.regions[0];
        assert!(first.adjacent.contains(&p.regions[1].id));
        assert!(!first.adjacent.contains(&first.id));
    }

    #[test]
    fn document_facts() {
        let p = profile();
        assert_eq!(p.document_class.as_deref(), Some("article"));
        assert!(p.uses_package("graphicx"));
        assert!(p.has_figures());
        assert!(p.has_complex_math);
        assert_eq!(p.subject, Subject::Calculus);
        assert!(p.warnings.is_empty());
    }

    #[test]
    fn analysis_is_deterministic() {
        assert_eq!(profile(), profile());
    }

    #[test]
    fn malformed_block_reported_as_warning() {
        let doc = SourceDocument::parse("bad", "\\begin{document}\nPay $3 now\n\\end{document}").unwrap();
        let p = analyze(&doc);
        assert_eq!(p.warnings.len(), 1);
        assert_eq!(p.regions[0].kind, RegionKind::Text);
        assert!(p.regions[0].warning);
    }

    #[test]
    fn glyph_mass_weights() {
        assert_eq!(glyph_mass("x"), 1.0);
        assert_eq!(glyph_mass("x^2"), 2.5);
        assert_eq!(glyph_mass(r"\frac{a}{b}"), 4.0);
        assert_eq!(glyph_mass(r"a \\ b"), 2.0);
    }

    #[test]
    fn subject_detection() {
        assert_eq!(detect_subject("Let A be a matrix; find its eigenvalues"), Subject::LinearAlgebra);
        assert_eq!(detect_subject("Count the vertices of graph G(V,E)"), Subject::DiscreteMath);
        assert_eq!(detect_subject("Hello world"), Subject::General);
    }

    #[test]
    fn subject_hints_need_word_boundaries() {
        assert_eq!(detect_subject(r"\includegraphics{plot.png} in two paragraphs"), Subject::General);
        assert_eq!(detect_subject(r"$\intercal$ and $\limsup$"), Subject::General);
        assert_eq!(detect_subject(r"Evaluate $\int_0^1 x\,dx$"), Subject::Calculus);
    }

    #[test]
    fn figure_markup_does_not_decide_the_subject() {
        let src = r"\documentclass{article}
\usepackage{graphicx}
\begin{document}
Find the derivative of $x^2$.

\begin{figure}[h]
\includegraphics{plot.png}
\end{figure}
\end{document}
";
        let p = analyze(&SourceDocument::parse("fig", src).unwrap());
        assert!(p.has_figures());
        assert_eq!(p.subject, Subject::Calculus);
    }

    #[test]
    fn calculus_wins_a_tie() {
        assert_eq!(detect_subject("the derivative along each edge"), Subject::Calculus);
    }
}
