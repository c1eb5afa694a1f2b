//! The operator catalog: a closed set of perturbation operators.
//!
//! Every operator is a variant of [`OperatorKind`] and declares its
//! capabilities up front:
//!
//! | Capability | Method |
//! |------------|--------|
//! | class (presentation / content-adjacent) | [`OperatorKind::class`] |
//! | region kinds it may touch | [`OperatorKind::applicable_kinds`] |
//! | intensity → parameter mapping | [`OperatorKind::strength`] |
//! | legibility cost | [`OperatorKind::legibility_cost`] |
//! | admission priority | [`OperatorKind::priority`] |
//!
//! Applications are pure: the same input and seed always produce the same
//! patches. Presentation operators act on the whole page and return
//! preamble additions (plus rewrites of shielded regions); content-adjacent
//! operators rewrite one region's fragment.

pub mod content;
pub mod mathtok;
pub mod presentation;
pub mod presets;

use crate::attack::{IntensityLevel, OperatorParams};
use crate::document::{braces_balanced, BlockId, BlockKind, Fragment, PageGeometry, RegionKind};
use crate::error::OperatorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use presets::{preset, preset_names, template_in_family, FAMILIES};

/// Broad class of an operator, deciding its granularity and priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorClass {
    /// Page-level: watermarks, textures, colour, spacing, layout.
    Presentation,
    /// Glyph-level: kerning, fonts, symbols, invisible characters, noise.
    ContentAdjacent,
}

/// Every operator the engine knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    // ── Content-adjacent ──────────────────────────────────────────────────
    Kerning,
    SymbolConfusion,
    FontSwap,
    MathFontMixing,
    SymbolSubstitution,
    SymbolStretch,
    InvisibleCharacters,
    VisualNoise,
    // ── Presentation ──────────────────────────────────────────────────────
    WatermarkTiled,
    Watermark,
    Texture,
    BackgroundColor,
    LineSpacing,
    PageStructure,
}

const ALL_KINDS: &[RegionKind] = &[RegionKind::Text, RegionKind::Math, RegionKind::Figure];
const TEXT_AND_MATH: &[RegionKind] = &[RegionKind::Text, RegionKind::Math];
const MATH_ONLY: &[RegionKind] = &[RegionKind::Math];

impl OperatorKind {
    /// All operators, in admission priority order.
    pub const ALL: [OperatorKind; 14] = [
        OperatorKind::Kerning,
        OperatorKind::SymbolConfusion,
        OperatorKind::FontSwap,
        OperatorKind::MathFontMixing,
        OperatorKind::SymbolSubstitution,
        OperatorKind::SymbolStretch,
        OperatorKind::InvisibleCharacters,
        OperatorKind::VisualNoise,
        OperatorKind::WatermarkTiled,
        OperatorKind::Watermark,
        OperatorKind::Texture,
        OperatorKind::BackgroundColor,
        OperatorKind::LineSpacing,
        OperatorKind::PageStructure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OperatorKind::Kerning => "kerning",
            OperatorKind::SymbolConfusion => "symbol_confusion",
            OperatorKind::FontSwap => "font_swap",
            OperatorKind::MathFontMixing => "math_font_mixing",
            OperatorKind::SymbolSubstitution => "symbol_substitution",
            OperatorKind::SymbolStretch => "symbol_stretch",
            OperatorKind::InvisibleCharacters => "invisible_characters",
            OperatorKind::VisualNoise => "visual_noise",
            OperatorKind::WatermarkTiled => "watermark_tiled",
            OperatorKind::Watermark => "watermark",
            OperatorKind::Texture => "texture",
            OperatorKind::BackgroundColor => "background_color",
            OperatorKind::LineSpacing => "line_spacing",
            OperatorKind::PageStructure => "page_structure",
        }
    }

    pub fn class(self) -> OperatorClass {
        match self {
            OperatorKind::Kerning
            | OperatorKind::SymbolConfusion
            | OperatorKind::FontSwap
            | OperatorKind::MathFontMixing
            | OperatorKind::SymbolSubstitution
            | OperatorKind::SymbolStretch
            | OperatorKind::InvisibleCharacters
            | OperatorKind::VisualNoise => OperatorClass::ContentAdjacent,
            _ => OperatorClass::Presentation,
        }
    }

    pub fn is_presentation(self) -> bool {
        self.class() == OperatorClass::Presentation
    }

    /// Region kinds the operator can act on.
    ///
    /// Presentation operators cover every kind; which regions they are
    /// kept away from is the selector's decision, not a capability.
    pub fn applicable_kinds(self) -> &'static [RegionKind] {
        match self {
            OperatorKind::Kerning
            | OperatorKind::FontSwap
            | OperatorKind::InvisibleCharacters
            | OperatorKind::VisualNoise => TEXT_AND_MATH,
            OperatorKind::SymbolConfusion
            | OperatorKind::MathFontMixing
            | OperatorKind::SymbolSubstitution
            | OperatorKind::SymbolStretch => MATH_ONLY,
            _ => ALL_KINDS,
        }
    }

    /// Admission priority: lower goes first. Content-adjacent operators
    /// always precede presentation operators.
    pub fn priority(self) -> usize {
        Self::ALL.iter().position(|k| *k == self).unwrap_or(usize::MAX)
    }

    /// Cost of the operator at `Medium` on a region of nominal density.
    pub fn base_cost(self) -> f32 {
        match self {
            OperatorKind::Kerning => 0.30,
            OperatorKind::SymbolConfusion => 0.35,
            OperatorKind::FontSwap => 0.20,
            OperatorKind::MathFontMixing => 0.30,
            OperatorKind::SymbolSubstitution => 0.15,
            OperatorKind::SymbolStretch => 0.25,
            OperatorKind::InvisibleCharacters => 0.05,
            OperatorKind::VisualNoise => 0.40,
            OperatorKind::WatermarkTiled => 0.25,
            OperatorKind::Watermark => 0.15,
            OperatorKind::Texture => 0.20,
            OperatorKind::BackgroundColor => 0.10,
            OperatorKind::LineSpacing => 0.10,
            OperatorKind::PageStructure => 0.15,
        }
    }

    /// Estimated loss of human legibility when applied to a region.
    ///
    /// `base × {0.5, 1, 1.5, 2}[intensity] × (0.5 + density)`: dense regions
    /// lose more legibility for the same perturbation. Non-decreasing in
    /// intensity for any fixed density.
    pub fn legibility_cost(self, intensity: IntensityLevel, density: f32) -> f32 {
        let level = 2.0 * intensity.scale();
        self.base_cost() * level * (0.5 + density.clamp(0.0, 1.0))
    }

    /// Fraction of a region's cost that bleeds into each adjacent region.
    pub fn spill(self) -> f32 {
        match self {
            OperatorKind::VisualNoise => 0.25,
            _ => 0.0,
        }
    }

    /// The operator's primary parameter at `intensity`.
    ///
    /// Strictly increasing in intensity for every operator.
    pub fn strength(self, intensity: IntensityLevel) -> f32 {
        let s = intensity.scale();
        match self {
            // em of negative kern between atoms
            OperatorKind::Kerning => content::kern_em(intensity),
            // number of symbol mappings enabled
            OperatorKind::SymbolConfusion => content::confusion_mapping_count(intensity) as f32,
            // fraction of occurrences swapped or wrapped
            OperatorKind::FontSwap
            | OperatorKind::MathFontMixing
            | OperatorKind::InvisibleCharacters => s,
            // raise in ex
            OperatorKind::SymbolSubstitution => content::substitution_raise_ex(intensity),
            // horizontal scale factor
            OperatorKind::SymbolStretch => content::stretch_factor(intensity),
            // dots per glyph
            OperatorKind::VisualNoise => content::noise_dots_per_glyph(intensity),
            // colour percentage
            OperatorKind::Watermark | OperatorKind::WatermarkTiled | OperatorKind::BackgroundColor => {
                presentation::tint_percent(self, intensity)
            }
            OperatorKind::Texture => presentation::texture_density(intensity),
            OperatorKind::LineSpacing => presentation::spread_delta(intensity),
            // inches of margin removed
            OperatorKind::PageStructure => presentation::margin_cut_in(intensity),
        }
    }

    /// Apply a content-adjacent operator to one region.
    pub fn apply_region(self, input: &RegionInput<'_>) -> Result<OperatorOutput, OperatorError> {
        let not_applicable = || OperatorError::NotApplicable {
            operator: self.name().to_string(),
            region: input.region,
        };
        if self.is_presentation() || !self.applicable_kinds().contains(&input.kind.region_kind()) {
            return Err(not_applicable());
        }
        let malformed = |detail: &str| OperatorError::MalformedFragment {
            operator: self.name().to_string(),
            region: input.region,
            detail: detail.to_string(),
        };
        if !braces_balanced(input.source) {
            return Err(malformed("unbalanced braces"));
        }
        let fragment = Fragment::split_source(input.kind, input.source)
            .ok_or_else(|| malformed("delimiters not found"))?;
        content::apply(self, input, fragment)
            .map_err(|e| malformed(&e))?
            .ok_or_else(not_applicable)
    }

    /// Apply a presentation operator to the whole document.
    pub fn apply_document(self, input: &DocumentInput<'_>) -> Result<OperatorOutput, OperatorError> {
        if !self.is_presentation() {
            return Err(OperatorError::NotApplicable {
                operator: self.name().to_string(),
                region: BlockId::new(0),
            });
        }
        presentation::apply(self, input)
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OperatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name() == key)
            .ok_or_else(|| format!("unknown operator '{s}'"))
    }
}

// ── Application I/O ──────────────────────────────────────────────────────

/// Input of a region-level application.
#[derive(Debug, Clone)]
pub struct RegionInput<'a> {
    pub region: BlockId,
    pub kind: &'a BlockKind,
    /// Current source of the region (after earlier operators).
    pub source: &'a str,
    pub intensity: IntensityLevel,
    pub params: &'a OperatorParams,
    pub seed: u64,
}

/// A region kept out of a presentation operator's reach.
#[derive(Debug, Clone)]
pub struct ShieldedRegion<'a> {
    pub region: BlockId,
    pub kind: &'a BlockKind,
    pub source: &'a str,
}

/// Input of a document-level application.
#[derive(Debug, Clone)]
pub struct DocumentInput<'a> {
    pub geometry: &'a PageGeometry,
    pub intensity: IntensityLevel,
    pub params: &'a OperatorParams,
    pub seed: u64,
    pub excluded: Vec<ShieldedRegion<'a>>,
    /// Blocks holding floats (`figure` environments).
    pub floats: Vec<BlockId>,
}

/// One edit to the variant document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "patch", rename_all = "snake_case")]
pub enum Patch {
    /// LaTeX added to the preamble. Identical additions are emitted once.
    Preamble { latex: String },
    /// New source for one region.
    Region { region: BlockId, source: String },
}

impl Patch {
    pub fn preamble(latex: impl Into<String>) -> Self {
        Patch::Preamble {
            latex: latex.into(),
        }
    }
}

/// Result of one successful application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorOutput {
    pub patches: Vec<Patch>,
    pub description: String,
}
