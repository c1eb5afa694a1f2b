//! Attack specifications: what was requested and what the selector planned.
//!
//! ```text
//! CombinationTemplate ──select()──▶ CombinationSpec ──compose()──▶ VariantDocument
//!  (named request)                  (concrete plan + audit)
//! ```
//!
//! A [`CombinationTemplate`] is the user's request: an ordered list of
//! [`AttackSpec`]s. A [`CombinationSpec`] is the selector's answer for one
//! document: the operator applications that survived context filtering and
//! the legibility budget, each with its own seed, plus an audit trail of
//! everything that was excluded, adjusted or dropped.

use crate::catalog::OperatorKind;
use crate::document::{BlockId, RegionKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Intensity ────────────────────────────────────────────────────────────

/// Requested strength of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensityLevel {
    Light,
    #[default]
    Medium,
    Strong,
    Extreme,
}

impl IntensityLevel {
    pub const ALL: [IntensityLevel; 4] = [
        IntensityLevel::Light,
        IntensityLevel::Medium,
        IntensityLevel::Strong,
        IntensityLevel::Extreme,
    ];

    /// Position on `[0.25, 1.0]`; strictly increasing with the level.
    pub fn scale(self) -> f32 {
        match self {
            IntensityLevel::Light => 0.25,
            IntensityLevel::Medium => 0.5,
            IntensityLevel::Strong => 0.75,
            IntensityLevel::Extreme => 1.0,
        }
    }

    pub fn rank(self) -> usize {
        self as usize
    }

    pub fn step_up(self) -> Self {
        Self::ALL[(self.rank() + 1).min(3)]
    }

    pub fn step_down(self) -> Self {
        Self::ALL[self.rank().saturating_sub(1)]
    }
}

impl fmt::Display for IntensityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IntensityLevel::Light => "light",
            IntensityLevel::Medium => "medium",
            IntensityLevel::Strong => "strong",
            IntensityLevel::Extreme => "extreme",
        })
    }
}

impl FromStr for IntensityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" | "low" => Ok(IntensityLevel::Light),
            "medium" | "med" => Ok(IntensityLevel::Medium),
            "strong" | "high" => Ok(IntensityLevel::Strong),
            "extreme" => Ok(IntensityLevel::Extreme),
            other => Err(format!("unknown intensity '{other}'")),
        }
    }
}

// ── Context level ────────────────────────────────────────────────────────

/// How much document structure the selector is allowed to use.
///
/// | Level | Behaviour |
/// |-------|-----------|
/// | 0 | Document-wide, structure ignored |
/// | 1 | Presentation operators avoid figures |
/// | 2 | + content operators only on math |
/// | 3 | + per-region intensity from density, subject-aware parameters |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ContextLevel {
    #[default]
    Uniform = 0,
    FigureAware = 1,
    MathFocused = 2,
    DensityAware = 3,
}

impl ContextLevel {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ContextLevel {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(ContextLevel::Uniform),
            1 => Ok(ContextLevel::FigureAware),
            2 => Ok(ContextLevel::MathFocused),
            3 => Ok(ContextLevel::DensityAware),
            n => Err(format!("context level must be 0–3, got {n}")),
        }
    }
}

impl From<ContextLevel> for u8 {
    fn from(c: ContextLevel) -> u8 {
        c.level()
    }
}

impl fmt::Display for ContextLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.level())
    }
}

// ── Tie-break policy ─────────────────────────────────────────────────────

/// Order in which competing presentation operators are admitted against
/// the budget. Content-adjacent operators always go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationTieBreak {
    /// Fixed catalog priority (see [`OperatorKind::priority`]).
    #[default]
    CatalogPriority,
    /// The order the attacks appear in the template.
    RequestOrder,
    /// Cheapest first, so more operators fit the budget.
    LowerCostFirst,
}

impl FromStr for PresentationTieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "catalog_priority" | "priority" => Ok(Self::CatalogPriority),
            "request_order" | "request" => Ok(Self::RequestOrder),
            "lower_cost_first" | "cost" => Ok(Self::LowerCostFirst),
            other => Err(format!("unknown tie-break policy '{other}'")),
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────────────

/// Optional operator parameters. Unset fields fall back to the operator's
/// defaults, or to subject-aware defaults at context level 3.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl OperatorParams {
    pub fn text(mut self, v: impl Into<String>) -> Self {
        self.text = Some(v.into());
        self
    }

    pub fn pattern(mut self, v: impl Into<String>) -> Self {
        self.pattern = Some(v.into());
        self
    }

    pub fn symbol(mut self, v: impl Into<String>) -> Self {
        self.symbol = Some(v.into());
        self
    }

    pub fn mode(mut self, v: impl Into<String>) -> Self {
        self.mode = Some(v.into());
        self
    }

    pub fn color(mut self, v: impl Into<String>) -> Self {
        self.color = Some(v.into());
        self
    }

    /// Fill every unset field from `defaults`.
    pub fn or(mut self, defaults: &OperatorParams) -> Self {
        self.text = self.text.or_else(|| defaults.text.clone());
        self.color = self.color.or_else(|| defaults.color.clone());
        self.pattern = self.pattern.or_else(|| defaults.pattern.clone());
        self.symbol = self.symbol.or_else(|| defaults.symbol.clone());
        self.font = self.font.or_else(|| defaults.font.clone());
        self.mode = self.mode.or_else(|| defaults.mode.clone());
        self
    }
}

/// A named, versioned request for one operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackSpec {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub operator: OperatorKind,
    /// Region kinds the operator may touch. Intersected with the
    /// operator's own capabilities during selection.
    pub targets: Vec<RegionKind>,
    #[serde(default)]
    pub intensity: IntensityLevel,
    /// Overrides the run's context level for this attack only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_level: Option<ContextLevel>,
    #[serde(default)]
    pub params: OperatorParams,
}

fn default_version() -> u32 {
    1
}

impl AttackSpec {
    /// A spec targeting every region kind the operator supports.
    pub fn new(name: impl Into<String>, operator: OperatorKind, intensity: IntensityLevel) -> Self {
        Self {
            name: name.into(),
            version: 1,
            operator,
            targets: operator.applicable_kinds().to_vec(),
            intensity,
            context_level: None,
            params: OperatorParams::default(),
        }
    }

    pub fn context_level(mut self, level: ContextLevel) -> Self {
        self.context_level = Some(level);
        self
    }

    pub fn targets(mut self, kinds: &[RegionKind]) -> Self {
        self.targets = kinds.to_vec();
        self
    }

    pub fn params(mut self, params: OperatorParams) -> Self {
        self.params = params;
        self
    }

    /// `name@vN`, the identifier written to ledgers and reports.
    pub fn qualified_name(&self) -> String {
        format!("{}@v{}", self.name, self.version)
    }
}

/// An ordered list of attacks forming one variant request.
///
/// Order is significant: later operators see the output of earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationTemplate {
    pub name: String,
    pub attacks: Vec<AttackSpec>,
}

/// Name of the unmodified control variant.
pub const BASELINE_NAME: &str = "baseline_clean";

impl CombinationTemplate {
    pub fn new(name: impl Into<String>, attacks: Vec<AttackSpec>) -> Self {
        Self {
            name: name.into(),
            attacks,
        }
    }

    /// The control: no attacks at all.
    pub fn baseline() -> Self {
        Self::new(BASELINE_NAME, Vec::new())
    }

    pub fn is_baseline(&self) -> bool {
        self.attacks.is_empty()
    }
}

// ── Plans ────────────────────────────────────────────────────────────────

/// Where one planned application lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ApplicationScope {
    /// Page-level effect over the whole document, except shielded regions.
    Document { excluded: Vec<BlockId> },
    /// Per-region rewrite, each with its own effective intensity.
    Regions { targets: Vec<RegionTarget> },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionTarget {
    pub region: BlockId,
    pub intensity: IntensityLevel,
    pub seed: u64,
}

/// One concrete operator application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedApplication {
    /// Attack name this application came from.
    pub attack: String,
    pub operator: OperatorKind,
    /// Nominal intensity; region targets may carry adjusted ones.
    pub intensity: IntensityLevel,
    pub params: OperatorParams,
    #[serde(flatten)]
    pub scope: ApplicationScope,
    pub seed: u64,
}

/// Why the selector changed or removed part of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEntry {
    /// Admitting the application would exceed the legibility budget.
    Dropped {
        attack: String,
        operator: OperatorKind,
        region: Option<BlockId>,
        cost: f32,
        spent: f32,
        budget: f32,
    },
    /// Region kept out of the operator's reach by the context level.
    Excluded {
        attack: String,
        operator: OperatorKind,
        region: BlockId,
        kind: RegionKind,
    },
    /// Density-driven intensity change at context level 3.
    IntensityAdjusted {
        attack: String,
        region: BlockId,
        from: IntensityLevel,
        to: IntensityLevel,
        density: f32,
    },
    /// Nothing in the document matched the operator's targets.
    NoApplicableRegions { attack: String, operator: OperatorKind },
    /// The operator cannot be used on this document at all.
    Unsupported {
        attack: String,
        operator: OperatorKind,
        reason: String,
    },
}

/// The selector's concrete, conflict-free plan for one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationSpec {
    pub name: String,
    pub seed: u64,
    pub context_level: ContextLevel,
    pub budget: f32,
    pub applications: Vec<PlannedApplication>,
    pub audit: Vec<AuditEntry>,
}

impl CombinationSpec {
    /// A plan with nothing to apply.
    pub fn empty(name: impl Into<String>, seed: u64) -> Self {
        Self {
            name: name.into(),
            seed,
            context_level: ContextLevel::default(),
            budget: 0.0,
            applications: Vec::new(),
            audit: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }

    pub fn dropped(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit
            .iter()
            .filter(|e| matches!(e, AuditEntry::Dropped { .. }))
    }
}
