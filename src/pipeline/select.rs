//! Context-aware selection: `CombinationTemplate` → `CombinationSpec`.
//!
//! The selector decides, for one document, which requested operators run,
//! on which regions and at what intensity. It works in two passes:
//!
//! 1. **Planning** (request order). Each attack's targets are intersected
//!    with the operator's capabilities and filtered by the context level:
//!
//!    | Level | Effect |
//!    |-------|--------|
//!    | L0 | every applicable region, nominal density, no adjacency |
//!    | L1 | presentation operators shield figure regions |
//!    | L2 | content-adjacent operators only on math regions |
//!    | L3 | per-region intensity from density, subject-aware defaults |
//!
//! 2. **Admission** against the per-region legibility budget. Content
//!    operators go first in catalog priority order and are admitted region
//!    by region; presentation operators follow in the configured
//!    [`PresentationTieBreak`] order and are admitted whole or not at all.
//!
//! Every exclusion, adjustment and drop lands in the audit trail. Given
//! the same profile, template and options the result is identical.

use crate::attack::{
    ApplicationScope, AttackSpec, AuditEntry, CombinationSpec, CombinationTemplate, ContextLevel,
    IntensityLevel, OperatorParams, PlannedApplication, PresentationTieBreak, RegionTarget,
};
use crate::catalog::OperatorKind;
use crate::document::{BlockId, RegionKind};
use crate::pipeline::analyze::{Region, StructuralProfile, Subject};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

/// Density assumed for every region when structure is ignored (L0).
pub const NOMINAL_DENSITY: f32 = 0.5;

/// Default per-region legibility budget.
pub const DEFAULT_BUDGET: f32 = 1.5;

const DENSE: f32 = 0.66;
const SPARSE: f32 = 0.33;
const EPSILON: f32 = 1e-6;

/// Knobs of one selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectOptions {
    pub context_level: ContextLevel,
    pub budget: f32,
    pub seed: u64,
    pub tie_break: PresentationTieBreak,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            context_level: ContextLevel::MathFocused,
            budget: DEFAULT_BUDGET,
            seed: 0,
            tie_break: PresentationTieBreak::default(),
        }
    }
}

// ── Seeds ────────────────────────────────────────────────────────────────

/// Derive an application seed from the variant seed and its coordinates.
pub fn derive_seed(seed: u64, attack: &str, index: usize, op: OperatorKind, region: Option<BlockId>) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(attack.as_bytes());
    hasher.update((index as u64).to_le_bytes());
    hasher.update(op.name().as_bytes());
    if let Some(r) = region {
        hasher.update(r.0.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

// ── Subject defaults ─────────────────────────────────────────────────────

/// Parameters that suit the exam's subject, used at L3 for unset fields.
pub fn subject_defaults(op: OperatorKind, subject: Subject) -> OperatorParams {
    let params = OperatorParams::default();
    match op {
        OperatorKind::Watermark | OperatorKind::WatermarkTiled => params.text(match subject {
            Subject::Calculus => "$f'(x)$",
            Subject::ComplexAnalysis => "$f(z)$",
            Subject::DiscreteMath => "$G(V,E)$",
            Subject::LinearAlgebra => r"$A\vec{x}$",
            Subject::Probability => "$P(X)$",
            Subject::MachineLearning => r"$\nabla J$",
            Subject::General => "$f(x)$",
        }),
        OperatorKind::Texture => params.pattern(match subject {
            Subject::Calculus => "wave",
            Subject::ComplexAnalysis => "circles",
            Subject::DiscreteMath | Subject::MachineLearning => "grid",
            Subject::LinearAlgebra => "lines",
            Subject::Probability | Subject::General => "dots",
        }),
        OperatorKind::FontSwap => params.symbol(match subject {
            Subject::Calculus | Subject::General => "+",
            Subject::ComplexAnalysis => "z",
            Subject::DiscreteMath => r"\in",
            Subject::LinearAlgebra => "=",
            Subject::Probability => "(",
            Subject::MachineLearning => r"\theta",
        }),
        _ => params,
    }
}

// ── Planning ─────────────────────────────────────────────────────────────

/// One region's share of an application.
#[derive(Debug, Clone)]
struct Charge {
    region: BlockId,
    intensity: IntensityLevel,
    cost: f32,
    /// Cost bled into neighbours.
    spill: Vec<(BlockId, f32)>,
}

#[derive(Debug, Clone)]
struct Candidate<'a> {
    index: usize,
    attack: &'a AttackSpec,
    params: OperatorParams,
    charges: Vec<Charge>,
    excluded: Vec<BlockId>,
}

impl Candidate<'_> {
    fn op(&self) -> OperatorKind {
        self.attack.operator
    }

    fn total_cost(&self) -> f32 {
        self.charges.iter().map(|c| c.cost).sum()
    }
}

fn cost_density(region: &Region, level: ContextLevel) -> f32 {
    if level == ContextLevel::Uniform {
        NOMINAL_DENSITY
    } else {
        region.density
    }
}

fn plan<'a>(
    profile: &StructuralProfile,
    index: usize,
    attack: &'a AttackSpec,
    opts: &SelectOptions,
    audit: &mut Vec<AuditEntry>,
) -> Option<Candidate<'a>> {
    let op = attack.operator;
    let level = attack.context_level.unwrap_or(opts.context_level);
    let kinds: Vec<RegionKind> = attack
        .targets
        .iter()
        .copied()
        .filter(|k| op.applicable_kinds().contains(k))
        .collect();
    if kinds.is_empty() {
        audit.push(AuditEntry::Unsupported {
            attack: attack.name.clone(),
            operator: op,
            reason: format!("targets {:?} are outside the operator's capabilities", attack.targets),
        });
        return None;
    }

    let mut params = attack.params.clone();
    if level >= ContextLevel::DensityAware {
        params = params.or(&subject_defaults(op, profile.subject));
    }

    if op == OperatorKind::PageStructure && params.mode.as_deref() == Some("columns") && profile.has_figures() {
        audit.push(AuditEntry::Unsupported {
            attack: attack.name.clone(),
            operator: op,
            reason: "multi-column layout cannot hold the document's figures".to_string(),
        });
        return None;
    }

    let mut charges = Vec::new();
    let mut excluded = Vec::new();
    for region in &profile.regions {
        if !kinds.contains(&region.kind) {
            continue;
        }
        let shielded = if op.is_presentation() {
            level >= ContextLevel::FigureAware && region.kind == RegionKind::Figure
        } else {
            level >= ContextLevel::MathFocused && region.kind != RegionKind::Math
        };
        if shielded {
            audit.push(AuditEntry::Excluded {
                attack: attack.name.clone(),
                operator: op,
                region: region.id,
                kind: region.kind,
            });
            excluded.push(region.id);
            continue;
        }

        let mut intensity = attack.intensity;
        if level >= ContextLevel::DensityAware && !op.is_presentation() {
            let adjusted = if region.density > DENSE {
                intensity.step_down()
            } else if region.density < SPARSE {
                intensity.step_up()
            } else {
                intensity
            };
            if adjusted != intensity {
                audit.push(AuditEntry::IntensityAdjusted {
                    attack: attack.name.clone(),
                    region: region.id,
                    from: intensity,
                    to: adjusted,
                    density: region.density,
                });
                intensity = adjusted;
            }
        }

        let cost = op.legibility_cost(intensity, cost_density(region, level));
        let spill = if level == ContextLevel::Uniform || op.spill() == 0.0 {
            Vec::new()
        } else {
            region.adjacent.iter().map(|a| (*a, cost * op.spill())).collect()
        };
        charges.push(Charge {
            region: region.id,
            intensity,
            cost,
            spill,
        });
    }

    if charges.is_empty() {
        audit.push(AuditEntry::NoApplicableRegions {
            attack: attack.name.clone(),
            operator: op,
        });
        return None;
    }
    Some(Candidate {
        index,
        attack,
        params,
        charges,
        excluded,
    })
}

// ── Admission ────────────────────────────────────────────────────────────

struct Budget {
    limit: f32,
    spent: HashMap<BlockId, f32>,
}

impl Budget {
    fn spent(&self, region: BlockId) -> f32 {
        self.spent.get(&region).copied().unwrap_or(0.0)
    }

    fn fits(&self, region: BlockId, cost: f32) -> bool {
        self.spent(region) + cost <= self.limit + EPSILON
    }

    fn fits_charge(&self, charge: &Charge) -> bool {
        self.fits(charge.region, charge.cost) && charge.spill.iter().all(|(r, c)| self.fits(*r, *c))
    }

    fn take(&mut self, charge: &Charge) {
        *self.spent.entry(charge.region).or_insert(0.0) += charge.cost;
        for (r, c) in &charge.spill {
            *self.spent.entry(*r).or_insert(0.0) += c;
        }
    }
}

fn dropped(c: &Candidate<'_>, charge: &Charge, budget: &Budget) -> AuditEntry {
    AuditEntry::Dropped {
        attack: c.attack.name.clone(),
        operator: c.op(),
        region: Some(charge.region),
        cost: charge.cost,
        spent: budget.spent(charge.region),
        budget: budget.limit,
    }
}

fn admit_content(
    c: Candidate<'_>,
    seed: u64,
    budget: &mut Budget,
    audit: &mut Vec<AuditEntry>,
) -> Option<(usize, PlannedApplication)> {
    let mut targets = Vec::new();
    for charge in &c.charges {
        if budget.fits_charge(charge) {
            budget.take(charge);
            targets.push(RegionTarget {
                region: charge.region,
                intensity: charge.intensity,
                seed: derive_seed(seed, &c.attack.name, c.index, c.op(), Some(charge.region)),
            });
        } else {
            audit.push(dropped(&c, charge, budget));
        }
    }
    if targets.is_empty() {
        return None;
    }
    Some((
        c.index,
        PlannedApplication {
            attack: c.attack.name.clone(),
            operator: c.op(),
            intensity: c.attack.intensity,
            params: c.params,
            scope: ApplicationScope::Regions { targets },
            seed: derive_seed(seed, &c.attack.name, c.index, c.attack.operator, None),
        },
    ))
}

fn admit_presentation(
    c: Candidate<'_>,
    seed: u64,
    budget: &mut Budget,
    audit: &mut Vec<AuditEntry>,
) -> Option<(usize, PlannedApplication)> {
    if let Some(over) = c.charges.iter().find(|ch| !budget.fits_charge(ch)) {
        audit.push(dropped(&c, over, budget));
        return None;
    }
    for charge in &c.charges {
        budget.take(charge);
    }
    Some((
        c.index,
        PlannedApplication {
            attack: c.attack.name.clone(),
            operator: c.op(),
            intensity: c.attack.intensity,
            params: c.params,
            scope: ApplicationScope::Document { excluded: c.excluded },
            seed: derive_seed(seed, &c.attack.name, c.index, c.attack.operator, None),
        },
    ))
}

// ── Entry point ──────────────────────────────────────────────────────────

/// Turn a request into a concrete, budget-respecting plan for one document.
pub fn select(profile: &StructuralProfile, template: &CombinationTemplate, opts: &SelectOptions) -> CombinationSpec {
    let mut spec = CombinationSpec {
        name: template.name.clone(),
        seed: opts.seed,
        context_level: opts.context_level,
        budget: opts.budget,
        applications: Vec::new(),
        audit: Vec::new(),
    };

    let candidates: Vec<Candidate<'_>> = template
        .attacks
        .iter()
        .enumerate()
        .filter_map(|(i, attack)| plan(profile, i, attack, opts, &mut spec.audit))
        .collect();

    let (mut content, mut presentation): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|c| !c.op().is_presentation());
    content.sort_by_key(|c| (c.op().priority(), c.index));
    match opts.tie_break {
        PresentationTieBreak::CatalogPriority => presentation.sort_by_key(|c| (c.op().priority(), c.index)),
        PresentationTieBreak::RequestOrder => presentation.sort_by_key(|c| c.index),
        PresentationTieBreak::LowerCostFirst => presentation.sort_by(|a, b| {
            a.total_cost()
                .total_cmp(&b.total_cost())
                .then(a.index.cmp(&b.index))
        }),
    }

    let mut budget = Budget {
        limit: opts.budget,
        spent: HashMap::new(),
    };
    let mut admitted = Vec::new();
    for c in content {
        admitted.extend(admit_content(c, opts.seed, &mut budget, &mut spec.audit));
    }
    for c in presentation {
        admitted.extend(admit_presentation(c, opts.seed, &mut budget, &mut spec.audit));
    }

    // Composition follows request order.
    admitted.sort_by_key(|(i, _)| *i);
    spec.applications = admitted.into_iter().map(|(_, a)| a).collect();

    debug!(
        "Selected {} for {}: {}/{} applications, {} dropped",
        spec.name,
        profile.document_id,
        spec.applications.len(),
        template.attacks.len(),
        spec.dropped().count()
    );
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{BoundingBox, PageGeometry};

    fn region(id: u32, kind: RegionKind, density: f32) -> Region {
        Region {
            id: BlockId::new(id),
            kind,
            bbox: BoundingBox {
                page: 1,
                left: 0.0,
                top: id as f32 * 20.0,
                width: 468.0,
                height: 20.0,
            },
            density,
            adjacent: Vec::new(),
            warning: false,
        }
    }

    fn profile(regions: Vec<Region>) -> StructuralProfile {
        StructuralProfile {
            document_id: "t".into(),
            geometry: PageGeometry::default(),
            pages: 1,
            regions,
            document_class: Some("article".into()),
            packages: Vec::new(),
            has_complex_math: false,
            subject: Subject::Calculus,
            warnings: Vec::new(),
        }
    }

    fn opts(level: ContextLevel) -> SelectOptions {
        SelectOptions {
            context_level: level,
            budget: DEFAULT_BUDGET,
            seed: 11,
            tie_break: PresentationTieBreak::CatalogPriority,
        }
    }

    fn template(attacks: Vec<AttackSpec>) -> CombinationTemplate {
        CombinationTemplate::new("t", attacks)
    }

    fn region_targets(app: &PlannedApplication) -> Vec<BlockId> {
        match &app.scope {
            ApplicationScope::Regions { targets } => targets.iter().map(|t| t.region).collect(),
            ApplicationScope::Document { .. } => Vec::new(),
        }
    }

    #[test]
    fn level_one_shields_figures_from_tiled_watermark() {
        let p = profile(vec![region(0, RegionKind::Math, 0.4), region(1, RegionKind::Figure, 1.0)]);
        let t = template(vec![AttackSpec::new("tiled", OperatorKind::WatermarkTiled, IntensityLevel::Medium)]);
        let spec = select(&p, &t, &opts(ContextLevel::FigureAware));
        assert_eq!(spec.applications.len(), 1);
        assert_eq!(
            spec.applications[0].scope,
            ApplicationScope::Document {
                excluded: vec![BlockId::new(1)]
            }
        );
        assert!(spec.audit.iter().any(|e| matches!(e, AuditEntry::Excluded { region, .. } if *region == BlockId::new(1))));
    }

    #[test]
    fn level_zero_ignores_structure() {
        let p = profile(vec![region(0, RegionKind::Text, 0.9), region(1, RegionKind::Math, 0.9), region(2, RegionKind::Figure, 1.0)]);
        let t = template(vec![
            AttackSpec::new("kern", OperatorKind::Kerning, IntensityLevel::Medium),
            AttackSpec::new("wm", OperatorKind::Watermark, IntensityLevel::Medium),
        ]);
        let spec = select(&p, &t, &opts(ContextLevel::Uniform));
        assert_eq!(region_targets(&spec.applications[0]), vec![BlockId::new(0), BlockId::new(1)]);
        assert_eq!(spec.applications[1].scope, ApplicationScope::Document { excluded: vec![] });
        assert!(spec.audit.is_empty());
    }

    #[test]
    fn level_two_restricts_content_operators_to_math() {
        let p = profile(vec![region(0, RegionKind::Text, 0.5), region(1, RegionKind::Math, 0.5)]);
        let t = template(vec![AttackSpec::new("kern", OperatorKind::Kerning, IntensityLevel::Medium)]);
        let spec = select(&p, &t, &opts(ContextLevel::MathFocused));
        assert_eq!(region_targets(&spec.applications[0]), vec![BlockId::new(1)]);
    }

    #[test]
    fn level_three_adjusts_intensity_by_density() {
        let p = profile(vec![region(0, RegionKind::Math, 0.9), region(1, RegionKind::Math, 0.1), region(2, RegionKind::Math, 0.5)]);
        let t = template(vec![AttackSpec::new("kern", OperatorKind::Kerning, IntensityLevel::Medium)]);
        let spec = select(&p, &t, &opts(ContextLevel::DensityAware));
        let ApplicationScope::Regions { targets } = &spec.applications[0].scope else {
            panic!("expected region scope");
        };
        let levels: Vec<IntensityLevel> = targets.iter().map(|t| t.intensity).collect();
        assert_eq!(levels, vec![IntensityLevel::Light, IntensityLevel::Strong, IntensityLevel::Medium]);
        assert_eq!(
            spec.audit
                .iter()
                .filter(|e| matches!(e, AuditEntry::IntensityAdjusted { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn level_three_fills_subject_defaults() {
        let p = profile(vec![region(0, RegionKind::Math, 0.5)]);
        let t = template(vec![AttackSpec::new("wm", OperatorKind::Watermark, IntensityLevel::Light)]);
        let spec = select(&p, &t, &opts(ContextLevel::DensityAware));
        assert_eq!(spec.applications[0].params.text.as_deref(), Some("$f'(x)$"));
    }

    #[test]
    fn over_budget_drops_lower_priority_and_records_it() {
        let p = profile(vec![region(0, RegionKind::Math, 1.0)]);
        // Listed in reverse priority order on purpose.
        let t = template(vec![
            AttackSpec::new("confuse", OperatorKind::SymbolConfusion, IntensityLevel::Medium),
            AttackSpec::new("kern", OperatorKind::Kerning, IntensityLevel::Extreme),
        ]);
        let mut o = opts(ContextLevel::MathFocused);
        o.budget = 1.0;
        let spec = select(&p, &t, &o);
        // Each fits alone (0.9 and 0.525); kerning goes first and confusion no longer fits.
        assert_eq!(spec.applications.len(), 1);
        assert_eq!(spec.applications[0].operator, OperatorKind::Kerning);
        let drops: Vec<&AuditEntry> = spec.dropped().collect();
        assert_eq!(drops.len(), 1);
        assert!(matches!(drops[0], AuditEntry::Dropped { operator: OperatorKind::SymbolConfusion, .. }));
    }

    #[test]
    fn tie_break_policy_decides_between_presentation_operators() {
        let p = profile(vec![region(0, RegionKind::Text, 0.5)]);
        let t = template(vec![
            AttackSpec::new("texture", OperatorKind::Texture, IntensityLevel::Extreme),
            AttackSpec::new("tiled", OperatorKind::WatermarkTiled, IntensityLevel::Extreme),
        ]);
        let mut o = opts(ContextLevel::FigureAware);
        // texture 0.4, tiled 0.5: only one fits.
        o.budget = 0.55;
        let first = |o: &SelectOptions| select(&p, &t, o).applications[0].operator;
        assert_eq!(first(&o), OperatorKind::WatermarkTiled);
        o.tie_break = PresentationTieBreak::RequestOrder;
        assert_eq!(first(&o), OperatorKind::Texture);
        o.tie_break = PresentationTieBreak::LowerCostFirst;
        assert_eq!(first(&o), OperatorKind::Texture);
    }

    #[test]
    fn visual_noise_charges_neighbours() {
        let mut a = region(0, RegionKind::Math, 0.5);
        let mut b = region(1, RegionKind::Text, 0.5);
        a.adjacent = vec![b.id];
        b.adjacent = vec![a.id];
        let p = profile(vec![a, b]);
        let t = template(vec![
            AttackSpec::new("noise", OperatorKind::VisualNoise, IntensityLevel::Extreme),
            AttackSpec::new("bg", OperatorKind::BackgroundColor, IntensityLevel::Extreme),
        ]);
        let mut o = opts(ContextLevel::MathFocused);
        // noise 0.8 on b0 spills 0.2 onto b1; background costs 0.2 everywhere.
        o.budget = 0.85;
        let spec = select(&p, &t, &o);
        assert_eq!(spec.applications.len(), 1);
        assert_eq!(spec.applications[0].operator, OperatorKind::VisualNoise);
        assert_eq!(spec.dropped().count(), 1);
    }

    #[test]
    fn selection_is_deterministic_and_seeded() {
        let p = profile(vec![region(0, RegionKind::Math, 0.5), region(1, RegionKind::Math, 0.5)]);
        let t = template(vec![AttackSpec::new("noise", OperatorKind::VisualNoise, IntensityLevel::Light)]);
        let a = select(&p, &t, &opts(ContextLevel::MathFocused));
        let b = select(&p, &t, &opts(ContextLevel::MathFocused));
        assert_eq!(a, b);
        let ApplicationScope::Regions { targets } = &a.applications[0].scope else {
            panic!("expected region scope");
        };
        assert_ne!(targets[0].seed, targets[1].seed);
        let mut other = opts(ContextLevel::MathFocused);
        other.seed = 12;
        assert_ne!(select(&p, &t, &other), a);
    }

    #[test]
    fn incompatible_targets_are_unsupported() {
        let p = profile(vec![region(0, RegionKind::Figure, 1.0)]);
        let t = template(vec![AttackSpec::new("kern", OperatorKind::Kerning, IntensityLevel::Light).targets(&[RegionKind::Figure])]);
        let spec = select(&p, &t, &opts(ContextLevel::Uniform));
        assert!(spec.is_empty());
        assert!(matches!(spec.audit[0], AuditEntry::Unsupported { .. }));
    }

    #[test]
    fn columns_refused_when_figures_present() {
        let p = profile(vec![region(0, RegionKind::Text, 0.5), region(1, RegionKind::Figure, 1.0)]);
        let t = template(vec![AttackSpec::new("cols", OperatorKind::PageStructure, IntensityLevel::Light)
            .params(OperatorParams::default().mode("columns"))]);
        let spec = select(&p, &t, &opts(ContextLevel::FigureAware));
        assert!(spec.is_empty());
    }
}
