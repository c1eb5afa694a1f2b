//! Named combination templates.
//!
//! Four graded protection levels combine presentation and content
//! operators; every operator also has a single-attack template named
//! after it (at medium intensity). Families group templates for subset
//! runs (`--family watermark`).

use super::OperatorKind;
use crate::attack::{AttackSpec, CombinationTemplate, IntensityLevel, OperatorParams};

/// Operator families for subset selection. `combo` is special: it matches
/// every template with more than one attack.
pub const FAMILIES: &[(&str, &[OperatorKind])] = &[
    ("watermark", &[OperatorKind::Watermark, OperatorKind::WatermarkTiled]),
    ("texture", &[OperatorKind::Texture, OperatorKind::BackgroundColor]),
    ("kerning", &[OperatorKind::Kerning]),
    ("font", &[OperatorKind::FontSwap, OperatorKind::MathFontMixing]),
    (
        "symbol",
        &[
            OperatorKind::SymbolConfusion,
            OperatorKind::SymbolSubstitution,
            OperatorKind::SymbolStretch,
        ],
    ),
    ("stretch", &[OperatorKind::SymbolStretch]),
    ("noise", &[OperatorKind::VisualNoise, OperatorKind::InvisibleCharacters]),
    ("layout", &[OperatorKind::LineSpacing, OperatorKind::PageStructure]),
    ("combo", &[]),
];

const PROTECTION_LEVELS: &[&str] = &[
    "light_protection",
    "medium_protection",
    "strong_protection",
    "extreme_protection",
];

fn attack(op: OperatorKind, intensity: IntensityLevel, params: OperatorParams) -> AttackSpec {
    AttackSpec::new(format!("{op}_{intensity}"), op, intensity).params(params)
}

/// Look up a template by name.
pub fn preset(name: &str) -> Option<CombinationTemplate> {
    use IntensityLevel::*;
    use OperatorKind::*;
    let none = OperatorParams::default;
    let attacks = match name {
        "light_protection" => vec![
            attack(Watermark, Light, none()),
            attack(Kerning, Light, none()),
        ],
        "medium_protection" => vec![
            attack(WatermarkTiled, Medium, none().text("$f(x)$")),
            attack(Texture, Medium, none().pattern("dots")),
        ],
        "strong_protection" => vec![
            attack(Kerning, Strong, none()),
            attack(WatermarkTiled, Strong, none().text(r"$\nabla f(x)$")),
            attack(FontSwap, Strong, none().symbol("=")),
        ],
        "extreme_protection" => vec![
            attack(WatermarkTiled, Extreme, none().text("$f'(x)$")),
            attack(Texture, Extreme, none().pattern("wave")),
            attack(InvisibleCharacters, Extreme, none()),
            attack(SymbolConfusion, Extreme, none()),
        ],
        crate::attack::BASELINE_NAME => return Some(CombinationTemplate::baseline()),
        other => {
            let op: OperatorKind = other.parse().ok()?;
            vec![AttackSpec::new(op.name(), op, Medium)]
        }
    };
    Some(CombinationTemplate::new(name, attacks))
}

/// Every built-in template name: baseline, protection levels, then one per
/// operator in catalog order.
pub fn preset_names() -> Vec<String> {
    std::iter::once(crate::attack::BASELINE_NAME.to_string())
        .chain(PROTECTION_LEVELS.iter().map(|s| s.to_string()))
        .chain(OperatorKind::ALL.iter().map(|op| op.name().to_string()))
        .collect()
}

/// Whether `template` belongs to `family`. Unknown families match nothing.
pub fn template_in_family(template: &CombinationTemplate, family: &str) -> bool {
    let Some((_, ops)) = FAMILIES.iter().find(|(name, _)| *name == family) else {
        return false;
    };
    if family == "combo" {
        return template.attacks.len() > 1;
    }
    template.attacks.iter().any(|a| ops.contains(&a.operator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_name_resolves() {
        for name in preset_names() {
            let t = preset(&name).unwrap_or_else(|| panic!("{name}"));
            assert_eq!(t.name, name);
        }
        assert!(preset("nonsense").is_none());
    }

    #[test]
    fn single_operator_templates() {
        let t = preset("symbol_stretch").unwrap();
        assert_eq!(t.attacks.len(), 1);
        assert_eq!(t.attacks[0].operator, OperatorKind::SymbolStretch);
    }

    #[test]
    fn families_filter_templates() {
        let extreme = preset("extreme_protection").unwrap();
        assert!(template_in_family(&extreme, "combo"));
        assert!(template_in_family(&extreme, "texture"));
        assert!(!template_in_family(&extreme, "kerning"));
        let kern = preset("kerning").unwrap();
        assert!(!template_in_family(&kern, "combo"));
        assert!(!template_in_family(&kern, "unknown"));
    }
}
