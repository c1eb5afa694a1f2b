//! Content-adjacent operators: glyph-level rewrites of one region.
//!
//! Every rewrite changes how a symbol is drawn, never which symbol the
//! source names, so ground truth derived from the template stays valid.
//! Random choices come from a `StdRng` seeded by the selector; the same
//! draws are made at every intensity, so a stronger application rewrites a
//! superset of the sites a weaker one does.

use super::mathtok::{self, Mode, Site};
use super::{OperatorKind, OperatorOutput, Patch, RegionInput};
use crate::attack::IntensityLevel;
use crate::document::{BlockKind, Fragment};
use crate::pipeline::analyze::glyph_mass;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ── Intensity mappings ───────────────────────────────────────────────────

/// Negative kern inserted between atoms, in em.
pub fn kern_em(intensity: IntensityLevel) -> f32 {
    0.02 + 0.08 * intensity.scale()
}

/// How many confusion mappings are enabled.
pub fn confusion_mapping_count(intensity: IntensityLevel) -> usize {
    intensity.rank() + 1
}

/// Vertical offset of substituted relation symbols, in ex.
pub fn substitution_raise_ex(intensity: IntensityLevel) -> f32 {
    0.05 + 0.25 * intensity.scale()
}

/// Horizontal scale of stretched relation symbols.
pub fn stretch_factor(intensity: IntensityLevel) -> f32 {
    1.0 + 0.6 * intensity.scale()
}

/// Noise dots per unit of glyph mass.
pub fn noise_dots_per_glyph(intensity: IntensityLevel) -> f32 {
    0.1 + 0.4 * intensity.scale()
}

const MAX_NOISE_DOTS: usize = 400;

/// `(source symbol, replacement, needs amssymb)`, weakest first.
const CONFUSIONS: &[(Site<'static>, &str, bool)] = &[
    (Site::Char('-'), r"\mathbin{\text{--}}", false),
    (Site::Char('='), r"\mathrel{\text{=}}", false),
    (Site::Command(r"\times"), r"\mathbin{\text{x}}", false),
    (Site::Char('+'), r"\mathbin{\dotplus}", true),
];

const MIXED_FONTS: &[&str] = &[r"\mathsf", r"\mathtt", r"\mathrm", r"\mathbf"];

const INVISIBLE_ANCHORS: &[char] = &['x', 'y', 'z', 'f', 'g', 'h'];

const ZERO_WIDTH_SPACE: char = '\u{200B}';

// ── Dispatch ─────────────────────────────────────────────────────────────

/// Apply `op` to the inner part of `fragment`.
///
/// `Ok(None)` means the region has no site the operator can act on.
pub(super) fn apply(
    op: OperatorKind,
    input: &RegionInput<'_>,
    fragment: Fragment,
) -> Result<Option<OperatorOutput>, String> {
    let mode = match input.kind {
        BlockKind::Math { .. } => Mode::Math,
        _ => Mode::Text,
    };
    let mut tokens = mathtok::parse(&fragment.inner, mode)?;
    let mut rng = StdRng::seed_from_u64(input.seed);
    let intensity = input.intensity;

    let (count, preamble, description) = match op {
        OperatorKind::Kerning => {
            let em = kern_em(intensity);
            let raw = format!(r"\kern-{em:.3}em ");
            let n = mathtok::insert_between(&mut tokens, &mut |left, right| {
                let fits = match mode {
                    Mode::Math => true,
                    Mode::Text => {
                        left.is_alphabetic() && matches!(right, Site::Char(c) if c.is_alphabetic())
                    }
                };
                fits.then(|| raw.clone())
            });
            (n, Vec::new(), format!("kerning -{em:.3}em between {n} atom pair(s)"))
        }
        OperatorKind::FontSwap => {
            let symbol = input.params.symbol.as_deref().unwrap_or("+");
            let fraction = f64::from(intensity.scale());
            let n = mathtok::map_sites(&mut tokens, &mut |site| {
                if !site_matches(site, symbol) {
                    return None;
                }
                let draw: f64 = rng.gen();
                (draw < fraction).then(|| swap_glyph(site, mode))
            });
            let preamble = vec![
                r"\usepackage{amsmath}".to_string(),
                r"\providecommand{\esswap}[1]{\text{\fontfamily{pcr}\selectfont #1}}".to_string(),
            ];
            (n, preamble, format!("font swap of '{symbol}' at {n} site(s)"))
        }
        OperatorKind::MathFontMixing => {
            let fraction = f64::from(intensity.scale());
            let n = mathtok::map_sites(&mut tokens, &mut |site| {
                let Site::Char(c) = site else { return None };
                if !c.is_ascii_alphabetic() {
                    return None;
                }
                let draw: f64 = rng.gen();
                let font = MIXED_FONTS[rng.gen_range(0..MIXED_FONTS.len())];
                (draw < fraction).then(|| format!("{{{font}{{{c}}}}}"))
            });
            (n, Vec::new(), format!("mixed math fonts on {n} letter(s)"))
        }
        OperatorKind::SymbolConfusion => {
            let enabled = &CONFUSIONS[..confusion_mapping_count(intensity).min(CONFUSIONS.len())];
            let n = mathtok::map_sites(&mut tokens, &mut |site| {
                enabled
                    .iter()
                    .find(|(from, _, _)| *from == site)
                    .map(|(_, to, _)| to.to_string())
            });
            let mut preamble = vec![r"\usepackage{amsmath}".to_string()];
            if enabled.iter().any(|(_, _, ams)| *ams) {
                preamble.push(r"\usepackage{amssymb}".to_string());
            }
            (n, preamble, format!("{} symbol confusion mapping(s), {n} site(s)", enabled.len()))
        }
        OperatorKind::SymbolSubstitution => {
            let suffix = ["a", "b", "c", "d"][intensity.rank()];
            let raise = substitution_raise_ex(intensity);
            let n = mathtok::map_sites(&mut tokens, &mut |site| match site {
                Site::Char('=') => Some(format!(r"\esEq{suffix} ")),
                Site::Char('+') => Some(format!(r"\esPlus{suffix} ")),
                _ => None,
            });
            let preamble = vec![
                r"\usepackage{graphicx}".to_string(),
                format!(r"\providecommand{{\esEq{suffix}}}{{\mathrel{{\raisebox{{{raise:.3}ex}}{{$=$}}}}}}"),
                format!(r"\providecommand{{\esPlus{suffix}}}{{\mathbin{{\raisebox{{-{raise:.3}ex}}{{$+$}}}}}}"),
            ];
            (n, preamble, format!("substituted {n} relation/operator symbol(s), raised {raise:.3}ex"))
        }
        OperatorKind::SymbolStretch => {
            let factor = stretch_factor(intensity);
            let symbol = input
                .params
                .symbol
                .as_deref()
                .and_then(|s| single_char(s))
                .unwrap_or('=');
            let n = mathtok::map_sites(&mut tokens, &mut |site| match site {
                Site::Char(c) if c == symbol => {
                    Some(format!(r"\mathrel{{\scalebox{{{factor:.3}}}[1]{{${c}$}}}}"))
                }
                _ => None,
            });
            (
                n,
                vec![r"\usepackage{graphicx}".to_string()],
                format!("stretched '{symbol}' ×{factor:.2} at {n} site(s)"),
            )
        }
        OperatorKind::InvisibleCharacters => {
            let fraction = f64::from(intensity.scale());
            let n = mathtok::map_sites(&mut tokens, &mut |site| {
                let Site::Char(c) = site else { return None };
                if !INVISIBLE_ANCHORS.contains(&c) {
                    return None;
                }
                let draw: f64 = rng.gen();
                (draw < fraction).then(|| format!("{c}{ZERO_WIDTH_SPACE}"))
            });
            (n, Vec::new(), format!("{n} zero-width space(s) inserted"))
        }
        OperatorKind::VisualNoise => {
            let mass = glyph_mass(&fragment.inner);
            let dots = ((mass * noise_dots_per_glyph(intensity)).ceil() as usize).min(MAX_NOISE_DOTS);
            if dots == 0 {
                (0, Vec::new(), String::new())
            } else {
                let overlay = noise_overlay(&mut rng, dots, mass, intensity);
                mathtok::prepend(&mut tokens, overlay);
                (
                    dots,
                    vec![r"\usepackage{tikz}".to_string()],
                    format!("{dots} noise dot(s) over the region"),
                )
            }
        }
        _ => return Err(format!("{op} is not a content-adjacent operator")),
    };

    if count == 0 {
        return Ok(None);
    }
    let rewritten = Fragment {
        inner: mathtok::render(&tokens),
        ..fragment
    };
    let mut patches: Vec<Patch> = preamble.into_iter().map(Patch::preamble).collect();
    patches.push(Patch::Region {
        region: input.region,
        source: rewritten.join(),
    });
    Ok(Some(OperatorOutput {
        patches,
        description: format!("{description} in {}", input.region),
    }))
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn single_char(s: &str) -> Option<char> {
    let mut chars = s.chars();
    let c = chars.next()?;
    chars.next().is_none().then_some(c)
}

fn site_matches(site: Site<'_>, symbol: &str) -> bool {
    match site {
        Site::Char(c) => single_char(symbol) == Some(c),
        Site::Command(cmd) => symbol.starts_with('\\') && cmd.trim_end() == symbol,
    }
}

/// Typewriter rendering of one symbol, keeping its math class.
fn swap_glyph(site: Site<'_>, mode: Mode) -> String {
    match (site, mode) {
        (Site::Command(cmd), _) => format!(r"{{\boldsymbol{{{cmd}}}}}"),
        (Site::Char(c), Mode::Text) => format!(r"\esswap{{{c}}}"),
        (Site::Char('='), Mode::Math) => r"\mathrel{\esswap{=}}".to_string(),
        (Site::Char(c @ ('<' | '>')), Mode::Math) => format!(r"\mathrel{{\boldsymbol{{{c}}}}}"),
        (Site::Char(c @ ('+' | '-' | '*')), Mode::Math) => format!(r"\mathbin{{\esswap{{{c}}}}}"),
        (Site::Char(c @ ('(' | '[')), Mode::Math) => format!(r"\mathopen{{\esswap{{{c}}}}}"),
        (Site::Char(c @ (')' | ']')), Mode::Math) => format!(r"\mathclose{{\esswap{{{c}}}}}"),
        (Site::Char(c), Mode::Math) => format!(r"{{\esswap{{{c}}}}}"),
    }
}

/// A zero-size TikZ overlay scattering dots over roughly the region's
/// extent, anchored at the start of the fragment.
fn noise_overlay(rng: &mut StdRng, dots: usize, mass: f32, intensity: IntensityLevel) -> String {
    let width_em = (mass * 0.55).clamp(1.0, 40.0);
    let shade = (30.0 + 40.0 * intensity.scale()).round() as u32;
    let mut out = String::from(r"\tikz[overlay]{");
    for _ in 0..dots {
        let x: f32 = rng.gen_range(0.0..width_em);
        let y: f32 = rng.gen_range(-0.3..0.9);
        let r: f32 = rng.gen_range(0.02..0.05);
        out.push_str(&format!(r"\fill[black!{shade}] ({x:.2}em,{y:.2}em) circle ({r:.3}em);"));
    }
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::OperatorParams;
    use crate::document::BlockId;

    fn math() -> BlockKind {
        BlockKind::Math {
            display: false,
            env: None,
        }
    }

    fn run(op: OperatorKind, kind: &BlockKind, source: &str, intensity: IntensityLevel, params: &OperatorParams) -> Option<String> {
        let input = RegionInput {
            region: BlockId::new(1),
            kind,
            source,
            intensity,
            params,
            seed: 7,
        };
        let fragment = Fragment::split_source(kind, source).unwrap();
        apply(op, &input, fragment).unwrap().map(|out| {
            out.patches
                .into_iter()
                .find_map(|p| match p {
                    Patch::Region { source, .. } => Some(source),
                    _ => None,
                })
                .unwrap()
        })
    }

    #[test]
    fn kerning_keeps_delimiters_and_arguments() {
        let out = run(OperatorKind::Kerning, &math(), "$ab + \\frac{c}{d}$ ", IntensityLevel::Medium, &OperatorParams::default()).unwrap();
        assert!(out.starts_with('$'));
        assert!(out.ends_with("$ "));
        assert!(out.contains(r"a\kern-0.060em b"), "{out}");
        assert!(out.contains(r"\frac{c}{d}"), "{out}");
    }

    #[test]
    fn kerning_in_text_only_between_letters() {
        let out = run(OperatorKind::Kerning, &BlockKind::Text, "ab 12\n", IntensityLevel::Light, &OperatorParams::default()).unwrap();
        assert_eq!(out, "a\\kern-0.040em b 12\n");
    }

    #[test]
    fn confusion_enables_more_mappings_with_intensity() {
        let src = r"$a - b = c \times d + e$";
        let light = run(OperatorKind::SymbolConfusion, &math(), src, IntensityLevel::Light, &OperatorParams::default()).unwrap();
        assert!(light.contains(r"\text{--}"));
        assert!(light.contains(" = "));
        let extreme = run(OperatorKind::SymbolConfusion, &math(), src, IntensityLevel::Extreme, &OperatorParams::default()).unwrap();
        assert!(extreme.contains(r"\dotplus"));
        assert!(!extreme.contains(r"\times"));
    }

    #[test]
    fn font_swap_is_a_superset_at_higher_intensity() {
        let src = "$1+2+3+4+5+6+7+8+9+10+11+12$";
        let params = OperatorParams::default().symbol("+");
        let count = |i| run(OperatorKind::FontSwap, &math(), src, i, &params).map(|s| s.matches(r"\esswap").count()).unwrap_or(0);
        let counts: Vec<usize> = IntensityLevel::ALL.iter().map(|i| count(*i)).collect();
        assert!(counts.windows(2).all(|w| w[0] <= w[1]), "{counts:?}");
        assert_eq!(counts[3], 11);
    }

    #[test]
    fn missing_sites_yield_none() {
        assert!(run(OperatorKind::SymbolStretch, &math(), "$x$", IntensityLevel::Strong, &OperatorParams::default()).is_none());
    }

    #[test]
    fn invisible_characters_leave_visible_text_alone() {
        let out = run(OperatorKind::InvisibleCharacters, &math(), "$f(x)+g(y)$", IntensityLevel::Extreme, &OperatorParams::default()).unwrap();
        assert_eq!(out.replace(ZERO_WIDTH_SPACE, ""), "$f(x)+g(y)$");
        assert_eq!(out.matches(ZERO_WIDTH_SPACE).count(), 4);
    }

    #[test]
    fn visual_noise_is_seeded() {
        let a = run(OperatorKind::VisualNoise, &math(), "$x^2+y^2=1$", IntensityLevel::Strong, &OperatorParams::default());
        let b = run(OperatorKind::VisualNoise, &math(), "$x^2+y^2=1$", IntensityLevel::Strong, &OperatorParams::default());
        assert_eq!(a, b);
        assert!(a.unwrap().starts_with(r"$\tikz[overlay]{\fill"));
    }

    #[test]
    fn substitution_macros_differ_per_intensity() {
        let light = run(OperatorKind::SymbolSubstitution, &math(), "$a=b$", IntensityLevel::Light, &OperatorParams::default()).unwrap();
        let strong = run(OperatorKind::SymbolSubstitution, &math(), "$a=b$", IntensityLevel::Strong, &OperatorParams::default()).unwrap();
        assert_eq!(light, r"$a\esEqa b$");
        assert_eq!(strong, r"$a\esEqc b$");
    }
}
