//! Presentation operators: page-level effects emitted as preamble code.
//!
//! Overlays are drawn on the shipout background (`eso-pic`), so they sit
//! under the text and never touch the source of a region. Regions the
//! selector keeps out of reach are shielded instead: images get an opaque
//! white backing so no watermark or texture shows through them, and line
//! spacing is reset around them.

use super::{DocumentInput, OperatorKind, OperatorOutput, Patch, ShieldedRegion};
use crate::attack::IntensityLevel;
use crate::document::{balanced_group_end, BlockKind, PageGeometry};
use crate::error::OperatorError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;

const USE_ESO_PIC: &str = r"\usepackage{eso-pic}";
const USE_TIKZ: &str = r"\usepackage{tikz}";
const USE_XCOLOR: &str = r"\usepackage{xcolor}";
const USE_GRAPHICX: &str = r"\usepackage{graphicx}";
const SHIELD_MACRO: &str = r"\providecommand{\esshield}[1]{{\setlength{\fboxsep}{0pt}\colorbox{white}{#1}}}";
const SPACING_RESET: &str = r"{\linespread{1}\selectfont ";

const DEFAULT_WATERMARK: &str = "$f(x)$";

// ── Intensity mappings ───────────────────────────────────────────────────

/// Colour percentage (`gray!N`) of overlay ink.
pub fn tint_percent(op: OperatorKind, intensity: IntensityLevel) -> f32 {
    let s = intensity.scale();
    match op {
        OperatorKind::Watermark => 5.0 + 25.0 * s,
        OperatorKind::WatermarkTiled => 4.0 + 16.0 * s,
        OperatorKind::BackgroundColor => 3.0 + 12.0 * s,
        _ => 6.0 + 14.0 * s,
    }
}

/// Number of texture elements per page.
pub fn texture_density(intensity: IntensityLevel) -> f32 {
    150.0 + 350.0 * intensity.scale()
}

/// Added line spread (`\linespread{1 + delta}`).
pub fn spread_delta(intensity: IntensityLevel) -> f32 {
    0.3 * intensity.scale()
}

/// Inches of margin removed from a 1in layout.
pub fn margin_cut_in(intensity: IntensityLevel) -> f32 {
    0.1 + 0.35 * intensity.scale()
}

// ── Dispatch ─────────────────────────────────────────────────────────────

pub(super) fn apply(op: OperatorKind, input: &DocumentInput<'_>) -> Result<OperatorOutput, OperatorError> {
    let mut preamble: Vec<String> = Vec::new();
    let description = match op {
        OperatorKind::Watermark => watermark(input, &mut preamble),
        OperatorKind::WatermarkTiled => watermark_tiled(input, &mut preamble),
        OperatorKind::Texture => texture(input, &mut preamble),
        OperatorKind::BackgroundColor => background_color(input, &mut preamble),
        OperatorKind::LineSpacing => line_spacing(input, &mut preamble),
        OperatorKind::PageStructure => page_structure(op, input, &mut preamble)?,
        _ => {
            return Err(OperatorError::NotApplicable {
                operator: op.name().to_string(),
                region: crate::document::BlockId::new(0),
            })
        }
    };

    let mut patches: Vec<Patch> = preamble.into_iter().map(Patch::preamble).collect();
    let shielded = shield(op, &input.excluded, &mut patches);
    let description = if shielded > 0 {
        format!("{description}; {shielded} region(s) shielded")
    } else {
        description
    };
    Ok(OperatorOutput { patches, description })
}

// ── Operators ────────────────────────────────────────────────────────────

fn watermark(input: &DocumentInput<'_>, preamble: &mut Vec<String>) -> String {
    let text = input.params.text.as_deref().unwrap_or(DEFAULT_WATERMARK);
    let color = input.params.color.as_deref().unwrap_or("gray");
    let tint = tint_percent(OperatorKind::Watermark, input.intensity).round();
    let scale = 4.0 + 4.0 * input.intensity.scale();
    preamble.extend([USE_XCOLOR, USE_GRAPHICX, USE_ESO_PIC].map(String::from));
    preamble.push(format!(
        r"\AddToShipoutPictureBG{{\AtPageCenter{{\makebox(0,0){{\rotatebox{{45}}{{\scalebox{{{scale:.2}}}{{\textcolor{{{color}!{tint}}}{{{text}}}}}}}}}}}}}"
    ));
    format!("watermark '{text}' at {color}!{tint}, scale {scale:.2}")
}

fn watermark_tiled(input: &DocumentInput<'_>, preamble: &mut Vec<String>) -> String {
    let text = input.params.text.as_deref().unwrap_or(DEFAULT_WATERMARK);
    let color = input.params.color.as_deref().unwrap_or("gray");
    let tint = tint_percent(OperatorKind::WatermarkTiled, input.intensity).round();
    let rank = input.intensity.rank();
    let (cols, rows) = (2 + rank, 3 + rank);
    let g = input.geometry;
    let (cell_w, cell_h) = (g.width_pt / cols as f32, g.height_pt / rows as f32);

    let mut tiles = String::new();
    for r in 0..rows {
        // Alternate rows are offset by half a cell.
        let shift = if r % 2 == 1 { cell_w / 2.0 } else { 0.0 };
        for c in 0..cols {
            let x = (c as f32 + 0.5) * cell_w + shift;
            let y = (r as f32 + 0.5) * cell_h;
            let _ = write!(
                tiles,
                r"\put({x:.1},{y:.1}){{\makebox(0,0){{\rotatebox{{30}}{{\scalebox{{2}}{{\textcolor{{{color}!{tint}}}{{{text}}}}}}}}}}}"
            );
        }
    }
    preamble.extend([USE_XCOLOR, USE_GRAPHICX, USE_ESO_PIC].map(String::from));
    preamble.push(format!(
        r"\AddToShipoutPictureBG{{\setlength{{\unitlength}}{{1pt}}\AtPageLowerLeft{{{tiles}}}}}"
    ));
    format!("tiled watermark '{text}' {cols}x{rows} at {color}!{tint}")
}

fn texture(input: &DocumentInput<'_>, preamble: &mut Vec<String>) -> String {
    let pattern = input.params.pattern.as_deref().unwrap_or("dots");
    let color = input.params.color.as_deref().unwrap_or("gray");
    let tint = tint_percent(OperatorKind::Texture, input.intensity).round();
    let count = texture_density(input.intensity) as usize;
    let s = input.intensity.scale();
    let g = input.geometry;
    let mut rng = StdRng::seed_from_u64(input.seed);
    let ink = format!("{color}!{tint}");

    let body = match pattern {
        "lines" => {
            let step = 24.0 - 12.0 * s;
            rules(g, step, &ink, false)
        }
        "grid" => {
            let step = 36.0 - 18.0 * s;
            rules(g, step, &ink, true)
        }
        "wave" => wave(g, 30.0 - 14.0 * s, 2.0 + 3.0 * s, &ink),
        "circles" => {
            let mut out = String::new();
            for _ in 0..count / 10 {
                let (x, y) = (rng.gen_range(0.0..g.width_pt), rng.gen_range(0.0..g.height_pt));
                let r: f32 = rng.gen_range(4.0..20.0);
                let _ = write!(out, r"\draw[{ink},line width=0.4pt] ({x:.1}pt,{y:.1}pt) circle ({r:.1}pt);");
            }
            out
        }
        _ => {
            let mut out = String::new();
            for _ in 0..count {
                let (x, y) = (rng.gen_range(0.0..g.width_pt), rng.gen_range(0.0..g.height_pt));
                let r: f32 = rng.gen_range(0.6..1.4);
                let _ = write!(out, r"\fill[{ink}] ({x:.1}pt,{y:.1}pt) circle ({r:.2}pt);");
            }
            out
        }
    };
    preamble.extend([USE_XCOLOR, USE_TIKZ, USE_ESO_PIC].map(String::from));
    preamble.push(background_picture(&body));
    format!("{pattern} texture ({count} elements) at {ink}")
}

fn background_color(input: &DocumentInput<'_>, preamble: &mut Vec<String>) -> String {
    let mode = input.params.mode.as_deref().unwrap_or("full");
    let color = input.params.color.as_deref().unwrap_or("yellow");
    let tint = tint_percent(OperatorKind::BackgroundColor, input.intensity).round();
    let g = input.geometry;
    preamble.push(USE_XCOLOR.to_string());
    match mode {
        "gradient" => {
            preamble.extend([USE_TIKZ, USE_ESO_PIC].map(String::from));
            preamble.push(background_picture(&format!(
                r"\shade[top color={color}!{tint},bottom color=white] (0pt,0pt) rectangle ({:.1}pt,{:.1}pt);",
                g.width_pt, g.height_pt
            )));
        }
        "sections" => {
            let band = g.height_pt / 6.0;
            let mut body = String::new();
            for i in (0..6).step_by(2) {
                let y = i as f32 * band;
                let _ = write!(
                    body,
                    r"\fill[{color}!{tint}] (0pt,{y:.1}pt) rectangle ({:.1}pt,{:.1}pt);",
                    g.width_pt,
                    y + band
                );
            }
            preamble.extend([USE_TIKZ, USE_ESO_PIC].map(String::from));
            preamble.push(background_picture(&body));
        }
        _ => preamble.push(format!(r"\pagecolor{{{color}!{tint}}}")),
    }
    format!("{mode} background {color}!{tint}")
}

fn line_spacing(input: &DocumentInput<'_>, preamble: &mut Vec<String>) -> String {
    let delta = spread_delta(input.intensity);
    let factor = match input.params.mode.as_deref() {
        Some("tight") => 1.0 - 0.4 * delta,
        _ => 1.0 + delta,
    };
    preamble.push(format!(r"\linespread{{{factor:.3}}}"));
    format!("line spread {factor:.3}")
}

fn page_structure(
    op: OperatorKind,
    input: &DocumentInput<'_>,
    preamble: &mut Vec<String>,
) -> Result<String, OperatorError> {
    let s = input.intensity.scale();
    match input.params.mode.as_deref().unwrap_or("margins") {
        "headers" => {
            let text = input.params.text.as_deref().unwrap_or("Examination");
            let rule = 0.4 + 1.6 * s;
            preamble.push(r"\usepackage{fancyhdr}".to_string());
            preamble.push(format!(
                r"\pagestyle{{fancy}}\fancyhf{{}}\fancyhead[L]{{{text}}}\fancyhead[R]{{\thepage}}\fancyfoot[C]{{{text}}}\renewcommand{{\headrulewidth}}{{{rule:.2}pt}}\renewcommand{{\footrulewidth}}{{{rule:.2}pt}}"
            ));
            Ok(format!("headers '{text}' with {rule:.2}pt rules"))
        }
        "columns" => {
            if let Some(region) = input.floats.first() {
                return Err(OperatorError::MalformedFragment {
                    operator: op.name().to_string(),
                    region: *region,
                    detail: "floats cannot be set inside multicols".to_string(),
                });
            }
            let cols = 2 + usize::from(input.intensity >= IntensityLevel::Strong);
            preamble.push(r"\usepackage{multicol}".to_string());
            preamble.push(format!(
                r"\AtBeginDocument{{\begin{{multicols}}{{{cols}}}}}\AtEndDocument{{\end{{multicols}}}}"
            ));
            Ok(format!("{cols}-column layout"))
        }
        _ => {
            let margin = (input.geometry.margin_pt / 72.0 - margin_cut_in(input.intensity)).max(0.3);
            preamble.push(r"\usepackage{geometry}".to_string());
            preamble.push(format!(r"\geometry{{margin={margin:.2}in}}"));
            Ok(format!("margins reduced to {margin:.2}in"))
        }
    }
}

// ── Drawing helpers ──────────────────────────────────────────────────────

fn background_picture(tikz_body: &str) -> String {
    format!(
        r"\AddToShipoutPictureBG{{\AtPageLowerLeft{{\begin{{tikzpicture}}[overlay]{tikz_body}\end{{tikzpicture}}}}}}"
    )
}

fn rules(g: &PageGeometry, step: f32, ink: &str, vertical: bool) -> String {
    let mut out = String::new();
    let mut y = step;
    while y < g.height_pt {
        let _ = write!(out, r"\draw[{ink},line width=0.3pt] (0pt,{y:.1}pt) -- ({:.1}pt,{y:.1}pt);", g.width_pt);
        y += step;
    }
    if vertical {
        let mut x = step;
        while x < g.width_pt {
            let _ = write!(out, r"\draw[{ink},line width=0.3pt] ({x:.1}pt,0pt) -- ({x:.1}pt,{:.1}pt);", g.height_pt);
            x += step;
        }
    }
    out
}

fn wave(g: &PageGeometry, spacing: f32, amplitude: f32, ink: &str) -> String {
    let mut out = String::new();
    let mut base = spacing;
    while base < g.height_pt {
        let _ = write!(out, r"\draw[{ink},line width=0.4pt] (0pt,{base:.1}pt)");
        let mut x = 8.0f32;
        while x <= g.width_pt {
            let y = base + amplitude * (x / 24.0).sin();
            let _ = write!(out, " -- ({x:.1}pt,{y:.1}pt)");
            x += 8.0;
        }
        out.push(';');
        base += spacing;
    }
    out
}

// ── Shielding ────────────────────────────────────────────────────────────

/// Add region patches that keep `op` away from the excluded regions.
fn shield(op: OperatorKind, excluded: &[ShieldedRegion<'_>], patches: &mut Vec<Patch>) -> usize {
    let mut count = 0;
    for region in excluded {
        if region.kind != &BlockKind::Figure {
            continue;
        }
        let rewritten = match op {
            OperatorKind::Watermark
            | OperatorKind::WatermarkTiled
            | OperatorKind::Texture
            | OperatorKind::BackgroundColor => shield_graphics(region.source),
            OperatorKind::LineSpacing => reset_spacing(region.source),
            _ => None,
        };
        if let Some(source) = rewritten {
            if op != OperatorKind::LineSpacing && count == 0 {
                patches.push(Patch::preamble(USE_XCOLOR));
                patches.push(Patch::preamble(SHIELD_MACRO));
            }
            patches.push(Patch::Region {
                region: region.region,
                source,
            });
            count += 1;
        }
    }
    count
}

/// Wrap every `\includegraphics` in `\esshield{..}`. `None` when there is
/// nothing left to wrap.
pub fn shield_graphics(source: &str) -> Option<String> {
    const CMD: &str = r"\includegraphics";
    const WRAP: &str = r"\esshield{";
    let mut out = String::with_capacity(source.len() + 32);
    let mut rest = source;
    let mut wrapped = 0;
    while let Some(at) = rest.find(CMD) {
        let already = rest[..at].ends_with(WRAP);
        let mut end = at + CMD.len();
        if rest[end..].starts_with('*') {
            end += 1;
        }
        if rest[end..].starts_with('[') {
            end = match rest[end..].find(']') {
                Some(p) => end + p + 1,
                None => break,
            };
        }
        let Some(group_end) = balanced_group_end(rest, end) else {
            break;
        };
        out.push_str(&rest[..at]);
        if already {
            out.push_str(&rest[at..group_end]);
        } else {
            out.push_str(WRAP);
            out.push_str(&rest[at..group_end]);
            out.push('}');
            wrapped += 1;
        }
        rest = &rest[group_end..];
    }
    out.push_str(rest);
    (wrapped > 0).then_some(out)
}

fn reset_spacing(source: &str) -> Option<String> {
    let core = source.trim_end();
    if core.starts_with(SPACING_RESET) {
        return None;
    }
    Some(format!("{SPACING_RESET}{core}}}{}", &source[core.len()..]))
}
