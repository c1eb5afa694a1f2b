//! Source documents: LaTeX exam templates split into content blocks.
//!
//! A [`SourceDocument`] is the immutable input of every experiment. Parsing
//! splits the template into three parts:
//!
//! ```text
//! preamble   everything up to and including \begin{document} (+ whitespace)
//! blocks     the body, segmented into text / math / figure blocks
//! postamble  \end{document} and anything after it
//! ```
//!
//! Concatenating `preamble + blocks[*].source + postamble` reproduces the
//! template byte for byte. Segmentation is total: an unterminated `$` or an
//! unmatched `\begin{..}` never fails the parse; the surrounding text block
//! simply carries a warning.
//!
//! Ground truth is derived once at parse time and never changes afterwards.
//! Known answers and topic keywords come from directive comments:
//!
//! ```latex
//! %%ANSWER: 12%%
//! %%KEYWORDS: derivative, chain rule%%
//! ```

use crate::error::ExamShieldError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Display-math environments recognised as math blocks.
pub const MATH_ENVIRONMENTS: &[&str] = &[
    "equation",
    "equation*",
    "align",
    "align*",
    "gather",
    "gather*",
    "multline",
    "multline*",
    "eqnarray",
    "eqnarray*",
    "displaymath",
    "array",
    "matrix",
    "pmatrix",
    "bmatrix",
    "vmatrix",
];

const FIGURE_ENVIRONMENTS: &[&str] = &["figure", "figure*", "wrapfigure"];

// ── Identifiers ──────────────────────────────────────────────────────────

/// Stable identifier of a content block, and of the region derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

// ── Blocks ───────────────────────────────────────────────────────────────

/// What a block contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Math {
        /// `true` for `$$`, `\[`, and math environments.
        display: bool,
        /// Environment name for `\begin{env}` blocks.
        env: Option<String>,
    },
    Figure,
}

/// Coarse class of a block, used by operator capability declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Text,
    Math,
    Figure,
}

impl BlockKind {
    pub fn region_kind(&self) -> RegionKind {
        match self {
            BlockKind::Text => RegionKind::Text,
            BlockKind::Math { .. } => RegionKind::Math,
            BlockKind::Figure => RegionKind::Figure,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RegionKind::Text => "text",
            RegionKind::Math => "math",
            RegionKind::Figure => "figure",
        })
    }
}

/// Approximate placement of a block, in points.
///
/// `top` is measured along the text flow: page 1 occupies
/// `[0, text_height)`, page 2 `[text_height, 2 * text_height)` and so on.
/// Using a single flow axis makes "regions do not overlap" a plain interval
/// check even for blocks that straddle a page break.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub page: u32,
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Interior intersection; touching edges do not count.
    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        let vertical = self.top < other.bottom() && other.top < self.bottom();
        let horizontal =
            self.left < other.left + other.width && other.left < self.left + self.width;
        vertical && horizontal && self.height > 0.0 && other.height > 0.0
    }
}

/// One contiguous slice of the document body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub id: BlockId,
    #[serde(flatten)]
    pub kind: BlockKind,
    /// Exact template text, including trailing whitespace.
    pub source: String,
    pub page: u32,
    pub bbox: BoundingBox,
    /// Set when segmentation hit malformed markup inside this block.
    pub warning: Option<String>,
}

// ── Page geometry ────────────────────────────────────────────────────────

/// Page layout assumptions used to estimate block placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageGeometry {
    pub width_pt: f32,
    pub height_pt: f32,
    pub margin_pt: f32,
    pub font_size_pt: f32,
}

impl Default for PageGeometry {
    /// US letter, 1in margins, 11pt.
    fn default() -> Self {
        Self {
            width_pt: 612.0,
            height_pt: 792.0,
            margin_pt: 72.0,
            font_size_pt: 11.0,
        }
    }
}

static RE_DOCUMENTCLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\documentclass(?:\[([^\]]*)\])?\{([^}]*)\}").unwrap());
static RE_GEOMETRY_MARGIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\usepackage\[[^\]]*margin\s*=\s*([0-9.]+)\s*(in|cm|mm|pt)[^\]]*\]\{geometry\}")
        .unwrap()
});
static RE_PAPER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\ba4paper\b").unwrap());
static RE_FONT_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(10|11|12)pt\b").unwrap());

impl PageGeometry {
    /// Read paper size, font size and margins from the preamble.
    pub fn from_preamble(preamble: &str) -> Self {
        let mut g = Self::default();
        if let Some(caps) = RE_DOCUMENTCLASS.captures(preamble) {
            let opts = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            if RE_PAPER.is_match(opts) {
                g.width_pt = 595.0;
                g.height_pt = 842.0;
            }
            if let Some(size) = RE_FONT_SIZE.captures(opts) {
                g.font_size_pt = size[1].parse().unwrap_or(g.font_size_pt);
            }
        }
        if let Some(caps) = RE_GEOMETRY_MARGIN.captures(preamble) {
            if let Ok(value) = caps[1].parse::<f32>() {
                let factor = match &caps[2] {
                    "in" => 72.0,
                    "cm" => 28.35,
                    "mm" => 2.835,
                    _ => 1.0,
                };
                g.margin_pt = (value * factor).clamp(0.0, g.width_pt / 3.0);
            }
        }
        g
    }

    pub fn text_width(&self) -> f32 {
        self.width_pt - 2.0 * self.margin_pt
    }

    pub fn text_height(&self) -> f32 {
        self.height_pt - 2.0 * self.margin_pt
    }

    pub fn line_height(&self) -> f32 {
        self.font_size_pt * 1.2
    }

    /// Average glyph advance at this font size.
    pub fn char_width(&self) -> f32 {
        self.font_size_pt * 0.5
    }

    pub fn chars_per_line(&self) -> usize {
        ((self.text_width() / self.char_width()).floor() as usize).max(1)
    }
}

// ── Ground truth ─────────────────────────────────────────────────────────

/// The semantic content a model is expected to recover.
///
/// Attacks only change presentation, so every variant shares its source's
/// ground truth unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruth {
    /// Literal content: text with markup removed, math source verbatim.
    pub transcription: String,
    /// Known answers for solve tasks.
    pub answers: Vec<String>,
    /// Topic words that a correct explanation should mention.
    pub keywords: Vec<String>,
}

static RE_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*%+[ \t]*(ANSWER|KEYWORDS)[ \t]*:[ \t]*(.*?)[ \t]*%*[ \t]*$").unwrap()
});

impl GroundTruth {
    fn from_template(text: &str, blocks: &[ContentBlock]) -> Self {
        let mut answers = Vec::new();
        let mut keywords = Vec::new();
        for caps in RE_DIRECTIVE.captures_iter(text) {
            let value = caps[2].trim();
            if value.is_empty() {
                continue;
            }
            match &caps[1] {
                "ANSWER" => answers.push(value.to_string()),
                _ => keywords.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(str::to_string),
                ),
            }
        }

        let transcription = blocks
            .iter()
            .map(|b| match &b.kind {
                BlockKind::Text => plain_text(&b.source),
                BlockKind::Math { .. } => match Fragment::split(b) {
                    Some(f) => math_literal(&f.inner),
                    None => math_literal(&b.source),
                },
                BlockKind::Figure => figure_caption(&b.source).map(|c| plain_text(&c)).unwrap_or_default(),
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            transcription,
            answers,
            keywords,
        }
    }
}

// ── Source document ──────────────────────────────────────────────────────

/// An immutable, parsed exam template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub preamble: String,
    pub blocks: Vec<ContentBlock>,
    pub postamble: String,
    pub ground_truth: GroundTruth,
    pub geometry: PageGeometry,
}

impl SourceDocument {
    /// Read and parse a template file. The document id is the file stem.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ExamShieldError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExamShieldError::TemplateNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ExamShieldError::TemplateRead {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "template".to_string());
        Self::parse(id, &text)
    }

    /// Parse template text.
    ///
    /// Fails only when there is no `\begin{document}`; malformed markup in
    /// the body is tolerated and flagged per block.
    pub fn parse(id: impl Into<String>, text: &str) -> Result<Self, ExamShieldError> {
        let id = id.into();
        let begin = text
            .find(r"\begin{document}")
            .ok_or_else(|| ExamShieldError::MissingDocumentBody { name: id.clone() })?;
        let mut body_start = begin + r"\begin{document}".len();
        body_start += text[body_start..].len() - text[body_start..].trim_start().len();
        let body_end = text[body_start..]
            .find(r"\end{document}")
            .map(|i| body_start + i)
            .unwrap_or(text.len());

        let preamble = text[..body_start].to_string();
        let body = &text[body_start..body_end];
        let postamble = text[body_end..].to_string();
        let geometry = PageGeometry::from_preamble(&preamble);

        let blocks = layout_blocks(segment_body(body), body, &geometry);
        let ground_truth = GroundTruth::from_template(text, &blocks);

        Ok(Self {
            id,
            preamble,
            blocks,
            postamble,
            ground_truth,
            geometry,
        })
    }

    /// Replace the known answers (e.g. from an answer key file).
    pub fn with_answers(mut self, answers: Vec<String>) -> Self {
        self.ground_truth.answers = answers;
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.ground_truth.keywords = keywords;
        self
    }

    /// The body exactly as it appears in the template.
    pub fn body(&self) -> String {
        self.blocks.iter().map(|b| b.source.as_str()).collect()
    }

    /// The full template text.
    pub fn to_latex(&self) -> String {
        let mut out = String::with_capacity(self.preamble.len() + self.postamble.len() + 4096);
        out.push_str(&self.preamble);
        for b in &self.blocks {
            out.push_str(&b.source);
        }
        out.push_str(&self.postamble);
        out
    }

    pub fn block(&self, id: BlockId) -> Option<&ContentBlock> {
        self.blocks.get(id.index()).filter(|b| b.id == id)
    }
}

// ── Fragments ────────────────────────────────────────────────────────────

/// A block's source split into delimiter, content and trailing whitespace.
///
/// Content operators rewrite `inner` only, so delimiters survive any chain
/// of operators and the block can be split again by the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub open: String,
    pub inner: String,
    pub close: String,
    pub trailing: String,
}

impl Fragment {
    /// Split an original block.
    pub fn split(block: &ContentBlock) -> Option<Self> {
        Self::split_source(&block.kind, &block.source)
    }

    /// Split a (possibly already rewritten) source for a block of `kind`.
    pub fn split_source(kind: &BlockKind, source: &str) -> Option<Self> {
        let core = source.trim_end();
        let trailing = source[core.len()..].to_string();
        let (open, close) = match kind {
            BlockKind::Math { env: Some(env), .. } => {
                (format!(r"\begin{{{env}}}"), format!(r"\end{{{env}}}"))
            }
            BlockKind::Math { .. } => {
                let pair = [("$$", "$$"), (r"\[", r"\]"), (r"\(", r"\)"), ("$", "$")]
                    .into_iter()
                    .find(|(o, c)| core.len() >= o.len() + c.len() && core.starts_with(o) && core.ends_with(c))?;
                (pair.0.to_string(), pair.1.to_string())
            }
            BlockKind::Text | BlockKind::Figure => (String::new(), String::new()),
        };
        if !core.starts_with(&open) || !core.ends_with(&close) || core.len() < open.len() + close.len() {
            return None;
        }
        let mut open = open;
        // `\begin{array}{cc}`: the column spec belongs to the delimiter.
        if matches!(kind, BlockKind::Math { env: Some(env), .. } if env == "array")
            && core[open.len()..].starts_with('{')
        {
            let end = balanced_group_end(core, open.len())?;
            if end > core.len() - close.len() {
                return None;
            }
            open = core[..end].to_string();
        }
        let inner = core[open.len()..core.len() - close.len()].to_string();
        Some(Self {
            open,
            inner,
            close,
            trailing,
        })
    }

    pub fn join(&self) -> String {
        format!("{}{}{}{}", self.open, self.inner, self.close, self.trailing)
    }
}

/// Index just past the `}` closing the group opened at `open_idx`.
pub fn balanced_group_end(s: &str, open_idx: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    if bytes.get(open_idx) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut i = open_idx;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// `true` when every unescaped `{` has a matching `}`.
pub fn braces_balanced(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut depth: i64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
        i += 1;
    }
    depth == 0
}

// ── Segmentation ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct RawSegment {
    kind: BlockKind,
    start: usize,
    end: usize,
    warning: Option<String>,
}

fn find_from(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

/// Position of the next unescaped `$` before any blank line.
fn find_inline_dollar(bytes: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'$' => return Some(i),
            b'\n' if blank_line_run(bytes, i).is_some() => return None,
            _ => {}
        }
        i += 1;
    }
    None
}

/// If a blank line starts at `i` (a `\n` followed by whitespace and another
/// `\n`), return the index after the whole run of blank lines.
fn blank_line_run(bytes: &[u8], i: usize) -> Option<usize> {
    if bytes.get(i) != Some(&b'\n') {
        return None;
    }
    let mut j = i + 1;
    let mut end = None;
    while j < bytes.len() {
        match bytes[j] {
            b'\n' => {
                end = Some(j + 1);
            }
            b' ' | b'\t' | b'\r' => {}
            _ => break,
        }
        j += 1;
    }
    end
}

fn read_env_name(bytes: &[u8], brace: usize) -> Option<(String, usize)> {
    let close = find_from(bytes, brace, b"}")?;
    let name = std::str::from_utf8(&bytes[brace + 1..close]).ok()?;
    Some((name.to_string(), close + 1))
}

fn push_special(
    segs: &mut Vec<RawSegment>,
    text_start: &mut usize,
    text_warning: &mut Option<String>,
    kind: BlockKind,
    start: usize,
    end: usize,
) {
    if *text_start < start {
        segs.push(RawSegment {
            kind: BlockKind::Text,
            start: *text_start,
            end: start,
            warning: text_warning.take(),
        });
    }
    segs.push(RawSegment {
        kind,
        start,
        end,
        warning: None,
    });
    *text_start = end;
}

/// Split a document body into contiguous raw segments covering all of it.
fn segment_body(body: &str) -> Vec<RawSegment> {
    let bytes = body.as_bytes();
    let mut segs: Vec<RawSegment> = Vec::new();
    let mut text_start = 0usize;
    let mut text_warning: Option<String> = None;
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                i = find_from(bytes, i, b"\n").unwrap_or(bytes.len());
            }
            b'\n' => {
                if let Some(end) = blank_line_run(bytes, i) {
                    segs.push(RawSegment {
                        kind: BlockKind::Text,
                        start: text_start,
                        end,
                        warning: text_warning.take(),
                    });
                    text_start = end;
                    i = end;
                } else {
                    i += 1;
                }
            }
            b'$' => {
                let display = bytes.get(i + 1) == Some(&b'$');
                let close = if display {
                    find_from(bytes, i + 2, b"$$").map(|p| p + 2)
                } else {
                    find_inline_dollar(bytes, i + 1).map(|p| p + 1)
                };
                match close {
                    Some(end) => {
                        push_special(
                            &mut segs,
                            &mut text_start,
                            &mut text_warning,
                            BlockKind::Math { display, env: None },
                            i,
                            end,
                        );
                        i = end;
                    }
                    None => {
                        text_warning.get_or_insert_with(|| "unterminated `$`".to_string());
                        i += if display { 2 } else { 1 };
                    }
                }
            }
            b'\\' => {
                let rest = &bytes[i..];
                if rest.starts_with(br"\(") || rest.starts_with(br"\[") {
                    let display = rest[1] == b'[';
                    let closer: &[u8] = if display { br"\]" } else { br"\)" };
                    match find_from(bytes, i + 2, closer) {
                        Some(p) => {
                            let end = p + 2;
                            push_special(
                                &mut segs,
                                &mut text_start,
                                &mut text_warning,
                                BlockKind::Math { display, env: None },
                                i,
                                end,
                            );
                            i = end;
                        }
                        None => {
                            text_warning.get_or_insert_with(|| {
                                format!("unterminated `{}`", if display { r"\[" } else { r"\(" })
                            });
                            i += 2;
                        }
                    }
                } else if rest.starts_with(br"\begin{") {
                    let brace = i + r"\begin".len();
                    let Some((env, after)) = read_env_name(bytes, brace) else {
                        text_warning.get_or_insert_with(|| r"unterminated `\begin{`".to_string());
                        i = brace + 1;
                        continue;
                    };
                    let is_math = MATH_ENVIRONMENTS.contains(&env.as_str());
                    let is_figure = FIGURE_ENVIRONMENTS.contains(&env.as_str());
                    if !is_math && !is_figure {
                        i = after;
                        continue;
                    }
                    let closer = format!(r"\end{{{env}}}");
                    match find_from(bytes, after, closer.as_bytes()) {
                        Some(p) => {
                            let end = p + closer.len();
                            let kind = if is_math {
                                BlockKind::Math {
                                    display: true,
                                    env: Some(env),
                                }
                            } else {
                                BlockKind::Figure
                            };
                            push_special(&mut segs, &mut text_start, &mut text_warning, kind, i, end);
                            i = end;
                        }
                        None => {
                            text_warning.get_or_insert_with(|| format!(r"unmatched `\begin{{{env}}}`"));
                            i = after;
                        }
                    }
                } else if rest.starts_with(br"\includegraphics") {
                    let mut j = i + r"\includegraphics".len();
                    if bytes.get(j) == Some(&b'[') {
                        j = find_from(bytes, j, b"]").map(|p| p + 1).unwrap_or(j);
                    }
                    match balanced_group_end(body, j) {
                        Some(end) => {
                            push_special(
                                &mut segs,
                                &mut text_start,
                                &mut text_warning,
                                BlockKind::Figure,
                                i,
                                end,
                            );
                            i = end;
                        }
                        None => {
                            text_warning.get_or_insert_with(|| r"malformed `\includegraphics`".to_string());
                            i = j;
                        }
                    }
                } else {
                    // Control word or escaped symbol.
                    i += 1;
                    if i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                        while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                            i += 1;
                        }
                    } else {
                        i += 1;
                    }
                }
            }
            _ => i += 1,
        }
    }
    if text_start < bytes.len() {
        segs.push(RawSegment {
            kind: BlockKind::Text,
            start: text_start,
            end: bytes.len(),
            warning: text_warning.take(),
        });
    }

    merge_whitespace_segments(segs, body)
}

/// Fold whitespace-only text segments into a neighbour so that every block
/// has visible content.
fn merge_whitespace_segments(segs: Vec<RawSegment>, body: &str) -> Vec<RawSegment> {
    let mut out: Vec<RawSegment> = Vec::with_capacity(segs.len());
    let mut carry_start: Option<usize> = None;
    for mut seg in segs {
        let blank = seg.kind == BlockKind::Text && body[seg.start..seg.end].trim().is_empty();
        if blank {
            if let Some(prev) = out.last_mut() {
                prev.end = seg.end;
                if prev.warning.is_none() {
                    prev.warning = seg.warning;
                }
            } else {
                carry_start.get_or_insert(seg.start);
            }
            continue;
        }
        if let Some(start) = carry_start.take() {
            seg.start = start;
        }
        out.push(seg);
    }
    if let Some(start) = carry_start {
        out.push(RawSegment {
            kind: BlockKind::Text,
            start,
            end: body.len(),
            warning: None,
        });
    }
    out
}

// ── Layout estimate ──────────────────────────────────────────────────────

/// Number of text lines a block occupies in the stacked layout.
pub(crate) fn estimated_lines(kind: &BlockKind, source: &str, geometry: &PageGeometry) -> usize {
    match kind {
        BlockKind::Text => {
            let chars = plain_text(source).chars().count();
            chars.div_ceil(geometry.chars_per_line()).max(1)
        }
        BlockKind::Math { display, .. } => {
            let rows = source.matches(r"\\").count() + 1;
            let tall = ["\\frac", "\\sum", "\\int", "\\prod", "\\binom", "matrix"]
                .iter()
                .any(|t| source.contains(t));
            let per_row = if tall { 2 } else { 1 };
            rows * per_row + usize::from(*display)
        }
        BlockKind::Figure => figure_lines(source, geometry),
    }
}

static RE_FIG_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(width|height)\s*=\s*([0-9.]+)\s*(\\textwidth|\\linewidth|in|cm|pt)?").unwrap()
});

fn figure_lines(source: &str, geometry: &PageGeometry) -> usize {
    let mut height_pt = geometry.text_width() * 0.5;
    if let Some(caps) = RE_FIG_SIZE.captures(source) {
        let value: f32 = caps[2].parse().unwrap_or(0.5);
        let unit = caps.get(3).map(|m| m.as_str()).unwrap_or("pt");
        let pts = match unit {
            r"\textwidth" | r"\linewidth" => value * geometry.text_width(),
            "in" => value * 72.0,
            "cm" => value * 28.35,
            _ => value,
        };
        // Images are assumed 4:3 when only the width is known.
        height_pt = if &caps[1] == "width" { pts * 0.75 } else { pts };
    }
    let caption = usize::from(source.contains(r"\caption"));
    ((height_pt / geometry.line_height()).ceil() as usize).max(1) + caption + 1
}

fn layout_blocks(segs: Vec<RawSegment>, body: &str, geometry: &PageGeometry) -> Vec<ContentBlock> {
    let line_h = geometry.line_height();
    let page_h = geometry.text_height();
    let mut cursor = 0.0f32;
    let mut blocks = Vec::with_capacity(segs.len());

    for (n, seg) in segs.into_iter().enumerate() {
        let source = body[seg.start..seg.end].to_string();
        let lines = estimated_lines(&seg.kind, &source, geometry);
        let height = lines as f32 * line_h;

        // A block that fits on one page is pushed to the next page rather
        // than split across the break.
        let page_offset = cursor % page_h;
        if height <= page_h && page_offset + height > page_h {
            cursor += page_h - page_offset;
        }
        let page = (cursor / page_h).floor() as u32 + 1;

        blocks.push(ContentBlock {
            id: BlockId::new(n as u32),
            kind: seg.kind,
            source,
            page,
            bbox: BoundingBox {
                page,
                left: 0.0,
                top: cursor,
                width: geometry.text_width(),
                height,
            },
            warning: seg.warning,
        });
        cursor += height;
    }
    blocks
}

// ── Text extraction ──────────────────────────────────────────────────────

static RE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)(^|[^\\])%.*$").unwrap());
static RE_KEEP_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\\(?:textbf|textit|textrm|texttt|textsf|emph|underline|text|mbox|section|subsection|subsubsection|paragraph|caption|title)\*?\{([^{}]*)\}",
    )
    .unwrap()
});
static RE_DROP_WITH_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\\(?:vspace|hspace|label|ref|eqref|cite|begin|end|includegraphics|setlength|centering|newpage|pagebreak|maketitle|noindent|item)\*?(?:\[[^\]]*\])?(?:\{[^{}]*\})?",
    )
    .unwrap()
});
static RE_COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[A-Za-z]+\*?").unwrap());
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_MATH_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\label\{[^{}]*\}|\\nonumber|\\notag").unwrap());

/// Text with comments, markup commands and braces removed.
pub fn plain_text(source: &str) -> String {
    let s = RE_COMMENT.replace_all(source, "$1");
    let s = s.replace(r"\\", " ").replace('~', " ");
    let mut s = s.to_string();
    loop {
        let next = RE_KEEP_ARG.replace_all(&s, "$1").to_string();
        if next == s {
            break;
        }
        s = next;
    }
    let s = RE_DROP_WITH_ARG.replace_all(&s, " ");
    let s = RE_COMMAND.replace_all(&s, " ");
    let s = s.replace(['{', '}'], "").replace(r"\%", "%").replace(r"\$", "$");
    RE_SPACES.replace_all(s.trim(), " ").to_string()
}

/// Math source as a model should transcribe it: labels removed, spacing
/// collapsed, everything else verbatim.
pub fn math_literal(inner: &str) -> String {
    let s = RE_MATH_LABEL.replace_all(inner, " ");
    RE_SPACES.replace_all(s.trim(), " ").to_string()
}

/// Content of the first `\caption{...}` in a figure.
pub fn figure_caption(source: &str) -> Option<String> {
    let at = source.find(r"\caption")?;
    let brace = at + source[at..].find('{')?;
    let end = balanced_group_end(source, brace)?;
    Some(source[brace + 1..end - 1].to_string())
}
