//! Response normalisation: deterministic cleanup before scoring.
//!
//! Models wrap the same content in very different packaging: Markdown
//! fences, `**bold**` headings, `\(…\)` versus `$…$`, Unicode minus signs,
//! zero-width characters copied from the page. None of that says anything
//! about whether the content was read correctly, so it is removed before
//! the scorer compares tokens.
//!
//! Ground truth goes through the same [`normalize_response`] pass, which
//! keeps the comparison symmetric.
//!
//! ## Rule Order
//!
//! Fences are stripped before line endings are normalised so that the fence
//! regex sees the raw text; invisible characters go before whitespace is
//! collapsed so that a zero-width space between two letters does not turn
//! into a word break.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every normalisation rule to a model response.
///
/// Rules (applied in order):
/// 1. Strip outer code fences
/// 2. Normalise line endings
/// 3. Remove invisible Unicode
/// 4. Strip Markdown decoration (headings, emphasis, list bullets)
/// 5. Remove math delimiters
/// 6. Fold Unicode math symbols to their LaTeX spelling
/// 7. Collapse whitespace
pub fn normalize_response(input: &str) -> String {
    let s = strip_fences(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    let s = strip_markdown(&s);
    let s = strip_math_delimiters(&s);
    let s = fold_unicode_math(&s);
    collapse_whitespace(&s)
}

/// Tokens of an answer or of a response searched for answers.
///
/// Sizing commands and thin spaces go, `\dfrac`/`\tfrac` become `\frac`,
/// and word breaks survive tokenisation, so `x = 15` stays `[x, =, 15]`.
/// Trailing punctuation is dropped.
pub fn answer_tokens(input: &str) -> Vec<String> {
    let s = normalize_response(input);
    let s = RE_SIZING.replace_all(&s, "");
    let s = s.replace(r"\dfrac", r"\frac").replace(r"\tfrac", r"\frac");
    let s = RE_THIN_SPACE.replace_all(&s, " ");
    let mut toks = tokens(&s);
    while toks.last().is_some_and(|t| matches!(t.as_str(), "." | "," | ";")) {
        toks.pop();
    }
    toks
}

/// Split normalised text into comparison tokens: LaTeX commands, words,
/// numbers and single symbols, lowercased.
pub fn tokens(input: &str) -> Vec<String> {
    RE_TOKEN
        .find_iter(input)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

// ── Rule 1: Strip outer fences ───────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Remove invisible Unicode ─────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{2061}',
            '\u{2062}', '\u{2063}',
        ],
        "",
    )
}

// ── Rule 4: Strip Markdown decoration ────────────────────────────────────

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+").unwrap());
static RE_BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*(?:[-*+]|\d+[.)])[ \t]+").unwrap());
static RE_EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*|__|`").unwrap());

fn strip_markdown(input: &str) -> String {
    let s = RE_HEADING.replace_all(input, "");
    let s = RE_BULLET.replace_all(&s, "");
    RE_EMPHASIS.replace_all(&s, "").into_owned()
}

// ── Rule 5: Remove math delimiters ───────────────────────────────────────

static RE_MATH_DELIMS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\$?|\\\(|\\\)|\\\[|\\\]").unwrap());

fn strip_math_delimiters(input: &str) -> String {
    RE_MATH_DELIMS.replace_all(input, " ").into_owned()
}

// ── Rule 6: Fold Unicode math ────────────────────────────────────────────

const UNICODE_MATH: &[(char, &str)] = &[
    ('−', "-"),
    ('–', "-"),
    ('×', r"\times "),
    ('·', r"\cdot "),
    ('÷', r"\div "),
    ('≤', r"\leq "),
    ('≥', r"\geq "),
    ('≠', r"\neq "),
    ('≈', r"\approx "),
    ('∞', r"\infty "),
    ('∫', r"\int "),
    ('∑', r"\sum "),
    ('∏', r"\prod "),
    ('√', r"\sqrt "),
    ('∂', r"\partial "),
    ('∇', r"\nabla "),
    ('π', r"\pi "),
    ('θ', r"\theta "),
    ('λ', r"\lambda "),
    ('μ', r"\mu "),
    ('σ', r"\sigma "),
    ('α', r"\alpha "),
    ('β', r"\beta "),
    ('→', r"\to "),
    ('∈', r"\in "),
];

fn fold_unicode_math(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match UNICODE_MATH.iter().find(|(u, _)| *u == c) {
            Some((_, latex)) => out.push_str(latex),
            None => out.push(c),
        }
    }
    out
}

// ── Rule 7: Collapse whitespace ──────────────────────────────────────────

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn collapse_whitespace(input: &str) -> String {
    RE_WHITESPACE.replace_all(input.trim(), " ").into_owned()
}

// ── Answers and tokens ───────────────────────────────────────────────────

static RE_SIZING: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\(?:left|right|big|Big|bigg|Bigg)\b").unwrap());
static RE_THIN_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[,;:! ]").unwrap());
static RE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\[A-Za-z]+|[A-Za-z]+|\d+(?:\.\d+)?|[^\s\w]").unwrap());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```latex\nx^2\n```"), "x^2");
        assert_eq!(strip_fences("```\nplain\n```"), "plain");
        assert_eq!(strip_fences("no fences"), "no fences");
    }

    #[test]
    fn markdown_decoration_is_removed() {
        let out = normalize_response("## Problem 1\n\n**Find** the `derivative`.\n- step one");
        assert_eq!(out, "Problem 1 Find the derivative. step one");
    }

    #[test]
    fn math_delimiters_and_unicode_fold() {
        assert_eq!(normalize_response(r"\(x − 1\) ≤ $y$"), r"x - 1 \leq y");
    }

    #[test]
    fn invisible_characters_do_not_split_words() {
        assert_eq!(normalize_response("f\u{200B}(x) = y\u{2062}z"), "f(x) = yz");
    }

    #[test]
    fn answer_tokens_keep_number_boundaries() {
        assert_eq!(answer_tokens("$x=15$."), vec!["x", "=", "15"]);
        assert_eq!(answer_tokens(r"y = \dfrac{1}{2}"), answer_tokens(r"y=\frac{1}{2}"));
        assert_eq!(answer_tokens("1.5"), vec!["1.5"]);
        assert_eq!(answer_tokens(r"$x = \dfrac{1}{2}.$"), answer_tokens(r"x=\frac{1}{2}"));
        assert_eq!(answer_tokens(r"\left( 3, 4 \right)"), vec!["(", "3", ",", "4", ")"]);
        assert_ne!(answer_tokens("x = 2"), answer_tokens("x = 3"));
    }

    #[test]
    fn tokenizer_splits_commands_words_and_symbols() {
        assert_eq!(
            tokens(r"\frac{a}{2} + Bx"),
            ["\\frac", "{", "a", "}", "{", "2", "}", "+", "bx"]
        );
        assert!(tokens("   ").is_empty());
    }
}
