//! A small LaTeX tokenizer for rewriting fragments without breaking them.
//!
//! Content operators need to touch individual glyphs while leaving command
//! arguments, dimensions, labels and alignment markup alone. The tokenizer
//! produces a tree that renders back to the exact input:
//!
//! ```text
//! x^2 + \frac{a}{b} \label{eq}
//! Char(x) Script(^, Char(2)) Raw( ) Char(+) Raw( ) Command(\frac)
//!   Group[transparent](a) Group[transparent](b) Raw( ) Command(\label) Group[opaque](eq)
//! ```
//!
//! A group is *transparent* when its content is ordinary math (or ordinary
//! text in text mode) and can be rewritten like the top level. Arguments of
//! commands outside the allow-lists (`\label`, `\hspace`, `\color`, ...) are
//! opaque and never modified.

use once_cell::sync::Lazy;
use regex::Regex;

/// Commands whose braced arguments hold ordinary math.
const MATH_ARG_COMMANDS: &[&str] = &[
    "frac", "dfrac", "tfrac", "sqrt", "binom", "overline", "underline", "hat", "bar", "vec",
    "tilde", "widehat", "widetilde", "dot", "ddot", "mathbf", "mathrm", "boldsymbol", "left",
    "right", "big", "Big", "bigg", "Bigg", "lim", "sum", "prod", "int", "overbrace",
    "underbrace",
];

/// Commands whose braced arguments hold ordinary text.
const TEXT_ARG_COMMANDS: &[&str] = &[
    "textbf", "textit", "textrm", "textsf", "emph", "underline", "section", "subsection",
    "subsubsection", "paragraph", "item", "mbox", "caption",
];

/// Commands followed by a bare TeX dimension (`\kern-0.05em`).
const DIMENSION_COMMANDS: &[&str] = &["kern", "mkern", "hskip", "mskip", "vskip", "raise", "lower"];

static RE_DIMENSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*[-+]?(?:\d+\.?\d*|\.\d+)\s*(?:em|ex|pt|mu|in|cm|mm|bp|sp)").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Math,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// One visible character.
    Char(char),
    /// Control word or symbol, including `[options]` and any dimension.
    Command(String),
    /// `{...}`.
    Group { content: Vec<Token>, transparent: bool },
    /// `^` or `_`, optional whitespace, then the argument.
    Script {
        marker: char,
        gap: String,
        arg: Box<Token>,
    },
    /// Whitespace, comments, `&`, `\\`: rendered verbatim, never rewritten.
    Raw(String),
}

impl Token {
    fn is_raw_space(&self) -> bool {
        matches!(self, Token::Raw(s) if s.chars().all(char::is_whitespace))
    }
}

/// A rewritable site handed to [`map_sites`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site<'a> {
    Char(char),
    Command(&'a str),
}

/// Tokenize a fragment. Fails on unbalanced braces or a dangling script.
pub fn parse(input: &str, mode: Mode) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;
    let tokens = parse_seq(&chars, &mut pos, mode, false)?;
    if pos != chars.len() {
        return Err(format!("unexpected '}}' at char {pos}"));
    }
    Ok(tokens)
}

fn parse_seq(chars: &[char], pos: &mut usize, mode: Mode, in_group: bool) -> Result<Vec<Token>, String> {
    let mut out: Vec<Token> = Vec::new();
    // Transparency inherited by groups that follow a command.
    let mut owner: Option<bool> = None;

    while *pos < chars.len() {
        let c = chars[*pos];
        match c {
            '}' => {
                if in_group {
                    return Ok(out);
                }
                return Err(format!("unbalanced '}}' at char {}", *pos));
            }
            '{' => {
                *pos += 1;
                let content = parse_seq(chars, pos, mode, true)?;
                if *pos >= chars.len() {
                    return Err("unterminated '{'".to_string());
                }
                *pos += 1;
                let transparent = owner.unwrap_or(true);
                out.push(Token::Group { content, transparent });
                continue;
            }
            '^' | '_' if mode == Mode::Math => {
                *pos += 1;
                let gap = take_while(chars, pos, |c| c.is_whitespace() && c != '\n');
                let arg = parse_script_arg(chars, pos, mode)?;
                out.push(Token::Script {
                    marker: c,
                    gap,
                    arg: Box::new(arg),
                });
                owner = None;
                continue;
            }
            '\\' => {
                let tok = parse_command(chars, pos);
                owner = match &tok {
                    Token::Command(name) => Some(arg_transparency(name, mode)),
                    _ => None,
                };
                out.push(tok);
                continue;
            }
            '%' => {
                let start = *pos;
                while *pos < chars.len() && chars[*pos] != '\n' {
                    *pos += 1;
                }
                out.push(Token::Raw(chars[start..*pos].iter().collect()));
                continue;
            }
            '&' => {
                *pos += 1;
                out.push(Token::Raw("&".into()));
                owner = None;
                continue;
            }
            c if c.is_whitespace() => {
                let ws = take_while(chars, pos, char::is_whitespace);
                out.push(Token::Raw(ws));
                continue;
            }
            _ => {
                *pos += 1;
                out.push(Token::Char(c));
                owner = None;
            }
        }
    }
    if in_group {
        return Err("unterminated '{'".to_string());
    }
    Ok(out)
}

fn take_while(chars: &[char], pos: &mut usize, f: impl Fn(char) -> bool) -> String {
    let start = *pos;
    while *pos < chars.len() && f(chars[*pos]) {
        *pos += 1;
    }
    chars[start..*pos].iter().collect()
}

fn parse_script_arg(chars: &[char], pos: &mut usize, mode: Mode) -> Result<Token, String> {
    match chars.get(*pos) {
        None => Err("script without argument".to_string()),
        Some('{') => {
            *pos += 1;
            let content = parse_seq(chars, pos, mode, true)?;
            if *pos >= chars.len() {
                return Err("unterminated '{'".to_string());
            }
            *pos += 1;
            Ok(Token::Group {
                content,
                transparent: true,
            })
        }
        Some('\\') => Ok(parse_command(chars, pos)),
        Some('}') | Some('^') | Some('_') => Err("script without argument".to_string()),
        Some(&c) => {
            *pos += 1;
            Ok(Token::Char(c))
        }
    }
}

/// Parse `\name[opts]` (plus a dimension for spacing commands), a control
/// symbol like `\,`, or the row break `\\` (returned as raw).
fn parse_command(chars: &[char], pos: &mut usize) -> Token {
    let start = *pos;
    *pos += 1;
    match chars.get(*pos) {
        None => return Token::Raw("\\".into()),
        Some('\\') => {
            *pos += 1;
            // Optional row spacing: \\[2pt]
            if chars.get(*pos) == Some(&'[') {
                if let Some(end) = chars[*pos..].iter().position(|&c| c == ']') {
                    *pos += end + 1;
                }
            }
            return Token::Raw(chars[start..*pos].iter().collect());
        }
        Some(c) if !c.is_ascii_alphabetic() => {
            *pos += 1;
            return Token::Command(chars[start..*pos].iter().collect());
        }
        _ => {}
    }
    while *pos < chars.len() && chars[*pos].is_ascii_alphabetic() {
        *pos += 1;
    }
    if chars.get(*pos) == Some(&'*') {
        *pos += 1;
    }
    let name: String = chars[start + 1..*pos].iter().collect();
    let name = name.trim_end_matches('*');

    if DIMENSION_COMMANDS.contains(&name) {
        let rest: String = chars[*pos..].iter().take(24).collect();
        if let Some(m) = RE_DIMENSION.find(&rest) {
            *pos += m.as_str().chars().count();
        }
    } else if chars.get(*pos) == Some(&'[') && name != "left" && name != "right" && !name.starts_with("big") && !name.starts_with("Big") {
        if let Some(end) = chars[*pos..].iter().position(|&c| c == ']') {
            *pos += end + 1;
        }
    }
    Token::Command(chars[start..*pos].iter().collect())
}

fn command_name(cmd: &str) -> &str {
    let body = cmd.trim_start_matches('\\');
    let end = body
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(body.len());
    &body[..end]
}

fn arg_transparency(cmd: &str, mode: Mode) -> bool {
    let name = command_name(cmd);
    match mode {
        Mode::Math => MATH_ARG_COMMANDS.contains(&name),
        Mode::Text => TEXT_ARG_COMMANDS.contains(&name),
    }
}

/// Render tokens back to LaTeX.
pub fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    render_into(tokens, &mut out);
    out
}

fn render_into(tokens: &[Token], out: &mut String) {
    for t in tokens {
        render_token(t, out);
    }
}

fn render_token(t: &Token, out: &mut String) {
    match t {
        Token::Char(c) => out.push(*c),
        Token::Command(s) | Token::Raw(s) => out.push_str(s),
        Token::Group { content, .. } => {
            out.push('{');
            render_into(content, out);
            out.push('}');
        }
        Token::Script { marker, gap, arg } => {
            out.push(*marker);
            out.push_str(gap);
            render_token(arg, out);
        }
    }
}

// ── Rewrites ─────────────────────────────────────────────────────────────

/// Replace rewritable sites. `f` returns the replacement LaTeX, or `None`
/// to leave the site alone. Replacements inside a script argument are
/// wrapped in braces automatically. Returns the number of replacements.
pub fn map_sites(tokens: &mut [Token], f: &mut impl FnMut(Site<'_>) -> Option<String>) -> usize {
    let mut count = 0;
    for t in tokens.iter_mut() {
        match t {
            Token::Char(c) => {
                if let Some(rep) = f(Site::Char(*c)) {
                    *t = Token::Raw(rep);
                    count += 1;
                }
            }
            Token::Command(cmd) => {
                if let Some(rep) = f(Site::Command(cmd)) {
                    *t = Token::Raw(rep);
                    count += 1;
                }
            }
            Token::Group {
                content,
                transparent: true,
            } => count += map_sites(content, f),
            Token::Script { arg, .. } => {
                let replacement = match arg.as_mut() {
                    Token::Char(c) => f(Site::Char(*c)),
                    Token::Command(cmd) => f(Site::Command(cmd)),
                    Token::Group {
                        content,
                        transparent: true,
                    } => {
                        count += map_sites(content, f);
                        None
                    }
                    _ => None,
                };
                if let Some(rep) = replacement {
                    let wrapped = if rep.starts_with('{') { rep } else { format!("{{{rep}}}") };
                    **arg = Token::Raw(wrapped);
                    count += 1;
                }
            }
            _ => {}
        }
    }
    count
}

/// Insert raw LaTeX between neighbouring atoms.
///
/// `gap(left, right)` is asked for every pair of adjacent tokens where the
/// left one is a character (or a completed script) and the right one is a
/// character or command; it never fires between a script marker and its
/// argument, or between a command and its arguments.
pub fn insert_between(tokens: &mut Vec<Token>, gap: &mut impl FnMut(char, Site<'_>) -> Option<String>) -> usize {
    let mut count = 0;
    for t in tokens.iter_mut() {
        if let Token::Group {
            content,
            transparent: true,
        } = t
        {
            count += insert_between(content, gap);
        }
    }

    let mut i = 0;
    while i + 1 < tokens.len() {
        // `\frac12`: an undelimited argument is glued to its command.
        if i > 0 && matches!(tokens[i - 1], Token::Command(_)) {
            i += 1;
            continue;
        }
        let left = match &tokens[i] {
            Token::Char(c) => Some(*c),
            Token::Script { .. } => Some('^'),
            _ => None,
        };
        let right = match &tokens[i + 1] {
            Token::Char(c) if !matches!(c, '\'' | '[' | ']') => Some(Site::Char(*c)),
            Token::Command(cmd) if command_name(cmd).len() > 1 => Some(Site::Command(cmd)),
            _ => None,
        };
        if let (Some(l), Some(r)) = (left, right) {
            if let Some(raw) = gap(l, r) {
                tokens.insert(i + 1, Token::Raw(raw));
                count += 1;
                i += 1;
            }
        }
        i += 1;
    }
    count
}

/// Insert raw LaTeX before the first non-whitespace token.
pub fn prepend(tokens: &mut Vec<Token>, raw: String) {
    let at = tokens.iter().position(|t| !t.is_raw_space()).unwrap_or(tokens.len());
    tokens.insert(at, Token::Raw(raw));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(s: &str, mode: Mode) {
        let toks = parse(s, mode).unwrap();
        assert_eq!(render(&toks), s);
    }

    #[test]
    fn renders_exactly() {
        roundtrip(r"f'(x) = \lim_{h \to 0} \frac{f(x+h) - f(x)}{h} \label{eq:def}", Mode::Math);
        roundtrip(r"x &= 1 \\[2pt] y^ 2 &= \kern-0.05em 3 % note", Mode::Math);
        roundtrip(r"\textbf{Q1.} Let \emph{n} be odd.", Mode::Text);
        roundtrip("a\u{200B}b", Mode::Math);
    }

    #[test]
    fn rejects_unbalanced() {
        assert!(parse(r"\frac{a}{b", Mode::Math).is_err());
        assert!(parse(r"a}", Mode::Math).is_err());
        assert!(parse(r"x^", Mode::Math).is_err());
    }

    #[test]
    fn label_argument_is_opaque() {
        let mut toks = parse(r"a \label{ab}", Mode::Math).unwrap();
        let n = map_sites(&mut toks, &mut |s| match s {
            Site::Char('a') => Some("A".into()),
            _ => None,
        });
        assert_eq!(n, 1);
        assert_eq!(render(&toks), r"A \label{ab}");
    }

    #[test]
    fn frac_arguments_are_transparent() {
        let mut toks = parse(r"\frac{a}{b}", Mode::Math).unwrap();
        map_sites(&mut toks, &mut |s| match s {
            Site::Char(c) => Some(c.to_ascii_uppercase().to_string()),
            _ => None,
        });
        assert_eq!(render(&toks), r"\frac{A}{B}");
    }

    #[test]
    fn script_replacements_are_braced() {
        let mut toks = parse("x^n", Mode::Math).unwrap();
        map_sites(&mut toks, &mut |s| match s {
            Site::Char('n') => Some(r"\mathsf{n}".into()),
            _ => None,
        });
        assert_eq!(render(&toks), r"x^{\mathsf{n}}");
    }

    #[test]
    fn kern_dimension_stays_with_command() {
        let toks = parse(r"\kern-0.06em x", Mode::Math).unwrap();
        assert_eq!(toks[0], Token::Command(r"\kern-0.06em".into()));
    }

    #[test]
    fn gaps_skip_scripts_and_arguments() {
        let mut toks = parse(r"ab^2\frac{c}{d}", Mode::Math).unwrap();
        insert_between(&mut toks, &mut |_, _| Some("|".into()));
        // a|b^2|\frac{c}{d}: nothing between b and ^, nor \frac and {c}
        assert_eq!(render(&toks), r"a|b^2|\frac{c}{d}");
    }

    #[test]
    fn gaps_never_split_undelimited_arguments() {
        let mut toks = parse(r"\frac12 x", Mode::Math).unwrap();
        let n = insert_between(&mut toks, &mut |_, _| Some("|".into()));
        assert_eq!(n, 0);
        assert_eq!(render(&toks), r"\frac12 x");
    }

    #[test]
    fn prepend_skips_leading_space() {
        let mut toks = parse("\n  x", Mode::Math).unwrap();
        prepend(&mut toks, "N".into());
        assert_eq!(render(&toks), "\n  Nx");
    }
}
