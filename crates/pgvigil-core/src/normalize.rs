//! Lexical normalization of SQL statements into canonical shapes.
//!
//! Structurally identical statements collapse to one canonical text (and one
//! signature) regardless of literal or parameter differences:
//!
//! - string and numeric literals, and positional parameters (`$1`), become `?`
//! - a parenthesized list after `IN` collapses to a single `(?)` group,
//!   so `IN ($1, $2, $3)` and `IN ($1, $2)` canonicalize identically
//! - whitespace runs collapse to one space
//!
//! `normalize` is total: it never panics out and never errors. On any internal
//! failure it returns the input unmodified. Idempotence is a hard invariant:
//! `normalize(normalize(x)) == normalize(x)` for all inputs.

use xxhash_rust::xxh3::xxh3_128;

/// Generic placeholder that replaces literals and parameters.
const PLACEHOLDER: char = '?';

/// Normalize a raw SQL text into its canonical form.
///
/// Pure and total. Degrades to returning `raw` unchanged if the internal
/// scanner fails.
pub fn normalize(raw: &str) -> String {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| normalize_inner(raw)))
        .unwrap_or_else(|_| raw.to_string())
}

/// Stable 128-bit content signature of a canonical text, as 32 hex chars.
///
/// Identifier-safe; used as the natural key of a canonical statement.
pub fn signature(canonical: &str) -> String {
    format!("{:032x}", xxh3_128(canonical.as_bytes()))
}

/// Normalize and hash in one step.
pub fn normalize_and_hash(raw: &str) -> (String, String) {
    let canonical = normalize(raw);
    let sig = signature(&canonical);
    (canonical, sig)
}

fn normalize_inner(raw: &str) -> String {
    let replaced = replace_literals(raw);
    let collapsed = collapse_in_lists(&replaced);
    collapsed.trim().to_string()
}

/// Single pass: literals and parameters become `?`, whitespace runs become
/// one space. Double-quoted identifiers are copied verbatim.
fn replace_literals(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    let mut prev: Option<char> = None;

    while i < chars.len() {
        let c = chars[i];

        // String literal: '...' with '' escapes.
        if c == '\'' {
            i += 1;
            while i < chars.len() {
                if chars[i] == '\'' {
                    if i + 1 < chars.len() && chars[i + 1] == '\'' {
                        i += 2; // escaped quote, stay inside the literal
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            out.push(PLACEHOLDER);
            prev = Some(PLACEHOLDER);
            continue;
        }

        // Quoted identifier: copy verbatim so embedded digits survive.
        if c == '"' {
            out.push(c);
            i += 1;
            while i < chars.len() {
                out.push(chars[i]);
                if chars[i] == '"' {
                    i += 1;
                    if i < chars.len() && chars[i] == '"' {
                        out.push(chars[i]);
                        i += 1;
                        continue;
                    }
                    break;
                }
                i += 1;
            }
            prev = Some('"');
            continue;
        }

        // Positional parameter: $N.
        if c == '$' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit() {
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            out.push(PLACEHOLDER);
            prev = Some(PLACEHOLDER);
            continue;
        }

        // Numeric literal — but not digits embedded in an identifier (t1, col_2).
        if c.is_ascii_digit() && !prev_is_ident(prev) {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // Exponent part: 1e9, 2.5E-3.
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            out.push(PLACEHOLDER);
            prev = Some(PLACEHOLDER);
            continue;
        }

        // Whitespace run → single space.
        if c.is_whitespace() {
            if !out.ends_with(' ') && !out.is_empty() {
                out.push(' ');
            }
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            prev = Some(' ');
            continue;
        }

        out.push(c);
        prev = Some(c);
        i += 1;
    }

    out
}

fn prev_is_ident(prev: Option<char>) -> bool {
    matches!(prev, Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '"')
}

/// Collapse `IN (?, ?, ...)` groups to `IN (?)`.
///
/// Only groups whose content is placeholders, commas, whitespace and balanced
/// parens qualify; `IN (SELECT ...)` is left untouched.
fn collapse_in_lists(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;

    while i < chars.len() {
        if is_in_keyword_at(&chars, i) {
            // Copy the keyword itself, preserving its case.
            out.push(chars[i]);
            out.push(chars[i + 1]);
            let mut j = i + 2;
            while j < chars.len() && chars[j] == ' ' {
                j += 1;
            }
            if j < chars.len() && chars[j] == '(' {
                if let Some(close) = matching_paren(&chars, j) {
                    if is_placeholder_list(&chars[j + 1..close]) {
                        if j > i + 2 {
                            out.push(' ');
                        }
                        out.push('(');
                        out.push(PLACEHOLDER);
                        out.push(')');
                        i = close + 1;
                        continue;
                    }
                }
            }
            i += 2;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }

    out
}

/// True if `chars[i..i+2]` is the standalone keyword `IN` (case-insensitive).
fn is_in_keyword_at(chars: &[char], i: usize) -> bool {
    if i + 2 > chars.len() || !chars[i].eq_ignore_ascii_case(&'i') {
        return false;
    }
    if i + 1 >= chars.len() || !chars[i + 1].eq_ignore_ascii_case(&'n') {
        return false;
    }
    let before_ok = i == 0 || !is_word_char(chars[i - 1]);
    let after_ok = i + 2 >= chars.len() || !is_word_char(chars[i + 2]);
    before_ok && after_ok
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Index of the paren matching the one at `open`, or None if unbalanced.
fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (k, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(k);
                }
            }
            _ => {}
        }
    }
    None
}

/// True if the slice contains only placeholders, commas, spaces and parens
/// (and at least one placeholder).
fn is_placeholder_list(content: &[char]) -> bool {
    let mut saw_placeholder = false;
    for &c in content {
        match c {
            PLACEHOLDER => saw_placeholder = true,
            ',' | ' ' | '(' | ')' => {}
            _ => return false,
        }
    }
    saw_placeholder
}
