//! Heuristic repair of almost-JSON object text.
//!
//! Handles the mistakes generators make most often: trailing commas, bare
//! keys, typographic or single quotes, and unquoted word values. Rewrites are
//! applied only outside string literals.

use std::sync::OnceLock;

use regex::{Captures, Regex};

static TRAILING_COMMA: OnceLock<Option<Regex>> = OnceLock::new();
static BARE_KEY: OnceLock<Option<Regex>> = OnceLock::new();
static BARE_VALUE: OnceLock<Option<Regex>> = OnceLock::new();

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Rewrite `candidate` into text that has a better chance of parsing.
pub fn repair(candidate: &str) -> String {
    let normalized = normalize_quotes(candidate);

    let mut out = String::with_capacity(normalized.len() + 16);
    for segment in split_segments(&normalized) {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Code(text) => out.push_str(&repair_code(text)),
        }
    }
    out
}

/// Map typographic quotes to ASCII, and single quotes to double quotes when
/// the text has no double quotes at all.
fn normalize_quotes(text: &str) -> String {
    let ascii: String = text
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' => '\'',
            other => other,
        })
        .collect();

    if ascii.contains('"') {
        ascii
    } else {
        ascii.replace('\'', "\"")
    }
}

fn repair_code(code: &str) -> String {
    let mut text = code.to_string();

    if let Some(re) = cached(&TRAILING_COMMA, r",(\s*[}\]])") {
        text = re.replace_all(&text, "$1").into_owned();
    }

    if let Some(re) = cached(&BARE_KEY, r#"([{,]\s*)([A-Za-z_$][A-Za-z0-9_$\-]*)(\s*:)"#) {
        text = re.replace_all(&text, "$1\"$2\"$3").into_owned();
    }

    if let Some(re) = cached(&BARE_VALUE, r#"(:\s*)([A-Za-z_][^,{}\[\]":]*?)(\s*[,}\]])"#) {
        text = re
            .replace_all(&text, |caps: &Captures| {
                let word = caps[2].trim_end();
                let value = match word {
                    "true" | "false" | "null" => word.to_string(),
                    "True" => "true".to_string(),
                    "False" => "false".to_string(),
                    "None" => "null".to_string(),
                    _ => format!("\"{}\"", word.replace('\\', "\\\\")),
                };
                format!("{}{}{}", &caps[1], value, &caps[3])
            })
            .into_owned();
    }

    text
}

enum Segment<'a> {
    Code(&'a str),
    Literal(&'a str),
}

/// Split text into alternating code and double-quoted literal segments.
///
/// An unterminated literal runs to the end of the text.
fn split_segments(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' if in_string => {
                segments.push(Segment::Literal(&text[start..=i]));
                start = i + 1;
                in_string = false;
            }
            '"' => {
                if i > start {
                    segments.push(Segment::Code(&text[start..i]));
                }
                start = i;
                in_string = true;
            }
            _ => {}
        }
    }

    if start < text.len() {
        let rest = &text[start..];
        if in_string {
            segments.push(Segment::Literal(rest));
        } else {
            segments.push(Segment::Code(rest));
        }
    }

    segments
}
