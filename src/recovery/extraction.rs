//! Scanners that locate structured-object candidates inside free text.
//!
//! All scanners track string-literal state (including escaped quotes) so that
//! braces inside string values never affect nesting depth.

use std::sync::OnceLock;

use regex::Regex;

static FENCED_BLOCK: OnceLock<Option<Regex>> = OnceLock::new();

/// A balanced `{...}` span found in raw text, as inclusive byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectSpan {
    pub start: usize,
    pub end: usize,
}

impl ObjectSpan {
    /// Length of the span in bytes.
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    /// Always false: a span covers at least `{}`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Borrow the span's text out of the source it was scanned from.
    pub fn slice<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..=self.end]
    }
}

/// Return the trimmed contents of the first fenced code block.
///
/// Accepts blocks with or without a language tag (```` ```json ````,
/// ```` ``` ````).
pub fn extract_fenced_block(content: &str) -> Option<&str> {
    let re = FENCED_BLOCK
        .get_or_init(|| Regex::new(r"```[A-Za-z0-9_+\-]*[ \t]*\r?\n?([\s\S]*?)```").ok())
        .as_ref()?;
    let caps = re.captures(content)?;
    let block = caps.get(1)?.as_str().trim();
    if block.is_empty() {
        None
    } else {
        Some(block)
    }
}

/// Collect every top-level balanced `{...}` span in `content`.
///
/// Candidates are ordered earliest first; spans starting at the same offset
/// are ordered longest first.
pub fn scan_object_spans(content: &str) -> Vec<ObjectSpan> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    let mut open_at: Option<usize> = None;

    for (i, c) in content.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => {
                if depth == 0 {
                    open_at = Some(i);
                }
                depth += 1;
            }
            '}' if !in_string && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = open_at.take() {
                        spans.push(ObjectSpan { start, end: i });
                    }
                }
            }
            _ => {}
        }
    }

    spans.sort_by(|a, b| a.start.cmp(&b.start).then(b.len().cmp(&a.len())));
    spans
}

/// The widest brace-delimited region: first `{` through last `}`.
///
/// String state is ignored, so this is the widest candidate available to the
/// trimming and repair strategies.
pub fn outermost_span(content: &str) -> Option<ObjectSpan> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end > start {
        Some(ObjectSpan { start, end })
    } else {
        None
    }
}

/// Shorter prefixes of `candidate` worth re-parsing after trimming.
///
/// Yields each prefix that ends in `}` and is at most `max_trim` bytes
/// shorter than the candidate, longest first.
pub fn trimmed_prefixes(candidate: &str, max_trim: usize) -> Vec<&str> {
    let floor = candidate.len().saturating_sub(max_trim);
    candidate
        .char_indices()
        .rev()
        .take_while(|(i, _)| *i >= floor)
        .filter(|(_, c)| *c == '}')
        .map(|(i, _)| &candidate[..=i])
        .filter(|prefix| prefix.len() < candidate.len())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spans_ignore_braces_in_strings() {
        let input = r#"{"braces": "{ not a brace }"}"#;
        assert_eq!(scan_object_spans(input), vec![ObjectSpan { start: 0, end: 28 }]);
    }

    #[test]
    fn test_unterminated_object_has_no_span() {
        assert!(scan_object_spans(r#"{"a": {"b": 1}"#).is_empty());
    }

    #[test]
    fn test_fenced_block_repeated_calls() {
        let input = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_fenced_block(input), extract_fenced_block(input));
        assert_eq!(extract_fenced_block(input), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_fenced_block_with_language() {
        let input = "Here is the result: ```json\n{\"x\":1}\n``` thanks";
        assert_eq!(extract_fenced_block(input), Some("{\"x\":1}"));
    }

    #[test]
    fn test_fenced_block_without_language() {
        let input = "Response:\n```\n[1, 2]\n```";
        assert_eq!(extract_fenced_block(input), Some("[1, 2]"));
    }

    #[test]
    fn test_fenced_block_takes_first() {
        let input = "```json\n{\"first\": 1}\n```\n```json\n{\"second\": 2}\n```";
        assert_eq!(extract_fenced_block(input), Some("{\"first\": 1}"));
    }

    #[test]
    fn test_no_fenced_block() {
        assert_eq!(extract_fenced_block("plain text {\"a\": 1}"), None);
        assert_eq!(extract_fenced_block("```\n```"), None);
    }

    #[test]
    fn test_scan_collects_top_level_spans() {
        let input = r#"first {"a": 1} then {"b": {"c": 2}} done"#;
        let spans = scan_object_spans(input);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].slice(input), r#"{"a": 1}"#);
        assert_eq!(spans[1].slice(input), r#"{"b": {"c": 2}}"#);
    }

    #[test]
    fn test_scan_ignores_braces_in_strings() {
        let input = r#"{"text": "a } inside", "n": 1} tail"#;
        let spans = scan_object_spans(input);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].slice(input), r#"{"text": "a } inside", "n": 1}"#);
    }

    #[test]
    fn test_scan_skips_unterminated() {
        let input = r#"{"a": 1} and {"b": "#;
        let spans = scan_object_spans(input);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].slice(input), r#"{"a": 1}"#);
    }

    #[test]
    fn test_outermost_span() {
        let input = "x {a} y {b} z";
        let span = outermost_span(input).unwrap();
        assert_eq!(span.slice(input), "{a} y {b}");
        assert!(outermost_span("} {").is_none());
        assert!(outermost_span("no braces").is_none());
    }

    #[test]
    fn test_trimmed_prefixes() {
        let candidate = r#"{"a": 1} note }"#;
        let prefixes = trimmed_prefixes(candidate, 50);
        assert_eq!(prefixes, vec![r#"{"a": 1}"#]);
    }

    #[test]
    fn test_trimmed_prefixes_respects_limit() {
        let candidate = format!(r#"{{"a": 1}}{}}}"#, " ".repeat(60));
        assert!(trimmed_prefixes(&candidate, 50).is_empty());
    }
}
