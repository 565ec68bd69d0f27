//! Tolerant structured-output recovery.
//!
//! Converts loosely formatted generator output into a field map with a
//! confidence score. Strategies are tried in a fixed order, each one more
//! aggressive than the last:
//!
//! 1. Direct parse of the trimmed text
//! 2. First fenced code block
//! 3. Brace-balanced scan for top-level objects
//! 4. Brace scan with trailing characters trimmed
//! 5. Heuristic repair of the outermost object
//! 6. Caller-supplied fallback
//!
//! Confidence never increases as the cascade escalates. Missing expected keys
//! scale the result down once more by [`MISSING_KEY_PENALTY`].
//!
//! # Example
//!
//! ```
//! use dx_forge::recovery::{recover, RecoveryStrategy};
//! use serde_json::Map;
//!
//! let raw = "Here is the result: ```json\n{\"x\":1}\n``` thanks";
//! let record = recover(raw, &["x"], Map::new());
//! assert_eq!(record.strategy, RecoveryStrategy::FencedBlock);
//! assert!((record.confidence - 0.95).abs() < 1e-9);
//! ```

pub mod extraction;
pub mod repair;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use extraction::{extract_fenced_block, outermost_span, scan_object_spans, trimmed_prefixes};

pub const DIRECT_CONFIDENCE: f64 = 1.0;
/// A bare top-level list, wrapped into [`LIST_FIELD`]. Never below any
/// later strategy.
pub const DIRECT_LIST_CONFIDENCE: f64 = 0.95;
pub const FENCED_CONFIDENCE: f64 = 0.95;
pub const FENCED_LIST_CONFIDENCE: f64 = 0.85;
pub const BRACE_SCAN_CONFIDENCE: f64 = 0.85;
pub const TRIMMED_CONFIDENCE: f64 = 0.75;
pub const REPAIR_CONFIDENCE: f64 = 0.7;
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

/// Applied once when one or more expected keys are absent.
pub const MISSING_KEY_PENALTY: f64 = 0.8;

/// How many trailing bytes the trimming strategy may discard.
pub const MAX_TRIM_CHARS: usize = 50;

/// Field that receives a parsed list when the output was not an object.
pub const LIST_FIELD: &str = "items";

/// The strategy that produced a [`RecoveredRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Direct,
    FencedBlock,
    BraceScan,
    TrimmedScan,
    HeuristicRepair,
    Fallback,
}

impl RecoveryStrategy {
    /// All strategies in cascade order.
    pub const CASCADE: [RecoveryStrategy; 6] = [
        RecoveryStrategy::Direct,
        RecoveryStrategy::FencedBlock,
        RecoveryStrategy::BraceScan,
        RecoveryStrategy::TrimmedScan,
        RecoveryStrategy::HeuristicRepair,
        RecoveryStrategy::Fallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Direct => "direct",
            RecoveryStrategy::FencedBlock => "fenced_block",
            RecoveryStrategy::BraceScan => "brace_scan",
            RecoveryStrategy::TrimmedScan => "trimmed_scan",
            RecoveryStrategy::HeuristicRepair => "heuristic_repair",
            RecoveryStrategy::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A structured record recovered from free text.
///
/// `confidence` is a lower bound on trust in `fields`, not a probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredRecord {
    pub fields: Map<String, Value>,
    pub confidence: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub strategy: RecoveryStrategy,
}

impl RecoveredRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    pub fn get_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.fields.get(key).and_then(Value::as_array)
    }

    pub fn has_field(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Whether every strategy failed and `fields` is the caller's fallback.
    pub fn is_fallback(&self) -> bool {
        self.strategy == RecoveryStrategy::Fallback
    }
}

/// Recover a structured record from `raw`.
///
/// Never fails: when nothing parses, `fallback` is returned with
/// [`FALLBACK_CONFIDENCE`] and a warning.
pub fn recover(raw: &str, expected_keys: &[&str], fallback: Map<String, Value>) -> RecoveredRecord {
    let mut warnings = Vec::new();

    let recovered = RecoveryStrategy::CASCADE
        .iter()
        .find_map(|strategy| attempt(*strategy, raw).map(|parsed| (*strategy, parsed)));

    let Some((strategy, parsed)) = recovered else {
        warn!(
            raw_len = raw.len(),
            "Structured output extraction failed, using fallback record"
        );
        warnings.push(format!(
            "Complete extraction failure: no structured object found in {} bytes of output; fallback record used",
            raw.len()
        ));
        return RecoveredRecord {
            fields: fallback,
            confidence: FALLBACK_CONFIDENCE,
            warnings,
            strategy: RecoveryStrategy::Fallback,
        };
    };

    let Parsed {
        fields,
        mut confidence,
        wrapped_list,
    } = parsed;

    if strategy != RecoveryStrategy::Direct {
        warnings.push(format!("Output recovered via {} strategy", strategy));
    }
    if wrapped_list {
        warnings.push(format!("Top-level list wrapped into field '{}'", LIST_FIELD));
    }

    let missing: Vec<&str> = expected_keys
        .iter()
        .copied()
        .filter(|key| !fields.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        confidence *= MISSING_KEY_PENALTY;
        for key in &missing {
            warnings.push(format!("Expected key '{}' missing from output", key));
        }
    }

    let confidence = confidence.clamp(0.0, 1.0);
    debug!(
        strategy = %strategy,
        confidence,
        missing_keys = missing.len(),
        "Recovered structured output"
    );

    RecoveredRecord {
        fields,
        confidence,
        warnings,
        strategy,
    }
}

/// Run a single strategy against `raw` without the rest of the cascade.
///
/// Returns the parsed fields and the strategy's base confidence (before any
/// missing-key penalty). [`RecoveryStrategy::Fallback`] never matches.
pub fn attempt_strategy(strategy: RecoveryStrategy, raw: &str) -> Option<(Map<String, Value>, f64)> {
    attempt(strategy, raw).map(|parsed| (parsed.fields, parsed.confidence))
}

struct Parsed {
    fields: Map<String, Value>,
    confidence: f64,
    wrapped_list: bool,
}

impl Parsed {
    fn object(fields: Map<String, Value>, confidence: f64) -> Self {
        Self {
            fields,
            confidence,
            wrapped_list: false,
        }
    }
}

fn attempt(strategy: RecoveryStrategy, raw: &str) -> Option<Parsed> {
    match strategy {
        RecoveryStrategy::Direct => parse_structured(raw.trim(), DIRECT_CONFIDENCE, DIRECT_LIST_CONFIDENCE),
        RecoveryStrategy::FencedBlock => {
            let block = extract_fenced_block(raw)?;
            parse_structured(block, FENCED_CONFIDENCE, FENCED_LIST_CONFIDENCE)
        }
        RecoveryStrategy::BraceScan => scan_object_spans(raw)
            .iter()
            .find_map(|span| parse_object(span.slice(raw)))
            .map(|fields| Parsed::object(fields, BRACE_SCAN_CONFIDENCE)),
        RecoveryStrategy::TrimmedScan => trimmed_candidates(raw)
            .into_iter()
            .find_map(|candidate| {
                trimmed_prefixes(candidate, MAX_TRIM_CHARS)
                    .into_iter()
                    .find_map(parse_object)
            })
            .map(|fields| Parsed::object(fields, TRIMMED_CONFIDENCE)),
        RecoveryStrategy::HeuristicRepair => {
            let span = outermost_span(raw)?;
            parse_object(&repair::repair(span.slice(raw))).map(|fields| Parsed::object(fields, REPAIR_CONFIDENCE))
        }
        RecoveryStrategy::Fallback => None,
    }
}

/// Candidates for the trimming strategy: everything from the first `{` to the
/// end of the text, then each balanced span that failed to parse on its own.
fn trimmed_candidates(raw: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    if let Some(start) = raw.find('{') {
        candidates.push(raw[start..].trim_end());
    }
    for span in scan_object_spans(raw) {
        let text = span.slice(raw);
        if parse_object(text).is_none() && !candidates.contains(&text) {
            candidates.push(text);
        }
    }
    candidates
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Parse an object, or a list wrapped into [`LIST_FIELD`] at the lower
/// `list_confidence`.
fn parse_structured(text: &str, confidence: f64, list_confidence: f64) -> Option<Parsed> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(Parsed::object(map, confidence)),
        Ok(Value::Array(items)) => {
            let mut map = Map::new();
            map.insert(LIST_FIELD.to_string(), Value::Array(items));
            Some(Parsed {
                fields: map,
                confidence: list_confidence,
                wrapped_list: true,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn fallback() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("fallback".to_string(), Value::Bool(true));
        map
    }

    #[test]
    fn test_well_formed_object_is_exact() {
        let record = recover(r#"  {"a": 1, "b": [true]}  "#, &["a", "b"], Map::new());
        assert_eq!(record.strategy, RecoveryStrategy::Direct);
        assert!(approx(record.confidence, 1.0));
        assert!(record.warnings.is_empty());
        assert_eq!(record.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_direct_list_is_wrapped() {
        let record = recover("[1, 2, 3]", &[], Map::new());
        assert_eq!(record.strategy, RecoveryStrategy::Direct);
        assert!(approx(record.confidence, DIRECT_LIST_CONFIDENCE));
        assert_eq!(record.get_array(LIST_FIELD).map(Vec::len), Some(3));
        assert_eq!(record.warnings.len(), 1);
    }

    #[test]
    fn test_fenced_block() {
        let raw = "Here is the result: ```json\n{\"x\":1}\n``` thanks";
        let record = recover(raw, &[], Map::new());
        assert_eq!(record.strategy, RecoveryStrategy::FencedBlock);
        assert!(approx(record.confidence, 0.95));
        assert_eq!(record.fields, json!({"x": 1}).as_object().cloned().unwrap());
    }

    #[test]
    fn test_fenced_list() {
        let raw = "Plan:\n```\n[\"a\", \"b\"]\n```";
        let record = recover(raw, &[], Map::new());
        assert_eq!(record.strategy, RecoveryStrategy::FencedBlock);
        assert!(approx(record.confidence, FENCED_LIST_CONFIDENCE));
    }

    #[test]
    fn test_brace_scan_with_prose() {
        let raw = r#"I think the answer is {"gene": "BRCA1", "note": "{braces}"} and that is all."#;
        let record = recover(raw, &["gene"], Map::new());
        assert_eq!(record.strategy, RecoveryStrategy::BraceScan);
        assert!(approx(record.confidence, 0.85));
        assert_eq!(record.get_str("note"), Some("{braces}"));
    }

    #[test]
    fn test_brace_scan_prefers_first_parseable() {
        let raw = r#"{not json} then {"ok": true}"#;
        let record = recover(raw, &[], Map::new());
        assert_eq!(record.strategy, RecoveryStrategy::BraceScan);
        assert_eq!(record.get_bool("ok"), Some(true));
    }

    #[test]
    fn test_trimmed_scan() {
        let raw = r#"He said "hi. {"a": 1} bye"#;
        let record = recover(raw, &["a"], Map::new());
        assert_eq!(record.strategy, RecoveryStrategy::TrimmedScan);
        assert!(approx(record.confidence, 0.75));
        assert_eq!(record.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_heuristic_repair() {
        let record = recover("{x:1, y:2,}", &["x", "y"], Map::new());
        assert_eq!(record.strategy, RecoveryStrategy::HeuristicRepair);
        assert!(approx(record.confidence, 0.7));
        assert_eq!(record.fields, json!({"x": 1, "y": 2}).as_object().cloned().unwrap());
    }

    #[test]
    fn test_total_failure_uses_fallback() {
        let record = recover("no structure here at all", &["a", "b"], fallback());
        assert!(record.is_fallback());
        assert!(approx(record.confidence, FALLBACK_CONFIDENCE));
        assert_eq!(record.get_bool("fallback"), Some(true));
        assert_eq!(record.warnings.len(), 1);
        assert!(record.warnings[0].contains("extraction failure"));
    }

    #[test]
    fn test_missing_keys_penalty() {
        let record = recover(r#"{"a": 1}"#, &["a", "b", "c"], Map::new());
        assert!(approx(record.confidence, DIRECT_CONFIDENCE * MISSING_KEY_PENALTY));
        let missing: Vec<_> = record.warnings.iter().filter(|w| w.contains("missing")).collect();
        assert_eq!(missing.len(), 2);
    }

    #[test]
    fn test_missing_keys_stack_with_strategy() {
        let record = recover("{x:1,}", &["x", "z"], Map::new());
        assert!(approx(record.confidence, REPAIR_CONFIDENCE * MISSING_KEY_PENALTY));
    }

    #[test]
    fn test_direct_list_outranks_fence_inside_it() {
        let raw = r#"["```{}```"]"#;
        let direct = attempt_strategy(RecoveryStrategy::Direct, raw).map(|(_, c)| c).unwrap();
        let fenced = attempt_strategy(RecoveryStrategy::FencedBlock, raw).map(|(_, c)| c).unwrap();
        assert!(direct >= fenced);

        let record = recover(raw, &[], Map::new());
        assert_eq!(record.strategy, RecoveryStrategy::Direct);
    }

    #[test]
    fn test_confidence_is_monotonic_across_strategies() {
        let inputs = [
            r#"{"a": 1}"#,
            "[1, 2]",
            "```json\n{\"a\": 1}\n```",
            "text ```\n[{\"a\": 1}]\n``` more",
            r#"prefix {"a": 1} suffix"#,
            r#"He said "hi. {"a": 1} bye"#,
            "{a: 1, b: [1,2,],}",
            "note {a: 'x'} and {\"b\": 2} end }",
            r#"["```{}```"]"#,
        ];

        for input in inputs {
            let confidences: Vec<f64> = RecoveryStrategy::CASCADE
                .iter()
                .filter_map(|s| attempt_strategy(*s, input).map(|(_, c)| c))
                .collect();
            for pair in confidences.windows(2) {
                assert!(
                    pair[0] >= pair[1],
                    "confidence increased for {:?}: {:?}",
                    input,
                    confidences
                );
            }
        }
    }

    #[test]
    fn test_confidence_bounds() {
        for input in ["", "{", "}", "{}", "```\n```", "[", "null", "42"] {
            let record = recover(input, &["k"], Map::new());
            assert!((0.0..=1.0).contains(&record.confidence), "{:?}", input);
        }
    }

    #[test]
    fn test_record_serializes_snake_case_strategy() {
        let record = recover("{x:1}", &[], Map::new());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["strategy"], json!("heuristic_repair"));
        assert!(value["confidence"].is_number());
    }
}
