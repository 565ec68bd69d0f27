//! Prompts for the generator-backed pipeline stages.
//!
//! - [`reasoning`]: hypotheses and a verification task plan
//! - [`synthesis`]: the final report
//!
//! Each builder returns a [`StagePrompt`] whose `render` output is what the
//! stage passes to its text generator.

pub mod reasoning;
pub mod synthesis;

pub use reasoning::{build_reasoning_prompt, TaskCatalogEntry, REASONING_EXPECTED_KEYS};
pub use synthesis::{build_synthesis_prompt, SYNTHESIS_EXPECTED_KEYS};

use serde_json::{Map, Value};

use crate::tasks::TaskResult;

/// A system and user prompt pair for one stage call.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePrompt {
    pub system: String,
    pub user: String,
}

impl StagePrompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    /// Single-string form for generators that take one prompt.
    pub fn render(&self) -> String {
        format!("{}\n\n{}", self.system.trim_end(), self.user)
    }
}

/// Pretty JSON for a case record, or a placeholder when there is none.
pub(crate) fn format_case(case: Option<&Map<String, Value>>) -> String {
    match case {
        Some(fields) if !fields.is_empty() => serde_json::to_string_pretty(fields)
            .unwrap_or_else(|_| "{}".to_string()),
        _ => "No case details available.".to_string(),
    }
}

/// One line per task result: name, status, items and annotations or error.
pub(crate) fn format_evidence(results: &[TaskResult]) -> String {
    if results.is_empty() {
        return "No verification results yet.".to_string();
    }
    results
        .iter()
        .map(|r| {
            let detail = match r.error_message {
                Some(ref message) if !r.is_success() => message.clone(),
                _ => Value::Object(r.annotations.clone()).to_string(),
            };
            format!(
                "- {} [{}] items={}: {}",
                r.name,
                r.status.as_str(),
                r.items_queried.join(","),
                detail
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskRequest;
    use serde_json::json;

    #[test]
    fn test_render_joins_system_and_user() {
        let prompt = StagePrompt::new("system text\n", "user text");
        assert_eq!(prompt.render(), "system text\n\nuser text");
    }

    #[test]
    fn test_format_evidence() {
        assert_eq!(format_evidence(&[]), "No verification results yet.");

        let req = TaskRequest::new("gene_lookup").with_item("FBN1");
        let mut annotations = Map::new();
        annotations.insert("FBN1".to_string(), json!({"omim": "134797"}));
        let ok = TaskResult::pending(&req).start().complete(annotations);
        let failed = TaskResult::pending(&req).start().fail("service down");

        let text = format_evidence(&[ok, failed]);
        assert!(text.contains("gene_lookup [COMPLETED] items=FBN1"));
        assert!(text.contains("134797"));
        assert!(text.contains("[FAILED] items=FBN1: service down"));
    }

    #[test]
    fn test_format_case_placeholder() {
        assert_eq!(format_case(None), "No case details available.");
        let mut case = Map::new();
        case.insert("age".to_string(), json!(34));
        assert!(format_case(Some(&case)).contains("\"age\": 34"));
    }
}
