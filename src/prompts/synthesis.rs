//! Synthesis stage prompt: turn hypotheses and evidence into a report.

use serde_json::{Map, Value};

use super::{format_case, format_evidence, StagePrompt};
use crate::pipeline::state::Hypothesis;
use crate::tasks::TaskResult;

/// Keys the synthesis stage expects in the recovered report.
pub const SYNTHESIS_EXPECTED_KEYS: [&str; 3] = ["summary", "ranked_hypotheses", "recommendations"];

const SYNTHESIS_SYSTEM_PROMPT: &str = r#"You are writing the final report for a diagnostic case.

Weigh every hypothesis against the verification results. Results marked
FAILED, TIMEOUT, RATE_LIMITED or SKIPPED carry no evidence either way.

## OUTPUT FORMAT

You must output a JSON object:
{
  "summary": "Two to four sentence overview",
  "ranked_hypotheses": [
    {"name": "...", "likelihood": 0.0-1.0, "supporting_evidence": ["..."]}
  ],
  "recommendations": ["next clinical step", "..."]
}

Output ONLY the JSON object. No additional text."#;

pub fn build_synthesis_prompt(
    case: Option<&Map<String, Value>>,
    hypotheses: &[Hypothesis],
    evidence: &[TaskResult],
) -> StagePrompt {
    let hypotheses_formatted = if hypotheses.is_empty() {
        "None proposed.".to_string()
    } else {
        hypotheses
            .iter()
            .map(|h| {
                let mut line = format!("- {}", h.name);
                if let Some(ref rationale) = h.rationale {
                    line.push_str(&format!(": {}", rationale));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let user = format!(
        r#"## CASE

{}

## HYPOTHESES

{}

## VERIFICATION RESULTS

{}

Write the report as a JSON object now."#,
        format_case(case),
        hypotheses_formatted,
        format_evidence(evidence)
    );

    StagePrompt::new(SYNTHESIS_SYSTEM_PROMPT, user)
}
