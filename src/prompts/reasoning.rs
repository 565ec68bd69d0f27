//! Reasoning stage prompt: propose hypotheses and a plan of verification
//! calls drawn from the registered task catalog.

use serde_json::{Map, Value};

use super::{format_case, format_evidence, StagePrompt};
use crate::pipeline::state::Hypothesis;
use crate::tasks::TaskResult;

/// Keys the reasoning stage expects in the recovered record.
pub const REASONING_EXPECTED_KEYS: [&str; 3] = ["hypotheses", "task_plan", "needs_more_tasks"];

/// A registered task as presented to the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCatalogEntry {
    pub name: String,
    pub description: Option<String>,
}

const REASONING_SYSTEM_PROMPT: &str = r#"You are a clinical reasoning assistant working through a diagnostic case.

## YOUR ROLE

1. Propose a ranked list of candidate explanations (hypotheses) for the case.
2. Plan verification calls that would confirm or rule out those hypotheses.
3. Decide whether more verification is needed before a report can be written.

Only plan tasks from the AVAILABLE TASKS list. Each task call names the items
it targets (gene symbols, variants, coordinates) and a priority of HIGH,
MEDIUM or LOW. HIGH tasks run first.

## OUTPUT FORMAT

You must output a JSON object:
{
  "hypotheses": [
    {"name": "...", "rationale": "...", "likelihood": 0.0-1.0}
  ],
  "task_plan": [
    {"name": "task_name", "priority": "HIGH|MEDIUM|LOW", "target_items": ["..."], "parameters": {}}
  ],
  "needs_more_tasks": true|false
}

Output ONLY the JSON object. No additional text."#;

/// Builds the reasoning prompt for one iteration.
///
/// `iteration` is zero-based; the prompt shows it as `iteration + 1` of
/// `max_iterations`.
pub fn build_reasoning_prompt(
    case: Option<&Map<String, Value>>,
    hypotheses: &[Hypothesis],
    evidence: &[TaskResult],
    catalog: &[TaskCatalogEntry],
    iteration: u32,
    max_iterations: u32,
) -> StagePrompt {
    let catalog_formatted = if catalog.is_empty() {
        "None. Return an empty task_plan.".to_string()
    } else {
        catalog
            .iter()
            .map(|entry| match entry.description {
                Some(ref description) => format!("- {}: {}", entry.name, description),
                None => format!("- {}", entry.name),
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let hypotheses_formatted = if hypotheses.is_empty() {
        "None yet.".to_string()
    } else {
        hypotheses
            .iter()
            .map(|h| match h.likelihood {
                Some(likelihood) => format!("- {} ({:.2})", h.name, likelihood),
                None => format!("- {}", h.name),
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let user = format!(
        r#"## CASE

{}

## CURRENT HYPOTHESES

{}

## VERIFICATION RESULTS SO FAR

{}

## AVAILABLE TASKS

{}

## ITERATION

This is reasoning round {} of at most {}. Set needs_more_tasks to false once
the evidence is sufficient for a report.

Provide your assessment as a JSON object now."#,
        format_case(case),
        hypotheses_formatted,
        format_evidence(evidence),
        catalog_formatted,
        iteration + 1,
        max_iterations.max(1)
    );

    StagePrompt::new(REASONING_SYSTEM_PROMPT, user)
}
