use coachframe_contracts::validation::{lowest_criteria, CriteriaScores, Criterion};
use serde_json::Value;

use crate::anthropic::{text_block, AnthropicClient};
use crate::error::RefinerError;
use crate::payload::{extract_json_object, strip_code_fence};

/// How many of the worst-scoring criteria are called out to the refiner.
pub const FOCUS_CRITERIA: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct RefineRequest<'a> {
    pub original_prompt: &'a str,
    pub issues: &'a [String],
    pub suggestions: &'a [String],
    pub criteria_scores: &'a CriteriaScores,
}

impl RefineRequest<'_> {
    pub fn focus(&self) -> Vec<(Criterion, f64)> {
        focus_criteria(self.criteria_scores)
    }
}

pub trait PromptRefiner: Send + Sync {
    fn name(&self) -> &str;
    fn refine(&self, request: &RefineRequest<'_>) -> Result<String, RefinerError>;
}

pub fn focus_criteria(scores: &CriteriaScores) -> Vec<(Criterion, f64)> {
    lowest_criteria(scores, FOCUS_CRITERIA)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refinement {
    pub prompt: String,
    /// Set when the original prompt was kept; holds the reason.
    pub fallback: Option<String>,
}

/// Calls `refiner`, keeping the original prompt if it fails or returns nothing.
pub fn refine_or_keep(refiner: &dyn PromptRefiner, request: &RefineRequest<'_>) -> Refinement {
    let result = refiner.refine(request).and_then(|prompt| {
        let trimmed = prompt.trim();
        if trimmed.is_empty() {
            Err(RefinerError::Empty)
        } else {
            Ok(trimmed.to_string())
        }
    });
    match result {
        Ok(prompt) => Refinement {
            prompt,
            fallback: None,
        },
        Err(err) => Refinement {
            prompt: request.original_prompt.to_string(),
            fallback: Some(err.to_string()),
        },
    }
}

const REFINER_SYSTEM: &str = "You rewrite image-edit prompts for a fitness video pipeline. \
The edit model receives a fixed reference photo of the character plus your prompt. \
Keep the character, outfit and setting unchanged and fix only what the reviewer flagged.";

pub fn refine_instruction(request: &RefineRequest<'_>) -> String {
    let mut lines = vec![
        "Current prompt:".to_string(),
        request.original_prompt.trim().to_string(),
        String::new(),
    ];
    lines.push("Reviewer issues:".to_string());
    if request.issues.is_empty() {
        lines.push("- (none listed)".to_string());
    } else {
        lines.extend(request.issues.iter().map(|issue| format!("- {issue}")));
    }
    if !request.suggestions.is_empty() {
        lines.push(String::new());
        lines.push("Reviewer suggestions:".to_string());
        lines.extend(request.suggestions.iter().map(|item| format!("- {item}")));
    }
    let focus = request.focus();
    if !focus.is_empty() {
        lines.push(String::new());
        lines.push("Weakest criteria, fix these first:".to_string());
        lines.extend(focus.iter().map(|(criterion, score)| {
            format!("- {} ({score:.2}): {}", criterion.as_str(), criterion.describe())
        }));
    }
    lines.push(String::new());
    lines.push(
        "Reply with JSON only: {\"refined_prompt\": \"...\"}. Keep it under 120 words."
            .to_string(),
    );
    lines.join("\n")
}

/// Pulls the new prompt out of a refiner reply: `refined_prompt` from a JSON
/// object when present, otherwise the de-fenced text.
pub fn parse_refiner_reply(text: &str) -> Option<String> {
    let candidate = match extract_json_object(text) {
        Some(object) => object
            .get("refined_prompt")
            .or_else(|| object.get("prompt"))
            .and_then(Value::as_str)
            .map(str::to_string)?,
        None => strip_code_fence(text),
    };
    let cleaned = candidate.trim().trim_matches('"').trim().to_string();
    (!cleaned.is_empty()).then_some(cleaned)
}

pub struct ClaudeRefiner {
    client: AnthropicClient,
    model: String,
    max_tokens: u64,
}

impl ClaudeRefiner {
    pub fn new(client: AnthropicClient, model: &str, max_tokens: u64) -> Self {
        Self {
            client,
            model: model.to_string(),
            max_tokens,
        }
    }
}

impl PromptRefiner for ClaudeRefiner {
    fn name(&self) -> &str {
        &self.model
    }

    fn refine(&self, request: &RefineRequest<'_>) -> Result<String, RefinerError> {
        let reply = self
            .client
            .message(
                &self.model,
                Some(REFINER_SYSTEM),
                vec![text_block(&refine_instruction(request))],
                self.max_tokens,
            )
            .map_err(RefinerError::Request)?;
        parse_refiner_reply(&reply).ok_or(RefinerError::Empty)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunRefiner;

impl PromptRefiner for DryrunRefiner {
    fn name(&self) -> &str {
        "dryrun-refiner"
    }

    fn refine(&self, request: &RefineRequest<'_>) -> Result<String, RefinerError> {
        let focus = request
            .focus()
            .iter()
            .map(|(criterion, _)| criterion.as_str().replace('_', " "))
            .collect::<Vec<String>>();
        let clause = if focus.is_empty() {
            "Match the reference character exactly.".to_string()
        } else {
            format!("Improve {}.", focus.join(" and "))
        };
        Ok(format!("{} {clause}", request.original_prompt.trim()))
    }
}
