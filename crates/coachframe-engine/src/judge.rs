use coachframe_contracts::validation::{failing_criteria, CriteriaScores, Criterion, ValidationResult};
use serde_json::{json, Map, Value};

use crate::anthropic::{image_block, text_block, AnthropicClient};
use crate::config::{DEFAULT_CRITERION_BAR, DEFAULT_PASS_THRESHOLD};
use crate::error::JudgeError;
use crate::media::EncodedImage;
use crate::payload::{coerce_text_list, extract_json_object, truncate_text};

const MAX_LIST_ITEMS: usize = 8;
const MAX_LIST_CHARS: usize = 240;

/// Everything the judge looks at for one verdict.
#[derive(Debug, Clone, Copy)]
pub struct JudgeRequest<'a> {
    pub generated: &'a EncodedImage,
    pub reference: &'a EncodedImage,
    pub prompt: &'a str,
    pub tts_context: &'a str,
}

pub trait VisionJudge: Send + Sync {
    fn name(&self) -> &str;
    fn judge(&self, request: &JudgeRequest<'_>) -> Result<ValidationResult, JudgeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyVerdict {
    Pass,
    /// The judge itself said no.
    JudgeRejected,
    /// The judge approved but the policy did not; carries the reason.
    Overruled(String),
}

impl PolicyVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, PolicyVerdict::Pass)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassPolicy {
    pub pass_threshold: f64,
    pub criterion_bar: f64,
    pub require_all_criteria: bool,
}

impl Default for PassPolicy {
    fn default() -> Self {
        Self {
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            criterion_bar: DEFAULT_CRITERION_BAR,
            require_all_criteria: false,
        }
    }
}

impl PassPolicy {
    pub fn decide(&self, judge_pass: bool, confidence: f64, scores: &CriteriaScores) -> PolicyVerdict {
        if !judge_pass {
            return PolicyVerdict::JudgeRejected;
        }
        if confidence < self.pass_threshold {
            return PolicyVerdict::Overruled(format!(
                "confidence {confidence:.2} is below the pass threshold {:.2}",
                self.pass_threshold
            ));
        }
        if self.require_all_criteria {
            let failing = failing_criteria(scores, self.criterion_bar);
            if !failing.is_empty() {
                let listed = failing
                    .iter()
                    .map(|(criterion, score)| format!("{criterion} ({score:.2})"))
                    .collect::<Vec<String>>()
                    .join(", ");
                return PolicyVerdict::Overruled(format!(
                    "criteria below {:.2}: {listed}",
                    self.criterion_bar
                ));
            }
        }
        PolicyVerdict::Pass
    }
}

/// Maps a judge reply object onto [`ValidationResult`] and applies `policy`.
pub fn normalize_validation(
    payload: &Map<String, Value>,
    policy: &PassPolicy,
) -> Result<ValidationResult, JudgeError> {
    let judge_pass = payload
        .get("overall_pass")
        .or_else(|| payload.get("pass"))
        .and_then(loose_bool)
        .ok_or_else(|| JudgeError::Malformed("missing boolean overall_pass".to_string()))?;
    let confidence = payload
        .get("confidence")
        .and_then(loose_number)
        .ok_or_else(|| JudgeError::Malformed("missing numeric confidence".to_string()))?
        .clamp(0.0, 1.0);

    let raw_scores = payload
        .get("criteria")
        .or_else(|| payload.get("criteria_scores"))
        .and_then(Value::as_object)
        .ok_or_else(|| JudgeError::Malformed("missing criteria object".to_string()))?;
    let mut criteria_scores = CriteriaScores::new();
    for (key, value) in raw_scores {
        let Some(criterion) = Criterion::parse(key) else {
            continue;
        };
        let score = match value {
            Value::Object(obj) => obj.get("score").and_then(loose_number),
            other => loose_number(other),
        };
        if let Some(score) = score {
            criteria_scores.insert(criterion, score.clamp(0.0, 1.0));
        }
    }
    let missing = Criterion::ALL
        .iter()
        .filter(|criterion| !criteria_scores.contains_key(*criterion))
        .map(|criterion| criterion.as_str())
        .collect::<Vec<&str>>();
    if !missing.is_empty() {
        return Err(JudgeError::Malformed(format!(
            "missing criterion scores: {}",
            missing.join(", ")
        )));
    }

    let mut issues = coerce_text_list(payload.get("issues"), MAX_LIST_ITEMS, MAX_LIST_CHARS);
    let suggestions = coerce_text_list(payload.get("suggestions"), MAX_LIST_ITEMS, MAX_LIST_CHARS);

    let verdict = policy.decide(judge_pass, confidence, &criteria_scores);
    match &verdict {
        PolicyVerdict::Pass => issues.clear(),
        PolicyVerdict::Overruled(reason) => issues.push(reason.clone()),
        PolicyVerdict::JudgeRejected => {}
    }

    Ok(ValidationResult {
        overall_pass: verdict.passed(),
        confidence,
        criteria_scores,
        issues,
        suggestions,
    })
}

/// Parses a free-text judge reply (possibly fenced) into a validation result.
pub fn parse_judge_reply(text: &str, policy: &PassPolicy) -> Result<ValidationResult, JudgeError> {
    let Some(payload) = extract_json_object(text) else {
        return Err(JudgeError::Malformed(format!(
            "no JSON object in reply: {}",
            truncate_text(text.trim(), 160)
        )));
    };
    normalize_validation(&payload, policy)
}

fn loose_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "pass" | "yes" => Some(true),
            "false" | "fail" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn loose_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

pub fn judge_instruction(prompt: &str, tts_context: &str) -> String {
    let criteria = Criterion::ALL
        .iter()
        .map(|criterion| format!("- {}: {}", criterion.as_str(), criterion.describe()))
        .collect::<Vec<String>>()
        .join("\n");
    let context = if tts_context.trim().is_empty() {
        "(no narration for this shot)"
    } else {
        tts_context.trim()
    };
    format!(
        "You are reviewing a frame for a fitness video. The first image is the \
reference anchor for the character; the second image was generated from it.\n\n\
Generation prompt:\n{prompt}\n\nNarration at this moment:\n{context}\n\n\
Score each criterion from 0.0 to 1.0:\n{criteria}\n\n\
Reply with a single JSON object and nothing else:\n\
{{\"overall_pass\": bool, \"confidence\": number, \"criteria\": {{\"<criterion>\": number}}, \
\"issues\": [string], \"suggestions\": [string]}}\n\
List concrete, visible problems in issues. Leave issues empty when the frame passes."
    )
}

pub struct ClaudeJudge {
    client: AnthropicClient,
    model: String,
    max_tokens: u64,
    policy: PassPolicy,
}

impl ClaudeJudge {
    pub fn new(client: AnthropicClient, model: &str, max_tokens: u64, policy: PassPolicy) -> Self {
        Self {
            client,
            model: model.to_string(),
            max_tokens,
            policy,
        }
    }
}

impl VisionJudge for ClaudeJudge {
    fn name(&self) -> &str {
        &self.model
    }

    fn judge(&self, request: &JudgeRequest<'_>) -> Result<ValidationResult, JudgeError> {
        let content = vec![
            text_block("Reference anchor:"),
            image_block(request.reference),
            text_block("Generated frame:"),
            image_block(request.generated),
            text_block(&judge_instruction(request.prompt, request.tts_context)),
        ];
        let reply = self
            .client
            .message(&self.model, None, content, self.max_tokens)
            .map_err(JudgeError::Request)?;
        parse_judge_reply(&reply, &self.policy)
    }
}

/// Approves every frame with fixed scores; used for offline runs.
#[derive(Debug, Clone, Default)]
pub struct DryrunJudge {
    policy: PassPolicy,
}

impl DryrunJudge {
    pub fn new(policy: PassPolicy) -> Self {
        Self { policy }
    }
}

impl VisionJudge for DryrunJudge {
    fn name(&self) -> &str {
        "dryrun-judge"
    }

    fn judge(&self, _request: &JudgeRequest<'_>) -> Result<ValidationResult, JudgeError> {
        let criteria = Criterion::ALL
            .iter()
            .map(|criterion| (criterion.as_str().to_string(), json!(0.9)))
            .collect::<Map<String, Value>>();
        let mut payload = Map::new();
        payload.insert("overall_pass".to_string(), Value::Bool(true));
        payload.insert("confidence".to_string(), json!(0.9));
        payload.insert("criteria".to_string(), Value::Object(criteria));
        normalize_validation(&payload, &self.policy)
    }
}
