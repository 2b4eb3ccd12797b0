//! Scripted collaborators for loop and orchestrator tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use coachframe_contracts::validation::{CriteriaScores, Criterion, ValidationResult};

use crate::error::{GenerationError, JudgeError, RefinerError};
use crate::generator::{Collaborators, ImageGenerator};
use crate::judge::{JudgeRequest, VisionJudge};
use crate::media::{render_placeholder, EncodedImage, ImageBytes};
use crate::refiner::{PromptRefiner, RefineRequest};

#[derive(Debug, Default)]
pub struct Calls {
    pub judged_prompts: Vec<String>,
    pub refined_prompts: Vec<String>,
    pub generated_prompts: Vec<String>,
}

pub type SharedCalls = Arc<Mutex<Calls>>;

pub fn scores(value: f64) -> CriteriaScores {
    Criterion::ALL
        .into_iter()
        .map(|criterion| (criterion, value))
        .collect()
}

pub fn passing(confidence: f64) -> ValidationResult {
    ValidationResult {
        overall_pass: true,
        confidence,
        criteria_scores: scores(0.9),
        issues: Vec::new(),
        suggestions: Vec::new(),
    }
}

pub fn failing(issue: &str) -> ValidationResult {
    let mut criteria_scores = scores(0.8);
    criteria_scores.insert(Criterion::PoseAccuracy, 0.3);
    criteria_scores.insert(Criterion::MuscleHighlighting, 0.5);
    ValidationResult {
        overall_pass: false,
        confidence: 0.4,
        criteria_scores,
        issues: vec![issue.to_string()],
        suggestions: vec!["straighten the arms".to_string()],
    }
}

pub fn write_reference(path: &Path, label: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_placeholder(label, 64, 64)?.bytes)?;
    Ok(())
}

/// Judge that replays `verdicts` in order and approves once they run out.
pub struct ScriptedJudge {
    verdicts: Mutex<VecDeque<Result<ValidationResult, JudgeError>>>,
    calls: SharedCalls,
}

impl VisionJudge for ScriptedJudge {
    fn name(&self) -> &str {
        "scripted-judge"
    }

    fn judge(&self, request: &JudgeRequest<'_>) -> Result<ValidationResult, JudgeError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.judged_prompts.push(request.prompt.to_string());
        }
        self.verdicts
            .lock()
            .ok()
            .and_then(|mut verdicts| verdicts.pop_front())
            .unwrap_or_else(|| Ok(passing(0.9)))
    }
}

/// Refiner that replays `replies`; once they run out it suffixes the prompt.
pub struct ScriptedRefiner {
    replies: Mutex<VecDeque<Result<String, RefinerError>>>,
    calls: SharedCalls,
}

impl PromptRefiner for ScriptedRefiner {
    fn name(&self) -> &str {
        "scripted-refiner"
    }

    fn refine(&self, request: &RefineRequest<'_>) -> Result<String, RefinerError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.refined_prompts.push(request.original_prompt.to_string());
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front())
            .unwrap_or_else(|| Ok(format!("{} (refined)", request.original_prompt)))
    }
}

/// Generator that replays `results`; once they run out it renders placeholders.
pub struct ScriptedGenerator {
    results: Mutex<VecDeque<Result<ImageBytes, GenerationError>>>,
    calls: SharedCalls,
}

impl ImageGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted-generator"
    }

    fn generate(
        &self,
        _reference: &EncodedImage,
        prompt: &str,
    ) -> Result<ImageBytes, GenerationError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.generated_prompts.push(prompt.to_string());
        }
        self.results
            .lock()
            .ok()
            .and_then(|mut results| results.pop_front())
            .unwrap_or_else(|| render_placeholder(prompt, 32, 32).map_err(GenerationError::Request))
    }
}

#[derive(Default)]
pub struct Script {
    pub verdicts: Vec<Result<ValidationResult, JudgeError>>,
    pub replies: Vec<Result<String, RefinerError>>,
    pub images: Vec<Result<ImageBytes, GenerationError>>,
}

impl Script {
    pub fn into_collaborators(self) -> (Collaborators, SharedCalls) {
        let calls = SharedCalls::default();
        let collaborators = Collaborators::new(
            Box::new(ScriptedJudge {
                verdicts: Mutex::new(self.verdicts.into()),
                calls: Arc::clone(&calls),
            }),
            Box::new(ScriptedRefiner {
                replies: Mutex::new(self.replies.into()),
                calls: Arc::clone(&calls),
            }),
            Box::new(ScriptedGenerator {
                results: Mutex::new(self.images.into()),
                calls: Arc::clone(&calls),
            }),
        );
        (collaborators, calls)
    }
}
