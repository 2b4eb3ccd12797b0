mod outcome;
mod plan;
mod record;

use std::path::PathBuf;

pub use outcome::{ShotOutcome, ShotStatus};
pub use plan::{ShotPlan, ShotPlanEntry};
pub use record::{PromptHistoryEntry, PromptRecord};

/// One exercise-video frame moving through the quality loop.
///
/// `prompt_history.len() == iteration_count` holds after every mutation made
/// through [`Shot::abandon_prompt`].
#[derive(Debug, Clone, PartialEq)]
pub struct Shot {
    pub id: String,
    /// Reference as written in the plan; keys the persisted record.
    pub reference: String,
    pub reference_image: PathBuf,
    pub current_prompt: String,
    /// Prompt the image on disk was rendered from, when known.
    pub generated_prompt: Option<String>,
    pub prompt_history: Vec<PromptHistoryEntry>,
    pub iteration_count: u32,
    pub tts_context: String,
}

impl Shot {
    pub fn new(
        id: impl Into<String>,
        reference_image: impl Into<PathBuf>,
        prompt: impl Into<String>,
        tts_context: impl Into<String>,
    ) -> Self {
        let reference_image = reference_image.into();
        Self {
            id: id.into(),
            reference: reference_image.to_string_lossy().to_string(),
            reference_image,
            current_prompt: prompt.into(),
            generated_prompt: None,
            prompt_history: Vec::new(),
            iteration_count: 0,
            tts_context: tts_context.into(),
        }
    }

    /// Builds a shot from its plan entry, resuming from `record` when it belongs
    /// to the same reference image.
    pub fn from_plan(
        entry: &ShotPlanEntry,
        reference_image: PathBuf,
        record: Option<PromptRecord>,
    ) -> Self {
        let mut shot = Shot::new(
            entry.id.trim(),
            reference_image,
            entry.prompt.trim(),
            entry.tts_context.trim(),
        );
        shot.reference = entry.reference.clone();
        if let Some(record) = record {
            if record.reference == entry.reference && !record.current_prompt.trim().is_empty() {
                shot.current_prompt = record.current_prompt;
                shot.generated_prompt = record.generated_prompt;
                shot.prompt_history = record.prompt_history;
                shot.iteration_count = record.iteration;
            }
        }
        shot
    }

    /// Records the failing prompt and switches to its replacement, consuming one
    /// iteration.
    pub fn abandon_prompt(&mut self, issues: Vec<String>, replacement: String) {
        let abandoned = std::mem::replace(&mut self.current_prompt, replacement);
        self.prompt_history.push(PromptHistoryEntry {
            iteration: self.iteration_count,
            prompt: abandoned,
            issues,
        });
        self.iteration_count += 1;
    }

    /// True when the image on disk was rendered from a prompt the shot has
    /// since abandoned, e.g. after a regeneration that failed.
    pub fn image_is_stale(&self) -> bool {
        self.generated_prompt
            .as_deref()
            .is_some_and(|rendered| rendered != self.current_prompt)
    }

    pub fn to_record(&self) -> PromptRecord {
        PromptRecord {
            shot_id: self.id.clone(),
            reference: self.reference.clone(),
            current_prompt: self.current_prompt.clone(),
            generated_prompt: self.generated_prompt.clone(),
            iteration: self.iteration_count,
            prompt_history: self.prompt_history.clone(),
            updated_at: None,
        }
    }
}
