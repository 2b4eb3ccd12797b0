use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{now_utc_iso, read_json, write_json_pretty};

/// A prompt that was tried and abandoned after a failed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptHistoryEntry {
    pub iteration: u32,
    pub prompt: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Persisted `prompt.json`; the resume basis for a shot across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub shot_id: String,
    pub reference: String,
    pub current_prompt: String,
    /// Prompt that rendered the image currently on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_prompt: Option<String>,
    pub iteration: u32,
    #[serde(default)]
    pub prompt_history: Vec<PromptHistoryEntry>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl PromptRecord {
    /// Reads a record, returning `None` when the shot has never been processed.
    ///
    /// History and iteration are reconciled so that one history entry exists per
    /// consumed iteration.
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        let Some(mut record) = read_json::<PromptRecord>(path)? else {
            return Ok(None);
        };
        record.reconcile();
        Ok(Some(record))
    }

    pub fn write(&mut self, path: &Path) -> anyhow::Result<()> {
        self.updated_at = Some(now_utc_iso());
        write_json_pretty(path, self)
    }

    fn reconcile(&mut self) {
        let history_len = self.prompt_history.len() as u32;
        if history_len > self.iteration {
            self.prompt_history.truncate(self.iteration as usize);
        } else if history_len < self.iteration {
            self.iteration = history_len;
        }
    }
}
