use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// One planned frame of an exercise video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotPlanEntry {
    pub id: String,
    /// Anchor image, relative to the content root unless absolute.
    pub reference: String,
    pub prompt: String,
    #[serde(default)]
    pub tts_context: String,
}

/// Contents of an exercise's `shots.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotPlan {
    pub exercise: String,
    pub shots: Vec<ShotPlanEntry>,
}

impl ShotPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading shot plan {}", path.display()))?;
        let mut plan: ShotPlan = serde_json::from_str(&raw)
            .with_context(|| format!("shot plan {} is not valid JSON", path.display()))?;
        for entry in &mut plan.shots {
            let trimmed = entry.id.trim();
            if trimmed.len() != entry.id.len() {
                entry.id = trimmed.to_string();
            }
        }
        plan.validate()
            .with_context(|| format!("shot plan {} rejected", path.display()))?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shots.is_empty() {
            bail!("plan for '{}' has no shots", self.exercise);
        }
        let mut seen = HashSet::new();
        for entry in &self.shots {
            let id = entry.id.trim();
            if id.is_empty() {
                bail!("shot with empty id");
            }
            if id.contains(['/', '\\']) || id == "." || id == ".." {
                bail!("shot id '{id}' is not a valid directory name");
            }
            if entry.prompt.trim().is_empty() {
                bail!("shot '{id}' has an empty prompt");
            }
            if entry.reference.trim().is_empty() {
                bail!("shot '{id}' has no reference image");
            }
            if !seen.insert(id.to_string()) {
                bail!("duplicate shot id '{id}'");
            }
        }
        Ok(())
    }

    /// Entries in processing order (lexical by id).
    pub fn ordered(&self) -> Vec<&ShotPlanEntry> {
        let mut entries: Vec<&ShotPlanEntry> = self.shots.iter().collect();
        entries.sort_by(|left, right| left.id.cmp(&right.id));
        entries
    }
}
