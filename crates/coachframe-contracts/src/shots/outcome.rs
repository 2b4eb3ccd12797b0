use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::validation::ValidationResult;
use crate::{now_utc_iso, read_json, write_json_pretty};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotStatus {
    Approved,
    Flagged,
    Error,
}

impl ShotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ShotStatus::Approved => "approved",
            ShotStatus::Flagged => "flagged",
            ShotStatus::Error => "error",
        }
    }
}

impl fmt::Display for ShotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal record for a shot, written once per run as `outcome.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotOutcome {
    pub shot_id: String,
    pub status: ShotStatus,
    pub iterations_used: u32,
    pub final_validation: Option<ValidationResult>,
    pub prompt_used: String,
    #[serde(default)]
    pub error: Option<String>,
    pub image_path: String,
    #[serde(default)]
    pub image_sha256: Option<String>,
    pub timestamp: String,
}

impl ShotOutcome {
    pub fn new(
        shot_id: &str,
        status: ShotStatus,
        iterations_used: u32,
        final_validation: Option<ValidationResult>,
        prompt_used: &str,
        image_path: &Path,
    ) -> Self {
        Self {
            shot_id: shot_id.to_string(),
            status,
            iterations_used,
            final_validation,
            prompt_used: prompt_used.to_string(),
            error: None,
            image_path: image_path.to_string_lossy().to_string(),
            image_sha256: None,
            timestamp: now_utc_iso(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_image_digest(mut self, digest: Option<String>) -> Self {
        self.image_sha256 = digest;
        self
    }

    /// One-line explanation of why this shot blocks assembly.
    pub fn blocking_reason(&self) -> Option<String> {
        match self.status {
            ShotStatus::Approved => None,
            ShotStatus::Error => Some(
                self.error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
            ShotStatus::Flagged => {
                let issues = self
                    .final_validation
                    .as_ref()
                    .map(|validation| validation.issues.join("; "))
                    .unwrap_or_default();
                if issues.trim().is_empty() {
                    Some("validation failed".to_string())
                } else {
                    Some(issues)
                }
            }
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        self.final_validation
            .as_ref()
            .map(|validation| validation.confidence)
    }

    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        read_json(path)
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        write_json_pretty(path, self)
    }
}
