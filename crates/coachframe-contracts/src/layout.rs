use std::path::{Path, PathBuf};

use anyhow::Context;

pub const PLAN_FILE: &str = "shots.json";

/// Files that belong to one shot of one exercise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShotPaths {
    pub dir: PathBuf,
    pub image: PathBuf,
    pub prompt_record: PathBuf,
    pub outcome: PathBuf,
}

impl ShotPaths {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            image: dir.join("image.png"),
            prompt_record: dir.join("prompt.json"),
            outcome: dir.join("outcome.json"),
            dir,
        }
    }
}

/// On-disk layout of a content root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentLayout {
    root: PathBuf,
}

impl ContentLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn exercises_dir(&self) -> PathBuf {
        self.root.join("exercises")
    }

    pub fn exercise_dir(&self, exercise: &str) -> PathBuf {
        self.exercises_dir().join(exercise)
    }

    pub fn plan_path(&self, exercise: &str) -> PathBuf {
        self.exercise_dir(exercise).join(PLAN_FILE)
    }

    pub fn summary_path(&self, exercise: &str) -> PathBuf {
        self.exercise_dir(exercise).join("summary.json")
    }

    pub fn events_path(&self, exercise: &str) -> PathBuf {
        self.exercise_dir(exercise).join("events.jsonl")
    }

    pub fn batch_summary_path(&self) -> PathBuf {
        self.root.join("batch-summary.json")
    }

    pub fn shot_paths(&self, exercise: &str, shot_id: &str) -> ShotPaths {
        ShotPaths::in_dir(self.exercise_dir(exercise).join("shots").join(shot_id))
    }

    pub fn resolve_reference(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference.trim());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Exercise names that have a shot plan, sorted lexically.
    pub fn exercises(&self) -> anyhow::Result<Vec<String>> {
        let dir = self.exercises_dir();
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed listing exercises in {}", dir.display()))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || !path.join(PLAN_FILE).is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|value| value.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
