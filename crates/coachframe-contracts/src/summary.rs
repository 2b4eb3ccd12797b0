use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::now_utc_iso;
use crate::shots::{ShotOutcome, ShotStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotStatusRow {
    pub shot_id: String,
    pub status: ShotStatus,
    pub iterations_used: u32,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingIssue {
    pub shot_id: String,
    pub status: ShotStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseSummary {
    pub run_id: String,
    pub exercise: String,
    pub started_at: String,
    pub finished_at: String,
    pub total: u64,
    pub approved: u64,
    pub flagged: u64,
    pub errored: u64,
    pub ready_for_assembly: bool,
    pub shots: Vec<ShotStatusRow>,
    pub blocking_issues: Vec<BlockingIssue>,
}

impl ExerciseSummary {
    pub fn from_outcomes(
        run_id: &str,
        exercise: &str,
        started_at: &str,
        outcomes: &[ShotOutcome],
    ) -> Self {
        let count = |status: ShotStatus| {
            outcomes
                .iter()
                .filter(|outcome| outcome.status == status)
                .count() as u64
        };
        let total = outcomes.len() as u64;
        let approved = count(ShotStatus::Approved);
        let flagged = count(ShotStatus::Flagged);
        let errored = count(ShotStatus::Error);

        let shots = outcomes
            .iter()
            .map(|outcome| ShotStatusRow {
                shot_id: outcome.shot_id.clone(),
                status: outcome.status,
                iterations_used: outcome.iterations_used,
                confidence: outcome.confidence(),
            })
            .collect();
        let blocking_issues = outcomes
            .iter()
            .filter_map(|outcome| {
                outcome.blocking_reason().map(|reason| BlockingIssue {
                    shot_id: outcome.shot_id.clone(),
                    status: outcome.status,
                    reason,
                })
            })
            .collect();

        Self {
            run_id: run_id.to_string(),
            exercise: exercise.to_string(),
            started_at: started_at.to_string(),
            finished_at: now_utc_iso(),
            total,
            approved,
            flagged,
            errored,
            ready_for_assembly: approved == total && flagged == 0 && errored == 0,
            shots,
            blocking_issues,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        crate::read_json(path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseRow {
    pub exercise: String,
    pub ready_for_assembly: bool,
    pub approved: u64,
    pub flagged: u64,
    pub errored: u64,
    /// Set when the exercise could not be run at all.
    pub error: Option<String>,
}

impl ExerciseRow {
    pub fn from_summary(summary: &ExerciseSummary) -> Self {
        Self {
            exercise: summary.exercise.clone(),
            ready_for_assembly: summary.ready_for_assembly,
            approved: summary.approved,
            flagged: summary.flagged,
            errored: summary.errored,
            error: None,
        }
    }

    pub fn failed(exercise: &str, error: impl Into<String>) -> Self {
        Self {
            exercise: exercise.to_string(),
            ready_for_assembly: false,
            approved: 0,
            flagged: 0,
            errored: 0,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub exercises: Vec<ExerciseRow>,
}

impl BatchSummary {
    pub fn new(run_id: &str, started_at: &str, exercises: Vec<ExerciseRow>) -> Self {
        Self {
            run_id: run_id.to_string(),
            started_at: started_at.to_string(),
            finished_at: now_utc_iso(),
            exercises,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exercises
            .iter()
            .all(|row| row.error.is_none() && row.ready_for_assembly)
    }
}

/// Writes any summary as pretty JSON, stamping `ts` and merging `extra` last.
pub fn write_summary<T: Serialize>(
    path: &Path,
    summary: &T,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("summary".to_string(), other);
            map
        }
    };
    payload.insert("ts".into(), now_utc_iso().into());
    payload.extend(extra.into_iter().flatten().map(|(k, v)| (k.clone(), v.clone())));
    crate::write_json_pretty(path, &payload)
}
