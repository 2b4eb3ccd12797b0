use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed set of things the vision judge scores on every shot.
///
/// Declaration order doubles as the tie-break order when ranking criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    CharacterConsistency,
    PoseAccuracy,
    MuscleHighlighting,
    ContextMatch,
    NoHallucination,
}

impl Criterion {
    pub const ALL: [Criterion; 5] = [
        Criterion::CharacterConsistency,
        Criterion::PoseAccuracy,
        Criterion::MuscleHighlighting,
        Criterion::ContextMatch,
        Criterion::NoHallucination,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Criterion::CharacterConsistency => "character_consistency",
            Criterion::PoseAccuracy => "pose_accuracy",
            Criterion::MuscleHighlighting => "muscle_highlighting",
            Criterion::ContextMatch => "context_match",
            Criterion::NoHallucination => "no_hallucination",
        }
    }

    /// Short phrase used when talking to the judge and refiner models.
    pub fn describe(self) -> &'static str {
        match self {
            Criterion::CharacterConsistency => {
                "same person as the reference: face, hair, skin tone, body type, outfit"
            }
            Criterion::PoseAccuracy => "body position matches the described exercise phase",
            Criterion::MuscleHighlighting => {
                "the working muscles are visibly emphasised where the prompt asks for it"
            }
            Criterion::ContextMatch => "the frame supports what the narration says at this moment",
            Criterion::NoHallucination => {
                "no extra limbs, warped equipment, duplicated people or stray text"
            }
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Criterion::ALL
            .into_iter()
            .find(|criterion| criterion.as_str() == normalized)
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type CriteriaScores = BTreeMap<Criterion, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub overall_pass: bool,
    pub confidence: f64,
    pub criteria_scores: CriteriaScores,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn score(&self, criterion: Criterion) -> Option<f64> {
        self.criteria_scores.get(&criterion).copied()
    }

    pub fn failing_criteria(&self, bar: f64) -> Vec<(Criterion, f64)> {
        failing_criteria(&self.criteria_scores, bar)
    }

    pub fn lowest_criteria(&self, count: usize) -> Vec<(Criterion, f64)> {
        lowest_criteria(&self.criteria_scores, count)
    }
}

pub fn failing_criteria(scores: &CriteriaScores, bar: f64) -> Vec<(Criterion, f64)> {
    Criterion::ALL
        .into_iter()
        .filter_map(|criterion| scores.get(&criterion).map(|score| (criterion, *score)))
        .filter(|(_, score)| *score < bar)
        .collect()
}

pub fn lowest_criteria(scores: &CriteriaScores, count: usize) -> Vec<(Criterion, f64)> {
    let mut ranked: Vec<(Criterion, f64)> = Criterion::ALL
        .into_iter()
        .filter_map(|criterion| scores.get(&criterion).map(|score| (criterion, *score)))
        .collect();
    // stable: equal scores keep declaration order
    ranked.sort_by(|left, right| left.1.total_cmp(&right.1));
    ranked.truncate(count);
    ranked
}
