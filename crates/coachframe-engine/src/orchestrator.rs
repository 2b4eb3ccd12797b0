use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{bail, Context, Result};
use coachframe_contracts::events::EventWriter;
use coachframe_contracts::layout::{ContentLayout, ShotPaths};
use coachframe_contracts::now_utc_iso;
use coachframe_contracts::shots::{PromptRecord, Shot, ShotOutcome, ShotPlan, ShotPlanEntry, ShotStatus};
use coachframe_contracts::summary::{write_summary, BatchSummary, ExerciseRow, ExerciseSummary};
use serde_json::json;

use crate::config::PipelineConfig;
use crate::generator::Collaborators;
use crate::media::AnchorCache;
use crate::payload::map_object;
use crate::shot_loop::{LoopContext, LoopSettings, ShotQualityLoop};
use crate::throttle::Throttle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Discard persisted prompts, images and outcomes and start from iteration 0.
    pub force: bool,
    pub skip_regeneration: bool,
}

#[derive(Debug, Clone)]
pub struct ExerciseReport {
    pub summary: ExerciseSummary,
    pub outcomes: Vec<ShotOutcome>,
}

impl ExerciseReport {
    pub fn ready_for_assembly(&self) -> bool {
        self.summary.ready_for_assembly
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub summary: BatchSummary,
    pub reports: Vec<ExerciseReport>,
}

/// Runs the quality loop over whole exercises, one shot at a time.
///
/// Owns the anchor cache and throttle so every shot of a run shares them.
pub struct ExerciseOrchestrator {
    layout: ContentLayout,
    collaborators: Collaborators,
    max_iterations: u32,
    criterion_bar: f64,
    cache: AnchorCache,
    throttle: Throttle,
    run_id: String,
}

impl ExerciseOrchestrator {
    pub fn new(config: &PipelineConfig, collaborators: Collaborators) -> Self {
        Self {
            layout: ContentLayout::new(config.root.clone()),
            collaborators,
            max_iterations: config.max_iterations,
            criterion_bar: config.criterion_bar,
            cache: AnchorCache::new(config.vision_max_dim),
            throttle: Throttle::new(config.request_delay),
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(config)?;
        tracing::debug!(
            judge = collaborators.judge.name(),
            refiner = collaborators.refiner.name(),
            generator = collaborators.generator.name(),
            "collaborators ready"
        );
        Ok(Self::new(config, collaborators))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn layout(&self) -> &ContentLayout {
        &self.layout
    }

    pub fn cache(&self) -> &AnchorCache {
        &self.cache
    }

    pub fn run_exercise(&mut self, exercise: &str, options: RunOptions) -> Result<ExerciseReport> {
        let started_at = now_utc_iso();
        let plan = ShotPlan::load(&self.layout.plan_path(exercise))?;
        if plan.exercise.trim() != exercise {
            tracing::warn!(
                exercise,
                plan_exercise = %plan.exercise,
                "plan names a different exercise; using the directory name"
            );
        }

        let events = EventWriter::new(self.layout.events_path(exercise), self.run_id.clone())
            .scoped("exercise", exercise);
        emit(
            &events,
            "exercise_started",
            json!({
                "shots": plan.shots.len(),
                "force": options.force,
                "skip_regeneration": options.skip_regeneration,
                "max_iterations": self.max_iterations,
            }),
        );
        tracing::info!(exercise, shots = plan.shots.len(), "processing exercise");

        let shot_loop = ShotQualityLoop::new(
            &self.collaborators,
            LoopSettings {
                max_iterations: self.max_iterations,
                criterion_bar: self.criterion_bar,
                skip_regeneration: options.skip_regeneration,
            },
        );
        let mut ctx = LoopContext {
            cache: &mut self.cache,
            throttle: &mut self.throttle,
            events: &events,
        };

        let mut outcomes = Vec::with_capacity(plan.shots.len());
        for entry in plan.ordered() {
            let paths = self.layout.shot_paths(exercise, &entry.id);
            if options.force {
                if let Err(err) = discard_shot_state(&paths) {
                    let reason = format!("{err:#}");
                    tracing::error!(exercise, shot = %entry.id, error = %reason, "could not discard shot state");
                    emit(
                        &events,
                        "shot_finished",
                        json!({"shot_id": entry.id, "status": ShotStatus::Error.as_str(), "error": reason}),
                    );
                    let outcome = ShotOutcome::new(
                        &entry.id,
                        ShotStatus::Error,
                        0,
                        None,
                        entry.prompt.trim(),
                        &paths.image,
                    )
                    .with_error(reason);
                    outcomes.push(outcome);
                    continue;
                }
            }
            let record = load_record(&paths, entry);
            if !options.force {
                if let Some(outcome) = reusable_outcome(&paths, entry, record.as_ref()) {
                    tracing::info!(exercise, shot = %entry.id, "already approved; skipping");
                    emit(
                        &events,
                        "shot_skipped",
                        json!({"shot_id": entry.id, "reason": "already approved"}),
                    );
                    outcomes.push(outcome);
                    continue;
                }
            }
            let mut shot = Shot::from_plan(
                entry,
                self.layout.resolve_reference(&entry.reference),
                record,
            );
            outcomes.push(shot_loop.run(&mut shot, &paths, &mut ctx));
        }

        let summary = ExerciseSummary::from_outcomes(&self.run_id, exercise, &started_at, &outcomes);
        write_summary(&self.layout.summary_path(exercise), &summary, None)?;
        emit(
            &events,
            "exercise_finished",
            json!({
                "approved": summary.approved,
                "flagged": summary.flagged,
                "errored": summary.errored,
                "ready_for_assembly": summary.ready_for_assembly,
            }),
        );
        tracing::info!(
            exercise,
            approved = summary.approved,
            flagged = summary.flagged,
            errored = summary.errored,
            ready = summary.ready_for_assembly,
            "exercise finished"
        );
        Ok(ExerciseReport { summary, outcomes })
    }

    /// Runs every exercise under the content root. A failing exercise is
    /// recorded in the batch summary and the rest still run.
    pub fn run_batch(&mut self, options: RunOptions) -> Result<BatchReport> {
        let started_at = now_utc_iso();
        let exercises = self.layout.exercises()?;
        if exercises.is_empty() {
            bail!(
                "no exercises with a shots.json under {}",
                self.layout.exercises_dir().display()
            );
        }

        let mut rows = Vec::with_capacity(exercises.len());
        let mut reports = Vec::new();
        for exercise in &exercises {
            match self.run_exercise(exercise, options) {
                Ok(report) => {
                    rows.push(ExerciseRow::from_summary(&report.summary));
                    reports.push(report);
                }
                Err(err) => {
                    tracing::error!(exercise = %exercise, error = %format!("{err:#}"), "exercise failed");
                    rows.push(ExerciseRow::failed(exercise, format!("{err:#}")));
                }
            }
        }

        let summary = BatchSummary::new(&self.run_id, &started_at, rows);
        write_summary(
            &self.layout.batch_summary_path(),
            &summary,
            Some(&map_object(json!({"exercise_count": exercises.len()}))),
        )?;
        Ok(BatchReport { summary, reports })
    }
}

fn load_record(paths: &ShotPaths, entry: &ShotPlanEntry) -> Option<PromptRecord> {
    match PromptRecord::load(&paths.prompt_record) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(shot = %entry.id, error = %err, "ignoring unreadable prompt record");
            None
        }
    }
}

/// A previous approval stands when its image is still on disk and the prompt
/// record, if any, was made for the same reference.
fn reusable_outcome(
    paths: &ShotPaths,
    entry: &ShotPlanEntry,
    record: Option<&PromptRecord>,
) -> Option<ShotOutcome> {
    if record.is_some_and(|record| record.reference != entry.reference) {
        return None;
    }
    if !paths.image.exists() {
        return None;
    }
    match ShotOutcome::load(&paths.outcome) {
        Ok(Some(outcome)) if outcome.status == ShotStatus::Approved => Some(outcome),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(shot = %entry.id, error = %err, "ignoring unreadable outcome");
            None
        }
    }
}

fn discard_shot_state(paths: &ShotPaths) -> Result<()> {
    for path in [&paths.prompt_record, &paths.image, &paths.outcome] {
        remove_if_present(path)?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed removing {}", path.display())),
    }
}

fn emit(events: &EventWriter, event_type: &str, payload: serde_json::Value) {
    if let Err(err) = events.emit(event_type, map_object(payload)) {
        tracing::warn!(event = event_type, error = %err, "failed writing event");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use coachframe_contracts::layout::ContentLayout;
    use coachframe_contracts::shots::{PromptHistoryEntry, PromptRecord, ShotStatus};
    use coachframe_contracts::summary::ExerciseSummary;
    use serde_json::{json, Value};

    use super::{ExerciseOrchestrator, RunOptions};
    use crate::config::PipelineConfig;
    use crate::error::JudgeError;
    use crate::testing::{failing, passing, write_reference, Script, SharedCalls};

    fn config(root: &Path) -> PipelineConfig {
        PipelineConfig {
            root: root.to_path_buf(),
            request_delay: Duration::ZERO,
            vision_max_dim: 256,
            ..PipelineConfig::default()
        }
    }

    fn write_plan(root: &Path, exercise: &str, shots: Value) -> anyhow::Result<()> {
        let layout = ContentLayout::new(root);
        let path = layout.plan_path(exercise);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            path,
            serde_json::to_string_pretty(&json!({"exercise": exercise, "shots": shots}))?,
        )?;
        Ok(())
    }

    fn pullup_plan(root: &Path) -> anyhow::Result<()> {
        write_reference(&root.join("anchors").join("hang.png"), "hang")?;
        write_reference(&root.join("anchors").join("top.png"), "top")?;
        write_plan(
            root,
            "pullup",
            json!([
                {"id": "02-pull-top", "reference": "anchors/top.png", "prompt": "chin over bar"},
                {"id": "01-pull-start", "reference": "anchors/hang.png", "prompt": "dead hang",
                 "tts_context": "start from a dead hang"},
            ]),
        )
    }

    fn orchestrator(root: &Path, script: Script) -> (ExerciseOrchestrator, SharedCalls) {
        let (collaborators, calls) = script.into_collaborators();
        (ExerciseOrchestrator::new(&config(root), collaborators), calls)
    }

    fn snapshot(calls: &SharedCalls) -> (Vec<String>, Vec<String>) {
        calls
            .lock()
            .map(|calls| (calls.judged_prompts.clone(), calls.generated_prompts.clone()))
            .unwrap_or_default()
    }

    #[test]
    fn shots_run_in_lexical_order_and_summary_is_written() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        pullup_plan(temp.path())?;
        let (mut orchestrator, calls) = orchestrator(temp.path(), Script::default());

        let report = orchestrator.run_exercise("pullup", RunOptions::default())?;
        assert!(report.ready_for_assembly());
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.outcomes[0].shot_id, "01-pull-start");
        assert_eq!(report.outcomes[1].shot_id, "02-pull-top");
        let (judged, generated) = snapshot(&calls);
        assert_eq!(judged, vec!["dead hang", "chin over bar"]);
        assert_eq!(generated, vec!["dead hang", "chin over bar"]);
        assert_eq!(orchestrator.cache().len(), 2);

        let layout = ContentLayout::new(temp.path());
        let stored = ExerciseSummary::load(&layout.summary_path("pullup"))?.expect("summary");
        assert_eq!(stored.run_id, orchestrator.run_id());
        assert!(stored.ready_for_assembly);
        Ok(())
    }

    #[test]
    fn failing_shot_does_not_stop_its_siblings() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        pullup_plan(temp.path())?;
        let script = Script {
            verdicts: vec![
                Err(JudgeError::Malformed("garbled".to_string())),
                Ok(passing(0.9)),
            ],
            ..Script::default()
        };
        let (mut orchestrator, _calls) = orchestrator(temp.path(), script);

        let report = orchestrator.run_exercise("pullup", RunOptions::default())?;
        assert_eq!(report.outcomes[0].status, ShotStatus::Error);
        assert_eq!(report.outcomes[1].status, ShotStatus::Approved);
        assert!(!report.ready_for_assembly());
        assert_eq!(report.summary.errored, 1);
        assert_eq!(report.summary.blocking_issues.len(), 1);
        assert_eq!(report.summary.blocking_issues[0].shot_id, "01-pull-start");
        Ok(())
    }

    #[test]
    fn broken_exercise_does_not_stop_the_batch() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        pullup_plan(temp.path())?;
        write_plan(
            temp.path(),
            "plank",
            json!([
                {"id": "01", "reference": "anchors/hang.png", "prompt": "a"},
                {"id": "01", "reference": "anchors/hang.png", "prompt": "b"},
            ]),
        )?;
        let (mut orchestrator, _calls) = orchestrator(temp.path(), Script::default());

        let batch = orchestrator.run_batch(RunOptions::default())?;
        assert!(!batch.summary.succeeded());
        assert_eq!(batch.summary.exercises.len(), 2);
        let plank = &batch.summary.exercises[0];
        assert_eq!(plank.exercise, "plank");
        assert!(plank.error.is_some());
        let pullup = &batch.summary.exercises[1];
        assert!(pullup.ready_for_assembly);
        assert_eq!(pullup.approved, 2);

        let layout = ContentLayout::new(temp.path());
        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(layout.batch_summary_path())?)?;
        assert_eq!(raw["exercise_count"], json!(2));
        assert_eq!(raw["run_id"], json!(orchestrator.run_id()));
        Ok(())
    }

    #[test]
    fn approved_shots_are_reused_unless_forced() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        pullup_plan(temp.path())?;
        let (mut first, _calls) = orchestrator(temp.path(), Script::default());
        first.run_exercise("pullup", RunOptions::default())?;

        let (mut second, calls) = orchestrator(temp.path(), Script::default());
        let report = second.run_exercise("pullup", RunOptions::default())?;
        assert!(report.ready_for_assembly());
        assert_eq!(snapshot(&calls), (Vec::new(), Vec::new()));

        let (mut forced, calls) = orchestrator(temp.path(), Script::default());
        let report = forced.run_exercise(
            "pullup",
            RunOptions {
                force: true,
                ..RunOptions::default()
            },
        )?;
        assert!(report.ready_for_assembly());
        let (judged, generated) = snapshot(&calls);
        assert_eq!(judged.len(), 2);
        assert_eq!(generated.len(), 2);
        Ok(())
    }

    #[test]
    fn flagged_shot_resumes_from_its_prompt_record() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        pullup_plan(temp.path())?;
        let layout = ContentLayout::new(temp.path());
        let paths = layout.shot_paths("pullup", "01-pull-start");
        write_reference(&paths.image, "earlier attempt")?;
        let mut record = PromptRecord {
            shot_id: "01-pull-start".to_string(),
            reference: "anchors/hang.png".to_string(),
            current_prompt: "dead hang, elbows locked".to_string(),
            generated_prompt: Some("dead hang, elbows locked".to_string()),
            iteration: 1,
            prompt_history: vec![PromptHistoryEntry {
                iteration: 0,
                prompt: "dead hang".to_string(),
                issues: vec!["elbows bent".to_string()],
            }],
            updated_at: None,
        };
        record.write(&paths.prompt_record)?;

        let script = Script {
            verdicts: vec![Ok(failing("still bent")), Ok(failing("still bent"))],
            ..Script::default()
        };
        let (mut orchestrator, calls) = orchestrator(temp.path(), script);
        let report = orchestrator.run_exercise("pullup", RunOptions::default())?;

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, ShotStatus::Flagged);
        assert_eq!(outcome.iterations_used, 2);
        let (judged, _generated) = snapshot(&calls);
        assert_eq!(judged[0], "dead hang, elbows locked");

        let stored = PromptRecord::load(&paths.prompt_record)?.expect("record");
        assert_eq!(stored.iteration, 2);
        assert_eq!(stored.prompt_history.len(), 2);
        assert_eq!(stored.prompt_history[0].prompt, "dead hang");
        Ok(())
    }

    #[test]
    fn force_restarts_from_iteration_zero() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        pullup_plan(temp.path())?;
        let layout = ContentLayout::new(temp.path());
        let paths = layout.shot_paths("pullup", "01-pull-start");
        let mut record = PromptRecord {
            shot_id: "01-pull-start".to_string(),
            reference: "anchors/hang.png".to_string(),
            current_prompt: "stale prompt".to_string(),
            generated_prompt: None,
            iteration: 0,
            prompt_history: Vec::new(),
            updated_at: None,
        };
        record.write(&paths.prompt_record)?;

        let (mut orchestrator, calls) = orchestrator(temp.path(), Script::default());
        let report = orchestrator.run_exercise(
            "pullup",
            RunOptions {
                force: true,
                skip_regeneration: false,
            },
        )?;
        assert_eq!(report.outcomes[0].prompt_used, "dead hang");
        let (judged, _generated) = snapshot(&calls);
        assert_eq!(judged[0], "dead hang");
        Ok(())
    }

    #[test]
    fn force_cleanup_failure_errors_only_that_shot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        pullup_plan(temp.path())?;
        let layout = ContentLayout::new(temp.path());
        let blocked = layout.shot_paths("pullup", "01-pull-start");
        std::fs::create_dir_all(&blocked.image)?;

        let (mut orchestrator, calls) = orchestrator(temp.path(), Script::default());
        let report = orchestrator.run_exercise(
            "pullup",
            RunOptions {
                force: true,
                ..RunOptions::default()
            },
        )?;

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].status, ShotStatus::Error);
        assert_eq!(report.outcomes[0].iterations_used, 0);
        assert!(report.outcomes[0]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("failed removing"));
        assert_eq!(report.outcomes[1].status, ShotStatus::Approved);
        let (judged, _generated) = snapshot(&calls);
        assert_eq!(judged, vec!["chin over bar"]);

        let stored = ExerciseSummary::load(&layout.summary_path("pullup"))?.expect("summary");
        assert_eq!(stored.errored, 1);
        assert!(layout.shot_paths("pullup", "02-pull-top").outcome.exists());
        Ok(())
    }

    #[test]
    fn missing_plan_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (mut orchestrator, _calls) = orchestrator(temp.path(), Script::default());
        assert!(orchestrator.run_exercise("deadlift", RunOptions::default()).is_err());
        assert!(orchestrator.run_batch(RunOptions::default()).is_err());
        Ok(())
    }
}
