use coachframe_contracts::events::{EventPayload, EventWriter};
use coachframe_contracts::layout::ShotPaths;
use coachframe_contracts::shots::{Shot, ShotOutcome, ShotStatus};
use coachframe_contracts::validation::ValidationResult;
use serde_json::{json, Value};

use crate::error::{GenerationError, JudgeError};
use crate::generator::Collaborators;
use crate::judge::JudgeRequest;
use crate::media::{encode_image, file_sha256, store_as_png, AnchorCache, EncodedImage};
use crate::payload::map_object;
use crate::refiner::{refine_or_keep, RefineRequest};
use crate::throttle::Throttle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub criterion_bar: f64,
    pub skip_regeneration: bool,
}

/// Run-wide state the loop borrows for one shot.
pub struct LoopContext<'a> {
    pub cache: &'a mut AnchorCache,
    pub throttle: &'a mut Throttle,
    pub events: &'a EventWriter,
}

/// Validate, refine and regenerate one shot until it is approved, flagged or
/// fails. Holds no state between shots; resume data lives on the [`Shot`].
pub struct ShotQualityLoop<'c> {
    collaborators: &'c Collaborators,
    settings: LoopSettings,
}

impl<'c> ShotQualityLoop<'c> {
    pub fn new(collaborators: &'c Collaborators, settings: LoopSettings) -> Self {
        Self {
            collaborators,
            settings,
        }
    }

    pub fn run(&self, shot: &mut Shot, paths: &ShotPaths, ctx: &mut LoopContext<'_>) -> ShotOutcome {
        let events = ctx.events.scoped("shot_id", shot.id.clone());
        emit(
            &events,
            "shot_started",
            json!({
                "iteration": shot.iteration_count,
                "max_iterations": self.settings.max_iterations,
                "skip_regeneration": self.settings.skip_regeneration,
            }),
        );
        tracing::info!(
            shot = %shot.id,
            iteration = shot.iteration_count,
            "validating shot"
        );

        let reference = match ctx.cache.load(&shot.reference_image) {
            Ok(reference) => reference,
            Err(err) => {
                let err = JudgeError::Image {
                    path: shot.reference_image.clone(),
                    reason: format!("{err:#}"),
                };
                return self.finish(shot, paths, &events, ShotStatus::Error, None, Some(err.to_string()));
            }
        };

        let stale = shot.image_is_stale();
        if !paths.image.exists() || stale {
            if stale {
                tracing::info!(shot = %shot.id, "image predates the current prompt; regenerating");
            }
            ctx.throttle.wait();
            match self.regenerate(&reference, &shot.current_prompt, paths) {
                Ok(()) => {
                    shot.generated_prompt = Some(shot.current_prompt.clone());
                    persist_record(shot, paths);
                    emit(
                        &events,
                        "shot_seeded",
                        json!({"prompt": shot.current_prompt, "replaced_stale_image": stale}),
                    );
                }
                Err(err) => {
                    emit(&events, "generation_failed", json!({"stage": "seed", "error": err.to_string()}));
                    return self.finish(shot, paths, &events, ShotStatus::Error, None, Some(err.to_string()));
                }
            }
        } else if shot.generated_prompt.is_none() {
            // An image placed by hand belongs to whatever prompt first judges it.
            shot.generated_prompt = Some(shot.current_prompt.clone());
        }

        loop {
            let validation = match self.validate(shot, &reference, paths, ctx) {
                Ok(validation) => validation,
                Err(err) => {
                    tracing::warn!(shot = %shot.id, error = %err, "judge failed");
                    emit(
                        &events,
                        "judge_failed",
                        json!({"iteration": shot.iteration_count, "error": err.to_string()}),
                    );
                    return self.finish(shot, paths, &events, ShotStatus::Error, None, Some(err.to_string()));
                }
            };

            let failing = validation.failing_criteria(self.settings.criterion_bar);
            emit(
                &events,
                "validation_completed",
                json!({
                    "iteration": shot.iteration_count,
                    "overall_pass": validation.overall_pass,
                    "confidence": validation.confidence,
                    "failing_criteria": failing
                        .iter()
                        .map(|(criterion, score)| json!({"criterion": criterion.as_str(), "score": score}))
                        .collect::<Vec<Value>>(),
                    "issues": validation.issues,
                }),
            );

            if validation.overall_pass {
                return self.finish(shot, paths, &events, ShotStatus::Approved, Some(validation), None);
            }
            if !failing.is_empty() {
                let listed = failing
                    .iter()
                    .map(|(criterion, score)| format!("{criterion}={score:.2}"))
                    .collect::<Vec<String>>()
                    .join(", ");
                tracing::info!(shot = %shot.id, failing = %listed, "criteria below bar");
            }
            if shot.iteration_count >= self.settings.max_iterations || self.settings.skip_regeneration {
                return self.finish(shot, paths, &events, ShotStatus::Flagged, Some(validation), None);
            }

            ctx.throttle.wait();
            let refinement = refine_or_keep(
                self.collaborators.refiner.as_ref(),
                &RefineRequest {
                    original_prompt: &shot.current_prompt,
                    issues: &validation.issues,
                    suggestions: &validation.suggestions,
                    criteria_scores: &validation.criteria_scores,
                },
            );
            if let Some(reason) = refinement.fallback.as_deref() {
                tracing::warn!(shot = %shot.id, reason, "refiner failed; keeping prompt");
                emit(
                    &events,
                    "refiner_fallback",
                    json!({"iteration": shot.iteration_count, "reason": reason}),
                );
            }
            shot.abandon_prompt(validation.issues.clone(), refinement.prompt);
            emit(
                &events,
                "prompt_refined",
                json!({"iteration": shot.iteration_count, "prompt": shot.current_prompt}),
            );
            persist_record(shot, paths);

            ctx.throttle.wait();
            if let Err(err) = self.regenerate(&reference, &shot.current_prompt, paths) {
                tracing::warn!(shot = %shot.id, error = %err, "regeneration failed");
                emit(
                    &events,
                    "generation_failed",
                    json!({"iteration": shot.iteration_count, "error": err.to_string()}),
                );
                return self.finish(
                    shot,
                    paths,
                    &events,
                    ShotStatus::Error,
                    Some(validation),
                    Some(err.to_string()),
                );
            }
            shot.generated_prompt = Some(shot.current_prompt.clone());
            persist_record(shot, paths);
            emit(
                &events,
                "regeneration_completed",
                json!({"iteration": shot.iteration_count}),
            );
        }
    }

    fn validate(
        &self,
        shot: &Shot,
        reference: &EncodedImage,
        paths: &ShotPaths,
        ctx: &mut LoopContext<'_>,
    ) -> Result<ValidationResult, JudgeError> {
        let generated = encode_image(&paths.image, ctx.cache.max_dim()).map_err(|err| {
            JudgeError::Image {
                path: paths.image.clone(),
                reason: format!("{err:#}"),
            }
        })?;
        ctx.throttle.wait();
        self.collaborators.judge.judge(&JudgeRequest {
            generated: &generated,
            reference,
            prompt: &shot.current_prompt,
            tts_context: &shot.tts_context,
        })
    }

    fn regenerate(
        &self,
        reference: &EncodedImage,
        prompt: &str,
        paths: &ShotPaths,
    ) -> Result<(), GenerationError> {
        let image = self.collaborators.generator.generate(reference, prompt)?;
        store_as_png(&image, &paths.image).map_err(|err| GenerationError::Store {
            path: paths.image.clone(),
            reason: format!("{err:#}"),
        })
    }

    fn finish(
        &self,
        shot: &Shot,
        paths: &ShotPaths,
        events: &EventWriter,
        status: ShotStatus,
        validation: Option<ValidationResult>,
        error: Option<String>,
    ) -> ShotOutcome {
        persist_record(shot, paths);
        let mut outcome = ShotOutcome::new(
            &shot.id,
            status,
            shot.iteration_count,
            validation,
            &shot.current_prompt,
            &paths.image,
        )
        .with_image_digest(file_sha256(&paths.image));
        if let Some(error) = error {
            outcome = outcome.with_error(error);
        }
        if let Err(err) = outcome.write(&paths.outcome) {
            tracing::error!(shot = %shot.id, error = %err, "failed writing outcome");
        }

        emit(
            events,
            "shot_finished",
            json!({
                "status": status.as_str(),
                "iterations_used": outcome.iterations_used,
                "confidence": outcome.confidence(),
                "error": outcome.error,
            }),
        );
        match status {
            ShotStatus::Approved => tracing::info!(
                shot = %shot.id,
                iterations = outcome.iterations_used,
                "shot approved"
            ),
            _ => tracing::warn!(
                shot = %shot.id,
                status = %status,
                reason = %outcome.blocking_reason().unwrap_or_default(),
                "shot needs attention"
            ),
        }
        outcome
    }
}

fn persist_record(shot: &Shot, paths: &ShotPaths) {
    let mut record = shot.to_record();
    if let Err(err) = record.write(&paths.prompt_record) {
        tracing::error!(shot = %shot.id, error = %err, "failed writing prompt record");
    }
}

fn emit(events: &EventWriter, event_type: &str, payload: Value) {
    let payload: EventPayload = map_object(payload);
    if let Err(err) = events.emit(event_type, payload) {
        tracing::warn!(event = event_type, error = %err, "failed writing event");
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use coachframe_contracts::events::EventWriter;
    use coachframe_contracts::layout::ShotPaths;
    use coachframe_contracts::shots::{
        PromptHistoryEntry, PromptRecord, Shot, ShotOutcome, ShotPlanEntry, ShotStatus,
    };
    use serde_json::Value;

    use super::{LoopContext, LoopSettings, ShotQualityLoop};
    use crate::error::{GenerationError, JudgeError, RefinerError};
    use crate::media::AnchorCache;
    use crate::testing::{failing, passing, write_reference, Calls, Script};
    use crate::throttle::Throttle;

    struct Fixture {
        _temp: tempfile::TempDir,
        reference: PathBuf,
        paths: ShotPaths,
        events_path: PathBuf,
    }

    impl Fixture {
        fn new(seeded: bool) -> anyhow::Result<Self> {
            let temp = tempfile::tempdir()?;
            let reference = temp.path().join("anchors").join("hang.png");
            write_reference(&reference, "anchor")?;
            let paths = ShotPaths::in_dir(temp.path().join("shots").join("03-pull-start"));
            if seeded {
                write_reference(&paths.image, "first render")?;
            }
            let events_path = temp.path().join("events.jsonl");
            Ok(Self {
                _temp: temp,
                reference,
                paths,
                events_path,
            })
        }

        fn shot(&self) -> Shot {
            Shot::new("03-pull-start", &self.reference, "dead hang, arms straight", "start from a dead hang")
        }

        fn run(&self, script: Script, settings: LoopSettings, shot: &mut Shot) -> (ShotOutcome, Calls) {
            let (collaborators, calls) = script.into_collaborators();
            let mut cache = AnchorCache::new(256);
            let mut throttle = Throttle::new(Duration::ZERO);
            let events = EventWriter::new(&self.events_path, "run-test");
            let mut ctx = LoopContext {
                cache: &mut cache,
                throttle: &mut throttle,
                events: &events,
            };
            let outcome = ShotQualityLoop::new(&collaborators, settings).run(shot, &self.paths, &mut ctx);
            drop(collaborators);
            let calls = std::sync::Arc::try_unwrap(calls)
                .ok()
                .and_then(|calls| calls.into_inner().ok())
                .unwrap_or_default();
            (outcome, calls)
        }

        fn event_types(&self) -> anyhow::Result<Vec<String>> {
            read_event_types(&self.events_path)
        }
    }

    fn read_event_types(path: &Path) -> anyhow::Result<Vec<String>> {
        let raw = std::fs::read_to_string(path)?;
        let mut types = Vec::new();
        for line in raw.lines() {
            let event: Value = serde_json::from_str(line)?;
            types.push(event["type"].as_str().unwrap_or_default().to_string());
        }
        Ok(types)
    }

    fn settings(max_iterations: u32) -> LoopSettings {
        LoopSettings {
            max_iterations,
            criterion_bar: 0.7,
            skip_regeneration: false,
        }
    }

    #[test]
    fn first_pass_approval_makes_no_other_calls() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut shot = fixture.shot();
        let script = Script {
            verdicts: vec![Ok(passing(0.9))],
            ..Script::default()
        };
        let (outcome, calls) = fixture.run(script, settings(2), &mut shot);

        assert_eq!(outcome.status, ShotStatus::Approved);
        assert_eq!(outcome.iterations_used, 0);
        assert!(calls.refined_prompts.is_empty());
        assert!(calls.generated_prompts.is_empty());
        assert!(outcome.image_sha256.is_some());

        let stored = ShotOutcome::load(&fixture.paths.outcome)?.expect("outcome written");
        assert_eq!(stored, outcome);
        let record = PromptRecord::load(&fixture.paths.prompt_record)?.expect("record written");
        assert_eq!(record.iteration, 0);
        assert_eq!(
            fixture.event_types()?,
            vec!["shot_started", "validation_completed", "shot_finished"]
        );
        Ok(())
    }

    #[test]
    fn second_attempt_approval_uses_one_iteration() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut shot = fixture.shot();
        let script = Script {
            verdicts: vec![Ok(failing("pose wrong")), Ok(passing(0.8))],
            replies: vec![Ok("dead hang, elbows locked".to_string())],
            ..Script::default()
        };
        let (outcome, calls) = fixture.run(script, settings(2), &mut shot);

        assert_eq!(outcome.status, ShotStatus::Approved);
        assert_eq!(outcome.iterations_used, 1);
        assert_eq!(outcome.prompt_used, "dead hang, elbows locked");
        assert_eq!(shot.prompt_history.len(), 1);
        assert_eq!(shot.prompt_history[0].issues, vec!["pose wrong"]);
        assert_eq!(calls.generated_prompts, vec!["dead hang, elbows locked"]);
        assert_eq!(calls.judged_prompts.len(), 2);

        let record = PromptRecord::load(&fixture.paths.prompt_record)?.expect("record written");
        assert_eq!(record.iteration, 1);
        assert_eq!(record.prompt_history.len(), 1);
        Ok(())
    }

    #[test]
    fn exhausted_budget_flags_shot() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut shot = fixture.shot();
        let script = Script {
            verdicts: vec![Ok(failing("a")), Ok(failing("b")), Ok(failing("c"))],
            ..Script::default()
        };
        let (outcome, calls) = fixture.run(script, settings(2), &mut shot);

        assert_eq!(outcome.status, ShotStatus::Flagged);
        assert_eq!(outcome.iterations_used, 2);
        assert_eq!(shot.prompt_history.len(), 2);
        assert_eq!(calls.judged_prompts.len(), 3);
        assert_eq!(calls.generated_prompts.len(), 2);
        assert_eq!(outcome.blocking_reason().as_deref(), Some("c"));
        Ok(())
    }

    #[test]
    fn skip_regeneration_flags_on_first_failure() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut shot = fixture.shot();
        let script = Script {
            verdicts: vec![Ok(failing("pose wrong"))],
            ..Script::default()
        };
        let settings = LoopSettings {
            skip_regeneration: true,
            ..settings(2)
        };
        let (outcome, calls) = fixture.run(script, settings, &mut shot);

        assert_eq!(outcome.status, ShotStatus::Flagged);
        assert_eq!(outcome.iterations_used, 0);
        assert!(calls.refined_prompts.is_empty());
        assert!(calls.generated_prompts.is_empty());
        Ok(())
    }

    #[test]
    fn generation_failure_freezes_iteration_count() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut shot = fixture.shot();
        let script = Script {
            verdicts: vec![Ok(failing("pose wrong"))],
            images: vec![Err(GenerationError::NoImages {
                provider: "fal".to_string(),
            })],
            ..Script::default()
        };
        let (outcome, _calls) = fixture.run(script, settings(2), &mut shot);

        assert_eq!(outcome.status, ShotStatus::Error);
        assert_eq!(outcome.iterations_used, 1);
        assert_eq!(outcome.error.as_deref(), Some("fal returned no images"));
        assert!(outcome.final_validation.is_some());
        assert!(fixture.event_types()?.contains(&"generation_failed".to_string()));
        Ok(())
    }

    #[test]
    fn refiner_failure_regenerates_with_unchanged_prompt() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut shot = fixture.shot();
        let script = Script {
            verdicts: vec![Ok(failing("pose wrong")), Ok(passing(0.85))],
            replies: vec![Err(RefinerError::Request(anyhow::anyhow!("overloaded")))],
            ..Script::default()
        };
        let (outcome, calls) = fixture.run(script, settings(2), &mut shot);

        assert_eq!(outcome.status, ShotStatus::Approved);
        assert_eq!(outcome.iterations_used, 1);
        assert_eq!(calls.generated_prompts, vec!["dead hang, arms straight"]);
        assert_eq!(shot.prompt_history[0].prompt, "dead hang, arms straight");
        assert!(fixture.event_types()?.contains(&"refiner_fallback".to_string()));
        Ok(())
    }

    #[test]
    fn judge_failure_is_an_error_without_consuming_iterations() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut shot = fixture.shot();
        let script = Script {
            verdicts: vec![Err(JudgeError::Malformed("no JSON object".to_string()))],
            ..Script::default()
        };
        let (outcome, calls) = fixture.run(script, settings(2), &mut shot);

        assert_eq!(outcome.status, ShotStatus::Error);
        assert_eq!(outcome.iterations_used, 0);
        assert!(outcome.final_validation.is_none());
        assert!(outcome.error.as_deref().unwrap_or_default().contains("no JSON object"));
        assert!(calls.refined_prompts.is_empty());
        Ok(())
    }

    #[test]
    fn missing_image_is_seeded_before_validation() -> anyhow::Result<()> {
        let fixture = Fixture::new(false)?;
        let mut shot = fixture.shot();
        let (outcome, calls) = fixture.run(Script::default(), settings(2), &mut shot);

        assert_eq!(outcome.status, ShotStatus::Approved);
        assert_eq!(outcome.iterations_used, 0);
        assert_eq!(calls.generated_prompts, vec!["dead hang, arms straight"]);
        assert!(fixture.paths.image.exists());
        assert_eq!(
            fixture.event_types()?,
            vec!["shot_started", "shot_seeded", "validation_completed", "shot_finished"]
        );
        Ok(())
    }

    #[test]
    fn failed_seed_is_an_error() -> anyhow::Result<()> {
        let fixture = Fixture::new(false)?;
        let mut shot = fixture.shot();
        let script = Script {
            images: vec![Err(GenerationError::Status {
                status: 422,
                body: "bad image".to_string(),
            })],
            ..Script::default()
        };
        let (outcome, calls) = fixture.run(script, settings(2), &mut shot);

        assert_eq!(outcome.status, ShotStatus::Error);
        assert_eq!(outcome.iterations_used, 0);
        assert!(calls.judged_prompts.is_empty());
        Ok(())
    }

    #[test]
    fn unreadable_reference_is_an_error() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut shot = Shot::new("03-pull-start", fixture.reference.with_file_name("missing.png"), "p", "");
        let (outcome, calls) = fixture.run(Script::default(), settings(2), &mut shot);

        assert_eq!(outcome.status, ShotStatus::Error);
        assert!(outcome.error.as_deref().unwrap_or_default().contains("missing.png"));
        assert!(calls.judged_prompts.is_empty());
        Ok(())
    }

    #[test]
    fn resumed_shot_at_budget_flags_after_one_judgement() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut shot = fixture.shot();
        shot.prompt_history = vec![
            PromptHistoryEntry {
                iteration: 0,
                prompt: "v0".to_string(),
                issues: Vec::new(),
            },
            PromptHistoryEntry {
                iteration: 1,
                prompt: "v1".to_string(),
                issues: Vec::new(),
            },
        ];
        shot.iteration_count = 2;
        let script = Script {
            verdicts: vec![Ok(failing("still wrong"))],
            ..Script::default()
        };
        let (outcome, calls) = fixture.run(script, settings(2), &mut shot);

        assert_eq!(outcome.status, ShotStatus::Flagged);
        assert_eq!(outcome.iterations_used, 2);
        assert_eq!(calls.judged_prompts.len(), 1);
        assert!(calls.generated_prompts.is_empty());
        Ok(())
    }

    #[test]
    fn resume_after_failed_regeneration_renders_the_refined_prompt_first() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut shot = fixture.shot();
        let script = Script {
            verdicts: vec![Ok(failing("pose wrong"))],
            replies: vec![Ok("REFINED PROMPT".to_string())],
            images: vec![Err(GenerationError::NoImages {
                provider: "fal".to_string(),
            })],
        };
        let (first, _calls) = fixture.run(script, settings(2), &mut shot);
        assert_eq!(first.status, ShotStatus::Error);
        assert_eq!(first.iterations_used, 1);

        let record = PromptRecord::load(&fixture.paths.prompt_record)?.expect("record written");
        assert_eq!(record.current_prompt, "REFINED PROMPT");
        assert_eq!(record.generated_prompt.as_deref(), Some("dead hang, arms straight"));

        let entry = ShotPlanEntry {
            id: "03-pull-start".to_string(),
            reference: fixture.reference.to_string_lossy().to_string(),
            prompt: "dead hang, arms straight".to_string(),
            tts_context: String::new(),
        };
        let mut resumed = Shot::from_plan(&entry, fixture.reference.clone(), Some(record));
        assert!(resumed.image_is_stale());
        let script = Script {
            verdicts: vec![Ok(passing(0.9))],
            ..Script::default()
        };
        let (second, calls) = fixture.run(script, settings(2), &mut resumed);

        assert_eq!(calls.generated_prompts, vec!["REFINED PROMPT"]);
        assert_eq!(calls.judged_prompts, vec!["REFINED PROMPT"]);
        assert_eq!(second.status, ShotStatus::Approved);
        assert_eq!(second.iterations_used, 1);
        assert_eq!(second.prompt_used, "REFINED PROMPT");
        assert_ne!(second.image_sha256, first.image_sha256);

        let record = PromptRecord::load(&fixture.paths.prompt_record)?.expect("record written");
        assert_eq!(record.generated_prompt.as_deref(), Some("REFINED PROMPT"));
        Ok(())
    }

    #[test]
    fn iterations_never_exceed_budget() -> anyhow::Result<()> {
        for max_iterations in 0..4 {
            let fixture = Fixture::new(true)?;
            let mut shot = fixture.shot();
            let script = Script {
                verdicts: (0..10).map(|_| Ok(failing("nope"))).collect(),
                ..Script::default()
            };
            let (outcome, calls) = fixture.run(script, settings(max_iterations), &mut shot);
            assert_eq!(outcome.status, ShotStatus::Flagged);
            assert_eq!(outcome.iterations_used, max_iterations);
            assert_eq!(shot.prompt_history.len() as u32, outcome.iterations_used);
            assert_eq!(calls.judged_prompts.len() as u32, max_iterations + 1);
        }
        Ok(())
    }
}
