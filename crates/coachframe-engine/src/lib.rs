pub mod anthropic;
pub mod config;
pub mod error;
pub mod generator;
pub mod judge;
pub mod media;
pub mod orchestrator;
pub mod payload;
pub mod refiner;
pub mod shot_loop;
pub mod throttle;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use error::{GenerationError, JudgeError, RefinerError};
pub use generator::{Collaborators, DryrunEditor, FalEditor, ImageGenerator};
pub use judge::{ClaudeJudge, DryrunJudge, JudgeRequest, PassPolicy, VisionJudge};
pub use media::{AnchorCache, EncodedImage, ImageBytes};
pub use orchestrator::{BatchReport, ExerciseOrchestrator, ExerciseReport, RunOptions};
pub use refiner::{ClaudeRefiner, DryrunRefiner, PromptRefiner, RefineRequest};
pub use shot_loop::{LoopContext, LoopSettings, ShotQualityLoop};
pub use throttle::Throttle;
