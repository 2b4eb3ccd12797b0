use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

pub const DEFAULT_MAX_ITERATIONS: u32 = 2;
pub const MAX_ITERATIONS_CEILING: u32 = 10;
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.70;
pub const DEFAULT_CRITERION_BAR: f64 = 0.70;
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 500;
pub const DEFAULT_VISION_MAX_DIM: u32 = 1024;
pub const DEFAULT_JUDGE_MODEL: &str = "claude-sonnet-4-5";
pub const DEFAULT_REFINER_MODEL: &str = "claude-sonnet-4-5";
pub const DEFAULT_EDIT_MODEL: &str = "fal-ai/nano-banana/edit";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub root: PathBuf,
    pub max_iterations: u32,
    pub pass_threshold: f64,
    pub criterion_bar: f64,
    pub require_all_criteria: bool,
    pub request_delay: Duration,
    pub vision_max_dim: u32,
    pub judge_model: String,
    pub refiner_model: String,
    pub edit_model: String,
    pub dryrun: bool,
    pub anthropic_api_key: Option<String>,
    pub anthropic_api_base: String,
    pub fal_api_key: Option<String>,
    pub fal_api_base: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("content"),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            criterion_bar: DEFAULT_CRITERION_BAR,
            require_all_criteria: false,
            request_delay: Duration::from_millis(DEFAULT_REQUEST_DELAY_MS),
            vision_max_dim: DEFAULT_VISION_MAX_DIM,
            judge_model: DEFAULT_JUDGE_MODEL.to_string(),
            refiner_model: DEFAULT_REFINER_MODEL.to_string(),
            edit_model: DEFAULT_EDIT_MODEL.to_string(),
            dryrun: false,
            anthropic_api_key: None,
            anthropic_api_base: "https://api.anthropic.com".to_string(),
            fal_api_key: None,
            fal_api_base: "https://fal.run".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Reads `COACHFRAME_*` and provider variables. Call `dotenvy::dotenv()`
    /// first to honour a `.env` file.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            root: first_non_empty_env(&["COACHFRAME_ROOT"])
                .map(PathBuf::from)
                .unwrap_or(defaults.root),
            max_iterations: env_parse("COACHFRAME_MAX_ITERATIONS", defaults.max_iterations)?,
            pass_threshold: env_parse("COACHFRAME_PASS_THRESHOLD", defaults.pass_threshold)?,
            criterion_bar: env_parse("COACHFRAME_CRITERION_BAR", defaults.criterion_bar)?,
            require_all_criteria: env_bool(
                "COACHFRAME_REQUIRE_ALL_CRITERIA",
                defaults.require_all_criteria,
            ),
            request_delay: Duration::from_millis(env_parse(
                "COACHFRAME_REQUEST_DELAY_MS",
                DEFAULT_REQUEST_DELAY_MS,
            )?),
            vision_max_dim: env_parse("COACHFRAME_VISION_MAX_DIM", defaults.vision_max_dim)?,
            judge_model: first_non_empty_env(&["COACHFRAME_JUDGE_MODEL"])
                .unwrap_or(defaults.judge_model),
            refiner_model: first_non_empty_env(&["COACHFRAME_REFINER_MODEL"])
                .unwrap_or(defaults.refiner_model),
            edit_model: first_non_empty_env(&["COACHFRAME_EDIT_MODEL"])
                .unwrap_or(defaults.edit_model),
            dryrun: env_bool("COACHFRAME_DRYRUN", false),
            anthropic_api_key: first_non_empty_env(&["ANTHROPIC_API_KEY"]),
            anthropic_api_base: first_non_empty_env(&["ANTHROPIC_API_BASE"])
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.anthropic_api_base),
            fal_api_key: first_non_empty_env(&["FAL_KEY", "FAL_API_KEY"]),
            fal_api_base: first_non_empty_env(&["FAL_API_BASE"])
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.fal_api_base),
        };
        config.validated()
    }

    /// Checks ranges and clamps the iteration budget.
    pub fn validated(mut self) -> Result<Self> {
        if !(0.0..=1.0).contains(&self.pass_threshold) {
            bail!(
                "pass threshold must be within [0, 1] (got {})",
                self.pass_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.criterion_bar) {
            bail!(
                "criterion bar must be within [0, 1] (got {})",
                self.criterion_bar
            );
        }
        self.max_iterations = self.max_iterations.min(MAX_ITERATIONS_CEILING);
        Ok(self)
    }
}

pub(crate) fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match first_non_empty_env(&[name]) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{name}={raw} is invalid: {err}")),
        None => Ok(default),
    }
}
