use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use coachframe_contracts::models::{
    ModelRegistry, ModelSelection, ModelSelector, CAPABILITY_EDIT, CAPABILITY_TEXT,
    CAPABILITY_VISION,
};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::anthropic::AnthropicClient;
use crate::config::PipelineConfig;
use crate::error::GenerationError;
use crate::judge::{ClaudeJudge, DryrunJudge, PassPolicy, VisionJudge};
use crate::media::{render_placeholder, EncodedImage, ImageBytes};
use crate::payload::truncate_text;
use crate::refiner::{ClaudeRefiner, DryrunRefiner, PromptRefiner};
use crate::throttle::Throttle;

const HTTP_TIMEOUT: Duration = Duration::from_secs(180);
const DEFAULT_MAX_TOKENS: u64 = 1024;
const DRYRUN_VISION_MODEL: &str = "dryrun-vision-1";
const DRYRUN_EDIT_MODEL: &str = "dryrun-edit-1";
const PLACEHOLDER_SIZE: u32 = 512;

/// Reference-conditioned image editing. Never retries.
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, reference: &EncodedImage, prompt: &str)
        -> Result<ImageBytes, GenerationError>;
}

pub struct FalEditor {
    endpoint: String,
    api_key: String,
    output_format: String,
    http: HttpClient,
    /// Spaces the edit request and the follow-up download.
    pacing: Mutex<Throttle>,
}

impl FalEditor {
    pub fn new(api_base: &str, model: &str, api_key: &str) -> Result<Self> {
        let model = model.trim();
        let endpoint = if model.starts_with("http://") || model.starts_with("https://") {
            model.to_string()
        } else {
            format!(
                "{}/{}",
                api_base.trim().trim_end_matches('/'),
                model.trim_start_matches('/')
            )
        };
        let http = HttpClient::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed building Fal HTTP client")?;
        Ok(Self {
            endpoint,
            api_key: api_key.to_string(),
            output_format: "png".to_string(),
            http,
            pacing: Mutex::new(Throttle::new(Duration::ZERO)),
        })
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.pacing = Mutex::new(Throttle::new(delay));
        self
    }

    fn pace(&self) -> Duration {
        match self.pacing.lock() {
            Ok(mut throttle) => throttle.wait(),
            Err(_) => Duration::ZERO,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn download_image(&self, url: &str) -> Result<ImageBytes> {
        if let Some(image) = decode_data_url(url) {
            return Ok(image);
        }
        self.pace();
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading Fal image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "Fal image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading Fal image bytes")?
            .to_vec();
        Ok(ImageBytes { bytes, mime_type })
    }
}

impl ImageGenerator for FalEditor {
    fn name(&self) -> &str {
        "fal"
    }

    fn generate(
        &self,
        reference: &EncodedImage,
        prompt: &str,
    ) -> Result<ImageBytes, GenerationError> {
        let payload = json!({
            "prompt": prompt,
            "image_urls": [reference.data_url()],
            "num_images": 1,
            "output_format": self.output_format,
        });
        self.pace();
        let response = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Key {}", self.api_key))
            .json(&payload)
            .send()
            .with_context(|| format!("Fal request failed ({})", self.endpoint))
            .map_err(GenerationError::Request)?;
        let status = response.status();
        let body = response
            .text()
            .context("Fal response body read failed")
            .map_err(GenerationError::Request)?;
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: truncate_text(&body, 512),
            });
        }
        let parsed: Value = serde_json::from_str(&body)
            .context("Fal returned invalid JSON payload")
            .map_err(GenerationError::Request)?;

        let urls = collect_image_urls(&parsed);
        let Some(first) = urls.first() else {
            return Err(GenerationError::NoImages {
                provider: "fal".to_string(),
            });
        };
        self.download_image(first).map_err(GenerationError::Request)
    }
}

/// Every image URL in a Fal response, in document order, without duplicates.
///
/// Accepts `images`, `data.images`, `image`, `output` and bare `url` shapes.
pub fn collect_image_urls(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    extract_urls(value, &mut out);
    out
}

fn extract_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            let usable = trimmed.starts_with("http") || trimmed.starts_with("data:image/");
            if usable && !out.iter().any(|existing| existing == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "images", "image", "output", "data"] {
                if let Some(nested) = obj.get(key) {
                    extract_urls(nested, out);
                }
            }
        }
        _ => {}
    }
}

fn decode_data_url(url: &str) -> Option<ImageBytes> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    let bytes = BASE64.decode(data.trim().as_bytes()).ok()?;
    Some(ImageBytes {
        bytes,
        mime_type: Some(mime.to_string()),
    })
}

/// Renders a solid placeholder whose colour follows the prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunEditor;

impl ImageGenerator for DryrunEditor {
    fn name(&self) -> &str {
        "dryrun-editor"
    }

    fn generate(
        &self,
        _reference: &EncodedImage,
        prompt: &str,
    ) -> Result<ImageBytes, GenerationError> {
        render_placeholder(prompt, PLACEHOLDER_SIZE, PLACEHOLDER_SIZE)
            .map_err(GenerationError::Request)
    }
}

/// The judge, refiner and generator one run talks to.
pub struct Collaborators {
    pub judge: Box<dyn VisionJudge>,
    pub refiner: Box<dyn PromptRefiner>,
    pub generator: Box<dyn ImageGenerator>,
}

impl Collaborators {
    pub fn new(
        judge: Box<dyn VisionJudge>,
        refiner: Box<dyn PromptRefiner>,
        generator: Box<dyn ImageGenerator>,
    ) -> Self {
        Self {
            judge,
            refiner,
            generator,
        }
    }

    /// Resolves configured model names through the registry and builds the
    /// matching backends. API keys are only required for the backends chosen.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut registry = ModelRegistry::new(None);
        for name in [&config.judge_model, &config.refiner_model] {
            if name.starts_with("claude-") {
                registry.register_custom(name, "anthropic", &[CAPABILITY_VISION, CAPABILITY_TEXT]);
            }
        }
        if config.edit_model.starts_with("fal-ai/") {
            registry.register_custom(&config.edit_model, "fal", &[CAPABILITY_EDIT]);
        }
        let selector = ModelSelector::new(Some(registry));

        let (judge_name, refiner_name, edit_name) = if config.dryrun {
            (DRYRUN_VISION_MODEL, DRYRUN_VISION_MODEL, DRYRUN_EDIT_MODEL)
        } else {
            (
                config.judge_model.as_str(),
                config.refiner_model.as_str(),
                config.edit_model.as_str(),
            )
        };
        let judge_model = select(&selector, judge_name, CAPABILITY_VISION, "judge")?;
        let refiner_model = select(&selector, refiner_name, CAPABILITY_TEXT, "refiner")?;
        let edit_model = select(&selector, edit_name, CAPABILITY_EDIT, "generator")?;

        let policy = PassPolicy {
            pass_threshold: config.pass_threshold,
            criterion_bar: config.criterion_bar,
            require_all_criteria: config.require_all_criteria,
        };
        let mut anthropic: Option<AnthropicClient> = None;
        let mut anthropic_client = || -> Result<AnthropicClient> {
            if let Some(client) = anthropic.as_ref() {
                return Ok(client.clone());
            }
            let key = config
                .anthropic_api_key
                .as_deref()
                .context("ANTHROPIC_API_KEY not set")?;
            let client = AnthropicClient::new(key, &config.anthropic_api_base, HTTP_TIMEOUT)?;
            anthropic = Some(client.clone());
            Ok(client)
        };

        let judge: Box<dyn VisionJudge> = match judge_model.model.provider.as_str() {
            "dryrun" => Box::new(DryrunJudge::new(policy)),
            "anthropic" => Box::new(ClaudeJudge::new(
                anthropic_client()?,
                &judge_model.model.name,
                judge_model.model.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                policy,
            )),
            other => bail!("unsupported judge provider '{other}'"),
        };
        let refiner: Box<dyn PromptRefiner> = match refiner_model.model.provider.as_str() {
            "dryrun" => Box::new(DryrunRefiner),
            "anthropic" => Box::new(ClaudeRefiner::new(
                anthropic_client()?,
                &refiner_model.model.name,
                refiner_model.model.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            )),
            other => bail!("unsupported refiner provider '{other}'"),
        };
        let generator: Box<dyn ImageGenerator> = match edit_model.model.provider.as_str() {
            "dryrun" => Box::new(DryrunEditor),
            "fal" => {
                let key = config
                    .fal_api_key
                    .as_deref()
                    .context("FAL_KEY (or FAL_API_KEY) not set")?;
                Box::new(
                    FalEditor::new(&config.fal_api_base, &edit_model.model.name, key)?
                        .with_request_delay(config.request_delay),
                )
            }
            other => bail!("unsupported generator provider '{other}'"),
        };

        Ok(Self::new(judge, refiner, generator))
    }
}

fn select(
    selector: &ModelSelector,
    requested: &str,
    capability: &str,
    role: &str,
) -> Result<ModelSelection> {
    let selection = selector
        .select(Some(requested), capability)
        .map_err(|err| anyhow!("{role}: {err}"))?;
    if let Some(reason) = selection.fallback_reason.as_deref() {
        tracing::warn!(
            role,
            model = %selection.model.name,
            "{reason}"
        );
    }
    Ok(selection)
}
