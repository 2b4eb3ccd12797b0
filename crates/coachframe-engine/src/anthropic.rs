use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use crate::media::EncodedImage;
use crate::payload::truncate_text;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Blocking client for the Messages API, shared by the judge and the refiner.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl AnthropicClient {
    pub fn new(api_key: &str, api_base: &str, timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed building Anthropic HTTP client")?;
        Ok(Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.api_base)
    }

    /// Sends one user turn and returns the concatenated text of the reply.
    pub fn message(
        &self,
        model: &str,
        system: Option<&str>,
        content: Vec<Value>,
        max_tokens: u64,
    ) -> Result<String> {
        let mut payload = json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": [{
                "role": "user",
                "content": content,
            }],
        });
        if let Some(system) = system.filter(|value| !value.trim().is_empty()) {
            payload["system"] = Value::String(system.to_string());
        }

        let endpoint = self.endpoint();
        let response = self
            .http
            .post(&endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .with_context(|| format!("Anthropic request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Anthropic", response)?;
        let text = extract_text(&parsed);
        if text.trim().is_empty() {
            let stop_reason = parsed
                .get("stop_reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            bail!("Anthropic reply contained no text (stop_reason: {stop_reason})");
        }
        Ok(text)
    }
}

pub fn text_block(text: &str) -> Value {
    json!({"type": "text", "text": text})
}

pub fn image_block(image: &EncodedImage) -> Value {
    json!({
        "type": "image",
        "source": {
            "type": "base64",
            "media_type": image.mime_type,
            "data": image.data_base64,
        }
    })
}

pub fn extract_text(response: &Value) -> String {
    let Some(blocks) = response.get("content").and_then(Value::as_array) else {
        return String::new();
    };
    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<&str>>()
        .join("\n")
        .trim()
        .to_string()
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}
