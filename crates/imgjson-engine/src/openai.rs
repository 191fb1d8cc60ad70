use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use imgjson_contracts::credentials::CredentialProvider;
use imgjson_contracts::image_data::{ImageData, DEFAULT_IMAGE_MIME};
use imgjson_contracts::providers::NamedProvider;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

use crate::providers::{ImageProvider, ImageRequest, ImageResponse, TextProvider, TextRequest, TextResponse};
use crate::{map_object, push_unique_warning, truncate_text};

const SUPPORTED_SIZES: [(&str, f64); 3] = [
    ("1024x1024", 1024f64 / 1024f64),
    ("1024x1536", 1024f64 / 1536f64),
    ("1536x1024", 1536f64 / 1024f64),
];

/// OpenAI `responses` for text/vision and `images/*` for rendering.
pub struct OpenAiProvider {
    api_base: String,
    http: HttpClient,
    credentials: Arc<dyn CredentialProvider>,
}

impl OpenAiProvider {
    pub fn new(
        api_base: &str,
        timeout: Duration,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            http,
            credentials,
        })
    }

    fn api_key(&self) -> Result<String> {
        self.credentials
            .read()
            .ok_or_else(|| anyhow!("API key is required"))
    }

    fn post_json(&self, endpoint: &str, api_key: &str, payload: &Value) -> Result<Value> {
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(api_key)
            .json(payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        response_json_or_error("OpenAI", response)
    }

    fn first_image(&self, response_payload: &Value) -> Result<ImageData> {
        let rows = response_payload
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for row in rows {
            if let Some(b64) = row.get("b64_json").and_then(Value::as_str) {
                let bytes = BASE64
                    .decode(b64.as_bytes())
                    .context("OpenAI image base64 decode failed")?;
                return Ok(ImageData::new(bytes, DEFAULT_IMAGE_MIME));
            }
            if let Some(url) = row.get("url").and_then(Value::as_str) {
                return self.download_image(url);
            }
        }
        bail!("OpenAI response returned no images")
    }

    fn download_image(&self, url: &str) -> Result<ImageData> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading provider image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "provider image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| value.starts_with("image/"))
            .unwrap_or(DEFAULT_IMAGE_MIME)
            .to_string();
        let bytes = response
            .bytes()
            .context("failed reading provider image bytes")?
            .to_vec();
        Ok(ImageData::new(bytes, mime_type))
    }
}

impl NamedProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }
}

impl TextProvider for OpenAiProvider {
    fn complete(&self, request: &TextRequest) -> Result<TextResponse> {
        let api_key = self.api_key()?;
        let endpoint = format!("{}/responses", self.api_base);

        let mut content = vec![json!({"type": "input_text", "text": request.prompt})];
        if let Some(image) = request.image.as_ref() {
            content.push(json!({"type": "input_image", "image_url": image.to_data_url()}));
        }
        let mut payload = map_object(json!({
            "model": request.model,
            "input": [{"role": "user", "content": content}],
            "max_output_tokens": request.max_output_tokens,
        }));
        if let Some(temperature) = request.temperature {
            payload.insert("temperature".to_string(), json!(temperature));
        }

        let parsed = self.post_json(&endpoint, &api_key, &Value::Object(payload))?;
        let text = extract_output_text(&parsed);
        if text.is_empty() {
            bail!("OpenAI response contained no text");
        }
        let (input_tokens, output_tokens) = usage_pair(&parsed);
        Ok(TextResponse {
            text,
            model: request.model.clone(),
            input_tokens,
            output_tokens,
        })
    }
}

impl ImageProvider for OpenAiProvider {
    fn generate(&self, request: &ImageRequest) -> Result<ImageResponse> {
        let api_key = self.api_key()?;
        let endpoint = format!("{}/images/generations", self.api_base);
        let mut warnings = Vec::new();
        let size = normalize_openai_size(
            &request.size,
            request.aspect_ratio.as_deref(),
            &mut warnings,
        );
        let payload = json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": 1,
            "size": size,
        });
        let parsed = self.post_json(&endpoint, &api_key, &payload)?;
        Ok(ImageResponse {
            image: self.first_image(&parsed)?,
            size,
            warnings,
        })
    }

    fn edit(&self, request: &ImageRequest, input: &ImageData) -> Result<ImageResponse> {
        let api_key = self.api_key()?;
        let endpoint = format!("{}/images/edits", self.api_base);
        let mut warnings = Vec::new();
        let size = normalize_openai_size(
            &request.size,
            request.aspect_ratio.as_deref(),
            &mut warnings,
        );
        let part = MultipartPart::bytes(input.bytes.clone())
            .file_name(format!("image.{}", input.extension()))
            .mime_str(&input.mime_type)
            .with_context(|| format!("invalid mime '{}'", input.mime_type))?;
        let form = MultipartForm::new()
            .text("model", request.model.clone())
            .text("prompt", request.prompt.clone())
            .text("n", "1")
            .text("size", size.clone())
            .part("image", part);

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .context("OpenAI edits request failed")?;
        let parsed = response_json_or_error("OpenAI edits", response)?;
        Ok(ImageResponse {
            image: self.first_image(&parsed)?,
            size,
            warnings,
        })
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
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
    serde_json::from_str(&body).with_context(|| format!("{provider} returned invalid JSON payload"))
}

/// Collects `output_text`, or the text chunks of `output[]` messages.
fn extract_output_text(response: &Value) -> String {
    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.trim().to_string();
        }
    }

    let mut parts: Vec<String> = Vec::new();
    let rows = response
        .get("output")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for row in rows {
        let kind = row.get("type").and_then(Value::as_str);
        if matches!(kind, Some("output_text" | "text")) {
            push_text_chunk(&row, &mut parts);
            continue;
        }
        if kind.is_some_and(|kind| kind != "message") {
            continue;
        }
        for chunk in row
            .get("content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let chunk_kind = chunk.get("type").and_then(Value::as_str).unwrap_or_default();
            if matches!(chunk_kind, "output_text" | "text") {
                push_text_chunk(chunk, &mut parts);
            }
        }
    }
    parts.join("\n").trim().to_string()
}

fn push_text_chunk(chunk: &Value, parts: &mut Vec<String>) {
    if let Some(text) = chunk.get("text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            parts.push(text.trim().to_string());
        }
    }
}

fn usage_pair(payload: &Value) -> (Option<i64>, Option<i64>) {
    let usage = payload.get("usage");
    let read = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| usage.and_then(|usage| usage.get(*key)).and_then(Value::as_i64))
    };
    (
        read(&["input_tokens", "prompt_tokens"]),
        read(&["output_tokens", "completion_tokens"]),
    )
}

/// Snaps a requested size to one the image endpoints accept.
///
/// An exact supported size is kept. Otherwise the ratio comes from the size,
/// then from `aspect_ratio`, and the closest supported size wins.
fn normalize_openai_size(raw: &str, aspect_ratio: Option<&str>, warnings: &mut Vec<String>) -> String {
    let normalized = raw.trim().to_ascii_lowercase().replace(' ', "");
    if normalized == "auto" {
        return normalized;
    }

    let mut ratio: Option<f64> = None;
    if let Some((width, height)) = parse_pair(&normalized, &['x']) {
        let key = format!("{width}x{height}");
        if SUPPORTED_SIZES.iter().any(|(supported, _)| *supported == key) {
            return key;
        }
        ratio = Some(width as f64 / height as f64);
    }
    if ratio.is_none() {
        ratio = aspect_ratio
            .and_then(|aspect| parse_pair(aspect.trim(), &[':', '/']))
            .map(|(width, height)| width as f64 / height as f64);
    }

    let Some(target) = ratio else {
        if !normalized.is_empty() {
            push_unique_warning(warnings, "OpenAI size unsupported; using 1024x1024.".to_string());
        }
        return "1024x1024".to_string();
    };
    let mut best_key = "1024x1024";
    let mut best_delta = f64::MAX;
    for (key, value) in SUPPORTED_SIZES {
        let delta = (value - target).abs();
        if delta < best_delta {
            best_key = key;
            best_delta = delta;
        }
    }
    push_unique_warning(warnings, format!("OpenAI size snapped to {best_key}."));
    best_key.to_string()
}

fn parse_pair(raw: &str, separators: &[char]) -> Option<(u32, u32)> {
    let (left, right) = raw.split_once(separators)?;
    let first = left.trim().parse::<u32>().ok()?;
    let second = right.trim().parse::<u32>().ok()?;
    if first == 0 || second == 0 {
        return None;
    }
    Some((first, second))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use imgjson_contracts::credentials::MemoryCredentials;
    use serde_json::json;

    use super::{extract_output_text, normalize_openai_size, usage_pair, OpenAiProvider};
    use crate::providers::{ImageProvider, ImageRequest, TextProvider, TextRequest};

    #[test]
    fn output_text_prefers_top_level_field() {
        let response = json!({"output_text": "  {\"a\": 1} ", "output": []});
        assert_eq!(extract_output_text(&response), "{\"a\": 1}");
    }

    #[test]
    fn output_text_joins_message_chunks() {
        let response = json!({
            "output": [
                {"type": "reasoning", "content": [{"type": "text", "text": "hidden"}]},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "first"},
                    {"type": "refusal", "text": "nope"},
                    {"type": "output_text", "text": "second"}
                ]}
            ]
        });
        assert_eq!(extract_output_text(&response), "first\nsecond");
        assert_eq!(extract_output_text(&json!({})), "");
    }

    #[test]
    fn usage_reads_either_naming() {
        let usage = usage_pair(&json!({"usage": {"prompt_tokens": 12, "output_tokens": 7}}));
        assert_eq!(usage, (Some(12), Some(7)));
        assert_eq!(usage_pair(&json!({})), (None, None));
    }

    #[test]
    fn size_normalization() {
        let mut warnings = Vec::new();
        assert_eq!(normalize_openai_size("1536x1024", None, &mut warnings), "1536x1024");
        assert!(warnings.is_empty());

        assert_eq!(normalize_openai_size("512 X 1024", None, &mut warnings), "1024x1536");
        assert_eq!(warnings, vec!["OpenAI size snapped to 1024x1536."]);

        let mut warnings = Vec::new();
        assert_eq!(normalize_openai_size("", Some("16:9"), &mut warnings), "1536x1024");
        assert_eq!(normalize_openai_size("", None, &mut Vec::new()), "1024x1024");

        let mut warnings = Vec::new();
        assert_eq!(normalize_openai_size("huge", None, &mut warnings), "1024x1024");
        assert_eq!(warnings, vec!["OpenAI size unsupported; using 1024x1024."]);
    }

    #[test]
    fn missing_key_fails_before_any_request() -> anyhow::Result<()> {
        let provider = OpenAiProvider::new(
            "http://127.0.0.1:9/v1",
            Duration::from_secs(1),
            Arc::new(MemoryCredentials::new()),
        )?;
        let text_err = provider
            .complete(&TextRequest {
                model: "gpt-4.1-mini".to_string(),
                prompt: "hi".to_string(),
                image: None,
                temperature: None,
                max_output_tokens: 16,
            })
            .err()
            .map(|err| err.to_string());
        assert_eq!(text_err.as_deref(), Some("API key is required"));

        let image_err = provider
            .generate(&ImageRequest {
                model: "gpt-image-1".to_string(),
                prompt: "a cat".to_string(),
                size: "1024x1024".to_string(),
                aspect_ratio: None,
            })
            .err()
            .map(|err| err.to_string());
        assert_eq!(image_err.as_deref(), Some("API key is required"));
        Ok(())
    }
}
