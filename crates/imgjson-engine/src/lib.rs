//! Orchestrates the image/description cycle: analyze an image into a JSON
//! description, edit that description with an instruction, and render it
//! back into an image. Every step is recorded in the run's event log.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use imgjson_contracts::credentials::CredentialProvider;
use imgjson_contracts::description::{
    annotate_generated, generated_fallback, imported_fallback, iso_timestamp,
};
use imgjson_contracts::events::{EventLog, EventPayload};
use imgjson_contracts::extract::{extract_with_strategy, Description, ExtractStrategy};
use imgjson_contracts::image_data::ImageData;
use imgjson_contracts::models::{Capability, ModelRegistry, ModelSelection, ModelSelector};
use imgjson_contracts::prompts::{
    analysis_instruction, edit_description_prompt, edit_image_prompt, render_prompt,
};
use imgjson_contracts::providers::ProviderRegistry;
use serde_json::{json, Map, Value};

pub mod config;
pub mod dryrun;
pub mod openai;
pub mod providers;

pub use config::{EngineConfig, RenderSettings};
pub use providers::{
    ImageProvider, ImageRequest, ImageResponse, TextProvider, TextRequest, TextResponse,
};

const ANALYSIS_TEMPERATURE: f32 = 0.7;
const EDIT_TEMPERATURE: f32 = 0.3;
const ANALYSIS_MAX_TOKENS: u64 = 2000;
const EDIT_MAX_TOKENS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct Analysis {
    pub description: Description,
    pub strategy: ExtractStrategy,
    pub raw_text: String,
    pub model: String,
}

impl Analysis {
    pub fn fell_back(&self) -> bool {
        self.strategy == ExtractStrategy::Fallback
    }
}

/// An image written to the run directory.
#[derive(Debug, Clone)]
pub struct Render {
    pub image: ImageData,
    pub image_path: PathBuf,
    pub prompt: String,
    pub size: String,
    pub model: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub render: Render,
    pub description: Description,
    /// False when the generated fallback stands in for a failed analysis.
    pub analyzed: bool,
}

#[derive(Debug, Clone)]
pub struct DescriptionEdit {
    pub original: Description,
    pub updated: Description,
    pub instruction: String,
    pub strategy: ExtractStrategy,
}

impl DescriptionEdit {
    pub fn fell_back(&self) -> bool {
        self.strategy == ExtractStrategy::Fallback
    }
}

#[derive(Debug, Clone)]
pub struct ImageEdit {
    pub render: Render,
    pub description: Description,
}

#[derive(Debug, Clone)]
pub struct ChatEdit {
    pub edit: DescriptionEdit,
    /// Absent when the edit fell back or the render failed.
    pub render: Option<Render>,
    /// Set when the edit succeeded but rendering it did not.
    pub render_error: Option<String>,
}

pub struct Engine {
    run_dir: PathBuf,
    events: EventLog,
    config: EngineConfig,
    model_selector: ModelSelector,
    text_providers: ProviderRegistry<dyn TextProvider>,
    image_providers: ProviderRegistry<dyn ImageProvider>,
    artifact_seq: AtomicU64,
}

impl Engine {
    /// Creates `run_dir` and registers the OpenAI and dryrun providers.
    pub fn new(
        run_dir: impl AsRef<Path>,
        events_path: impl AsRef<Path>,
        config: EngineConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let run_dir = run_dir.as_ref().to_path_buf();
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed to create {}", run_dir.display()))?;
        let run_id = run_dir
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("run")
            .to_string();
        let events = EventLog::new(events_path.as_ref(), run_id);

        let openai = Arc::new(openai::OpenAiProvider::new(
            &config.api_base,
            config.timeout,
            credentials,
        )?);
        let dryrun = Arc::new(dryrun::DryrunProvider);
        let mut engine = Self::bare(run_dir, events, config);
        engine.register_text_provider(openai.clone());
        engine.register_image_provider(openai);
        engine.register_text_provider(dryrun.clone());
        engine.register_image_provider(dryrun);
        Ok(engine)
    }

    /// An engine with no providers; callers register their own.
    pub fn bare(run_dir: PathBuf, events: EventLog, config: EngineConfig) -> Self {
        Self {
            run_dir,
            events,
            config,
            model_selector: ModelSelector::new(None),
            text_providers: ProviderRegistry::new(),
            image_providers: ProviderRegistry::new(),
            artifact_seq: AtomicU64::new(0),
        }
    }

    pub fn register_text_provider(&mut self, provider: Arc<dyn TextProvider>) {
        self.text_providers.register(provider);
    }

    pub fn register_image_provider(&mut self, provider: Arc<dyn ImageProvider>) {
        self.image_providers.register(provider);
    }

    pub fn set_model_registry(&mut self, registry: ModelRegistry) {
        self.model_selector = ModelSelector::new(Some(registry));
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.model_selector.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    pub fn analyze_image(&self, image: &ImageData, filename: Option<&str>) -> Result<Analysis> {
        let selection = self.select_model(self.config.vision_model.as_deref(), Capability::Vision)?;
        let provider = self.text_provider(&selection)?;
        let import_date = iso_timestamp();
        self.emit(
            "analysis_started",
            map_object(json!({
                "filename": filename,
                "mime_type": image.mime_type,
                "bytes": image.bytes.len(),
                "model": selection.model.name,
            })),
        )?;

        let request = TextRequest {
            model: selection.model.name.clone(),
            prompt: analysis_instruction(filename, &import_date),
            image: Some(image.clone()),
            temperature: Some(ANALYSIS_TEMPERATURE),
            max_output_tokens: ANALYSIS_MAX_TOKENS,
        };
        let response = match provider.complete(&request) {
            Ok(response) => response,
            Err(err) => {
                self.emit(
                    "analysis_failed",
                    map_object(json!({
                        "model": selection.model.name,
                        "error": error_chain_text(&err, 512),
                    })),
                )?;
                return Err(err.context("image analysis failed"));
            }
        };

        let fallback = imported_fallback(filename, &response.text, &import_date);
        let extraction = extract_with_strategy(&response.text, fallback);
        self.emit_extracted("analyze_image", extraction.strategy, &extraction.description)?;
        Ok(Analysis {
            description: extraction.description,
            strategy: extraction.strategy,
            raw_text: response.text,
            model: response.model,
        })
    }

    /// Renders `prompt`, then describes the result.
    ///
    /// A failed or unparseable analysis does not fail the generation; the
    /// generated fallback description is used instead.
    pub fn generate_image(&self, prompt: &str, settings: &RenderSettings) -> Result<Generation> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            bail!("prompt is required");
        }
        self.emit(
            "generation_started",
            map_object(json!({
                "prompt": prompt,
                "size": settings.size,
                "aspect_ratio": settings.aspect_ratio,
            })),
        )?;
        let render = self.render(prompt, settings, None)?;

        let now = iso_timestamp();
        let aspect_ratio = settings.aspect_ratio.as_deref();
        let filename = render
            .image_path
            .file_name()
            .and_then(|value| value.to_str())
            .map(str::to_string);
        let (description, analyzed) = match self.analyze_image(&render.image, filename.as_deref()) {
            Ok(analysis) if !analysis.fell_back() => (
                annotate_generated(analysis.description, prompt, &render.size, aspect_ratio, &now),
                true,
            ),
            Ok(_) => (generated_fallback(prompt, &render.size, aspect_ratio, &now), false),
            Err(err) => {
                tracing::warn!(
                    target: "imgjson::engine",
                    error = %error_chain_text(&err, 512),
                    "analysis of generated image failed; using fallback description"
                );
                (generated_fallback(prompt, &render.size, aspect_ratio, &now), false)
            }
        };

        self.emit(
            "generation_completed",
            map_object(json!({
                "image_path": render.image_path.to_string_lossy(),
                "analyzed": analyzed,
            })),
        )?;
        Ok(Generation {
            render,
            description,
            analyzed,
        })
    }

    /// Applies `instruction` to `current`. When the reply holds no usable
    /// object, `updated` is `current` unchanged and `fell_back()` is true.
    pub fn edit_description(
        &self,
        current: &Description,
        instruction: &str,
    ) -> Result<DescriptionEdit> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            bail!("instruction is required");
        }
        let selection = self.select_model(self.config.text_model.as_deref(), Capability::Text)?;
        let provider = self.text_provider(&selection)?;
        self.emit(
            "edit_started",
            map_object(json!({
                "instruction": instruction,
                "model": selection.model.name,
            })),
        )?;

        let request = TextRequest {
            model: selection.model.name.clone(),
            prompt: edit_description_prompt(current, instruction),
            image: None,
            temperature: Some(EDIT_TEMPERATURE),
            max_output_tokens: EDIT_MAX_TOKENS,
        };
        let response = match provider.complete(&request) {
            Ok(response) => response,
            Err(err) => {
                self.emit(
                    "edit_failed",
                    map_object(json!({"error": error_chain_text(&err, 512)})),
                )?;
                return Err(err.context("description edit failed"));
            }
        };

        let extraction = extract_with_strategy(&response.text, current.clone());
        self.emit_extracted("edit_description", extraction.strategy, &extraction.description)?;
        if extraction.fell_back() {
            tracing::warn!(
                target: "imgjson::engine",
                raw = %truncate_text(&response.text, 200),
                "edit reply held no JSON object; description unchanged"
            );
        }
        Ok(DescriptionEdit {
            original: current.clone(),
            updated: extraction.description,
            instruction: instruction.to_string(),
            strategy: extraction.strategy,
        })
    }

    pub fn generate_from_description(
        &self,
        description: &Description,
        settings: &RenderSettings,
    ) -> Result<Render> {
        let prompt = render_prompt(description, settings.prompt_style);
        self.render(&prompt, settings, None)
    }

    /// Edits `image` so that it matches `description`.
    pub fn edit_image(
        &self,
        description: &Description,
        image: &ImageData,
        settings: &RenderSettings,
    ) -> Result<Render> {
        let prompt = edit_image_prompt(description);
        self.render(&prompt, settings, Some(image))
    }

    /// Validating entry point for loosely typed callers.
    ///
    /// `description` may be an object or JSON text holding one; `image` is a
    /// data URL or bare base64.
    pub fn edit_image_from_description(
        &self,
        description: Option<&Value>,
        image: Option<&str>,
        settings: &RenderSettings,
    ) -> Result<ImageEdit> {
        let description = match description {
            None | Some(Value::Null) => bail!("description is required"),
            Some(Value::Object(object)) => object.clone(),
            Some(Value::String(text)) if text.trim().is_empty() => {
                bail!("description is required")
            }
            Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(object)) => object,
                Ok(_) => bail!("invalid JSON description: expected an object"),
                Err(err) => bail!("invalid JSON description: {err}"),
            },
            Some(_) => bail!("invalid JSON description: expected an object"),
        };
        let image = match image.map(str::trim).filter(|value| !value.is_empty()) {
            Some(raw) => ImageData::from_base64(raw)?,
            None => bail!("image is required"),
        };
        let render = self.edit_image(&description, &image, settings)?;
        Ok(ImageEdit {
            render,
            description,
        })
    }

    /// Edits the description, then renders it unless the edit fell back.
    ///
    /// A failed render keeps the edit; the error is reported in
    /// `render_error` instead of failing the call.
    pub fn chat_edit(
        &self,
        current: &Description,
        instruction: &str,
        settings: &RenderSettings,
    ) -> Result<ChatEdit> {
        let edit = self.edit_description(current, instruction)?;
        if edit.fell_back() {
            return Ok(ChatEdit {
                edit,
                render: None,
                render_error: None,
            });
        }
        match self.generate_from_description(&edit.updated, settings) {
            Ok(render) => Ok(ChatEdit {
                edit,
                render: Some(render),
                render_error: None,
            }),
            Err(err) => {
                tracing::warn!(
                    target: "imgjson::engine",
                    error = %error_chain_text(&err, 512),
                    "render after description edit failed; keeping the edit"
                );
                Ok(ChatEdit {
                    edit,
                    render: None,
                    render_error: Some(format!("{err:#}")),
                })
            }
        }
    }

    fn render(
        &self,
        prompt: &str,
        settings: &RenderSettings,
        input: Option<&ImageData>,
    ) -> Result<Render> {
        let capability = if input.is_some() {
            Capability::Edit
        } else {
            Capability::Image
        };
        let selection = self.select_model(self.config.image_model.as_deref(), capability)?;
        let provider = self.image_provider(&selection)?;
        self.emit(
            "render_started",
            map_object(json!({
                "model": selection.model.name,
                "size": settings.size,
                "aspect_ratio": settings.aspect_ratio,
                "edit": input.is_some(),
                "prompt_chars": prompt.chars().count(),
            })),
        )?;

        let request = ImageRequest {
            model: selection.model.name.clone(),
            prompt: prompt.to_string(),
            size: settings.size.clone(),
            aspect_ratio: settings.aspect_ratio.clone(),
        };
        let result = match input {
            Some(image) => provider.edit(&request, image),
            None => provider.generate(&request),
        };
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.emit(
                    "render_failed",
                    map_object(json!({
                        "model": selection.model.name,
                        "error": error_chain_text(&err, 512),
                    })),
                )?;
                return Err(err.context("image render failed"));
            }
        };

        let seq = self.artifact_seq.fetch_add(1, Ordering::SeqCst);
        let image_path = self.run_dir.join(format!(
            "artifact-{}-{:02}.{}",
            timestamp_millis(),
            seq,
            response.image.extension()
        ));
        fs::write(&image_path, &response.image.bytes)
            .with_context(|| format!("failed to write {}", image_path.display()))?;
        self.emit(
            "artifact_created",
            map_object(json!({
                "image_path": image_path.to_string_lossy(),
                "model": selection.model.name,
                "size": response.size,
                "mime_type": response.image.mime_type,
                "warnings": response.warnings,
            })),
        )?;
        tracing::info!(target: "imgjson::engine", path = %image_path.display(), "image written");

        Ok(Render {
            image: response.image,
            image_path,
            prompt: prompt.to_string(),
            size: response.size,
            model: selection.model.name,
            warnings: response.warnings,
        })
    }

    fn select_model(&self, requested: Option<&str>, capability: Capability) -> Result<ModelSelection> {
        let selection = self
            .model_selector
            .select(requested, capability)
            .map_err(|message| anyhow!(message))?;
        if let (Some(reason), true) = (
            selection.fallback_reason.as_ref(),
            selection.requested.is_some(),
        ) {
            tracing::warn!(target: "imgjson::engine", model = %selection.model.name, "{reason}");
            self.emit(
                "model_fallback",
                map_object(json!({
                    "capability": capability.as_str(),
                    "requested": selection.requested,
                    "model": selection.model.name,
                    "reason": reason,
                })),
            )?;
        }
        Ok(selection)
    }

    fn text_provider(&self, selection: &ModelSelection) -> Result<&dyn TextProvider> {
        let name = &selection.model.provider;
        self.text_providers
            .get(name)
            .ok_or_else(|| anyhow!("no text provider registered for '{name}'"))
    }

    fn image_provider(&self, selection: &ModelSelection) -> Result<&dyn ImageProvider> {
        let name = &selection.model.provider;
        self.image_providers
            .get(name)
            .ok_or_else(|| anyhow!("no image provider registered for '{name}'"))
    }

    fn emit_extracted(
        &self,
        operation: &str,
        strategy: ExtractStrategy,
        description: &Description,
    ) -> Result<()> {
        self.emit(
            "description_extracted",
            map_object(json!({
                "operation": operation,
                "strategy": strategy.as_str(),
                "fell_back": strategy == ExtractStrategy::Fallback,
                "keys": description.len(),
            })),
        )?;
        Ok(())
    }
}

pub(crate) fn parse_dims(size: &str) -> (u32, u32) {
    let normalized = size.trim().to_ascii_lowercase();
    let parsed = normalized.split_once('x').and_then(|(width, height)| {
        Some((width.trim().parse::<u32>().ok()?, height.trim().parse::<u32>().ok()?))
    });
    match parsed {
        Some((width, height)) if width > 0 && height > 0 => (width, height),
        _ => (1024, 1024),
    }
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().is_some_and(|existing| existing == trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() || warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}
