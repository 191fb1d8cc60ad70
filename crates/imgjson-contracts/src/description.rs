//! Fallback descriptions and the annotations applied to generated images.
//!
//! Fallbacks are built only from what the caller already knows, so they can be
//! handed to the extractor before the model has answered.

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::extract::Description;

const CONTENT_PREVIEW_CHARS: usize = 100;

/// Millisecond UTC timestamp in the `2026-01-01T00:00:00.000Z` form.
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn imported_fallback(filename: Option<&str>, raw_text: &str, now: &str) -> Description {
    let preview: String = raw_text.chars().take(CONTENT_PREVIEW_CHARS).collect();
    object(json!({
        "analysis": "Imported image analysis",
        "source": "imported",
        "filename": display_filename(filename),
        "image_properties": {
            "format": "Unknown",
            "estimated_dimensions": "Unknown",
            "import_date": now,
        },
        "description": {
            "style": "User-imported image",
            "content": format!("{preview}..."),
            "quality": "Original quality",
        },
        "elements": ["imported", "user", "content"],
        "mood": "User-defined",
        "colors": ["varied"],
    }))
}

pub fn generated_fallback(
    prompt: &str,
    dimensions: &str,
    aspect_ratio: Option<&str>,
    now: &str,
) -> Description {
    object(json!({
        "analysis": "AI Generated Image",
        "source": "generated",
        "prompt_used": prompt,
        "image_properties": {
            "dimensions": dimensions,
            "aspect_ratio": aspect_ratio,
            "format": "PNG",
            "generated_at": now,
        },
        "description": {
            "style": "AI-generated digital art",
            "content": format!("Generated from prompt: {prompt}"),
            "quality": "High resolution",
        },
        "elements": ["AI", "generated", "content"],
        "mood": "Creative",
        "colors": ["varied"],
        "composition": "AI-generated composition",
    }))
}

/// Marks an analyzed description as generated from `prompt`.
///
/// Existing `image_properties` keys are kept; generation keys overwrite them.
pub fn annotate_generated(
    mut description: Description,
    prompt: &str,
    dimensions: &str,
    aspect_ratio: Option<&str>,
    now: &str,
) -> Description {
    description.insert("source".to_string(), json!("generated"));
    description.insert("prompt_used".to_string(), json!(prompt));

    let mut properties = match description.remove("image_properties") {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    properties.insert("dimensions".to_string(), json!(dimensions));
    properties.insert("aspect_ratio".to_string(), json!(aspect_ratio));
    properties.insert("format".to_string(), json!("PNG"));
    properties.insert("generated_at".to_string(), json!(now));
    description.insert("image_properties".to_string(), Value::Object(properties));
    description
}

/// Condenses the well-known description fields into a short prompt.
pub fn summarize_description(description: &Description) -> String {
    let mut parts: Vec<String> = Vec::new();
    let inner = description.get("description").and_then(Value::as_object);

    if let Some(content) = inner.and_then(|value| string_field(value, "content")) {
        parts.push(content.to_string());
    }
    if let Some(style) = inner.and_then(|value| string_field(value, "style")) {
        parts.push(format!("in {style} style"));
    }
    if let Some(elements) = joined_list(description.get("elements")) {
        parts.push(format!("featuring {elements}"));
    }
    if let Some(colors) = joined_list(description.get("colors")) {
        parts.push(format!("with {colors} colors"));
    }
    if let Some(mood) = string_field(description, "mood") {
        parts.push(format!("{mood} mood"));
    }
    if let Some(composition) = string_field(description, "composition") {
        parts.push(format!("{composition} composition"));
    }
    if let Some(quality) = inner.and_then(|value| string_field(value, "quality")) {
        parts.push(quality.to_string());
    }
    if let Some(dimensions) = description
        .get("image_properties")
        .and_then(Value::as_object)
        .and_then(|value| string_field(value, "dimensions"))
    {
        parts.push(format!("{dimensions} resolution"));
    }

    if parts.is_empty() {
        return serde_json::to_string(description).unwrap_or_else(|_| "{}".to_string());
    }
    parts.join(", ")
}

fn display_filename(filename: Option<&str>) -> &str {
    filename
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown")
}

fn string_field<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

fn joined_list(value: Option<&Value>) -> Option<String> {
    let rows = value?.as_array()?;
    if rows.is_empty() {
        return None;
    }
    let rendered: Vec<String> = rows
        .iter()
        .map(|row| match row {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect();
    Some(rendered.join(", "))
}

fn object(value: Value) -> Description {
    value.as_object().cloned().unwrap_or_default()
}
