//! Offline provider: deterministic descriptions and solid-colour images, so
//! every flow can run without network access or an API key.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imgjson_contracts::extract::extract_description;
use imgjson_contracts::image_data::ImageData;
use imgjson_contracts::providers::NamedProvider;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::parse_dims;
use crate::providers::{ImageProvider, ImageRequest, ImageResponse, TextProvider, TextRequest, TextResponse};

const EDIT_JSON_MARKER: &str = "Current JSON: ";
const EDIT_INSTRUCTION_MARKER: &str = "\n\nUser instruction: ";
const EDIT_TAIL_MARKER: &str = "\n\nReturn the updated JSON";
const MAX_SIDE: u32 = 2048;

#[derive(Debug, Default, Clone, Copy)]
pub struct DryrunProvider;

impl NamedProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }
}

impl TextProvider for DryrunProvider {
    fn complete(&self, request: &TextRequest) -> Result<TextResponse> {
        let text = match request.image.as_ref() {
            Some(image) => describe_image(image),
            None => match split_edit_prompt(&request.prompt) {
                Some((current, instruction)) => apply_edit(current, instruction),
                None => serde_json::to_string(&json!({"echo": request.prompt.trim()}))?,
            },
        };
        Ok(TextResponse {
            text,
            model: request.model.clone(),
            input_tokens: None,
            output_tokens: None,
        })
    }
}

impl ImageProvider for DryrunProvider {
    fn generate(&self, request: &ImageRequest) -> Result<ImageResponse> {
        let (width, height) = parse_dims(&request.size);
        let (width, height) = (width.min(MAX_SIDE), height.min(MAX_SIDE));
        let color = color_from_bytes(&[request.prompt.as_bytes()]);
        Ok(ImageResponse {
            image: solid_png(width, height, color)?,
            size: format!("{width}x{height}"),
            warnings: Vec::new(),
        })
    }

    fn edit(&self, request: &ImageRequest, input: &ImageData) -> Result<ImageResponse> {
        let (width, height) = match image::load_from_memory(&input.bytes) {
            Ok(decoded) => (decoded.width(), decoded.height()),
            Err(_) => parse_dims(&request.size),
        };
        let (width, height) = (width.min(MAX_SIDE), height.min(MAX_SIDE));
        let color = color_from_bytes(&[request.prompt.as_bytes(), &input.bytes]);
        Ok(ImageResponse {
            image: solid_png(width, height, color)?,
            size: format!("{width}x{height}"),
            warnings: Vec::new(),
        })
    }
}

/// Answers in a fenced block, the way chat models commonly do.
fn describe_image(image: &ImageData) -> String {
    let (dimensions, color) = match image::load_from_memory(&image.bytes) {
        Ok(decoded) => {
            let rgb = decoded.to_rgb8();
            let pixel = rgb.get_pixel(0, 0).0;
            (
                format!("{}x{}", decoded.width(), decoded.height()),
                (pixel[0], pixel[1], pixel[2]),
            )
        }
        Err(_) => ("Unknown".to_string(), color_from_bytes(&[&image.bytes])),
    };
    let hex_color = format!("#{}", hex::encode([color.0, color.1, color.2]));
    let description = json!({
        "analysis": format!("A uniform field of {hex_color}."),
        "source": "imported",
        "image_properties": {
            "format": image.extension().to_ascii_uppercase(),
            "estimated_dimensions": dimensions,
        },
        "description": {
            "style": "flat colour",
            "content": format!("solid {hex_color} background"),
            "quality": "synthetic",
        },
        "elements": ["colour field"],
        "mood": "neutral",
        "colors": [hex_color],
        "composition": "uniform",
    });
    let pretty = serde_json::to_string_pretty(&description).unwrap_or_else(|_| "{}".to_string());
    format!("```json\n{pretty}\n```")
}

fn split_edit_prompt(prompt: &str) -> Option<(&str, &str)> {
    let (_, rest) = prompt.split_once(EDIT_JSON_MARKER)?;
    let (current, rest) = rest.split_once(EDIT_INSTRUCTION_MARKER)?;
    let instruction = rest
        .split_once(EDIT_TAIL_MARKER)
        .map(|(instruction, _)| instruction)
        .unwrap_or(rest);
    Some((current, instruction.trim()))
}

/// Records the instruction under `edits` and wraps the answer in prose.
fn apply_edit(current: &str, instruction: &str) -> String {
    let mut description = extract_description(current, Map::new());
    let mut edits = match description.remove("edits") {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    edits.push(Value::String(instruction.to_string()));
    description.insert("edits".to_string(), Value::Array(edits));
    let body = serde_json::to_string(&description).unwrap_or_else(|_| "{}".to_string());
    format!("Here is the updated JSON:\n{body}\nLet me know if you need more changes.")
}

fn solid_png(width: u32, height: u32, (r, g, b): (u8, u8, u8)) -> Result<ImageData> {
    let mut image = RgbImage::new(width.max(1), height.max(1));
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode dryrun image")?;
    Ok(ImageData::new(bytes, "image/png"))
}

fn color_from_bytes(chunks: &[&[u8]]) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
