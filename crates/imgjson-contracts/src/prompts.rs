use serde_json::Value;

use crate::description::summarize_description;
use crate::extract::Description;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderPromptStyle {
    /// Embed the description as compact JSON.
    #[default]
    Json,
    /// Use the natural-language summary of the known fields.
    Summary,
}

impl RenderPromptStyle {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "summary" | "text" => Some(Self::Summary),
            _ => None,
        }
    }
}

pub fn analysis_instruction(filename: Option<&str>, import_date: &str) -> String {
    let filename = filename
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown");
    format!(
        r#"Analyze this image and create a detailed JSON description that includes:
- Analysis of what the image contains
- Technical properties (try to detect dimensions, format, etc.)
- Style description
- Content description
- Quality assessment

IMPORTANT: Return ONLY a valid JSON object. Do NOT wrap it in markdown code blocks or any other formatting. Start your response directly with {{ and end with }}.

Use this structure:
{{
  "analysis": "detailed analysis of the image",
  "source": "imported",
  "filename": "{filename}",
  "image_elements": [
    {{
      "element": "name of the element",
      "attributes": {{
        "color": "color of the element",
        "shape": "shape of the element",
        "style": "style of the element",
        "size": "size of the element",
        "position": "position of the element",
        "orientation": "orientation of the element",
        "texture": "texture of the element",
        "material": "material of the element"
      }}
    }}
  ],
  "image_properties": {{
    "format": "detected format",
    "estimated_dimensions": "estimated dimensions",
    "import_date": "{import_date}"
  }},
  "description": {{
    "style": "description of visual style",
    "content": "description of image content",
    "quality": "quality assessment"
  }},
  "elements": ["array", "of", "key", "visual", "elements"],
  "mood": "overall mood/atmosphere",
  "colors": ["dominant", "color", "palette"],
  "composition": "description of composition and layout"
}}"#
    )
}

pub fn edit_description_prompt(current: &Description, instruction: &str) -> String {
    format!(
        "You are an expert at editing JSON descriptions for image generation. Given a JSON object \
         describing an image and a natural language instruction, modify the JSON to reflect the \
         requested changes. Return ONLY the modified JSON object, no additional text or explanation.\n\n\
         Current JSON: {}\n\n\
         User instruction: {}\n\n\
         Return the updated JSON that incorporates the user's requested changes:",
        pretty(current),
        instruction.trim()
    )
}

pub fn render_prompt(description: &Description, style: RenderPromptStyle) -> String {
    match style {
        RenderPromptStyle::Json => format!(
            "Generate an image based on this JSON description: {}. Create a detailed visual \
             representation that captures all the elements, style, mood, and composition \
             described in the JSON.",
            serde_json::to_string(description).unwrap_or_else(|_| "{}".to_string())
        ),
        RenderPromptStyle::Summary => summarize_description(description),
    }
}

pub fn edit_image_prompt(description: &Description) -> String {
    format!(
        "Make edits to this image. Here is a JSON representation of the new image with the edits. \
         Make sure to follow the JSON description exactly. \n {}",
        pretty(description)
    )
}

fn pretty(description: &Description) -> String {
    serde_json::to_string_pretty(&Value::Object(description.clone()))
        .unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        analysis_instruction, edit_description_prompt, edit_image_prompt, render_prompt,
        RenderPromptStyle,
    };

    #[test]
    fn analysis_instruction_interpolates_filename_and_date() {
        let text = analysis_instruction(Some("cat.png"), "2026-10-18T00:00:00.000Z");
        assert!(text.contains("\"filename\": \"cat.png\""));
        assert!(text.contains("\"import_date\": \"2026-10-18T00:00:00.000Z\""));
        assert!(text.contains("Return ONLY a valid JSON object"));
        assert!(analysis_instruction(None, "t").contains("\"filename\": \"unknown\""));
    }

    #[test]
    fn edit_prompt_embeds_pretty_json_and_instruction() {
        let current = json!({"mood": "calm"});
        let text = edit_description_prompt(
            current.as_object().unwrap_or(&Default::default()),
            "  make it stormy ",
        );
        assert!(text.contains("Current JSON: {\n  \"mood\": \"calm\"\n}"));
        assert!(text.contains("User instruction: make it stormy\n"));
    }

    #[test]
    fn render_prompt_styles() {
        let description = json!({"mood": "calm"});
        let object = description.as_object().cloned().unwrap_or_default();
        assert!(render_prompt(&object, RenderPromptStyle::Json)
            .starts_with("Generate an image based on this JSON description: {\"mood\":\"calm\"}."));
        assert_eq!(render_prompt(&object, RenderPromptStyle::Summary), "calm mood");
        assert_eq!(RenderPromptStyle::parse(" Summary "), Some(RenderPromptStyle::Summary));
        assert_eq!(RenderPromptStyle::parse("xml"), None);
    }

    #[test]
    fn edit_image_prompt_ends_with_pretty_json() {
        let description = json!({"colors": ["red"]});
        let text = edit_image_prompt(description.as_object().unwrap_or(&Default::default()));
        assert!(text.starts_with("Make edits to this image."));
        assert!(text.ends_with("{\n  \"colors\": [\n    \"red\"\n  ]\n}"));
    }
}
