use serde_json::{Map, Value};

/// JSON object describing an image. Every field is optional to readers.
pub type Description = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractStrategy {
    Direct,
    FenceStripped,
    GreedySpan,
    Fallback,
}

impl ExtractStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::FenceStripped => "fence_stripped",
            Self::GreedySpan => "greedy_span",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub description: Description,
    pub strategy: ExtractStrategy,
}

impl Extraction {
    pub fn fell_back(&self) -> bool {
        self.strategy == ExtractStrategy::Fallback
    }
}

/// Turns model output into a description object, or returns `fallback`.
///
/// Strategies run in order and the first one yielding a JSON object wins:
/// the trimmed text as-is, the text with a bounding ```` ``` ````/```` ```json ````
/// fence removed, and finally the span from the first `{` to the last `}`.
/// The span is greedy, so two separate objects in one response are parsed as
/// one (invalid) candidate and the fallback is returned.
pub fn extract_description(raw: &str, fallback: Description) -> Description {
    extract_with_strategy(raw, fallback).description
}

pub fn extract_with_strategy(raw: &str, fallback: Description) -> Extraction {
    let trimmed = raw.trim();
    if let Some(description) = parse_object(trimmed) {
        return Extraction {
            description,
            strategy: ExtractStrategy::Direct,
        };
    }

    let unfenced = strip_code_fence(trimmed);
    if let Some(description) = parse_object(unfenced) {
        return Extraction {
            description,
            strategy: ExtractStrategy::FenceStripped,
        };
    }

    match greedy_object_span(unfenced) {
        Some(span) => {
            if let Some(description) = parse_object(span) {
                return Extraction {
                    description,
                    strategy: ExtractStrategy::GreedySpan,
                };
            }
            tracing::debug!(
                target: "imgjson::extract",
                span_len = span.len(),
                "object span did not parse; using fallback"
            );
        }
        None => {
            tracing::debug!(
                target: "imgjson::extract",
                raw_len = raw.len(),
                "no object span in model output; using fallback"
            );
        }
    }

    Extraction {
        description: fallback,
        strategy: ExtractStrategy::Fallback,
    }
}

/// Removes a leading ```` ``` ```` (optionally followed by a language tag
/// such as `json` or `jsonc`) and a trailing ```` ``` ````. Fences in the
/// middle of the text are left alone.
pub fn strip_code_fence(text: &str) -> &str {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = strip_language_tag(rest);
    }
    if let Some(rest) = body.strip_suffix("```") {
        body = rest;
    }
    body.trim()
}

/// A tag is a run of ASCII alphanumerics ended by whitespace or the end of
/// the text; anything else is content.
fn strip_language_tag(rest: &str) -> &str {
    let tag_len = rest
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    let after = &rest[tag_len..];
    if tag_len > 0 && (after.is_empty() || after.starts_with(char::is_whitespace)) {
        after
    } else {
        rest
    }
}

fn greedy_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

fn parse_object(candidate: &str) -> Option<Description> {
    if candidate.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}
