use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub const DEFAULT_IMAGE_MIME: &str = "image/png";

/// Raw image bytes plus the MIME type they were received or loaded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageData {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    /// Accepts either a `data:image/<type>;base64,` URL or bare base64.
    pub fn from_base64(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!("image data is empty");
        }
        let (subtype, payload) = match split_data_url(trimmed) {
            Some((subtype, payload)) => (Some(subtype), payload),
            None => (None, trimmed),
        };
        let bytes = BASE64
            .decode(payload.as_bytes())
            .context("invalid image data format")?;
        if bytes.is_empty() {
            bail!("image data is empty");
        }
        let mime_type = subtype
            .map(|value| format!("image/{value}"))
            .unwrap_or_else(|| DEFAULT_IMAGE_MIME.to_string());
        Ok(Self { bytes, mime_type })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        if bytes.is_empty() {
            bail!("{} is empty", path.display());
        }
        let mime_type = mime_for_path(path).unwrap_or(DEFAULT_IMAGE_MIME);
        Ok(Self::new(bytes, mime_type))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    pub fn extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }
}

/// Removes a `data:image/<lowercase letters>;base64,` prefix if present.
pub fn strip_data_url_prefix(raw: &str) -> &str {
    split_data_url(raw)
        .map(|(_, payload)| payload)
        .unwrap_or(raw)
}

fn split_data_url(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix("data:image/")?;
    let subtype_len = rest
        .bytes()
        .take_while(|byte| byte.is_ascii_lowercase())
        .count();
    if subtype_len == 0 {
        return None;
    }
    let (subtype, tail) = rest.split_at(subtype_len);
    let payload = tail.strip_prefix(";base64,")?;
    Some((subtype, payload))
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("gif") {
        return "gif";
    }
    "png"
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{extension_for_mime, mime_for_path, strip_data_url_prefix, ImageData};

    #[test]
    fn data_url_prefix_is_stripped_and_mime_kept() -> anyhow::Result<()> {
        let image = ImageData::from_base64("data:image/jpeg;base64,AQID")?;
        assert_eq!(image.bytes, vec![1, 2, 3]);
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.extension(), "jpg");
        Ok(())
    }

    #[test]
    fn bare_base64_defaults_to_png() -> anyhow::Result<()> {
        let image = ImageData::from_base64("  AQID\n")?;
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.to_data_url(), "data:image/png;base64,AQID");
        Ok(())
    }

    #[test]
    fn invalid_or_empty_base64_is_rejected() {
        assert!(ImageData::from_base64("").is_err());
        assert!(ImageData::from_base64("not base64 !!").is_err());
        assert!(ImageData::from_base64("data:image/png;base64,").is_err());
    }

    #[test]
    fn only_lowercase_image_prefixes_are_stripped() {
        assert_eq!(strip_data_url_prefix("data:image/png;base64,AAAA"), "AAAA");
        assert_eq!(
            strip_data_url_prefix("data:image/PNG;base64,AAAA"),
            "data:image/PNG;base64,AAAA"
        );
        assert_eq!(
            strip_data_url_prefix("data:text/plain;base64,AAAA"),
            "data:text/plain;base64,AAAA"
        );
        assert_eq!(strip_data_url_prefix("AAAA"), "AAAA");
    }

    #[test]
    fn from_path_guesses_mime() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("photo.JPG");
        std::fs::write(&path, [9u8, 9, 9])?;
        let image = ImageData::from_path(&path)?;
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(mime_for_path(Path::new("a.bmp")), None);
        assert_eq!(extension_for_mime("image/webp"), "webp");
        Ok(())
    }
}
