use std::time::Duration;

use imgjson_contracts::prompts::RenderPromptStyle;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_SIZE: &str = "1024x1024";
pub const DEFAULT_ASPECT_RATIO: &str = "1:1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// How a description is turned into an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
    pub size: String,
    pub aspect_ratio: Option<String>,
    pub prompt_style: RenderPromptStyle,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            size: DEFAULT_SIZE.to_string(),
            aspect_ratio: Some(DEFAULT_ASPECT_RATIO.to_string()),
            prompt_style: RenderPromptStyle::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub api_base: String,
    pub text_model: Option<String>,
    pub vision_model: Option<String>,
    pub image_model: Option<String>,
    pub timeout: Duration,
    pub render: RenderSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            text_model: None,
            vision_model: None,
            image_model: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            render: RenderSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();
        let timeout = get("IMGJSON_TIMEOUT_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);

        Self {
            api_base: normalize_api_base(
                &get("OPENAI_API_BASE")
                    .or_else(|| get("OPENAI_BASE_URL"))
                    .unwrap_or(defaults.api_base),
            ),
            text_model: get("IMGJSON_TEXT_MODEL"),
            vision_model: get("IMGJSON_VISION_MODEL"),
            image_model: get("IMGJSON_IMAGE_MODEL"),
            timeout,
            render: defaults.render,
        }
    }
}

/// Trims trailing slashes and appends `/v1` to a bare host.
pub fn normalize_api_base(raw: &str) -> String {
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if base.is_empty() {
        return DEFAULT_API_BASE.to_string();
    }
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{normalize_api_base, EngineConfig, DEFAULT_API_BASE};

    fn config_from(pairs: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = config_from(&[]);
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.render.size, "1024x1024");
        assert_eq!(config.render.aspect_ratio.as_deref(), Some("1:1"));
    }

    #[test]
    fn environment_overrides() {
        let config = config_from(&[
            ("OPENAI_BASE_URL", "http://localhost:8080/"),
            ("IMGJSON_TEXT_MODEL", " dryrun-text-1 "),
            ("IMGJSON_IMAGE_MODEL", ""),
            ("IMGJSON_TIMEOUT_SECS", "30"),
        ]);
        assert_eq!(config.api_base, "http://localhost:8080/v1");
        assert_eq!(config.text_model.as_deref(), Some("dryrun-text-1"));
        assert_eq!(config.image_model, None);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn api_base_precedence_and_bad_timeout() {
        let config = config_from(&[
            ("OPENAI_API_BASE", "https://proxy.example/openai/v1"),
            ("OPENAI_BASE_URL", "http://ignored"),
            ("IMGJSON_TIMEOUT_SECS", "soon"),
        ]);
        assert_eq!(config.api_base, "https://proxy.example/openai/v1");
        assert_eq!(config.timeout, EngineConfig::default().timeout);
    }

    #[test]
    fn normalize_keeps_explicit_paths() {
        assert_eq!(normalize_api_base("  "), DEFAULT_API_BASE);
        assert_eq!(normalize_api_base("https://api.openai.com"), DEFAULT_API_BASE);
        assert_eq!(
            normalize_api_base("https://gateway.example/v2/"),
            "https://gateway.example/v2"
        );
    }
}
