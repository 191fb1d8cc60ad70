use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use similar::TextDiff;
use uuid::Uuid;

use crate::extract::Description;

pub const SESSION_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub ts: String,
}

/// One description, as produced by a single analyze/generate/edit cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionVersion {
    pub version_id: String,
    pub parent_version_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub instruction: Option<String>,
    pub description: Description,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub description_diff: Option<Vec<String>>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    #[serde(skip)]
    pub path: PathBuf,
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    #[serde(default)]
    pub versions: Vec<DescriptionVersion>,
    #[serde(default)]
    pub transcript: Vec<ChatMessage>,
}

impl SessionManifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: SESSION_SCHEMA_VERSION,
            session_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            versions: Vec::new(),
            transcript: Vec::new(),
        }
    }

    /// Loads `path`, starting a fresh session when it is missing or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let parsed = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<SessionManifest>(&raw).ok());
        match parsed {
            Some(mut manifest) => {
                manifest.path = path;
                manifest
            }
            None => Self::new(path),
        }
    }

    pub fn current(&self) -> Option<&DescriptionVersion> {
        self.versions.last()
    }

    pub fn current_description(&self) -> Option<&Description> {
        self.current().map(|version| &version.description)
    }

    pub fn current_image_path(&self) -> Option<&str> {
        self.versions
            .iter()
            .rev()
            .find_map(|version| version.image_path.as_deref())
    }

    /// Records a new description that replaces the current one.
    pub fn add_version(
        &mut self,
        action: &str,
        instruction: Option<&str>,
        description: Description,
        image_path: Option<String>,
    ) -> DescriptionVersion {
        let parent = self.current();
        let description_diff = parent.map(|prev| description_diff(&prev.description, &description));
        let version = DescriptionVersion {
            version_id: format!("v{}", self.versions.len() + 1),
            parent_version_id: parent.map(|prev| prev.version_id.clone()),
            action: action.to_string(),
            instruction: instruction.map(str::to_string),
            description,
            image_path,
            description_diff,
            created_at: now_utc_iso(),
        };
        self.versions.push(version.clone());
        version
    }

    /// Points the current version at a newly rendered image.
    pub fn attach_image(&mut self, image_path: &Path) {
        if let Some(version) = self.versions.last_mut() {
            version.image_path = Some(image_path.to_string_lossy().to_string());
        }
    }

    pub fn push_message(&mut self, role: ChatRole, content: impl Into<String>) {
        self.transcript.push(ChatMessage {
            role,
            content: content.into(),
            ts: now_utc_iso(),
        });
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn description_diff(prev: &Description, curr: &Description) -> Vec<String> {
    let before = pretty(prev);
    let after = pretty(curr);
    TextDiff::from_lines(&before, &after)
        .unified_diff()
        .header("prev", "curr")
        .to_string()
        .lines()
        .map(str::to_string)
        .collect()
}

fn pretty(description: &Description) -> String {
    let mut text = serde_json::to_string_pretty(&Value::Object(description.clone()))
        .unwrap_or_else(|_| "{}".to_string());
    text.push('\n');
    text
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
