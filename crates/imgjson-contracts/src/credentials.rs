//! API credential providers.
//!
//! Network-calling components receive an `Arc<dyn CredentialProvider>` and ask
//! it for the key on every request, so clearing a key takes effect at once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

pub trait CredentialProvider: Send + Sync {
    fn name(&self) -> &str;
    fn read(&self) -> Option<String>;
    fn set(&self, key: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;

    fn writable(&self) -> bool {
        true
    }
}

/// Trims a key and drops a leading `Bearer ` so header values can be pasted.
pub fn normalize_api_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let key = match trimmed.strip_prefix("Bearer") {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim(),
        _ => trimmed,
    };
    if key.is_empty() {
        return None;
    }
    Some(key.to_string())
}

#[derive(Debug, Default)]
pub struct MemoryCredentials {
    key: Mutex<Option<String>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: &str) -> Self {
        Self {
            key: Mutex::new(normalize_api_key(key)),
        }
    }
}

impl CredentialProvider for MemoryCredentials {
    fn name(&self) -> &str {
        "memory"
    }

    fn read(&self) -> Option<String> {
        self.key.lock().ok().and_then(|guard| guard.clone())
    }

    fn set(&self, key: &str) -> Result<()> {
        let key = normalize_api_key(key).ok_or_else(|| anyhow!("API key is empty"))?;
        let mut guard = self
            .key
            .lock()
            .map_err(|_| anyhow!("credential lock poisoned"))?;
        *guard = Some(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self
            .key
            .lock()
            .map_err(|_| anyhow!("credential lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}

/// Key persisted in a single file, readable only by the owner on unix.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("imgjson").join("credentials"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialProvider for FileCredentials {
    fn name(&self) -> &str {
        "file"
    }

    fn read(&self) -> Option<String> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        normalize_api_key(&raw)
    }

    fn set(&self, key: &str) -> Result<()> {
        let key = normalize_api_key(key).ok_or_else(|| anyhow!("API key is empty"))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{key}\n"))
            .with_context(|| format!("failed writing {}", self.path.display()))?;
        restrict_permissions(&self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed removing {}", self.path.display()))
            }
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed restricting {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Read-only key from the process environment, then from a `.env` file.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    var: String,
    dotenv: Option<PathBuf>,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>, dotenv: Option<PathBuf>) -> Self {
        Self {
            var: var.into(),
            dotenv,
        }
    }

    pub fn openai() -> Self {
        Self::new(OPENAI_API_KEY_ENV, Some(PathBuf::from(".env")))
    }
}

impl CredentialProvider for EnvCredentials {
    fn name(&self) -> &str {
        "env"
    }

    fn read(&self) -> Option<String> {
        if let Some(value) = std::env::var(&self.var)
            .ok()
            .and_then(|value| normalize_api_key(&value))
        {
            return Some(value);
        }
        let path = self.dotenv.as_ref()?;
        parse_dotenv(path)
            .get(&self.var)
            .and_then(|value| normalize_api_key(value))
    }

    fn set(&self, _key: &str) -> Result<()> {
        bail!("environment credentials are read-only; export {}", self.var)
    }

    fn clear(&self) -> Result<()> {
        bail!("environment credentials are read-only; unset {}", self.var)
    }

    fn writable(&self) -> bool {
        false
    }
}

/// Reads from the first provider that has a key. Writes go to the first
/// writable provider; `clear` empties every writable provider.
pub struct ChainedCredentials {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl ChainedCredentials {
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    /// The saved key file first, then `OPENAI_API_KEY` / `.env`.
    pub fn standard() -> Self {
        let mut providers: Vec<Box<dyn CredentialProvider>> = Vec::new();
        if let Some(path) = FileCredentials::default_path() {
            providers.push(Box::new(FileCredentials::new(path)));
        }
        providers.push(Box::new(EnvCredentials::openai()));
        Self::new(providers)
    }

    /// Name of the provider currently supplying the key.
    pub fn source(&self) -> Option<&str> {
        self.providers
            .iter()
            .find(|provider| provider.read().is_some())
            .map(|provider| provider.name())
    }
}

impl CredentialProvider for ChainedCredentials {
    fn name(&self) -> &str {
        "chain"
    }

    fn read(&self) -> Option<String> {
        self.providers.iter().find_map(|provider| provider.read())
    }

    fn set(&self, key: &str) -> Result<()> {
        let Some(provider) = self.providers.iter().find(|provider| provider.writable()) else {
            bail!("no writable credential store configured");
        };
        provider.set(key)
    }

    fn clear(&self) -> Result<()> {
        for provider in self.providers.iter().filter(|provider| provider.writable()) {
            provider.clear()?;
        }
        Ok(())
    }

    fn writable(&self) -> bool {
        self.providers.iter().any(|provider| provider.writable())
    }
}

/// Parses `KEY=value` lines, ignoring comments and an `export ` prefix.
/// Matching single or double quotes around a value are removed.
pub fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    let mut vars = HashMap::new();
    for raw_line in content.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix("export ") {
            line = stripped.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let unquoted = ['"', '\'']
            .iter()
            .find_map(|quote| {
                value
                    .strip_prefix(*quote)
                    .and_then(|rest| rest.strip_suffix(*quote))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), unquoted.to_string());
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::{
        normalize_api_key, parse_dotenv, ChainedCredentials, CredentialProvider, EnvCredentials,
        FileCredentials, MemoryCredentials,
    };

    #[test]
    fn normalize_strips_bearer_and_whitespace() {
        assert_eq!(normalize_api_key("  sk-123\n"), Some("sk-123".to_string()));
        assert_eq!(normalize_api_key("Bearer sk-123"), Some("sk-123".to_string()));
        assert_eq!(normalize_api_key("   "), None);
        assert_eq!(normalize_api_key("Bearer "), None);
        assert_eq!(normalize_api_key("Bearer\tsk-456 "), Some("sk-456".to_string()));
        assert_eq!(normalize_api_key("Bearersk-789"), Some("Bearersk-789".to_string()));
        let creds = MemoryCredentials::new();
        assert!(creds.set("Bearer ").is_err());
        assert_eq!(creds.read(), None);
    }

    #[test]
    fn memory_credentials_lifecycle() -> anyhow::Result<()> {
        let creds = MemoryCredentials::new();
        assert_eq!(creds.read(), None);
        creds.set("sk-abc")?;
        assert_eq!(creds.read().as_deref(), Some("sk-abc"));
        assert!(creds.set("  ").is_err());
        assert_eq!(creds.read().as_deref(), Some("sk-abc"));
        creds.clear()?;
        assert_eq!(creds.read(), None);
        Ok(())
    }

    #[test]
    fn file_credentials_persist_and_clear() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("credentials");
        let creds = FileCredentials::new(&path);
        assert_eq!(creds.read(), None);
        creds.set("sk-file")?;
        assert_eq!(FileCredentials::new(&path).read().as_deref(), Some("sk-file"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path)?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        creds.clear()?;
        assert!(!path.exists());
        creds.clear()?;
        Ok(())
    }

    #[test]
    fn dotenv_parsing_handles_quotes_comments_and_export() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(".env");
        std::fs::write(
            &path,
            "# comment\nexport IMGJSON_TEST_A=\"quoted value\"\nIMGJSON_TEST_B='single'\n\
             IMGJSON_TEST_C = plain \nnot a pair\n=missing\n",
        )?;
        let vars = parse_dotenv(&path);
        assert_eq!(vars.get("IMGJSON_TEST_A").map(String::as_str), Some("quoted value"));
        assert_eq!(vars.get("IMGJSON_TEST_B").map(String::as_str), Some("single"));
        assert_eq!(vars.get("IMGJSON_TEST_C").map(String::as_str), Some("plain"));
        assert_eq!(vars.len(), 3);
        Ok(())
    }

    #[test]
    fn env_credentials_fall_back_to_dotenv_and_are_read_only() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(".env");
        std::fs::write(&path, "IMGJSON_TEST_DOTENV_ONLY_KEY=sk-dotenv\n")?;
        let creds = EnvCredentials::new("IMGJSON_TEST_DOTENV_ONLY_KEY", Some(path));
        assert_eq!(creds.read().as_deref(), Some("sk-dotenv"));
        assert!(!creds.writable());
        assert!(creds.set("sk-new").is_err());
        assert!(creds.clear().is_err());
        Ok(())
    }

    #[test]
    fn chain_reads_first_available_and_writes_first_writable() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dotenv = temp.path().join(".env");
        std::fs::write(&dotenv, "IMGJSON_TEST_CHAIN_KEY=sk-env\n")?;
        let chain = ChainedCredentials::new(vec![
            Box::new(EnvCredentials::new("IMGJSON_TEST_CHAIN_KEY_MISSING", None)),
            Box::new(FileCredentials::new(temp.path().join("credentials"))),
            Box::new(EnvCredentials::new("IMGJSON_TEST_CHAIN_KEY", Some(dotenv))),
        ]);
        assert_eq!(chain.read().as_deref(), Some("sk-env"));
        assert_eq!(chain.source(), Some("env"));

        chain.set("sk-saved")?;
        assert_eq!(chain.read().as_deref(), Some("sk-saved"));
        assert_eq!(chain.source(), Some("file"));

        chain.clear()?;
        assert_eq!(chain.read().as_deref(), Some("sk-env"));
        Ok(())
    }
}
