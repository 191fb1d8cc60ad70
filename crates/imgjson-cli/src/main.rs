use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use imgjson_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use imgjson_contracts::credentials::{ChainedCredentials, CredentialProvider};
use imgjson_contracts::extract::{extract_with_strategy, Description};
use imgjson_contracts::image_data::ImageData;
use imgjson_contracts::prompts::RenderPromptStyle;
use imgjson_contracts::session::{ChatRole, SessionManifest};
use imgjson_engine::{Engine, EngineConfig};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "imgjson",
    version,
    about = "Describe images as JSON, edit the JSON, render it back"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session: import or generate, then edit by instruction.
    Chat(ChatArgs),
    /// Describe an image file as JSON.
    Analyze(AnalyzeArgs),
    /// Generate an image from a prompt and describe it.
    Generate(GenerateArgs),
    /// Render an image from a JSON description file.
    Render(RenderArgs),
    /// Apply a natural-language instruction to a JSON description file.
    EditJson(EditJsonArgs),
    /// Edit an image so that it follows a JSON description file.
    EditImage(EditImageArgs),
    /// Pull a JSON object out of model output read from a file or stdin.
    Extract(ExtractArgs),
    /// Manage the saved OpenAI API key.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Debug, Subcommand)]
enum KeyAction {
    Set { key: String },
    Show,
    Clear,
}

#[derive(Debug, Args)]
struct EngineArgs {
    /// Run directory for images, events.jsonl and session.json.
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    vision_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    size: Option<String>,
    #[arg(long)]
    aspect: Option<String>,
    /// Prompt built from a description: `json` or `summary`.
    #[arg(long)]
    style: Option<String>,
}

#[derive(Debug, Args)]
struct ChatArgs {
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    save_json: Option<PathBuf>,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    save_json: Option<PathBuf>,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Args)]
struct RenderArgs {
    #[arg(long)]
    description: PathBuf,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Args)]
struct EditJsonArgs {
    #[arg(long)]
    description: PathBuf,
    #[arg(long)]
    instruction: String,
    #[arg(long)]
    save_json: Option<PathBuf>,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Args)]
struct EditImageArgs {
    #[arg(long)]
    description: PathBuf,
    #[arg(long)]
    image: PathBuf,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    /// Defaults to stdin.
    #[arg(long)]
    input: Option<PathBuf>,
    /// JSON object returned when nothing can be extracted.
    #[arg(long)]
    fallback: Option<PathBuf>,
    /// Print the strategy that produced the result to stderr.
    #[arg(long)]
    show_strategy: bool,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("imgjson error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("IMGJSON_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let credentials: Arc<dyn CredentialProvider> = Arc::new(ChainedCredentials::standard());
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match cli.command {
        Command::Chat(args) => {
            let engine = build_engine(&args.engine, credentials.clone())?;
            let session = SessionManifest::load(args.engine.out.join("session.json"));
            let mut chat = ChatSession::new(engine, credentials, session);
            chat.run_loop(io::stdin().lock(), &mut out)?;
            Ok(0)
        }
        Command::Analyze(args) => {
            let engine = build_engine(&args.engine, credentials)?;
            let image = ImageData::from_path(&args.image)?;
            let filename = file_name_of(&args.image);
            let analysis = engine.analyze_image(&image, filename.as_deref())?;
            if analysis.fell_back() {
                eprintln!("No JSON object in the model reply; wrote the fallback description.");
            }
            emit_description(&analysis.description, args.save_json.as_deref(), &mut out)?;
            Ok(0)
        }
        Command::Generate(args) => {
            let engine = build_engine(&args.engine, credentials)?;
            let generation = engine.generate_image(&args.prompt, &engine.config().render)?;
            eprintln!("Image saved to {}", generation.render.image_path.display());
            emit_description(&generation.description, args.save_json.as_deref(), &mut out)?;
            Ok(0)
        }
        Command::Render(args) => {
            let engine = build_engine(&args.engine, credentials)?;
            let description = read_description(&args.description)?;
            let render = engine.generate_from_description(&description, &engine.config().render)?;
            writeln!(out, "{}", render.image_path.display())?;
            Ok(0)
        }
        Command::EditJson(args) => {
            let engine = build_engine(&args.engine, credentials)?;
            let description = read_description(&args.description)?;
            let edit = engine.edit_description(&description, &args.instruction)?;
            emit_description(&edit.updated, args.save_json.as_deref(), &mut out)?;
            // Exit 2 tells scripts the description came back unchanged.
            Ok(if edit.fell_back() { 2 } else { 0 })
        }
        Command::EditImage(args) => {
            let engine = build_engine(&args.engine, credentials)?;
            let description = fs::read_to_string(&args.description)
                .with_context(|| format!("failed reading {}", args.description.display()))?;
            let image = ImageData::from_path(&args.image)?.to_data_url();
            let edit = engine.edit_image_from_description(
                Some(&Value::String(description)),
                Some(image.as_str()),
                &engine.config().render,
            )?;
            writeln!(out, "{}", edit.render.image_path.display())?;
            Ok(0)
        }
        Command::Extract(args) => {
            run_extract(args, &mut out)?;
            Ok(0)
        }
        Command::Key { action } => {
            run_key(action, credentials.as_ref(), &mut out)?;
            Ok(0)
        }
    }
}

fn build_engine(args: &EngineArgs, credentials: Arc<dyn CredentialProvider>) -> Result<Engine> {
    let mut config = EngineConfig::from_env();
    if let Some(api_base) = args.api_base.as_deref() {
        config.api_base = imgjson_engine::config::normalize_api_base(api_base);
    }
    if let Some(model) = args.text_model.clone() {
        config.vision_model.get_or_insert_with(|| model.clone());
        config.text_model = Some(model);
    }
    if args.vision_model.is_some() {
        config.vision_model = args.vision_model.clone();
    }
    if args.image_model.is_some() {
        config.image_model = args.image_model.clone();
    }
    if let Some(size) = args.size.as_deref() {
        config.render.size = normalize_size(size)?;
    }
    if let Some(aspect) = args.aspect.as_deref() {
        config.render.aspect_ratio = Some(normalize_aspect(aspect)?);
    }
    if let Some(style) = args.style.as_deref() {
        config.render.prompt_style = parse_style(style)?;
    }
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    Engine::new(&args.out, &events_path, config, credentials)
}

fn run_extract(args: ExtractArgs, out: &mut dyn Write) -> Result<()> {
    let raw = match args.input.as_ref() {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed reading stdin")?;
            buffer
        }
    };
    let fallback = match args.fallback.as_ref() {
        Some(path) => read_description(path)?,
        None => Map::new(),
    };
    let extraction = extract_with_strategy(&raw, fallback);
    if args.show_strategy {
        eprintln!("strategy: {}", extraction.strategy.as_str());
    }
    writeln!(out, "{}", pretty_json(&extraction.description))?;
    Ok(())
}

fn run_key(action: KeyAction, credentials: &dyn CredentialProvider, out: &mut dyn Write) -> Result<()> {
    match action {
        KeyAction::Set { key } => {
            credentials.set(&key)?;
            writeln!(out, "API key saved.")?;
        }
        KeyAction::Show => match credentials.read() {
            Some(key) => writeln!(out, "{}", mask_key(&key))?,
            None => writeln!(out, "No API key configured.")?,
        },
        KeyAction::Clear => {
            credentials.clear()?;
            writeln!(out, "API key cleared.")?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatFlow {
    Continue,
    Quit,
}

/// One interactive session: the engine, the saved key, and the
/// description history persisted next to the run's images.
struct ChatSession {
    engine: Engine,
    credentials: Arc<dyn CredentialProvider>,
    session: SessionManifest,
}

impl ChatSession {
    fn new(
        engine: Engine,
        credentials: Arc<dyn CredentialProvider>,
        session: SessionManifest,
    ) -> Self {
        Self {
            engine,
            credentials,
            session,
        }
    }

    fn run_loop(&mut self, mut input: impl io::BufRead, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "imgjson chat started. Type /help for commands.")?;
        if self.session.current().is_some() {
            writeln!(
                out,
                "Resumed session with {} description version(s).",
                self.session.versions.len()
            )?;
        }
        let mut line = String::new();
        loop {
            write!(out, "> ")?;
            out.flush()?;

            line.clear();
            let read = match input.read_line(&mut line) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if read == 0 {
                break;
            }
            if self.handle_line(line.trim_end_matches(['\n', '\r']), out)? == ChatFlow::Quit {
                break;
            }
        }
        Ok(())
    }

    /// Runs one line. Operation failures are reported to the user and the
    /// session continues; only output and session-file errors propagate.
    fn handle_line(&mut self, line: &str, out: &mut dyn Write) -> Result<ChatFlow> {
        let intent = parse_intent(line);
        if intent.action == "noop" {
            return Ok(ChatFlow::Continue);
        }
        tracing::debug!(target: "imgjson::chat", action = %intent.action, "chat intent");
        if intent.action != "set_key" {
            self.session.push_message(ChatRole::User, line.trim());
        }

        let flow = match self.dispatch(&intent, out) {
            Ok(flow) => flow,
            Err(err) => {
                self.say(out, &format!("Error: {err:#}"))?;
                ChatFlow::Continue
            }
        };
        self.session.save()?;
        Ok(flow)
    }

    fn dispatch(&mut self, intent: &Intent, out: &mut dyn Write) -> Result<ChatFlow> {
        match intent.action.as_str() {
            "help" => {
                self.say(out, &format!("Commands: {}", CHAT_HELP_COMMANDS.join(" ")))?;
            }
            "quit" => return Ok(ChatFlow::Quit),
            "set_key" => {
                let Some(key) = intent.arg("key") else {
                    self.say(out, "/key requires a key")?;
                    return Ok(ChatFlow::Continue);
                };
                self.credentials.set(key)?;
                self.session.push_message(ChatRole::User, "/key ****");
                self.say(out, "API key saved.")?;
            }
            "logout" => {
                self.credentials.clear()?;
                self.say(out, "API key cleared.")?;
            }
            "set_text_model" => {
                let Some(model) = intent.arg("model") else {
                    self.say(out, "/text_model requires a model name")?;
                    return Ok(ChatFlow::Continue);
                };
                let config = self.engine.config_mut();
                config.text_model = Some(model.to_string());
                config.vision_model = Some(model.to_string());
                self.say(out, &format!("Text model set to {model}"))?;
            }
            "set_image_model" => {
                let Some(model) = intent.arg("model") else {
                    self.say(out, "/image_model requires a model name")?;
                    return Ok(ChatFlow::Continue);
                };
                self.engine.config_mut().image_model = Some(model.to_string());
                self.say(out, &format!("Image model set to {model}"))?;
            }
            "set_size" => {
                let size = normalize_size(intent.setting("size").unwrap_or_default())?;
                self.engine.config_mut().render.size = size.clone();
                self.say(out, &format!("Size set to {size}"))?;
            }
            "set_aspect_ratio" => {
                let aspect = normalize_aspect(intent.setting("aspect_ratio").unwrap_or_default())?;
                self.engine.config_mut().render.aspect_ratio = Some(aspect.clone());
                self.say(out, &format!("Aspect ratio set to {aspect}"))?;
            }
            "set_prompt_style" => {
                let raw = intent.setting("prompt_style").unwrap_or_default();
                self.engine.config_mut().render.prompt_style = parse_style(raw)?;
                self.say(out, &format!("Prompt style set to {raw}"))?;
            }
            "show" => match self.session.current_description() {
                Some(description) => {
                    let text = pretty_json(description);
                    self.say(out, &text)?;
                }
                None => self.say(out, "No description yet.")?,
            },
            "history" => self.show_history(out)?,
            "import" => {
                let Some(path) = intent.arg("path") else {
                    self.say(out, "/import requires a path")?;
                    return Ok(ChatFlow::Continue);
                };
                self.import(Path::new(path), out)?;
            }
            "load_description" => {
                let Some(path) = intent.arg("path") else {
                    self.say(out, "/load requires a path")?;
                    return Ok(ChatFlow::Continue);
                };
                self.load_description(Path::new(path), out)?;
            }
            "generate" => {
                let prompt = intent.prompt.as_deref().map(str::trim).unwrap_or_default();
                if prompt.is_empty() {
                    self.say(out, "/generate requires a prompt")?;
                    return Ok(ChatFlow::Continue);
                }
                self.generate(prompt, out)?;
            }
            "update" => self.update_image(out)?,
            "edit_image" => self.edit_image(out)?,
            "save_image" => {
                let Some(path) = intent.arg("path") else {
                    self.say(out, "/save requires a path")?;
                    return Ok(ChatFlow::Continue);
                };
                self.save_image(Path::new(path), out)?;
            }
            "instruct" => {
                let instruction = intent.prompt.as_deref().unwrap_or_default();
                if self.session.current_description().is_some() {
                    self.instruct(instruction, out)?;
                } else {
                    self.generate(instruction, out)?;
                }
            }
            "unknown" => {
                let command = intent.arg("command").unwrap_or_default();
                self.say(
                    out,
                    &format!("Unknown command: /{command}. Type /help for commands."),
                )?;
            }
            other => {
                self.say(out, &format!("Unsupported action: {other}"))?;
            }
        }
        Ok(ChatFlow::Continue)
    }

    fn import(&mut self, path: &Path, out: &mut dyn Write) -> Result<()> {
        let image = ImageData::from_path(path)?;
        let filename = file_name_of(path);
        let analysis = self.engine.analyze_image(&image, filename.as_deref())?;
        if analysis.fell_back() {
            self.say(out, "The model reply held no JSON; using a basic description.")?;
        }
        let text = pretty_json(&analysis.description);
        self.session.add_version(
            "import",
            None,
            analysis.description,
            Some(path.to_string_lossy().to_string()),
        );
        self.say(out, &text)
    }

    fn generate(&mut self, prompt: &str, out: &mut dyn Write) -> Result<()> {
        let settings = self.engine.config().render.clone();
        let generation = self.engine.generate_image(prompt, &settings)?;
        let image_path = generation.render.image_path.to_string_lossy().to_string();
        let text = pretty_json(&generation.description);
        self.session
            .add_version("generate", Some(prompt), generation.description, Some(image_path.clone()));
        self.say(out, &format!("Image saved to {image_path}"))?;
        self.say(out, &text)
    }

    fn instruct(&mut self, instruction: &str, out: &mut dyn Write) -> Result<()> {
        let Some(current) = self.session.current_description().cloned() else {
            bail!("no description to edit");
        };
        let settings = self.engine.config().render.clone();
        let chat = self.engine.chat_edit(&current, instruction, &settings)?;
        if chat.edit.fell_back() {
            return self.say(
                out,
                "Could not read an updated description from the model; keeping the current one.",
            );
        }
        let image_path = chat
            .render
            .as_ref()
            .map(|render| render.image_path.to_string_lossy().to_string());
        let text = pretty_json(&chat.edit.updated);
        self.session.add_version(
            "edit",
            Some(chat.edit.instruction.as_str()),
            chat.edit.updated,
            image_path.clone(),
        );
        self.say(out, &text)?;
        if let Some(image_path) = image_path {
            self.say(out, &format!("Image saved to {image_path}"))?;
        }
        if let Some(error) = chat.render_error {
            self.say(
                out,
                &format!("Description updated; the image was not rendered ({error}). Use /update to retry."),
            )?;
        }
        Ok(())
    }

    fn load_description(&mut self, path: &Path, out: &mut dyn Write) -> Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let extraction = extract_with_strategy(&raw, Map::new());
        if extraction.fell_back() {
            bail!("no JSON object found in {}", path.display());
        }
        self.session
            .add_version("load", None, extraction.description, None);
        self.say(out, &format!("Loaded description from {}", path.display()))
    }

    fn update_image(&mut self, out: &mut dyn Write) -> Result<()> {
        let Some(description) = self.session.current_description().cloned() else {
            return self.say(out, "No description yet. Use /import or /generate first.");
        };
        let settings = self.engine.config().render.clone();
        let render = self.engine.generate_from_description(&description, &settings)?;
        self.session.attach_image(&render.image_path);
        self.say(out, &format!("Image saved to {}", render.image_path.display()))
    }

    fn edit_image(&mut self, out: &mut dyn Write) -> Result<()> {
        let Some(description) = self.session.current_description().cloned() else {
            return self.say(out, "No description yet. Use /import or /generate first.");
        };
        let Some(image_path) = self.session.current_image_path().map(PathBuf::from) else {
            return self.say(out, "No image yet. Use /import, /generate or /update first.");
        };
        let image = ImageData::from_path(&image_path)?;
        let settings = self.engine.config().render.clone();
        let render = self.engine.edit_image(&description, &image, &settings)?;
        self.session.attach_image(&render.image_path);
        self.say(out, &format!("Image saved to {}", render.image_path.display()))
    }

    fn save_image(&mut self, target: &Path, out: &mut dyn Write) -> Result<()> {
        let Some(source) = self.session.current_image_path().map(PathBuf::from) else {
            return self.say(out, "No image to save.");
        };
        if let Some(parent) = target.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, target)
            .with_context(|| format!("failed copying {} to {}", source.display(), target.display()))?;
        self.say(out, &format!("Saved {}", target.display()))
    }

    fn show_history(&mut self, out: &mut dyn Write) -> Result<()> {
        if self.session.versions.is_empty() {
            return self.say(out, "No history yet.");
        }
        let lines: Vec<String> = self
            .session
            .versions
            .iter()
            .map(|version| {
                let mut line = format!("{} {}", version.version_id, version.action);
                if let Some(instruction) = version.instruction.as_deref() {
                    line.push_str(&format!(": {instruction}"));
                }
                if let Some(image_path) = version.image_path.as_deref() {
                    line.push_str(&format!(" [{image_path}]"));
                }
                line
            })
            .collect();
        self.say(out, &lines.join("\n"))
    }

    fn say(&mut self, out: &mut dyn Write, message: &str) -> Result<()> {
        writeln!(out, "{message}")?;
        self.session.push_message(ChatRole::System, message);
        Ok(())
    }
}

fn read_description(path: &Path) -> Result<Description> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    match serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?
    {
        Value::Object(object) => Ok(object),
        _ => bail!("{} must contain a JSON object", path.display()),
    }
}

fn emit_description(
    description: &Description,
    save_to: Option<&Path>,
    out: &mut dyn Write,
) -> Result<()> {
    let text = pretty_json(description);
    if let Some(path) = save_to {
        fs::write(path, format!("{text}\n"))
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    writeln!(out, "{text}")?;
    Ok(())
}

fn pretty_json(description: &Description) -> String {
    serde_json::to_string_pretty(description).unwrap_or_else(|_| "{}".to_string())
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|value| value.to_str())
        .map(str::to_string)
}

/// Accepts `WxH` with positive integer sides.
fn normalize_size(raw: &str) -> Result<String> {
    let normalized = raw.trim().to_ascii_lowercase().replace(' ', "");
    let valid = normalized
        .split_once('x')
        .and_then(|(width, height)| Some((width.parse::<u32>().ok()?, height.parse::<u32>().ok()?)))
        .is_some_and(|(width, height)| width > 0 && height > 0);
    if !valid {
        bail!("size must look like 1024x1024 (got '{}')", raw.trim());
    }
    Ok(normalized)
}

fn normalize_aspect(raw: &str) -> Result<String> {
    let trimmed = raw.trim().replace(' ', "");
    let valid = trimmed
        .split_once(':')
        .and_then(|(width, height)| Some((width.parse::<u32>().ok()?, height.parse::<u32>().ok()?)))
        .is_some_and(|(width, height)| width > 0 && height > 0);
    if !valid {
        bail!("aspect ratio must look like 16:9 (got '{}')", raw.trim());
    }
    Ok(trimmed)
}

fn parse_style(raw: &str) -> Result<RenderPromptStyle> {
    match RenderPromptStyle::parse(raw) {
        Some(style) => Ok(style),
        None => bail!("prompt style must be 'json' or 'summary' (got '{}')", raw.trim()),
    }
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use anyhow::Result;
    use imgjson_contracts::credentials::{CredentialProvider, MemoryCredentials};
    use imgjson_contracts::events::read_event_types;
    use imgjson_contracts::session::{ChatRole, SessionManifest};
    use imgjson_contracts::image_data::ImageData;
    use imgjson_contracts::providers::NamedProvider;
    use imgjson_engine::{
        Engine, EngineConfig, ImageProvider, ImageRequest, ImageResponse, RenderSettings,
    };
    use serde_json::json;

    use super::{mask_key, normalize_aspect, normalize_size, run_key, ChatFlow, ChatSession, KeyAction};

    fn dryrun_chat(dir: &Path) -> Result<(ChatSession, Arc<MemoryCredentials>)> {
        let config = EngineConfig {
            text_model: Some("dryrun-text-1".to_string()),
            vision_model: Some("dryrun-text-1".to_string()),
            image_model: Some("dryrun-image-1".to_string()),
            render: RenderSettings {
                size: "32x32".to_string(),
                ..RenderSettings::default()
            },
            ..EngineConfig::default()
        };
        let credentials = Arc::new(MemoryCredentials::new());
        let engine = Engine::new(dir, dir.join("events.jsonl"), config, credentials.clone())?;
        let session = SessionManifest::new(dir.join("session.json"));
        Ok((ChatSession::new(engine, credentials.clone(), session), credentials))
    }

    fn say(chat: &mut ChatSession, line: &str) -> Result<(ChatFlow, String)> {
        let mut out = Vec::new();
        let flow = chat.handle_line(line, &mut out)?;
        Ok((flow, String::from_utf8_lossy(&out).to_string()))
    }

    #[test]
    fn plain_text_generates_then_edits() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (mut chat, _) = dryrun_chat(temp.path())?;

        let (_, output) = say(&mut chat, "a red barn")?;
        assert!(output.contains("Image saved to"), "{output}");
        assert_eq!(chat.session.versions.len(), 1);
        assert_eq!(chat.session.versions[0].action, "generate");

        let (_, output) = say(&mut chat, "add snow")?;
        assert!(output.contains("add snow"), "{output}");
        let current = chat.session.current().cloned();
        let current = current.as_ref();
        assert_eq!(current.map(|v| v.action.as_str()), Some("edit"));
        assert_eq!(
            current.map(|v| v.description["edits"].clone()),
            Some(json!(["add snow"]))
        );
        assert!(current.and_then(|v| v.image_path.as_deref()).is_some());
        assert!(current.and_then(|v| v.description_diff.as_ref()).is_some());

        let saved = SessionManifest::load(temp.path().join("session.json"));
        assert_eq!(saved.versions.len(), 2);
        assert!(saved
            .transcript
            .iter()
            .any(|message| message.role == ChatRole::User && message.content == "add snow"));

        let types = read_event_types(&temp.path().join("events.jsonl"))?;
        assert!(types.iter().any(|kind| kind == "generation_completed"));
        Ok(())
    }

    struct BrokenImages;

    impl NamedProvider for BrokenImages {
        fn name(&self) -> &str {
            "dryrun"
        }
    }

    impl ImageProvider for BrokenImages {
        fn generate(&self, _request: &ImageRequest) -> Result<ImageResponse> {
            anyhow::bail!("image service unavailable")
        }

        fn edit(&self, _request: &ImageRequest, _input: &ImageData) -> Result<ImageResponse> {
            anyhow::bail!("image service unavailable")
        }
    }

    #[test]
    fn edit_is_kept_when_render_fails() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (mut chat, _) = dryrun_chat(temp.path())?;
        say(&mut chat, "a red barn")?;
        chat.engine.register_image_provider(Arc::new(BrokenImages));

        let (_, output) = say(&mut chat, "add snow")?;
        assert!(output.contains("image render failed"), "{output}");
        assert!(output.contains("image service unavailable"), "{output}");
        assert_eq!(chat.session.versions.len(), 2);
        let current = chat.session.current().cloned();
        assert_eq!(current.as_ref().map(|v| v.action.as_str()), Some("edit"));
        assert_eq!(
            current.as_ref().map(|v| v.description["edits"].clone()),
            Some(json!(["add snow"]))
        );
        assert_eq!(current.and_then(|v| v.image_path), None);

        let saved = SessionManifest::load(temp.path().join("session.json"));
        assert_eq!(saved.versions.len(), 2);
        Ok(())
    }

    #[test]
    fn import_load_update_save_and_history() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (mut chat, _) = dryrun_chat(temp.path())?;

        say(&mut chat, "/generate a quiet pond")?;
        let source = chat
            .session
            .current_image_path()
            .map(str::to_string)
            .unwrap_or_default();

        let (_, output) = say(&mut chat, &format!("/import \"{source}\""))?;
        assert!(output.contains("\"source\": \"imported\""), "{output}");

        let manual = temp.path().join("manual.json");
        std::fs::write(&manual, "```json\n{\"mood\": \"eerie\"}\n```")?;
        say(&mut chat, &format!("/load {}", manual.display()))?;
        assert_eq!(
            chat.session.current_description().map(|d| d["mood"].clone()),
            Some(json!("eerie"))
        );
        // Loaded JSON has no image of its own yet.
        assert_eq!(chat.session.current().and_then(|v| v.image_path.clone()), None);

        let (_, output) = say(&mut chat, "/update")?;
        assert!(output.starts_with("Image saved to"), "{output}");
        let (_, output) = say(&mut chat, "/edit_image")?;
        assert!(output.starts_with("Image saved to"), "{output}");

        let exported = temp.path().join("export").join("final.png");
        say(&mut chat, &format!("/save {}", exported.display()))?;
        assert!(exported.exists());

        let (_, history) = say(&mut chat, "/history")?;
        assert!(history.contains("v1 generate: a quiet pond"), "{history}");
        assert!(history.contains("v2 import"), "{history}");
        assert!(history.contains("v3 load"), "{history}");
        Ok(())
    }

    #[test]
    fn settings_and_errors_keep_the_session_alive() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (mut chat, credentials) = dryrun_chat(temp.path())?;

        let (_, output) = say(&mut chat, "/size 64 x 48")?;
        assert_eq!(output.trim(), "Size set to 64x48");
        assert_eq!(chat.engine.config().render.size, "64x48");

        let (_, output) = say(&mut chat, "/size huge")?;
        assert!(output.starts_with("Error: size must look like"), "{output}");

        let (_, output) = say(&mut chat, "/aspect 16:9")?;
        assert_eq!(output.trim(), "Aspect ratio set to 16:9");
        let (_, output) = say(&mut chat, "/style summary")?;
        assert_eq!(output.trim(), "Prompt style set to summary");

        let (_, output) = say(&mut chat, "/load /definitely/missing.json")?;
        assert!(output.starts_with("Error: failed reading"), "{output}");

        let (_, output) = say(&mut chat, "/update")?;
        assert!(output.starts_with("No description yet"), "{output}");

        let (_, output) = say(&mut chat, "/frobnicate now")?;
        assert_eq!(output.trim(), "Unknown command: /frobnicate. Type /help for commands.");

        say(&mut chat, "/key sk-test-123456")?;
        assert_eq!(credentials.read().as_deref(), Some("sk-test-123456"));
        assert!(chat
            .session
            .transcript
            .iter()
            .all(|message| !message.content.contains("sk-test-123456")));
        say(&mut chat, "/logout")?;
        assert_eq!(credentials.read(), None);

        let (flow, _) = say(&mut chat, "/quit")?;
        assert_eq!(flow, ChatFlow::Quit);
        Ok(())
    }

    #[test]
    fn run_loop_stops_at_eof() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (mut chat, _) = dryrun_chat(temp.path())?;
        let mut out = Vec::new();
        chat.run_loop("/help\n\n".as_bytes(), &mut out)?;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("Commands: /key <api-key>"), "{text}");
        assert!(text.contains(" /help "), "{text}");
        Ok(())
    }

    #[test]
    fn key_commands() -> Result<()> {
        let credentials = MemoryCredentials::new();
        let mut out = Vec::new();
        run_key(KeyAction::Show, &credentials, &mut out)?;
        run_key(
            KeyAction::Set {
                key: " sk-proj-abcdefgh ".to_string(),
            },
            &credentials,
            &mut out,
        )?;
        run_key(KeyAction::Show, &credentials, &mut out)?;
        run_key(KeyAction::Clear, &credentials, &mut out)?;
        assert_eq!(
            String::from_utf8_lossy(&out),
            "No API key configured.\nAPI key saved.\nsk-…efgh\nAPI key cleared.\n"
        );
        Ok(())
    }

    #[test]
    fn size_aspect_and_mask_helpers() {
        assert_eq!(normalize_size(" 1536X1024 ").ok().as_deref(), Some("1536x1024"));
        assert!(normalize_size("0x10").is_err());
        assert_eq!(normalize_aspect("3 : 2").ok().as_deref(), Some("3:2"));
        assert!(normalize_aspect("wide").is_err());
        assert_eq!(mask_key("short"), "*****");
    }
}
