#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg_key: Option<&'static str>,
}

const fn spec(
    command: &'static str,
    action: &'static str,
    arg_key: Option<&'static str>,
) -> CommandSpec {
    CommandSpec {
        command,
        action,
        arg_key,
    }
}

/// Commands whose argument is kept verbatim (prompts, keys, model names).
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    spec("key", "set_key", Some("key")),
    spec("generate", "generate", Some("prompt")),
    spec("text_model", "set_text_model", Some("model")),
    spec("image_model", "set_image_model", Some("model")),
];

/// Commands whose argument is one filesystem path (quotes allowed).
pub(crate) const PATH_ARG_COMMANDS: &[CommandSpec] = &[
    spec("import", "import", Some("path")),
    spec("load", "load_description", Some("path")),
    spec("save", "save_image", Some("path")),
];

/// Commands that update render settings.
pub(crate) const SETTING_COMMANDS: &[CommandSpec] = &[
    spec("size", "set_size", Some("size")),
    spec("aspect", "set_aspect_ratio", Some("aspect_ratio")),
    spec("style", "set_prompt_style", Some("prompt_style")),
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    spec("help", "help", None),
    spec("logout", "logout", None),
    spec("show", "show", None),
    spec("update", "update", None),
    spec("edit_image", "edit_image", None),
    spec("history", "history", None),
    spec("quit", "quit", None),
    spec("exit", "quit", None),
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/key <api-key>",
    "/logout",
    "/import <path>",
    "/generate <prompt>",
    "/size <WxH>",
    "/aspect <ratio>",
    "/style json|summary",
    "/show",
    "/load <path.json>",
    "/update",
    "/edit_image",
    "/save <path>",
    "/history",
    "/text_model <model>",
    "/image_model <model>",
    "/help",
    "/quit",
];
