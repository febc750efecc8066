//! Pipeline configuration.
//!
//! Loaded once from the environment (or built by the caller) and treated
//! as an immutable snapshot for the life of a session: core stages never
//! consult ambient settings mid-turn.

use std::path::PathBuf;
use std::time::Duration;

/// Which generative backend produces candidate commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Probe the chain in fixed priority order: cloud API, local CLI,
    /// deterministic fallback.
    #[default]
    Auto,
    OpenAi,
    LocalCli,
    Fallback,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Auto => "auto",
            BackendKind::OpenAi => "openai-api",
            BackendKind::LocalCli => "local-cli",
            BackendKind::Fallback => "fallback-local",
        }
    }

    /// Parse a backend name; unrecognized values mean `Auto`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai-api" | "openai" => BackendKind::OpenAi,
            "local-cli" | "cli" => BackendKind::LocalCli,
            "fallback-local" | "fallback" => BackendKind::Fallback,
            _ => BackendKind::Auto,
        }
    }
}

/// Immutable configuration snapshot for a session.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    /// Local CLI invocation, shell-split (e.g. `["codex", "exec"]`).
    pub cli_command: Vec<String>,
    pub cli_model: Option<String>,
    /// Per-attempt timeout for each backend invocation.
    pub backend_timeout: Duration,
    /// Troubleshoot invocations allowed per session.
    pub troubleshoot_limit: u32,
    /// Store location; `None` keeps history in memory.
    pub store_path: Option<PathBuf>,
    /// Command that boots the live audio interpreter, shell-split.
    pub runtime_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            openai_api_key: None,
            openai_model: "gpt-4.1-mini".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            cli_command: vec!["codex".to_string(), "exec".to_string()],
            cli_model: None,
            backend_timeout: Duration::from_secs(30),
            troubleshoot_limit: 3,
            store_path: None,
            runtime_command: vec!["renardo".to_string()],
        }
    }
}

impl Config {
    /// Build a config from `RIFF_*` / `OPENAI_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(backend) = std::env::var("RIFF_BACKEND") {
            config.backend = BackendKind::parse(&backend);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY")
            && !key.trim().is_empty()
        {
            config.openai_api_key = Some(key);
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            config.openai_model = model;
        }
        if let Ok(url) = std::env::var("RIFF_OPENAI_BASE_URL") {
            config.openai_base_url = url;
        }
        if let Ok(command) = std::env::var("RIFF_CLI_COMMAND")
            && let Some(parts) = shlex::split(&command)
            && !parts.is_empty()
        {
            config.cli_command = parts;
        }
        if let Ok(model) = std::env::var("RIFF_CLI_MODEL") {
            config.cli_model = Some(model);
        }
        if let Ok(secs) = std::env::var("RIFF_BACKEND_TIMEOUT_SECS")
            && let Ok(secs) = secs.parse::<u64>()
        {
            config.backend_timeout = Duration::from_secs(secs);
        }
        if let Ok(limit) = std::env::var("RIFF_TROUBLESHOOT_LIMIT")
            && let Ok(limit) = limit.parse::<u32>()
        {
            config.troubleshoot_limit = limit;
        }
        if let Ok(path) = std::env::var("RIFF_STORE_PATH") {
            config.store_path = Some(PathBuf::from(path));
        }
        if let Ok(command) = std::env::var("RIFF_RUNTIME_COMMAND")
            && let Some(parts) = shlex::split(&command)
            && !parts.is_empty()
        {
            config.runtime_command = parts;
        }

        config
    }
}
