//! Generative backends and the resolution chain.
//!
//! Three interchangeable sources of candidate commands sit behind the
//! `CommandBackend` trait: a cloud completion API, a local CLI agent
//! subprocess, and a deterministic fallback that needs no network at
//! all. `BackendChain` resolves which of them to try and walks the
//! list, advancing on every failure or per-attempt timeout, so a turn
//! degrades to the fallback rather than erroring while any backend in
//! the chain can still answer.

mod extract;
mod fallback;
mod local_cli;
mod openai;

pub use extract::{ExtractError, Extraction, ExtractionMethod, extract_commands};
pub use fallback::FallbackBackend;
pub use local_cli::LocalCliBackend;
pub use openai::OpenAiBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use riff_protocol::{Intent, SessionSnapshot, Violation};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{BackendKind, Config};

/// Instructions every backend is given before the user's prompt.
pub(crate) const SYSTEM_PROMPT: &str = "\
You translate a live-coding performer's request into a JSON array of \
commands. Reply with ONLY the JSON array, no prose. Allowed ops: \
set_global (target: Clock.bpm | Scale.default | Root.default), \
player_assign (player, synth, pattern, kwargs), player_set (player, \
param, value), player_stop (player), clock_clear. Players are p1-p8, \
b1-b4, d1-d4, n1-n4. At most 12 commands. Prefer small, reversible \
edits over rewriting the whole scene.";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no API key configured")]
    MissingCredentials,

    #[error("CLI binary '{binary}' not found on PATH")]
    BinaryNotFound { binary: String },

    #[error("backend timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("API request failed with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("API transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("CLI process exited with {code:?}: {stderr}")]
    Process { code: Option<i32>, stderr: String },

    #[error(transparent)]
    Extraction(#[from] ExtractError),

    #[error("backend returned an empty command list")]
    Empty,

    #[error("all backends failed: {}", attempts.join("; "))]
    AllFailed { attempts: Vec<String> },
}

/// Why the previous attempt at this prompt was rejected; present only
/// in repair requests.
#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub failed_commands: Vec<serde_json::Value>,
    pub violations: Vec<Violation>,
}

/// Everything a backend needs to produce a candidate batch.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub intent: Intent,
    pub snapshot: SessionSnapshot,
    pub failure: Option<FailureContext>,
}

impl GenerateRequest {
    /// The JSON payload sent as the user message.
    pub(crate) fn user_payload(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "intent": self.intent.as_str(),
            "request": self.prompt,
            "state": self.snapshot,
        });
        if let Some(failure) = &self.failure {
            payload["failed_commands"] = serde_json::json!(failure.failed_commands);
            payload["violations"] = serde_json::json!(failure.violations);
            payload["instruction"] =
                "Fix the failed commands so every violation is resolved.".into();
        }
        payload
    }
}

/// A raw candidate batch plus provenance.
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub commands: Vec<serde_json::Value>,
    /// Backend/model identifier recorded on the turn.
    pub model: String,
    pub confidence: f32,
}

#[async_trait]
pub trait CommandBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &GenerateRequest) -> Result<BackendReply, BackendError>;
}

/// What the environment makes available, probed once at chain build time.
#[derive(Debug, Clone, Copy)]
pub struct Probes {
    pub has_api_key: bool,
    pub cli_available: bool,
}

/// Resolve the configured kind to the ordered list of backends to try.
/// `Auto` prefers the cloud API, then the local CLI, and always ends at
/// the fallback so the chain is never empty. An explicit pin means that
/// variant only: its failures propagate instead of degrading.
pub fn resolve_chain(kind: BackendKind, probes: &Probes) -> Vec<BackendKind> {
    match kind {
        BackendKind::Auto => {
            let mut chain = Vec::new();
            if probes.has_api_key {
                chain.push(BackendKind::OpenAi);
            }
            if probes.cli_available {
                chain.push(BackendKind::LocalCli);
            }
            chain.push(BackendKind::Fallback);
            chain
        }
        BackendKind::OpenAi | BackendKind::LocalCli | BackendKind::Fallback => vec![kind],
    }
}

/// Ordered backends plus the per-attempt timeout.
pub struct BackendChain {
    backends: Vec<Arc<dyn CommandBackend>>,
    timeout: Duration,
}

impl BackendChain {
    pub fn new(backends: Vec<Arc<dyn CommandBackend>>, timeout: Duration) -> Self {
        Self { backends, timeout }
    }

    /// Build the chain from config, probing credentials and PATH.
    pub fn from_config(config: &Config) -> Self {
        let cli_binary = config.cli_command.first().cloned().unwrap_or_default();
        let probes = Probes {
            has_api_key: config.openai_api_key.is_some(),
            cli_available: !cli_binary.is_empty() && which::which(&cli_binary).is_ok(),
        };
        let backends = resolve_chain(config.backend, &probes)
            .into_iter()
            .map(|kind| -> Arc<dyn CommandBackend> {
                match kind {
                    BackendKind::OpenAi => Arc::new(OpenAiBackend::from_config(config)),
                    BackendKind::LocalCli => Arc::new(LocalCliBackend::from_config(config)),
                    BackendKind::Fallback | BackendKind::Auto => {
                        Arc::new(FallbackBackend::new())
                    }
                }
            })
            .collect();
        Self::new(backends, config.backend_timeout)
    }

    /// Names of the backends in resolution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Try each backend in order until one produces a non-empty batch.
    pub async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<BackendReply, BackendError> {
        let mut attempts = Vec::new();
        for backend in &self.backends {
            debug!(backend = backend.name(), "trying backend");
            let attempt = tokio::time::timeout(self.timeout, backend.generate(request)).await;
            let error = match attempt {
                Ok(Ok(reply)) if reply.commands.is_empty() => BackendError::Empty,
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(err)) => err,
                Err(_) => BackendError::Timeout {
                    elapsed: self.timeout,
                },
            };
            warn!(backend = backend.name(), %error, "backend failed, advancing");
            attempts.push(format!("{}: {error}", backend.name()));
        }
        Err(BackendError::AllFailed { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct FixedBackend {
        name: &'static str,
        reply: Result<Vec<serde_json::Value>, fn() -> BackendError>,
        delay: Duration,
    }

    #[async_trait]
    impl CommandBackend for FixedBackend {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn generate(
            &self,
            _request: &GenerateRequest,
        ) -> Result<BackendReply, BackendError> {
            tokio::time::sleep(self.delay).await;
            match &self.reply {
                Ok(commands) => Ok(BackendReply {
                    commands: commands.clone(),
                    model: self.name.to_string(),
                    confidence: 0.9,
                }),
                Err(make) => Err(make()),
            }
        }
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            prompt: "make it darker".into(),
            intent: Intent::Edit,
            snapshot: SessionSnapshot::default(),
            failure: None,
        }
    }

    #[test]
    fn auto_resolution_depends_on_probes() {
        let all = Probes {
            has_api_key: true,
            cli_available: true,
        };
        assert_eq!(
            resolve_chain(BackendKind::Auto, &all),
            vec![
                BackendKind::OpenAi,
                BackendKind::LocalCli,
                BackendKind::Fallback
            ]
        );

        let none = Probes {
            has_api_key: false,
            cli_available: false,
        };
        assert_eq!(
            resolve_chain(BackendKind::Auto, &none),
            vec![BackendKind::Fallback]
        );
    }

    #[test]
    fn explicit_pin_is_that_variant_only() {
        let probes = Probes {
            has_api_key: true,
            cli_available: true,
        };
        assert_eq!(
            resolve_chain(BackendKind::OpenAi, &probes),
            vec![BackendKind::OpenAi]
        );
        assert_eq!(
            resolve_chain(BackendKind::LocalCli, &probes),
            vec![BackendKind::LocalCli]
        );
        assert_eq!(
            resolve_chain(BackendKind::Fallback, &probes),
            vec![BackendKind::Fallback]
        );
    }

    #[tokio::test]
    async fn chain_advances_past_failures() {
        let chain = BackendChain::new(
            vec![
                Arc::new(FixedBackend {
                    name: "broken",
                    reply: Err(|| BackendError::MissingCredentials),
                    delay: Duration::ZERO,
                }),
                Arc::new(FixedBackend {
                    name: "working",
                    reply: Ok(vec![serde_json::json!({"op": "clock_clear"})]),
                    delay: Duration::ZERO,
                }),
            ],
            Duration::from_secs(1),
        );
        let reply = chain.generate(&request()).await.unwrap();
        assert_eq!(reply.model, "working");
    }

    #[tokio::test]
    async fn per_attempt_timeout_advances_the_chain() {
        let chain = BackendChain::new(
            vec![
                Arc::new(FixedBackend {
                    name: "slow",
                    reply: Ok(vec![serde_json::json!({"op": "clock_clear"})]),
                    delay: Duration::from_secs(30),
                }),
                Arc::new(FixedBackend {
                    name: "fast",
                    reply: Ok(vec![serde_json::json!({"op": "clock_clear"})]),
                    delay: Duration::ZERO,
                }),
            ],
            Duration::from_millis(50),
        );
        let reply = chain.generate(&request()).await.unwrap();
        assert_eq!(reply.model, "fast");
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_attempt() {
        let chain = BackendChain::new(
            vec![
                Arc::new(FixedBackend {
                    name: "a",
                    reply: Err(|| BackendError::MissingCredentials),
                    delay: Duration::ZERO,
                }),
                Arc::new(FixedBackend {
                    name: "b",
                    reply: Ok(vec![]),
                    delay: Duration::ZERO,
                }),
            ],
            Duration::from_secs(1),
        );
        match chain.generate(&request()).await {
            Err(BackendError::AllFailed { attempts }) => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts[0].starts_with("a:"));
                assert!(attempts[1].starts_with("b:"));
            }
            other => panic!("expected AllFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_reply_counts_as_failure() {
        let chain = BackendChain::new(
            vec![
                Arc::new(FixedBackend {
                    name: "empty",
                    reply: Ok(vec![]),
                    delay: Duration::ZERO,
                }),
                Arc::new(FixedBackend {
                    name: "real",
                    reply: Ok(vec![serde_json::json!({"op": "clock_clear"})]),
                    delay: Duration::ZERO,
                }),
            ],
            Duration::from_secs(1),
        );
        let reply = chain.generate(&request()).await.unwrap();
        assert_eq!(reply.model, "real");
    }
}
