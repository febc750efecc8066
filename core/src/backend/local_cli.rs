//! Local CLI agent backend.
//!
//! Shells out to an installed agent binary (e.g. `codex exec`), hands it
//! the combined prompt on argv and extracts the command list from its
//! stdout. One process per request; the chain's per-attempt timeout
//! bounds how long it may run.

use async_trait::async_trait;
use tokio::process::Command as ProcessCommand;
use tracing::debug;

use crate::config::Config;

use super::{BackendError, BackendReply, CommandBackend, GenerateRequest, SYSTEM_PROMPT,
    extract_commands};

pub struct LocalCliBackend {
    command: Vec<String>,
    model: Option<String>,
}

impl LocalCliBackend {
    pub fn new(command: Vec<String>, model: Option<String>) -> Self {
        Self { command, model }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cli_command.clone(), config.cli_model.clone())
    }

    fn prompt_arg(request: &GenerateRequest) -> String {
        format!("{SYSTEM_PROMPT}\n\n{}", request.user_payload())
    }
}

#[async_trait]
impl CommandBackend for LocalCliBackend {
    fn name(&self) -> &'static str {
        "local-cli"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<BackendReply, BackendError> {
        let (binary, args) = self
            .command
            .split_first()
            .ok_or_else(|| BackendError::BinaryNotFound {
                binary: String::new(),
            })?;

        let mut process = ProcessCommand::new(binary);
        process.args(args);
        if let Some(model) = &self.model {
            process.arg("--model").arg(model);
        }
        process.arg(Self::prompt_arg(request));
        process.kill_on_drop(true);

        debug!(%binary, "spawning CLI backend");
        let output = process.output().await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                BackendError::BinaryNotFound {
                    binary: binary.clone(),
                }
            } else {
                BackendError::Process {
                    code: None,
                    stderr: err.to_string(),
                }
            }
        })?;

        if !output.status.success() {
            return Err(BackendError::Process {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let extraction = extract_commands(&stdout)?;
        let confidence = extraction.confidence();
        Ok(BackendReply {
            commands: extraction.commands,
            model: self
                .model
                .clone()
                .unwrap_or_else(|| format!("cli:{binary}")),
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riff_protocol::{Intent, SessionSnapshot};

    fn request() -> GenerateRequest {
        GenerateRequest {
            prompt: "stop everything".into(),
            intent: Intent::Edit,
            snapshot: SessionSnapshot::default(),
            failure: None,
        }
    }

    #[test]
    fn prompt_arg_includes_instructions_and_payload() {
        let arg = LocalCliBackend::prompt_arg(&request());
        assert!(arg.starts_with(SYSTEM_PROMPT));
        assert!(arg.contains("stop everything"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn extracts_commands_from_stdout() {
        // `echo` prints its argv back; embed a command list in a fixed
        // leading argument so stdout carries extractable JSON.
        let backend = LocalCliBackend::new(
            vec![
                "echo".to_string(),
                r#"result: [{"op": "clock_clear"}]"#.to_string(),
            ],
            None,
        );
        let reply = backend.generate(&request()).await.unwrap();
        assert_eq!(reply.commands.len(), 1);
        assert_eq!(reply.commands[0]["op"], "clock_clear");
        assert_eq!(reply.model, "cli:echo");
        // Depth-scanned from surrounding prose, not a direct parse.
        assert!(reply.confidence > 0.0 && reply.confidence < 0.95);
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_such() {
        let backend = LocalCliBackend::new(vec!["riff-no-such-agent".to_string()], None);
        match backend.generate(&request()).await {
            Err(BackendError::BinaryNotFound { binary }) => {
                assert_eq!(binary, "riff-no-such-agent");
            }
            other => panic!("expected BinaryNotFound, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let backend = LocalCliBackend::new(
            vec!["sh".to_string(), "-c".to_string(), "echo broken >&2; exit 3".to_string()],
            None,
        );
        match backend.generate(&request()).await {
            Err(BackendError::Process { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("broken"));
            }
            other => panic!("expected Process error, got {other:?}"),
        }
    }
}
