//! The live runtime boundary.
//!
//! `LiveRuntime` is the only seam through which rendered instructions
//! leave the pipeline. The production implementation feeds lines to a
//! long-lived interpreter subprocess over stdin and forwards its output
//! to the session event bus; `NullRuntime` accepts everything and is
//! used for dry runs and tests.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use riff_protocol::EventLevel;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as ProcessCommand};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::emit::{self, RuntimeInstruction};
use crate::events::EventBus;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime is not running")]
    NotRunning,

    #[error("runtime command is empty")]
    EmptyCommand,

    #[error("failed to spawn runtime '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The surface the applier talks to. One instruction per call; callers
/// serialize batches under the apply lock.
#[async_trait]
pub trait LiveRuntime: Send + Sync {
    /// Adopt the owning session's event bus. Called once, before boot;
    /// runtimes with no output to forward can ignore it.
    fn attach_events(&self, _events: EventBus) {}

    /// Boot the runtime if it is not already running. Idempotent.
    async fn ensure_running(&self) -> Result<(), RuntimeError>;

    fn is_running(&self) -> bool;

    /// Execute a single rendered instruction.
    async fn apply(&self, instruction: &RuntimeInstruction) -> Result<(), RuntimeError>;

    /// Execute a song file inside the runtime.
    async fn load_song(&self, path: &Path) -> Result<(), RuntimeError>;

    /// Silence everything and reset the transport.
    async fn clear(&self) -> Result<(), RuntimeError> {
        self.apply(&RuntimeInstruction::ClearClock).await
    }

    async fn shutdown(&self) -> Result<(), RuntimeError>;
}

/// Feeds a live interpreter subprocess line by line over stdin.
pub struct ProcessRuntime {
    command: Vec<String>,
    stdin: Mutex<Option<ChildStdin>>,
    running: Arc<AtomicBool>,
    events: std::sync::RwLock<EventBus>,
}

impl ProcessRuntime {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            stdin: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            events: std::sync::RwLock::new(EventBus::new("detached", None)),
        }
    }

    fn events(&self) -> EventBus {
        self.events
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn send_line(&self, line: &str) -> Result<(), RuntimeError> {
        if !self.is_running() {
            return Err(RuntimeError::NotRunning);
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(RuntimeError::NotRunning)?;
        debug!(%line, "runtime <<");
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    fn pump_output(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            let events = self.events();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    events.publish("runtime", EventLevel::Info, line, serde_json::json!({}));
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let events = self.events();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    events.publish("runtime", EventLevel::Warning, line, serde_json::json!({}));
                }
            });
        }
    }

    fn watch_exit(&self, mut child: Child) {
        let running = Arc::clone(&self.running);
        let events = self.events();
        tokio::spawn(async move {
            let status = child.wait().await;
            running.store(false, Ordering::SeqCst);
            let message = match status {
                Ok(status) => format!("runtime exited: {status}"),
                Err(err) => format!("runtime wait failed: {err}"),
            };
            warn!("{message}");
            events.publish("runtime", EventLevel::Error, message, serde_json::json!({}));
        });
    }
}

#[async_trait]
impl LiveRuntime for ProcessRuntime {
    fn attach_events(&self, events: EventBus) {
        *self
            .events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = events;
    }

    async fn ensure_running(&self) -> Result<(), RuntimeError> {
        if self.is_running() {
            return Ok(());
        }
        let (program, args) = self
            .command
            .split_first()
            .ok_or(RuntimeError::EmptyCommand)?;

        let mut child = ProcessCommand::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: self.command.join(" "),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(RuntimeError::NotRunning)?;
        *self.stdin.lock().await = Some(stdin);
        self.pump_output(&mut child);
        self.running.store(true, Ordering::SeqCst);
        self.watch_exit(child);

        info!(command = %self.command.join(" "), "runtime booted");
        self.events().publish(
            "system",
            EventLevel::Info,
            "runtime booted",
            serde_json::json!({ "command": self.command }),
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn apply(&self, instruction: &RuntimeInstruction) -> Result<(), RuntimeError> {
        self.send_line(&emit::render(instruction)).await
    }

    async fn load_song(&self, path: &Path) -> Result<(), RuntimeError> {
        let literal = emit::quote(&path.to_string_lossy());
        self.send_line(&format!("exec(open({literal}).read())")).await
    }

    async fn shutdown(&self) -> Result<(), RuntimeError> {
        // Closing stdin lets the interpreter exit cleanly; the exit
        // watcher flips `running` when it does.
        self.stdin.lock().await.take();
        Ok(())
    }
}

/// Accepts every instruction without side effects, recording what it saw.
#[derive(Default)]
pub struct NullRuntime {
    running: AtomicBool,
    applied: std::sync::Mutex<Vec<RuntimeInstruction>>,
}

impl NullRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instructions applied so far, in order.
    pub fn applied(&self) -> Vec<RuntimeInstruction> {
        self.applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl LiveRuntime for NullRuntime {
    async fn ensure_running(&self) -> Result<(), RuntimeError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn apply(&self, instruction: &RuntimeInstruction) -> Result<(), RuntimeError> {
        if !self.is_running() {
            return Err(RuntimeError::NotRunning);
        }
        self.applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(instruction.clone());
        Ok(())
    }

    async fn load_song(&self, _path: &Path) -> Result<(), RuntimeError> {
        if !self.is_running() {
            return Err(RuntimeError::NotRunning);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}
