//! Interactive command-line front end for a riff session.
//!
//! Boots (or dry-runs) a live session, optionally loads a song, then
//! reads prompts from stdin. `:undo`, `:repair`, `:state` and `:quit`
//! are meta-commands; everything else is submitted as a turn.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use riff_core::runtime::{LiveRuntime, NullRuntime, ProcessRuntime};
use riff_core::{BackendKind, Config, LiveSession, RiffError};
use riff_protocol::{ApplyStatus, FailedTurn, Intent, TurnOutcome, TurnRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "riff", about = "Patch a live audio session from prompts")]
struct Cli {
    /// Backend to use: auto, openai-api, local-cli or fallback-local.
    #[arg(long)]
    backend: Option<String>,

    /// Model name for the cloud or CLI backend.
    #[arg(long)]
    model: Option<String>,

    /// Command that boots the live interpreter (shell-split).
    #[arg(long)]
    runtime_cmd: Option<String>,

    /// SQLite store path; omitted means in-memory history.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Song file to load after boot.
    #[arg(long)]
    song: Option<PathBuf>,

    /// Intent hint forwarded to the backend: edit, new_scene or mix_fix.
    #[arg(long, default_value = "edit")]
    intent: String,

    /// Accept instructions without a live interpreter process.
    #[arg(long)]
    dry_run: bool,

    /// One-shot prompt; skips the interactive loop.
    prompt: Option<String>,
}

fn parse_intent(value: &str) -> Intent {
    match value {
        "new_scene" => Intent::NewScene,
        "mix_fix" => Intent::MixFix,
        _ => Intent::Edit,
    }
}

fn build_config(cli: &Cli) -> Config {
    let mut config = Config::from_env();
    if let Some(backend) = &cli.backend {
        config.backend = BackendKind::parse(backend);
    }
    if let Some(model) = &cli.model {
        config.openai_model = model.clone();
        config.cli_model = Some(model.clone());
    }
    if let Some(command) = &cli.runtime_cmd
        && let Some(parts) = shlex::split(command)
        && !parts.is_empty()
    {
        config.runtime_command = parts;
    }
    if let Some(store) = &cli.store {
        config.store_path = Some(store.clone());
    }
    config
}

fn print_outcome(outcome: &TurnOutcome) {
    match outcome.apply_status {
        ApplyStatus::Applied => {
            println!("applied ({}, {}ms):", outcome.model, outcome.latency_ms);
            for line in &outcome.emitted {
                println!("  {line}");
            }
        }
        ApplyStatus::Skipped => {
            if let Some(err) = &outcome.backend_error {
                println!("no commands generated: {err}");
            } else {
                println!("rejected:");
                for violation in &outcome.validation.violations {
                    println!("  {}", violation.message);
                }
                println!("(use :repair to ask for a corrected batch)");
            }
        }
        ApplyStatus::Failed => {
            println!("runtime refused the patch; session state was rolled back");
        }
    }
    for note in &outcome.normalization_notes {
        println!("  note: {note}");
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = build_config(&cli);
    let intent = parse_intent(&cli.intent);

    let runtime: Arc<dyn LiveRuntime> = if cli.dry_run {
        Arc::new(NullRuntime::new())
    } else {
        Arc::new(ProcessRuntime::new(config.runtime_command.clone()))
    };
    let session = LiveSession::new(&config, runtime)?;

    // Mirror session events to stderr so they interleave with prompts.
    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            eprintln!("[{}] {}", event.source, event.message);
        }
    });

    session.boot().await?;
    if let Some(song) = &cli.song {
        session.load_song(song).await?;
    }

    if let Some(prompt) = &cli.prompt {
        let request = TurnRequest {
            session_id: session.id().to_string(),
            input: prompt.clone(),
            intent,
        };
        let outcome = session.submit(&request).await?;
        print_outcome(&outcome);
        session.shutdown().await?;
        return Ok(());
    }

    let mut last_failed: Option<FailedTurn> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"riff> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            ":quit" | ":q" => break,
            ":state" => {
                let snapshot = session.snapshot().await;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            ":undo" => match session.undo().await {
                Ok(undo) => {
                    println!("undid patch {}:", undo.reverted_patch_id);
                    for line in &undo.emitted {
                        println!("  {line}");
                    }
                }
                Err(RiffError::NothingToUndo) => println!("nothing to undo"),
                Err(err) => println!("undo failed: {err}"),
            },
            ":repair" => match &last_failed {
                None => println!("no failed turn to repair"),
                Some(failed) => match session.troubleshoot(failed).await {
                    Ok(proposal) => {
                        println!(
                            "proposal ({}, confidence {:.2}, budget {}/{}):",
                            proposal.model,
                            proposal.confidence,
                            proposal.budget.used,
                            proposal.budget.limit
                        );
                        println!("  {}", serde_json::to_string(&proposal.fixed_commands)?);
                        println!("  {}", proposal.reason);
                        println!("paste the batch back in to apply it");
                    }
                    Err(err) => println!("repair unavailable: {err}"),
                },
            },
            prompt => {
                debug!(%prompt, "submitting turn");
                let outcome = session.submit_turn(prompt, intent).await?;
                if outcome.apply_status == ApplyStatus::Skipped
                    && outcome.backend_error.is_none()
                {
                    last_failed = Some(FailedTurn {
                        prompt: prompt.to_string(),
                        intent,
                        commands: outcome.effective_commands.clone(),
                        violations: outcome.validation.violations.clone(),
                    });
                } else if outcome.apply_status == ApplyStatus::Applied {
                    last_failed = None;
                }
                print_outcome(&outcome);
            }
        }
    }

    session.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli).await.context("riff session failed")
}
