//! Streamed agent edits, verified by the typechecker before they touch disk.
//!
//! `editloop turn` runs a full generate/apply/check/repair turn against the
//! current directory; `parse` and `apply` replay a saved agent transcript.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use editloop::apply::{DEFAULT_CHUNK_BYTES, apply_transcript, parse_transcript};
use editloop::controller::{ControllerConfig, DiagnosticsLoopController};
use editloop::core::overlay::OverlayStore;
use editloop::core::session::{TurnEvent, TurnStatus};
use editloop::exit_codes;
use editloop::io::base_tree::FsBaseTree;
use editloop::io::commit::commit_overlay;
use editloop::io::config::load_config;
use editloop::io::generator::CommandGenerator;
use editloop::io::init::{EditloopPaths, InitOptions, init_editloop};
use editloop::io::turn_log::{TurnRecord, write_turn_record};
use editloop::io::typecheck::CommandTypechecker;
use editloop::logging;

#[derive(Parser)]
#[command(
    name = "editloop",
    version,
    about = "Apply streamed agent edits through a typecheck repair loop"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.editloop/config.toml` with defaults.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Parse a saved agent transcript and print its directives as JSON.
    Parse {
        file: PathBuf,
        /// Feed the parser in chunks of this many bytes.
        #[arg(long, default_value_t = DEFAULT_CHUNK_BYTES)]
        chunk_bytes: usize,
    },
    /// Apply a saved agent transcript to an overlay over the current directory.
    Apply {
        file: PathBuf,
        /// Write the resulting overlay to disk.
        #[arg(long)]
        commit: bool,
        #[arg(long, default_value_t = DEFAULT_CHUNK_BYTES)]
        chunk_bytes: usize,
    },
    /// Run one generate/apply/typecheck/repair turn.
    Turn {
        /// Request sent to the generating agent.
        #[arg(short, long)]
        prompt: String,
        /// Commit the overlay if the turn ends clean.
        #[arg(long)]
        commit: bool,
        /// Commit the overlay even if the turn failed.
        #[arg(long)]
        force_commit: bool,
        /// Skip writing `.editloop/turns/<turn_id>.json`.
        #[arg(long)]
        no_archive: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Parse { file, chunk_bytes } => cmd_parse(&file, chunk_bytes),
        Command::Apply {
            file,
            commit,
            chunk_bytes,
        } => cmd_apply(&root, &file, chunk_bytes, commit),
        Command::Turn {
            prompt,
            commit,
            force_commit,
            no_archive,
        } => cmd_turn(&root, &prompt, commit, force_commit, !no_archive),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_editloop(root, &InitOptions { force })?;
    println!("wrote {}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_parse(file: &Path, chunk_bytes: usize) -> Result<i32> {
    let text = read_transcript(file)?;
    let parsed = parse_transcript(&text, chunk_bytes);
    print_json(&parsed)?;
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
struct ApplySummary {
    applied: usize,
    unchanged: usize,
    issues: Vec<editloop::core::directive::DirectiveIssue>,
    virtual_files: Vec<String>,
    deleted_files: Vec<String>,
    dependencies: Vec<String>,
    committed: bool,
}

fn cmd_apply(root: &Path, file: &Path, chunk_bytes: usize, commit: bool) -> Result<i32> {
    let text = read_transcript(file)?;
    let base = FsBaseTree::new(root);
    let mut overlay = OverlayStore::new();
    let outcome = apply_transcript(&text, chunk_bytes, &mut overlay, &base);
    if commit {
        commit_overlay(root, &overlay)?;
    }
    print_json(&ApplySummary {
        applied: outcome.applied.len(),
        unchanged: outcome.unchanged,
        issues: outcome.issues,
        virtual_files: overlay.writes().keys().map(ToString::to_string).collect(),
        deleted_files: overlay.deletes().iter().map(ToString::to_string).collect(),
        dependencies: overlay.dependencies().iter().cloned().collect(),
        committed: commit,
    })?;
    Ok(exit_codes::OK)
}

fn cmd_turn(
    root: &Path,
    prompt: &str,
    commit: bool,
    force_commit: bool,
    archive: bool,
) -> Result<i32> {
    let paths = EditloopPaths::new(root);
    let cfg = load_config(&paths.config_path)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    runtime.block_on(async {
        let controller = DiagnosticsLoopController::new(
            CommandGenerator::new(&cfg.generator).with_cwd(root),
            CommandTypechecker::new(&cfg.typecheck),
            FsBaseTree::new(root),
            root,
            ControllerConfig::from(&cfg),
        );
        let cancel = controller.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        let turn_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut overlay = OverlayStore::new();
        let result = controller
            .run_turn(&turn_id, prompt, &mut overlay, print_event)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let state = match result {
            Ok(state) => state,
            Err(aborted) => {
                if archive {
                    let record = TurnRecord::new(&aborted.state, &overlay, duration_ms);
                    write_turn_record(root, &record)?;
                }
                return Err(aborted.into());
            }
        };

        if archive {
            let record = TurnRecord::new(&state, &overlay, duration_ms);
            let path = write_turn_record(root, &record)?;
            info!(path = %path.display(), "archived turn");
        }

        let committable = match state.status {
            TurnStatus::Clean => commit || force_commit,
            TurnStatus::Failed => force_commit,
            _ => false,
        };
        if committable {
            let summary = commit_overlay(root, &overlay)?;
            eprintln!(
                "committed {} written, {} removed",
                summary.written.len(),
                summary.removed.len()
            );
        } else if state.status == TurnStatus::Cancelled {
            overlay.discard();
        }
        if !overlay.dependencies().is_empty() {
            let packages: Vec<&str> = overlay.dependencies().iter().map(String::as_str).collect();
            eprintln!("dependencies to install: {}", packages.join(" "));
        }

        Ok::<_, anyhow::Error>(match state.status {
            TurnStatus::Clean => exit_codes::OK,
            TurnStatus::Cancelled => exit_codes::CANCELLED,
            _ => exit_codes::TURN_FAILED,
        })
    })
}

fn print_event(event: TurnEvent) {
    match event {
        TurnEvent::Chunk { text, .. } => {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
        TurnEvent::Patch {
            directives, issues, ..
        } => {
            for spanned in directives {
                eprintln!("[patch] {}", spanned.directive.label());
            }
            for issue in issues {
                eprintln!("[skipped] {}", issue.message);
            }
        }
        TurnEvent::Diagnostics {
            attempt, problems, ..
        } => {
            eprintln!("[check {attempt}] {} problem(s)", problems.len());
            for problem in problems {
                eprintln!("  {}", problem.headline());
            }
        }
        TurnEvent::Done {
            status, failure, ..
        } => match failure {
            Some(failure) => eprintln!("[done] {status}: {failure}"),
            None => eprintln!("[done] {status}"),
        },
    }
}

fn read_transcript(file: &Path) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("read transcript {}", file.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["editloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_turn_flags() {
        let cli = Cli::parse_from([
            "editloop",
            "turn",
            "--prompt",
            "add a page",
            "--force-commit",
            "--no-archive",
        ]);
        match cli.command {
            Command::Turn {
                prompt,
                commit,
                force_commit,
                no_archive,
            } => {
                assert_eq!(prompt, "add a page");
                assert!(!commit && force_commit && no_archive);
            }
            _ => panic!("expected turn"),
        }
    }

    #[test]
    fn parse_apply_defaults_chunk_size() {
        let cli = Cli::parse_from(["editloop", "apply", "out.txt"]);
        assert!(matches!(
            cli.command,
            Command::Apply {
                commit: false,
                chunk_bytes: DEFAULT_CHUNK_BYTES,
                ..
            }
        ));
    }
}
