//! Typecheck collaborator: compiler problems for the materialized tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::config::TypecheckConfig;
use super::process::run_command_with_timeout;
use super::staging::{StageRequest, stage_tree};
use crate::core::error::TypecheckError;
use crate::core::overlay::OverlayStore;
use crate::core::path::{ProjectPath, normalize};
use crate::core::problem::{Problem, attach_snippets, sort_problems};

/// Everything the typechecker needs to see the overlay on top of the project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypecheckRequest {
    pub root: PathBuf,
    pub writes: BTreeMap<ProjectPath, String>,
    pub deletes: BTreeSet<ProjectPath>,
    pub renames: BTreeMap<ProjectPath, ProjectPath>,
}

impl TypecheckRequest {
    pub fn from_overlay(root: &Path, overlay: &OverlayStore) -> Self {
        Self {
            root: root.to_path_buf(),
            writes: overlay.virtual_files(),
            deletes: overlay.deleted_files(),
            renames: overlay.renames().clone(),
        }
    }
}

#[async_trait]
pub trait Typechecker: Send + Sync {
    /// Problems for the request, sorted by `(file, line, column)`.
    ///
    /// `Err` means the collaborator itself failed, never that the code has errors.
    async fn check(&self, request: &TypecheckRequest) -> Result<Vec<Problem>, TypecheckError>;
}

/// Stages the tree in a temp dir and runs a `tsc`-style command inside it.
#[derive(Debug, Clone)]
pub struct CommandTypechecker {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    skip_dirs: Vec<String>,
}

impl CommandTypechecker {
    pub fn new(config: &TypecheckConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: config.timeout(),
            output_limit_bytes: config.output_limit_bytes,
            skip_dirs: config.skip_dirs.clone(),
        }
    }
}

#[async_trait]
impl Typechecker for CommandTypechecker {
    #[instrument(skip_all, fields(root = %request.root.display(), writes = request.writes.len()))]
    async fn check(&self, request: &TypecheckRequest) -> Result<Vec<Problem>, TypecheckError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| TypecheckError::Unavailable("typecheck command is empty".to_string()))?;

        let owned = request.clone();
        let skip_dirs = self.skip_dirs.clone();
        let staged = tokio::task::spawn_blocking(move || {
            stage_tree(&StageRequest {
                root: &owned.root,
                writes: &owned.writes,
                deletes: &owned.deletes,
                skip_dirs: &skip_dirs,
            })
        })
        .await
        .map_err(|err| TypecheckError::Unavailable(format!("staging task failed: {err}")))?
        .map_err(|err| TypecheckError::Unavailable(format!("{err:#}")))?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(staged.path());
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .await
            .map_err(|err| TypecheckError::Unavailable(format!("{err:#}")))?;
        if output.timed_out {
            return Err(TypecheckError::Unavailable(format!(
                "typecheck timed out after {}s",
                self.timeout.as_secs()
            )));
        }

        let text = output.combined_text();
        let mut problems = parse_tsc_output(&text, staged.path());
        if !output.status.success() && problems.is_empty() {
            let tail: String = text.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            return Err(TypecheckError::Unavailable(format!(
                "typecheck exited with {} and no parseable diagnostics: {tail}",
                output.status
            )));
        }
        attach_snippets(&mut problems, |path| {
            fs::read_to_string(staged.resolve(path)).ok()
        });
        info!(problems = problems.len(), "typecheck finished");
        Ok(problems)
    }
}

static TSC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s(][^(]*)\((?P<line>\d+),(?P<col>\d+)\): error TS(?P<code>\d+): (?P<msg>.*)$")
        .unwrap()
});

/// Parse `file(line,col): error TSnnnn: message` lines.
///
/// Indented continuation lines extend the previous message. Absolute paths
/// under `staged_root` are made project-relative; anything outside the project
/// is dropped.
pub fn parse_tsc_output(text: &str, staged_root: &Path) -> Vec<Problem> {
    let mut problems: Vec<Problem> = Vec::new();
    let mut continuing = false;
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(caps) = TSC_LINE.captures(line) {
            continuing = false;
            let raw = caps["file"].trim();
            let Some(file) = project_relative(raw, staged_root) else {
                debug!(file = raw, "dropping diagnostic outside project");
                continue;
            };
            let (Ok(line_no), Ok(column), Ok(code)) = (
                caps["line"].parse::<u32>(),
                caps["col"].parse::<u32>(),
                caps["code"].parse::<u32>(),
            ) else {
                warn!(line, "unparseable diagnostic numbers");
                continue;
            };
            problems.push(Problem {
                file,
                line: line_no,
                column,
                message: caps["msg"].trim().to_string(),
                code,
                snippet: None,
            });
            continuing = true;
        } else if continuing && line.starts_with(char::is_whitespace) && !line.trim().is_empty() {
            if let Some(last) = problems.last_mut() {
                last.message.push(' ');
                last.message.push_str(line.trim());
            }
        } else {
            continuing = false;
        }
    }
    sort_problems(&mut problems);
    problems
}

fn project_relative(raw: &str, staged_root: &Path) -> Option<ProjectPath> {
    let path = Path::new(raw);
    let relative = if path.is_absolute() {
        path.strip_prefix(staged_root).ok()?.to_str()?
    } else {
        raw
    };
    normalize(relative).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tsc_lines_and_continuations() {
        let output = "\
app/page.tsx(3,7): error TS2322: Type 'string' is not assignable to type 'number'.
src/a.ts(10,1): error TS2304: Cannot find name 'foo'.
  The name was declared later.
Found 2 errors in 2 files.
";
        let problems = parse_tsc_output(output, Path::new("/tmp/stage"));
        assert_eq!(problems.len(), 2);
        assert_eq!(problems[0].file.as_str(), "app/page.tsx");
        assert_eq!((problems[0].line, problems[0].column, problems[0].code), (3, 7, 2322));
        assert_eq!(
            problems[1].message,
            "Cannot find name 'foo'. The name was declared later."
        );
    }

    #[test]
    fn strips_staging_prefix_and_drops_outside_paths() {
        let output = "\
/tmp/stage/src/b.ts(1,2): error TS1005: ';' expected.
/usr/lib/node/lib.d.ts(4,4): error TS2300: Duplicate identifier.
../outside.ts(1,1): error TS1000: nope
";
        let problems = parse_tsc_output(output, Path::new("/tmp/stage"));
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].file.as_str(), "src/b.ts");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_typechecker_reports_problems_with_snippets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = TypecheckConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo \"a.ts(2,1): error TS2304: Cannot find name 'x'.\"; exit 2".to_string(),
            ],
            timeout_secs: 5,
            ..TypecheckConfig::default()
        };
        let mut overlay = OverlayStore::new();
        overlay
            .writes
            .insert(normalize("a.ts").unwrap(), "ok\nx;\n".to_string());
        let request = TypecheckRequest::from_overlay(temp.path(), &overlay);

        let problems = CommandTypechecker::new(&config)
            .check(&request)
            .await
            .expect("check");
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].snippet.as_deref(), Some("x;"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_without_diagnostics_is_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = TypecheckConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
            timeout_secs: 5,
            ..TypecheckConfig::default()
        };
        let request = TypecheckRequest::from_overlay(temp.path(), &OverlayStore::new());
        let err = CommandTypechecker::new(&config)
            .check(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, TypecheckError::Unavailable(_)));
    }
}
