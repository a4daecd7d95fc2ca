//! Turn archives under `.editloop/turns/`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::init::EditloopPaths;
use crate::core::directive::{DirectiveIssue, SpannedDirective};
use crate::core::overlay::OverlayStore;
use crate::core::session::{CheckRound, SessionState, TurnFailure, TurnStatus};

/// Everything needed to reconstruct what a turn changed, even on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: String,
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TurnFailure>,
    pub attempt: u32,
    pub checks: usize,
    pub typecheck_calls: u32,
    pub applied_directives: Vec<SpannedDirective>,
    pub issues: Vec<DirectiveIssue>,
    pub rounds: Vec<CheckRound>,
    pub virtual_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub dependencies: BTreeSet<String>,
    pub duration_ms: u64,
}

impl TurnRecord {
    pub fn new(state: &SessionState, overlay: &OverlayStore, duration_ms: u64) -> Self {
        Self {
            turn_id: state.turn_id.clone(),
            status: state.status,
            failure: state.failure.clone(),
            attempt: state.attempt,
            checks: state.checks_completed(),
            typecheck_calls: state.typecheck_calls,
            applied_directives: state.applied_directives.clone(),
            issues: state.issues.clone(),
            rounds: state.rounds.clone(),
            virtual_files: overlay.writes().keys().map(ToString::to_string).collect(),
            deleted_files: overlay.deletes().iter().map(ToString::to_string).collect(),
            dependencies: overlay.dependencies().clone(),
            duration_ms,
        }
    }
}

/// Write the record as pretty JSON to `.editloop/turns/<turn_id>.json`.
pub fn write_turn_record(root: &Path, record: &TurnRecord) -> Result<PathBuf> {
    let paths = EditloopPaths::new(root);
    fs::create_dir_all(&paths.turns_dir)
        .with_context(|| format!("create turns dir {}", paths.turns_dir.display()))?;
    let path = paths.turn_record_path(&record.turn_id);
    let mut buf = serde_json::to_string_pretty(record).context("serialize turn record")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

pub fn read_turn_record(path: &Path) -> Result<TurnRecord> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
