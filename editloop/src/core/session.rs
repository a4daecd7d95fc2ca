//! Per-turn state owned by the diagnostics loop controller.
//!
//! State machine:
//!
//! ```text
//! streaming -> checking -> clean
//!                       -> repairing -> streaming
//!                       -> failed
//! (any non-terminal) -> cancelled
//! streaming -> failed            (generator unavailable)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::applier::BatchReport;
use crate::core::directive::{DirectiveIssue, SpannedDirective};
use crate::core::error::InvalidTransition;
use crate::core::problem::Problem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Streaming,
    Checking,
    Repairing,
    Clean,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Streaming => "streaming",
            TurnStatus::Checking => "checking",
            TurnStatus::Repairing => "repairing",
            TurnStatus::Clean => "clean",
            TurnStatus::Failed => "failed",
            TurnStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnStatus::Clean | TurnStatus::Failed | TurnStatus::Cancelled
        )
    }

    fn can_transition_to(self, next: TurnStatus) -> bool {
        use TurnStatus as S;
        match (self, next) {
            (S::Streaming, S::Checking | S::Failed) => true,
            (S::Checking, S::Clean | S::Repairing | S::Failed) => true,
            (S::Repairing, S::Streaming) => true,
            (from, S::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a turn ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TurnFailure {
    /// Problems remained after the last permitted repair attempt.
    RepairBudgetExhausted { attempts: u32 },
    /// The typecheck collaborator failed twice in one checking phase.
    TypecheckCollaboratorUnavailable { message: String },
    /// The generating collaborator could not produce or finish a stream.
    GeneratorUnavailable { message: String },
}

impl fmt::Display for TurnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnFailure::RepairBudgetExhausted { attempts } => {
                write!(f, "repair budget exhausted after {attempts} attempts")
            }
            TurnFailure::TypecheckCollaboratorUnavailable { message } => {
                write!(f, "typecheck collaborator unavailable: {message}")
            }
            TurnFailure::GeneratorUnavailable { message } => {
                write!(f, "generator unavailable: {message}")
            }
        }
    }
}

/// Problems returned by one checking phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRound {
    pub attempt: u32,
    pub problems: Vec<Problem>,
}

/// Ephemeral record of one turn. Never shared across turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub turn_id: String,
    pub status: TurnStatus,
    /// Repair cycles started so far.
    pub attempt: u32,
    /// Every directive that changed the overlay, in application order.
    pub applied_directives: Vec<SpannedDirective>,
    /// Problems from the most recent checking phase.
    pub diagnostics: Vec<Problem>,
    /// Problems from every checking phase, oldest first.
    pub rounds: Vec<CheckRound>,
    /// Per-directive errors and end-of-stream malformed warnings.
    pub issues: Vec<DirectiveIssue>,
    /// Typecheck collaborator invocations, retries included.
    pub typecheck_calls: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TurnFailure>,
}

impl SessionState {
    pub fn new(turn_id: impl Into<String>) -> Self {
        Self {
            turn_id: turn_id.into(),
            status: TurnStatus::Streaming,
            attempt: 0,
            applied_directives: Vec::new(),
            diagnostics: Vec::new(),
            rounds: Vec::new(),
            issues: Vec::new(),
            typecheck_calls: 0,
            failure: None,
        }
    }

    pub fn transition(&mut self, next: TurnStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Enter `repairing`, counting exactly one repair attempt.
    pub fn begin_repair(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TurnStatus::Repairing)?;
        self.attempt += 1;
        Ok(())
    }

    pub fn record_batch(&mut self, report: &BatchReport) {
        self.applied_directives.extend(report.applied.iter().cloned());
        self.issues.extend(report.issues.iter().cloned());
    }

    pub fn record_check(&mut self, problems: Vec<Problem>) {
        self.rounds.push(CheckRound {
            attempt: self.attempt,
            problems: problems.clone(),
        });
        self.diagnostics = problems;
    }

    /// Number of checking phases that produced a problem list.
    pub fn checks_completed(&self) -> usize {
        self.rounds.len()
    }

    /// Enter `failed` with the given reason.
    pub fn fail(&mut self, failure: TurnFailure) -> Result<(), InvalidTransition> {
        self.transition(TurnStatus::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }
}

/// Ordered per-turn events for any session transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Raw generated text, in arrival order.
    Chunk { turn_id: String, text: String },
    /// A just-applied directive batch.
    Patch {
        turn_id: String,
        directives: Vec<SpannedDirective>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        issues: Vec<DirectiveIssue>,
    },
    /// Problems from one checking phase.
    Diagnostics {
        turn_id: String,
        attempt: u32,
        problems: Vec<Problem>,
    },
    /// Terminal event carrying the final status.
    Done {
        turn_id: String,
        status: TurnStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<TurnFailure>,
    },
}

impl TurnEvent {
    pub fn turn_id(&self) -> &str {
        match self {
            TurnEvent::Chunk { turn_id, .. }
            | TurnEvent::Patch { turn_id, .. }
            | TurnEvent::Diagnostics { turn_id, .. }
            | TurnEvent::Done { turn_id, .. } => turn_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::Chunk { .. } => "chunk",
            TurnEvent::Patch { .. } => "patch",
            TurnEvent::Diagnostics { .. } => "diagnostics",
            TurnEvent::Done { .. } => "done",
        }
    }
}
