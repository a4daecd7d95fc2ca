//! Diagnostics loop controller: one turn of generate, apply, check and repair.
//!
//! The loop is explicit and bounded. Each pass streams one generation into the
//! overlay, then runs the typechecker once (plus at most one retry if the
//! collaborator itself fails). A turn therefore checks at most
//! `max_attempts + 1` times before it is `clean` or `failed`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::applier::apply_batch;
use crate::core::overlay::{BaseTree, OverlayStore};
use crate::core::parser::{ParseBatch, TagParser};
use crate::core::problem::{Problem, attach_snippets, render_digest, sort_problems};
use crate::core::session::{SessionState, TurnEvent, TurnFailure, TurnStatus};
use crate::io::config::EditloopConfig;
use crate::io::generator::Generator;
use crate::io::prompt::{PromptBuilder, RepairInputs};
use crate::io::typecheck::{TypecheckRequest, Typechecker};

/// Typecheck collaborator calls allowed per checking phase.
///
/// The retry absorbs a crashed or timed-out collaborator. It does not count
/// against the repair budget, so the `max_attempts + 1` bound is on completed
/// checks; a turn may call the collaborator up to
/// `TYPECHECK_CALLS_PER_CHECK * (max_attempts + 1)` times.
const TYPECHECK_CALLS_PER_CHECK: u32 = 2;

/// An internal failure that stopped a turn before it reached a terminal status.
#[derive(Debug, Error)]
#[error("turn {} aborted: {error:#}", .state.turn_id)]
pub struct TurnAborted {
    /// State reached before the failure, applied-directive log included.
    pub state: SessionState,
    pub error: anyhow::Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub max_attempts: u32,
    pub prompt_budget_bytes: usize,
    pub digest_problem_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from(&EditloopConfig::default())
    }
}

impl From<&EditloopConfig> for ControllerConfig {
    fn from(cfg: &EditloopConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            prompt_budget_bytes: cfg.prompt_budget_bytes,
            digest_problem_limit: cfg.digest_problem_limit,
        }
    }
}

enum StreamEnd {
    Finished,
    Cancelled,
    GeneratorFailed(String),
}

enum CheckEnd {
    Problems(Vec<Problem>),
    Cancelled,
    Unavailable(String),
}

/// Drives one turn against a single overlay.
///
/// The controller never commits. On return the overlay holds every fully
/// applied directive and nothing else; committing or discarding it is the
/// caller's decision based on the final status.
pub struct DiagnosticsLoopController<G, T, B> {
    generator: G,
    typechecker: T,
    base: B,
    root: PathBuf,
    config: ControllerConfig,
    cancel: CancellationToken,
}

impl<G, T, B> DiagnosticsLoopController<G, T, B>
where
    G: Generator,
    T: Typechecker,
    B: BaseTree + Sync,
{
    pub fn new(
        generator: G,
        typechecker: T,
        base: B,
        root: impl Into<PathBuf>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            generator,
            typechecker,
            base,
            root: root.into(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned token so the caller can cancel the turn.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run a full turn for `request`, emitting events in order.
    ///
    /// The returned state is always terminal. `Err` is reserved for internal
    /// failures such as an unrenderable prompt; it still carries the state
    /// reached so far, including the applied-directive log.
    #[instrument(skip_all, fields(turn_id = %turn_id, max_attempts = self.config.max_attempts))]
    pub async fn run_turn<F>(
        &self,
        turn_id: &str,
        request: &str,
        overlay: &mut OverlayStore,
        mut on_event: F,
    ) -> Result<SessionState, TurnAborted>
    where
        F: FnMut(TurnEvent) + Send,
    {
        let mut state = SessionState::new(turn_id);
        match self.drive(request, overlay, &mut state, &mut on_event).await {
            Ok(()) => Ok(state),
            Err(error) => Err(TurnAborted { state, error }),
        }
    }

    async fn drive<F>(
        &self,
        request: &str,
        overlay: &mut OverlayStore,
        state: &mut SessionState,
        on_event: &mut F,
    ) -> Result<()>
    where
        F: FnMut(TurnEvent) + Send,
    {
        let builder = PromptBuilder::new(self.config.prompt_budget_bytes);
        let mut prompt = builder.build_turn(request)?;
        let mut stream_index = 0u32;

        loop {
            info!(attempt = state.attempt, stream_index, "streaming");
            match self
                .stream_once(&prompt, stream_index, overlay, state, on_event)
                .await
            {
                StreamEnd::Finished => {}
                StreamEnd::Cancelled => return finish_cancelled(state, on_event),
                StreamEnd::GeneratorFailed(message) => {
                    warn!(%message, "generator failed");
                    state.fail(TurnFailure::GeneratorUnavailable { message })?;
                    finish(state, on_event);
                    return Ok(());
                }
            }

            state.transition(TurnStatus::Checking)?;
            if self.cancel.is_cancelled() {
                return finish_cancelled(state, on_event);
            }
            info!(attempt = state.attempt, "checking");
            let problems = match self.check(overlay, state).await {
                CheckEnd::Problems(problems) => problems,
                CheckEnd::Cancelled => return finish_cancelled(state, on_event),
                CheckEnd::Unavailable(message) => {
                    state.fail(TurnFailure::TypecheckCollaboratorUnavailable { message })?;
                    finish(state, on_event);
                    return Ok(());
                }
            };

            state.record_check(problems.clone());
            on_event(TurnEvent::Diagnostics {
                turn_id: state.turn_id.clone(),
                attempt: state.attempt,
                problems: problems.clone(),
            });

            if problems.is_empty() {
                info!(attempt = state.attempt, "clean");
                state.transition(TurnStatus::Clean)?;
                finish(state, on_event);
                return Ok(());
            }
            if state.attempt >= self.config.max_attempts {
                warn!(
                    attempt = state.attempt,
                    problems = problems.len(),
                    "repair budget exhausted"
                );
                state.fail(TurnFailure::RepairBudgetExhausted {
                    attempts: state.attempt,
                })?;
                finish(state, on_event);
                return Ok(());
            }

            state.begin_repair()?;
            info!(attempt = state.attempt, problems = problems.len(), "repairing");
            let digest = render_digest(&problems, self.config.digest_problem_limit);
            prompt = builder.build_repair(&RepairInputs {
                digest: &digest,
                attempt: state.attempt,
                max_attempts: self.config.max_attempts,
                request,
                overlay,
            })?;
            if self.cancel.is_cancelled() {
                return finish_cancelled(state, on_event);
            }
            state.transition(TurnStatus::Streaming)?;
            stream_index += 1;
        }
    }

    async fn stream_once<F>(
        &self,
        prompt: &str,
        stream_index: u32,
        overlay: &mut OverlayStore,
        state: &mut SessionState,
        on_event: &mut F,
    ) -> StreamEnd
    where
        F: FnMut(TurnEvent) + Send,
    {
        let started = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
            started = self.generator.generate(prompt) => started,
        };
        let mut stream = match started {
            Ok(stream) => stream,
            Err(err) => return StreamEnd::GeneratorFailed(format!("{err:#}")),
        };

        let mut parser = TagParser::new(stream_index);
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break StreamEnd::Cancelled,
                next = stream.next() => next,
            };
            match next {
                None => break StreamEnd::Finished,
                Some(Err(err)) => break StreamEnd::GeneratorFailed(format!("{err:#}")),
                Some(Ok(chunk)) => {
                    on_event(TurnEvent::Chunk {
                        turn_id: state.turn_id.clone(),
                        text: chunk.clone(),
                    });
                    let batch = parser.push(&chunk);
                    self.apply(batch, overlay, state, on_event);
                }
            }
        };

        let warnings = parser.finish();
        if !warnings.is_empty() {
            debug!(count = warnings.len(), "malformed directives at end of stream");
            state.issues.extend(warnings);
        }
        end
    }

    fn apply<F>(
        &self,
        batch: ParseBatch,
        overlay: &mut OverlayStore,
        state: &mut SessionState,
        on_event: &mut F,
    ) where
        F: FnMut(TurnEvent),
    {
        if batch.is_empty() {
            return;
        }
        let mut report = apply_batch(overlay, &self.base, &batch.directives);
        let mut issues = batch.rejected;
        issues.append(&mut report.issues);
        report.issues = issues;
        state.record_batch(&report);
        if !report.applied.is_empty() || !report.issues.is_empty() {
            on_event(TurnEvent::Patch {
                turn_id: state.turn_id.clone(),
                directives: report.applied,
                issues: report.issues,
            });
        }
    }

    async fn check(&self, overlay: &OverlayStore, state: &mut SessionState) -> CheckEnd {
        let request = TypecheckRequest::from_overlay(&self.root, overlay);
        let mut last_error = String::new();
        for call in 1..=TYPECHECK_CALLS_PER_CHECK {
            state.typecheck_calls += 1;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return CheckEnd::Cancelled,
                result = self.typechecker.check(&request) => result,
            };
            match result {
                Ok(mut problems) => {
                    sort_problems(&mut problems);
                    attach_snippets(&mut problems, |path| overlay.read_file(&self.base, path));
                    return CheckEnd::Problems(problems);
                }
                Err(err) => {
                    warn!(call, %err, "typecheck collaborator failed");
                    last_error = err.to_string();
                }
            }
        }
        CheckEnd::Unavailable(last_error)
    }
}

fn finish<F>(state: &SessionState, on_event: &mut F)
where
    F: FnMut(TurnEvent),
{
    on_event(TurnEvent::Done {
        turn_id: state.turn_id.clone(),
        status: state.status,
        failure: state.failure.clone(),
    });
}

fn finish_cancelled<F>(state: &mut SessionState, on_event: &mut F) -> Result<()>
where
    F: FnMut(TurnEvent),
{
    info!(status = %state.status, "turn cancelled");
    state.transition(TurnStatus::Cancelled)?;
    finish(state, on_event);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_turn_carries_partial_state() {
        let aborted = TurnAborted {
            state: SessionState::new("t9"),
            error: anyhow::anyhow!("render repair prompt"),
        };
        assert_eq!(aborted.to_string(), "turn t9 aborted: render repair prompt");
        assert_eq!(aborted.state.status, TurnStatus::Streaming);
        let wrapped: anyhow::Error = aborted.into();
        assert!(wrapped.to_string().contains("t9"));
    }
}
