//! Background turn tasks for sessions.

use std::time::Instant;

use tracing::{error, info, warn};

use editloop::controller::{ControllerConfig, DiagnosticsLoopController};
use editloop::core::session::{SessionState, TurnEvent, TurnStatus};
use editloop::io::base_tree::FsBaseTree;
use editloop::io::generator::{CommandGenerator, Generator};
use editloop::io::turn_log::{TurnRecord, write_turn_record};
use editloop::io::typecheck::{CommandTypechecker, Typechecker};
use editloop::registry::TurnLease;

use crate::state::AppState;

/// Spawn a turn with the configured command collaborators.
pub fn spawn_turn(state: AppState, lease: TurnLease, prompt: String) {
    let controller = DiagnosticsLoopController::new(
        CommandGenerator::new(&state.config.generator).with_cwd(&state.project_dir),
        CommandTypechecker::new(&state.config.typecheck),
        FsBaseTree::new(&state.project_dir),
        &state.project_dir,
        ControllerConfig::from(state.config.as_ref()),
    );
    tokio::spawn(drive_turn(state, controller, lease, prompt));
}

/// Run one leased turn to completion and hand the overlay back.
pub async fn drive_turn<G, T>(
    state: AppState,
    controller: DiagnosticsLoopController<G, T, FsBaseTree>,
    lease: TurnLease,
    prompt: String,
) where
    G: Generator,
    T: Typechecker,
{
    let TurnLease {
        session_id,
        turn_id,
        cancel,
        mut overlay,
    } = lease;
    let controller = controller.with_cancellation(cancel);
    let started = Instant::now();

    let result = controller
        .run_turn(&turn_id, &prompt, &mut overlay, |event| {
            state.publish(&session_id, event, controller.base());
        })
        .await;

    let (outcome, aborted) = match result {
        Ok(outcome) => (outcome, false),
        Err(aborted) => {
            error!(
                %session_id,
                %turn_id,
                applied = aborted.state.applied_directives.len(),
                error = %format!("{:#}", aborted.error),
                "turn aborted"
            );
            (abandoned(&state, &session_id, aborted.state, controller.base()), true)
        }
    };

    // Aborted turns are archived too.
    if outcome.status != TurnStatus::Cancelled || aborted {
        let duration_ms = started.elapsed().as_millis() as u64;
        let record = TurnRecord::new(&outcome, &overlay, duration_ms);
        if let Err(err) = write_turn_record(&state.project_dir, &record) {
            warn!(%session_id, error = %format!("{err:#}"), "failed to archive turn");
        }
    }
    info!(%session_id, %turn_id, status = %outcome.status, "turn finished");
    state.registry().finish_turn(&session_id, overlay, outcome);
}

/// Close out a turn that hit an internal error as cancelled, keeping the
/// state it reached.
fn abandoned(
    state: &AppState,
    session_id: &str,
    mut outcome: SessionState,
    base: &FsBaseTree,
) -> SessionState {
    outcome.status = TurnStatus::Cancelled;
    state.publish(
        session_id,
        TurnEvent::Done {
            turn_id: outcome.turn_id.clone(),
            status: TurnStatus::Cancelled,
            failure: None,
        },
        base,
    );
    outcome
}

#[cfg(test)]
mod tests {
    use editloop::core::directive::{Directive, SourceSpan, SpannedDirective};
    use editloop::core::path::normalize;
    use editloop::io::config::EditloopConfig;

    use super::*;

    #[test]
    fn abandoned_turn_keeps_partial_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = AppState::new(temp.path().to_path_buf(), EditloopConfig::default());
        let mut events = state.event_tx.subscribe();

        let mut partial = SessionState::new("t1");
        partial.applied_directives.push(SpannedDirective {
            directive: Directive::Delete {
                path: normalize("src/a.ts").unwrap(),
            },
            span: SourceSpan {
                stream: 0,
                start: 0,
                end: 30,
            },
        });

        let outcome = abandoned(&state, "s1", partial, &FsBaseTree::new(temp.path()));
        assert_eq!(outcome.status, TurnStatus::Cancelled);
        assert_eq!(outcome.turn_id, "t1");
        assert_eq!(outcome.applied_directives.len(), 1);

        let done = events.try_recv().expect("done event");
        assert_eq!(done.session_id, "s1");
        assert_eq!(done.event.name(), "done");
    }
}
