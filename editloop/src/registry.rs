//! Explicit map from session id to the overlay and turn state it owns.
//!
//! Entries are created when a turn starts and removed on commit or cancel.
//! While a turn runs, its task owns the overlay; the entry keeps a preview
//! rebuilt by replaying the turn's patch events, so readers never block the
//! turn.

use std::collections::HashMap;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::applier::apply_batch;
use crate::core::overlay::{BaseTree, OverlaySnapshot, OverlayStore};
use crate::core::session::{SessionState, TurnEvent, TurnStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session {session_id} already has an active turn")]
    TurnActive { session_id: String },
    #[error("unknown session {session_id}")]
    UnknownSession { session_id: String },
    #[error("session {session_id} has a turn in progress")]
    TurnRunning { session_id: String },
    #[error("session {session_id} ended {status}; pass force to commit anyway")]
    NotCommittable {
        session_id: String,
        status: TurnStatus,
    },
}

/// What a turn task takes out of the registry while it runs.
#[derive(Debug)]
pub struct TurnLease {
    pub session_id: String,
    pub turn_id: String,
    pub cancel: CancellationToken,
    pub overlay: OverlayStore,
}

#[derive(Debug)]
pub struct SessionEntry {
    turn_id: String,
    cancel: CancellationToken,
    /// Present once the running turn hands its overlay back.
    overlay: Option<OverlayStore>,
    preview: OverlayStore,
    outcome: Option<SessionState>,
}

impl SessionEntry {
    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn is_running(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn outcome(&self) -> Option<&SessionState> {
        self.outcome.as_ref()
    }

    /// Current view of the session's pending mutations.
    pub fn snapshot(&self) -> OverlaySnapshot {
        self.overlay.as_ref().unwrap_or(&self.preview).snapshot()
    }
}

/// Owned, explicitly managed sessions. Never a process-wide singleton.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionEntry> {
        self.sessions.get(session_id)
    }

    /// Start a turn. A finished, uncommitted overlay carries into the new turn.
    pub fn begin_turn(
        &mut self,
        session_id: &str,
        turn_id: &str,
    ) -> Result<TurnLease, RegistryError> {
        let overlay = match self.sessions.get_mut(session_id) {
            Some(entry) if entry.is_running() => {
                return Err(RegistryError::TurnActive {
                    session_id: session_id.to_string(),
                });
            }
            Some(entry) => entry.overlay.take().unwrap_or_default(),
            None => OverlayStore::new(),
        };
        let cancel = CancellationToken::new();
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                turn_id: turn_id.to_string(),
                cancel: cancel.clone(),
                overlay: None,
                preview: overlay.clone(),
                outcome: None,
            },
        );
        info!(session_id, turn_id, "turn started");
        Ok(TurnLease {
            session_id: session_id.to_string(),
            turn_id: turn_id.to_string(),
            cancel,
            overlay,
        })
    }

    /// Replay a patch event into the session preview.
    pub fn observe<B: BaseTree + ?Sized>(&mut self, session_id: &str, event: &TurnEvent, base: &B) {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            return;
        };
        if event.turn_id() != entry.turn_id {
            return;
        }
        if let TurnEvent::Patch { directives, .. } = event {
            let report = apply_batch(&mut entry.preview, base, directives);
            debug!(session_id, applied = report.applied.len(), "preview updated");
        }
    }

    /// Hand a finished turn's overlay back. Cancelled turns are discarded.
    pub fn finish_turn(&mut self, lease_session: &str, overlay: OverlayStore, state: SessionState) {
        let Some(entry) = self.sessions.get_mut(lease_session) else {
            debug!(session_id = lease_session, "finished turn for removed session");
            return;
        };
        if entry.turn_id != state.turn_id {
            return;
        }
        if state.status == TurnStatus::Cancelled {
            info!(session_id = lease_session, "cancelled turn discarded");
            self.sessions.remove(lease_session);
            return;
        }
        entry.preview = OverlayStore::new();
        entry.overlay = Some(overlay);
        entry.outcome = Some(state);
    }

    /// Cancel the active turn, or discard a finished one.
    pub fn cancel(&mut self, session_id: &str) -> Result<(), RegistryError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| RegistryError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        entry.cancel.cancel();
        if !entry.is_running() {
            self.sessions.remove(session_id);
            info!(session_id, "finished session discarded");
        }
        Ok(())
    }

    /// Borrow a finished session's overlay for commit.
    ///
    /// Only `clean` outcomes are committable unless `force` is set. The entry
    /// stays in place until [`SessionRegistry::remove_committed`], so a failed
    /// commit can be retried or inspected.
    pub fn committable(
        &self,
        session_id: &str,
        force: bool,
    ) -> Result<(&OverlayStore, &SessionState), RegistryError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| RegistryError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        let (Some(overlay), Some(state)) = (entry.overlay.as_ref(), entry.outcome.as_ref()) else {
            return Err(RegistryError::TurnRunning {
                session_id: session_id.to_string(),
            });
        };
        if state.status != TurnStatus::Clean && !force {
            return Err(RegistryError::NotCommittable {
                session_id: session_id.to_string(),
                status: state.status,
            });
        }
        Ok((overlay, state))
    }

    /// Drop a session whose overlay has been written to disk.
    pub fn remove_committed(&mut self, session_id: &str) -> Option<SessionState> {
        let entry = self.sessions.remove(session_id)?;
        info!(session_id, "session committed");
        entry.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::directive::{Directive, SourceSpan, SpannedDirective};
    use crate::core::overlay::MemoryTree;
    use crate::core::path::normalize;

    fn finished(turn_id: &str, status: TurnStatus) -> SessionState {
        let mut state = SessionState::new(turn_id);
        state.status = status;
        state
    }

    #[test]
    fn second_turn_while_running_is_rejected() {
        let mut registry = SessionRegistry::new();
        registry.begin_turn("s1", "t1").expect("begin");
        let err = registry.begin_turn("s1", "t2").unwrap_err();
        assert!(matches!(err, RegistryError::TurnActive { .. }));
        registry.begin_turn("s2", "t3").expect("other session");
        assert_eq!(registry.session_ids(), vec!["s1", "s2"]);
    }

    #[test]
    fn preview_replays_patch_events() {
        let mut registry = SessionRegistry::new();
        let base = MemoryTree::new().with_file(normalize("a.ts").unwrap(), "a");
        registry.begin_turn("s1", "t1").expect("begin");
        let event = TurnEvent::Patch {
            turn_id: "t1".to_string(),
            directives: vec![SpannedDirective {
                directive: Directive::Rename {
                    from: normalize("a.ts").unwrap(),
                    to: normalize("b.ts").unwrap(),
                },
                span: SourceSpan {
                    stream: 0,
                    start: 0,
                    end: 10,
                },
            }],
            issues: Vec::new(),
        };
        registry.observe("s1", &event, &base);
        let snapshot = registry.get("s1").expect("entry").snapshot();
        assert_eq!(snapshot.files.get(&normalize("b.ts").unwrap()).map(String::as_str), Some("a"));
        assert!(snapshot.deleted.contains(&normalize("a.ts").unwrap()));
    }

    #[test]
    fn cancelled_turn_is_removed() {
        let mut registry = SessionRegistry::new();
        let lease = registry.begin_turn("s1", "t1").expect("begin");
        registry.cancel("s1").expect("cancel");
        assert!(lease.cancel.is_cancelled());
        registry.finish_turn("s1", lease.overlay, finished("t1", TurnStatus::Cancelled));
        assert!(registry.is_empty());
    }

    #[test]
    fn commit_requires_clean_or_force() {
        let mut registry = SessionRegistry::new();
        let lease = registry.begin_turn("s1", "t1").expect("begin");
        assert!(matches!(
            registry.committable("s1", false),
            Err(RegistryError::TurnRunning { .. })
        ));
        registry.finish_turn("s1", lease.overlay, finished("t1", TurnStatus::Failed));
        assert!(matches!(
            registry.committable("s1", false),
            Err(RegistryError::NotCommittable { .. })
        ));
        let (_, state) = registry.committable("s1", true).expect("forced");
        assert_eq!(state.status, TurnStatus::Failed);
        // Still present until the commit is confirmed.
        assert_eq!(registry.len(), 1);

        let removed = registry.remove_committed("s1").expect("removed");
        assert_eq!(removed.status, TurnStatus::Failed);
        assert!(registry.is_empty());
    }

    #[test]
    fn finished_overlay_carries_into_next_turn() {
        let mut registry = SessionRegistry::new();
        let mut lease = registry.begin_turn("s1", "t1").expect("begin");
        lease
            .overlay
            .writes
            .insert(normalize("x.ts").unwrap(), "x".to_string());
        registry.finish_turn("s1", lease.overlay, finished("t1", TurnStatus::Failed));

        let next = registry.begin_turn("s1", "t2").expect("next turn");
        assert!(next.overlay.writes().contains_key(&normalize("x.ts").unwrap()));
        assert!(registry.get("s1").expect("entry").is_running());
    }
}
