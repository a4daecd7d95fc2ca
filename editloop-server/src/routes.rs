//! HTTP route handlers for the session API.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use editloop::core::overlay::OverlaySnapshot;
use editloop::core::session::{TurnFailure, TurnStatus};
use editloop::io::commit::{CommitSummary, commit_overlay};
use editloop::registry::RegistryError;

use crate::sse;
use crate::state::AppState;
use crate::turns::spawn_turn;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_id}/turns", post(start_turn))
        .route("/sessions/{session_id}/events", get(sse::events_handler))
        .route("/sessions/{session_id}/files", get(get_files))
        .route("/sessions/{session_id}/cancel", post(cancel_session))
        .route("/sessions/{session_id}/commit", post(commit_session))
}

/// Registry failures mapped onto HTTP statuses.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match err {
            RegistryError::UnknownSession { .. } => StatusCode::NOT_FOUND,
            RegistryError::TurnActive { .. }
            | RegistryError::TurnRunning { .. }
            | RegistryError::NotCommittable { .. } => StatusCode::CONFLICT,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<String>,
}

/// GET /api/sessions - ids of every live session.
async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.registry().session_ids(),
    })
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct TurnStarted {
    pub session_id: String,
    pub turn_id: String,
}

/// POST /api/sessions/:id/turns - start a turn; 409 while one is running.
pub async fn start_turn(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<TurnRequest>,
) -> Result<(StatusCode, Json<TurnStarted>), ApiError> {
    let turn_id = uuid::Uuid::new_v4().to_string();
    let lease = state.registry().begin_turn(&session_id, &turn_id)?;
    spawn_turn(state.clone(), lease, body.prompt);
    Ok((
        StatusCode::ACCEPTED,
        Json(TurnStarted {
            session_id,
            turn_id,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct FilesResponse {
    pub turn_id: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TurnStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TurnFailure>,
    #[serde(flatten)]
    pub snapshot: OverlaySnapshot,
}

/// GET /api/sessions/:id/files - pending virtual and deleted files.
pub async fn get_files(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<FilesResponse>, ApiError> {
    let registry = state.registry();
    let entry = registry
        .get(&session_id)
        .ok_or(RegistryError::UnknownSession { session_id })?;
    let outcome = entry.outcome();
    Ok(Json(FilesResponse {
        turn_id: entry.turn_id().to_string(),
        running: entry.is_running(),
        status: outcome.map(|state| state.status),
        failure: outcome.and_then(|state| state.failure.clone()),
        snapshot: entry.snapshot(),
    }))
}

/// POST /api/sessions/:id/cancel - stop the turn and discard its overlay.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry().cancel(&session_id)?;
    info!(%session_id, "cancel requested");
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Default, Deserialize)]
pub struct CommitParams {
    #[serde(default)]
    pub force: bool,
}

/// POST /api/sessions/:id/commit[?force=true] - write a finished overlay to disk.
///
/// The session is removed only once the commit succeeds.
pub async fn commit_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<CommitParams>,
) -> Result<Json<CommitSummary>, ApiError> {
    let mut registry = state.registry();
    let (overlay, outcome) = registry.committable(&session_id, params.force)?;
    if outcome.status != TurnStatus::Clean {
        warn!(%session_id, status = %outcome.status, "forced commit");
    }
    let summary = commit_overlay(&state.project_dir, overlay).map_err(|err| {
        warn!(%session_id, error = %format!("{err:#}"), "commit failed; session kept");
        ApiError::internal(err)
    })?;
    registry.remove_committed(&session_id);
    info!(
        %session_id,
        written = summary.written.len(),
        removed = summary.removed.len(),
        "session committed"
    );
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use editloop::controller::{ControllerConfig, DiagnosticsLoopController};
    use editloop::core::path::normalize;
    use editloop::io::base_tree::FsBaseTree;
    use editloop::io::config::EditloopConfig;
    use editloop::test_support::{
        ScriptedGenerator, ScriptedReply, ScriptedTypechecker, problem, write_tag,
    };

    use super::*;
    use crate::turns::drive_turn;

    fn app(dir: &std::path::Path) -> AppState {
        AppState::new(dir.to_path_buf(), EditloopConfig::default())
    }

    async fn run_scripted(
        state: &AppState,
        session_id: &str,
        reply: ScriptedReply,
        typechecker: ScriptedTypechecker,
    ) {
        let lease = state
            .registry()
            .begin_turn(session_id, "turn-1")
            .expect("begin");
        let controller = DiagnosticsLoopController::new(
            ScriptedGenerator::new(vec![reply]),
            typechecker,
            FsBaseTree::new(&state.project_dir),
            &state.project_dir,
            ControllerConfig {
                max_attempts: 1,
                ..ControllerConfig::default()
            },
        );
        drive_turn(state.clone(), controller, lease, "go".to_string()).await;
    }

    #[tokio::test]
    async fn clean_turn_is_visible_then_committed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = app(temp.path());
        let mut events = state.event_tx.subscribe();
        run_scripted(
            &state,
            "s1",
            ScriptedReply::chunks([write_tag("src/a.ts", "export {};\n")]),
            ScriptedTypechecker::clean(),
        )
        .await;

        let Json(files) = get_files(State(state.clone()), Path("s1".to_string()))
            .await
            .expect("files");
        assert!(!files.running);
        assert_eq!(files.status, Some(TurnStatus::Clean));
        assert_eq!(files.snapshot.files.len(), 1);
        assert!(!temp.path().join("src/a.ts").exists());

        let Json(summary) = commit_session(
            State(state.clone()),
            Path("s1".to_string()),
            Query(CommitParams::default()),
        )
        .await
        .expect("commit");
        assert_eq!(summary.written.len(), 1);
        assert_eq!(
            fs::read_to_string(temp.path().join("src/a.ts")).expect("committed"),
            "export {};\n"
        );
        assert!(state.registry().is_empty());

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.session_id, "s1");
            names.push(event.event.name());
        }
        assert_eq!(names.last(), Some(&"done"));
        assert!(names.contains(&"patch"));
    }

    #[tokio::test]
    async fn failed_turn_needs_force_to_commit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = app(temp.path());
        run_scripted(
            &state,
            "s1",
            ScriptedReply::chunks([write_tag("src/a.ts", "bad\n")]),
            ScriptedTypechecker::always(vec![problem("src/a.ts", 1, 1, "nope")]),
        )
        .await;

        let err = commit_session(
            State(state.clone()),
            Path("s1".to_string()),
            Query(CommitParams { force: false }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        commit_session(
            State(state.clone()),
            Path("s1".to_string()),
            Query(CommitParams { force: true }),
        )
        .await
        .expect("forced commit");
        assert!(temp.path().join("src/a.ts").exists());
    }

    #[tokio::test]
    async fn failed_commit_keeps_session_and_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("src");
        fs::write(temp.path().join("src/old.ts"), "old\n").expect("old");
        fs::write(temp.path().join("lib"), "plain file\n").expect("lib");
        let state = app(temp.path());
        run_scripted(
            &state,
            "s1",
            ScriptedReply::chunks([format!(
                "<edit-delete path=\"src/old.ts\"/>\n{}",
                write_tag("lib/x.ts", "export {};\n")
            )]),
            ScriptedTypechecker::clean(),
        )
        .await;

        let err = commit_session(
            State(state.clone()),
            Path("s1".to_string()),
            Query(CommitParams::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            fs::read_to_string(temp.path().join("src/old.ts")).expect("still there"),
            "old\n"
        );
        assert_eq!(state.registry().session_ids(), vec!["s1"]);

        let Json(files) = get_files(State(state.clone()), Path("s1".to_string()))
            .await
            .expect("files");
        assert!(files.snapshot.deleted.contains(&normalize("src/old.ts").unwrap()));
    }

    #[tokio::test]
    async fn second_turn_conflicts_while_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = app(temp.path());
        let _lease = state.registry().begin_turn("s1", "t1").expect("begin");

        let err = start_turn(
            State(state.clone()),
            Path("s1".to_string()),
            Json(TurnRequest {
                prompt: "again".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = app(temp.path());
        let err = cancel_session(State(state.clone()), Path("ghost".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err = get_files(State(state), Path("ghost".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
