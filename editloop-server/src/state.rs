//! Shared application state for the session server.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;

use editloop::core::overlay::BaseTree;
use editloop::core::session::TurnEvent;
use editloop::io::config::EditloopConfig;
use editloop::registry::SessionRegistry;

/// A turn event tagged with the session it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub event: TurnEvent,
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Project the sessions edit.
    pub project_dir: PathBuf,
    pub config: Arc<EditloopConfig>,
    pub registry: Arc<Mutex<SessionRegistry>>,
    /// Every session's events; SSE handlers filter by session id.
    pub event_tx: Arc<broadcast::Sender<SessionEvent>>,
}

impl AppState {
    pub fn new(project_dir: PathBuf, config: EditloopConfig) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            project_dir,
            config: Arc::new(config),
            registry: Arc::new(Mutex::new(SessionRegistry::new())),
            event_tx: Arc::new(event_tx),
        }
    }

    /// Lock the registry, recovering from poisoning.
    pub fn registry(&self) -> MutexGuard<'_, SessionRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Update the session preview, then fan the event out to subscribers.
    pub fn publish<B: BaseTree + ?Sized>(&self, session_id: &str, event: TurnEvent, base: &B) {
        self.registry().observe(session_id, &event, base);
        // No subscribers is fine.
        let _ = self.event_tx.send(SessionEvent {
            session_id: session_id.to_string(),
            event,
        });
    }
}
