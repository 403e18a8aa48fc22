//! Aggregated connection status.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::error;

use crate::identifiers::SessionId;
use crate::session::{SessionState, Transition, TransitionHandler};
use crate::transport::TransportKind;

// ============================================================================
// SupervisorStatus
// ============================================================================

/// What the application shows about the connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    /// Transport of the current or last session.
    pub transport_kind: Option<TransportKind>,
    /// State of the current or last session.
    pub session_state: SessionState,
    /// Last human-readable status line.
    pub last_message: Option<String>,
    /// Set once a fatal condition requires restarting the process.
    pub restart_required: bool,
}

// ============================================================================
// StatusReporter
// ============================================================================

/// Folds session transitions into the published [`SupervisorStatus`].
///
/// Only the current session updates state and message; a fatal transition
/// from any session latches the restart flag.
pub(crate) struct StatusReporter {
    status: watch::Sender<SupervisorStatus>,
    current: Mutex<Option<SessionId>>,
    restart: AtomicBool,
}

impl StatusReporter {
    pub(crate) fn new() -> Arc<Self> {
        let (status, _) = watch::channel(SupervisorStatus::default());
        Arc::new(Self {
            status,
            current: Mutex::new(None),
            restart: AtomicBool::new(false),
        })
    }

    /// Transition callback to hand to new sessions.
    pub(crate) fn handler(self: &Arc<Self>) -> TransitionHandler {
        let reporter = Arc::clone(self);
        Arc::new(move |t: &Transition| reporter.on_transition(t))
    }

    /// Makes `session_id` the session whose transitions are shown.
    pub(crate) fn track(&self, session_id: SessionId, kind: TransportKind) {
        *self.current.lock() = Some(session_id);
        self.status.send_modify(|s| {
            s.transport_kind = Some(kind);
            s.session_state = SessionState::Idle;
        });
    }

    /// Replaces the status line.
    pub(crate) fn note(&self, message: impl Into<String>) {
        let message = message.into();
        self.status.send_modify(|s| s.last_message = Some(message));
    }

    #[inline]
    pub(crate) fn restart_required(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    fn on_transition(&self, t: &Transition) {
        if t.fatal && !self.restart.swap(true, Ordering::SeqCst) {
            error!(session_id = %t.session_id, message = ?t.message, "Restart required");
        }

        let is_current = *self.current.lock() == Some(t.session_id);
        let fatal = t.fatal;

        self.status.send_modify(|s| {
            if fatal {
                s.restart_required = true;
            }
            if is_current {
                s.transport_kind = Some(t.transport_kind);
                s.session_state = t.to;
                if let Some(message) = &t.message {
                    s.last_message = Some(message.clone());
                }
            }
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
