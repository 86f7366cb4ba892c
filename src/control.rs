//! Shared control connection and shutdown phase
//!
//! One lock covers both the phase and the connection handle so that
//! "phase is Running" and "take a handle" are a single observation. A caller
//! that obtained a handle may finish its statement after draining starts;
//! every later statement sees the new phase and is skipped.

use crate::admin::{AdminError, AdminExecutor};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Member shutdown phase. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShutdownPhase::Running => "running",
            ShutdownPhase::Draining => "draining",
            ShutdownPhase::Stopping => "stopping",
            ShutdownPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    pub from: ShutdownPhase,
    pub to: ShutdownPhase,
}

/// Outcome of a phase-guarded statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Statement ran; carries the affected row count
    Applied(u64),
    /// Phase was no longer Running; nothing was sent
    Skipped,
}

impl Execution {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Execution::Skipped)
    }
}

struct ControlState {
    phase: ShutdownPhase,
    conn: Option<Arc<dyn AdminExecutor>>,
}

pub struct ControlPlane {
    state: RwLock<ControlState>,
    changes: broadcast::Sender<PhaseChange>,
}

impl ControlPlane {
    pub fn new(conn: Arc<dyn AdminExecutor>) -> Self {
        let (changes, _) = broadcast::channel(16);
        ControlPlane {
            state: RwLock::new(ControlState {
                phase: ShutdownPhase::Running,
                conn: Some(conn),
            }),
            changes,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.state.read().phase
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    /// Connection handle, only while Running
    pub fn acquire(&self) -> Option<Arc<dyn AdminExecutor>> {
        let state = self.state.read();
        match state.phase {
            ShutdownPhase::Running => state.conn.clone(),
            _ => None,
        }
    }

    /// Connection handle in any phase until invalidated. Reserved for the
    /// shutdown sequence itself.
    pub fn acquire_for_shutdown(&self) -> Option<Arc<dyn AdminExecutor>> {
        self.state.read().conn.clone()
    }

    /// Move to `to`. Returns false, leaving the phase unchanged, if `to` is
    /// not strictly later than the current phase.
    pub fn advance(&self, to: ShutdownPhase) -> bool {
        let change = {
            let mut state = self.state.write();
            let from = state.phase;
            if to <= from {
                if to < from {
                    warn!(%from, %to, "refusing backwards phase transition");
                }
                return false;
            }
            state.phase = to;
            PhaseChange { from, to }
        };

        info!(from = %change.from, to = %change.to, "shutdown phase changed");
        // No subscribers is fine
        let _ = self.changes.send(change);
        true
    }

    /// Detach the connection; every later `acquire*` returns `None`
    pub fn invalidate(&self) -> Option<Arc<dyn AdminExecutor>> {
        self.state.write().conn.take()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhaseChange> {
        self.changes.subscribe()
    }

    /// Execute `statement` if and only if the phase is Running
    pub async fn execute(&self, statement: &str) -> Result<Execution, AdminError> {
        let Some(conn) = self.acquire() else {
            debug!(statement, phase = %self.phase(), "skipping statement, not running");
            return Ok(Execution::Skipped);
        };
        conn.execute(statement).await.map(Execution::Applied)
    }
}
