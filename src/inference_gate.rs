//! Exclusive, first-come-first-served access to the loaded model.
//!
//! The process holds one model and decodes one request at a time. Callers
//! take a ticket and wait until it is served, so requests reach the model
//! in arrival order. `acquire()` blocks; `try_acquire()` returns `None`
//! when anyone holds or waits for the model. `current_operation()` shows
//! what is running.

use std::sync::{Condvar, Mutex, MutexGuard};

use serde::Serialize;

use crate::pipeline::generation::Stage;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Snapshot of the request currently holding the model.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub stage: Stage,
    pub model: String,
    /// When the operation started (ISO 8601).
    pub started_at: String,
    pub ticket: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Internal lock error")]
    LockPoisoned,
}

#[derive(Default)]
struct GateState {
    next_ticket: u64,
    now_serving: u64,
    current: Option<ActiveOperation>,
}

impl GateState {
    fn waiting(&self) -> u64 {
        let taken = self.next_ticket - self.now_serving;
        taken.saturating_sub(u64::from(self.current.is_some()))
    }
}

// ═══════════════════════════════════════════════════════════
// InferenceGate
// ═══════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InferenceGate {
    state: Mutex<GateState>,
    turn: Condvar,
}

impl InferenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for this caller's turn at the model.
    ///
    /// Hold the guard for the whole operation; dropping it hands the model
    /// to the next ticket.
    pub fn acquire(&self, stage: Stage, model: &str) -> Result<InferenceGuard<'_>, GateError> {
        let mut state = self.state.lock().map_err(|_| GateError::LockPoisoned)?;
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        if ticket != state.now_serving {
            tracing::debug!(ticket, ahead = ticket - state.now_serving, "Waiting for model");
        }
        while ticket != state.now_serving {
            state = self.turn.wait(state).map_err(|_| GateError::LockPoisoned)?;
        }

        Ok(self.start(state, stage, model, ticket))
    }

    /// Take the model only if nobody holds or waits for it.
    pub fn try_acquire(&self, stage: Stage, model: &str) -> Option<InferenceGuard<'_>> {
        let mut state = self.state.lock().ok()?;
        if state.next_ticket != state.now_serving {
            return None;
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        Some(self.start(state, stage, model, ticket))
    }

    /// What is running, or `None` when idle.
    pub fn current_operation(&self) -> Option<ActiveOperation> {
        self.state.lock().ok()?.current.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.current.is_some())
            .unwrap_or(true)
    }

    /// Callers queued behind the current operation.
    pub fn waiting(&self) -> u64 {
        self.state.lock().map(|s| s.waiting()).unwrap_or(0)
    }

    // ── Internal ────────────────────────────────────────────

    fn start(
        &self,
        mut state: MutexGuard<'_, GateState>,
        stage: Stage,
        model: &str,
        ticket: u64,
    ) -> InferenceGuard<'_> {
        state.current = Some(ActiveOperation {
            stage,
            model: model.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            ticket,
        });
        InferenceGuard { gate: self }
    }

    fn finish(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.current = None;
        state.now_serving += 1;
        drop(state);
        self.turn.notify_all();
    }
}

// ═══════════════════════════════════════════════════════════
// InferenceGuard — RAII exclusive access token
// ═══════════════════════════════════════════════════════════

/// Dropping the guard clears the current operation and serves the next ticket.
pub struct InferenceGuard<'a> {
    gate: &'a InferenceGate,
}

impl Drop for InferenceGuard<'_> {
    fn drop(&mut self) {
        self.gate.finish();
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
