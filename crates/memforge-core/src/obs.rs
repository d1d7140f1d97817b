//! Structured observability hooks for the session lifecycle.
//!
//! This module provides:
//! - A session-scoped tracing span, attached to the session future with
//!   `tracing::Instrument` so it follows the task across await points
//! - Emission functions for key lifecycle events: start, action dispatched,
//!   breaker tripped, rollback finished, session finished

use tracing::{info, warn};

/// Span tagged with the session and owner ids.
///
/// # Example
///
/// ```ignore
/// controller.drive(&mut session).instrument(session_span(&id, &owner)).await
/// ```
pub fn session_span(session_id: &str, owner_id: &str) -> tracing::Span {
    tracing::info_span!("memforge.session", session_id = %session_id, owner_id = %owner_id)
}

pub fn emit_session_started(session_id: &str, owner_id: &str, pre_mass: u64, threshold: f64) {
    info!(
        event = "session.started",
        session_id = %session_id,
        owner_id = %owner_id,
        pre_mass = pre_mass,
        retention_threshold = threshold,
    );
}

/// Emit event: one tool call dispatched.
pub fn emit_action_dispatched(session_id: &str, action: &str, ok: bool, mutations: u32) {
    info!(
        event = "session.action",
        session_id = %session_id,
        action = %action,
        ok = ok,
        mutation_count = mutations,
    );
}

pub fn emit_breaker_tripped(session_id: &str, pre_mass: u64, post_mass: u64, ratio: f64) {
    warn!(
        event = "breaker.tripped",
        session_id = %session_id,
        pre_mass = pre_mass,
        post_mass = post_mass,
        ratio = ratio,
    );
}

pub fn emit_rollback_finished(session_id: &str, reversed: usize, reason: &str) {
    info!(
        event = "rollback.finished",
        session_id = %session_id,
        reversed = reversed,
        reason = %reason,
    );
}

/// Emit event: session reached a terminal state.
pub fn emit_session_finished(
    session_id: &str,
    state: &str,
    duration_ms: u64,
    mutations: u32,
    post_mass: u64,
) {
    info!(
        event = "session.finished",
        session_id = %session_id,
        state = %state,
        duration_ms = duration_ms,
        mutations = mutations,
        post_mass = post_mass,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_span_create() {
        let _entered = session_span("s-1", "owner-1").entered();
        emit_action_dispatched("s-1", "search", true, 0);
    }
}
