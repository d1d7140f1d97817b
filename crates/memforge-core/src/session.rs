//! Ephemeral per-session state.
//!
//! A `Session` lives only inside one controller loop. Nothing about it is
//! persisted except the audit entries it produces.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The model called `complete`
    Completed,
    /// The retention check failed and the session was unwound
    CircuitBreaker,
    /// Turn limit hit or the model stopped calling tools
    Exhausted,
    /// An infrastructure error interrupted the loop
    Interrupted,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Completed => "completed",
            TerminationReason::CircuitBreaker => "circuit_breaker",
            TerminationReason::Exhausted => "exhausted",
            TerminationReason::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-operation counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub deleted: u32,
    pub consolidated: u32,
    pub updated: u32,
    pub protected: u32,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub owner_id: String,
    pub pre_session_mass: u64,
    pub retention_threshold: f64,
    pub max_mutations: u32,
    pub mutation_count: u32,
    pub stats: SessionStats,
    termination: Option<TerminationReason>,
    summary: Option<String>,
    next_seq: u64,
}

impl Session {
    pub fn new(
        owner_id: impl Into<String>,
        pre_session_mass: u64,
        retention_threshold: f64,
        max_mutations: u32,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            pre_session_mass,
            retention_threshold,
            max_mutations,
            mutation_count: 0,
            stats: SessionStats::default(),
            termination: None,
            summary: None,
            next_seq: 0,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_some()
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Mark terminal. The first reason wins.
    pub fn terminate(&mut self, reason: TerminationReason, summary: Option<String>) {
        if self.termination.is_none() {
            self.termination = Some(reason);
            self.summary = summary;
        }
    }

    pub fn cap_reached(&self) -> bool {
        self.mutation_count >= self.max_mutations
    }

    pub fn mutations_remaining(&self) -> u32 {
        self.max_mutations.saturating_sub(self.mutation_count)
    }

    pub fn record_mutation(&mut self) {
        self.mutation_count += 1;
    }

    /// Allocate the next audit sequence number.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_is_monotonic() {
        let mut session = Session::new("o", 100, 0.7, 10);
        assert_eq!(session.next_seq(), 0);
        assert_eq!(session.next_seq(), 1);
        assert_eq!(session.next_seq(), 2);
    }

    #[test]
    fn test_first_termination_wins() {
        let mut session = Session::new("o", 100, 0.7, 10);
        session.terminate(TerminationReason::Completed, Some("done".to_string()));
        session.terminate(TerminationReason::Exhausted, None);
        assert_eq!(session.termination(), Some(TerminationReason::Completed));
        assert_eq!(session.summary(), Some("done"));
    }

    #[test]
    fn test_cap() {
        let mut session = Session::new("o", 100, 0.7, 2);
        assert!(!session.cap_reached());
        session.record_mutation();
        session.record_mutation();
        assert!(session.cap_reached());
        assert_eq!(session.mutations_remaining(), 0);
    }
}
