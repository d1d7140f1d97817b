//! Global atomic counters for memforge sessions.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the scheduler does so after every pass).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    sessions_completed: AtomicU64,
    sessions_rolled_back: AtomicU64,
    sessions_exhausted: AtomicU64,
    sessions_abandoned: AtomicU64,
    mutations_applied: AtomicU64,
    actions_rejected: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_completed: u64,
    pub sessions_rolled_back: u64,
    pub sessions_exhausted: u64,
    pub sessions_abandoned: u64,
    pub mutations_applied: u64,
    pub actions_rejected: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sessions_completed: AtomicU64::new(0),
            sessions_rolled_back: AtomicU64::new(0),
            sessions_exhausted: AtomicU64::new(0),
            sessions_abandoned: AtomicU64::new(0),
            mutations_applied: AtomicU64::new(0),
            actions_rejected: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_completed(&self) {
        Self::bump(&self.sessions_completed, "sessions_completed");
    }

    pub fn inc_rolled_back(&self) {
        Self::bump(&self.sessions_rolled_back, "sessions_rolled_back");
    }

    pub fn inc_exhausted(&self) {
        Self::bump(&self.sessions_exhausted, "sessions_exhausted");
    }

    pub fn inc_abandoned(&self) {
        Self::bump(&self.sessions_abandoned, "sessions_abandoned");
    }

    pub fn inc_mutations(&self) {
        Self::bump(&self.mutations_applied, "mutations_applied");
    }

    pub fn inc_rejected(&self) {
        Self::bump(&self.actions_rejected, "actions_rejected");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_rolled_back: self.sessions_rolled_back.load(Ordering::Relaxed),
            sessions_exhausted: self.sessions_exhausted.load(Ordering::Relaxed),
            sessions_abandoned: self.sessions_abandoned.load(Ordering::Relaxed),
            mutations_applied: self.mutations_applied.load(Ordering::Relaxed),
            actions_rejected: self.actions_rejected.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            sessions_completed = s.sessions_completed,
            sessions_rolled_back = s.sessions_rolled_back,
            sessions_exhausted = s.sessions_exhausted,
            sessions_abandoned = s.sessions_abandoned,
            mutations_applied = s.mutations_applied,
            actions_rejected = s.actions_rejected,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.sessions_completed,
            &self.sessions_rolled_back,
            &self.sessions_exhausted,
            &self.sessions_abandoned,
            &self.mutations_applied,
            &self.actions_rejected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_reset() {
        let m = Metrics::new();
        m.inc_completed();
        m.inc_mutations();
        m.inc_mutations();
        m.inc_rejected();

        let s = m.snapshot();
        assert_eq!(s.sessions_completed, 1);
        assert_eq!(s.mutations_applied, 2);
        assert_eq!(s.actions_rejected, 1);
        assert_eq!(s.sessions_abandoned, 0);

        m.reset();
        assert_eq!(m.snapshot().mutations_applied, 0);
    }
}
