//! Retention check run after every committed mutating action.

use std::sync::Arc;

use memforge_state::{StorageResult, Store};
use tracing::debug;

use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakerVerdict {
    /// Pre-session mass was zero; nothing to protect
    Skipped,
    Holding { post_mass: u64, ratio: f64 },
    Tripped { post_mass: u64, ratio: f64 },
}

impl BreakerVerdict {
    pub fn is_tripped(&self) -> bool {
        matches!(self, BreakerVerdict::Tripped { .. })
    }
}

/// Compare surviving mass against the retention floor.
pub fn evaluate(pre_session_mass: u64, post_mass: u64, retention_threshold: f64) -> BreakerVerdict {
    if pre_session_mass == 0 {
        return BreakerVerdict::Skipped;
    }
    let ratio = post_mass as f64 / pre_session_mass as f64;
    if ratio < retention_threshold {
        BreakerVerdict::Tripped { post_mass, ratio }
    } else {
        BreakerVerdict::Holding { post_mass, ratio }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn Store>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Read committed core mass and evaluate it for the session.
    pub async fn check(&self, session: &Session) -> StorageResult<BreakerVerdict> {
        if session.pre_session_mass == 0 {
            return Ok(BreakerVerdict::Skipped);
        }
        let post_mass = self.store.core_mass(&session.owner_id).await?;
        let verdict = evaluate(
            session.pre_session_mass,
            post_mass,
            session.retention_threshold,
        );
        debug!(
            session_id = %session.session_id,
            pre_mass = session.pre_session_mass,
            post_mass,
            threshold = session.retention_threshold,
            tripped = verdict.is_tripped(),
            "retention check"
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_pre_mass_is_skipped() {
        assert_eq!(evaluate(0, 0, 0.7), BreakerVerdict::Skipped);
    }

    #[test]
    fn test_trips_below_threshold() {
        assert!(evaluate(200, 100, 0.7).is_tripped());
        assert!(!evaluate(200, 150, 0.7).is_tripped());
    }

    #[test]
    fn test_exact_threshold_holds() {
        assert!(!evaluate(100, 70, 0.7).is_tripped());
        assert!(evaluate(100, 69, 0.7).is_tripped());
    }

    #[test]
    fn test_growth_holds() {
        assert!(matches!(
            evaluate(100, 120, 0.7),
            BreakerVerdict::Holding { post_mass: 120, .. }
        ));
    }
}
