//! Scheduler: fans eligible owners out to concurrent sessions.
//!
//! Different owners run in parallel on Tokio tasks, bounded by a semaphore.
//! At most one session per owner is ever in flight; a second request for a
//! busy owner is refused with [`EngineError::OwnerBusy`] or skipped during a
//! pass.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::controller::{SessionController, SessionReport};
use crate::error::{EngineError, Result};
use crate::metrics::METRICS;

type Claims = Arc<Mutex<HashSet<String>>>;

/// Exclusive claim on an owner, released on drop.
#[derive(Debug)]
pub struct OwnerClaim {
    owner_id: String,
    claims: Claims,
}

impl OwnerClaim {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

impl Drop for OwnerClaim {
    fn drop(&mut self) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.remove(&self.owner_id);
        }
    }
}

/// Summary of one scheduler pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub sessions: Vec<SessionReport>,
    /// Eligible owners skipped because a session was already running
    pub skipped: Vec<String>,
    /// Owners whose session ended in an error
    pub failed: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct Scheduler {
    controller: Arc<SessionController>,
    claims: Claims,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(controller: Arc<SessionController>) -> Self {
        let permits = controller.config().max_concurrent_sessions.max(1);
        Self {
            controller,
            claims: Arc::new(Mutex::new(HashSet::new())),
            permits: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    /// Claim `owner_id`, or `None` if a session for it is in flight.
    pub fn try_claim(&self, owner_id: &str) -> Option<OwnerClaim> {
        let mut claims = self.claims.lock().ok()?;
        if !claims.insert(owner_id.to_string()) {
            return None;
        }
        Some(OwnerClaim {
            owner_id: owner_id.to_string(),
            claims: Arc::clone(&self.claims),
        })
    }

    /// Run a session for one owner regardless of eligibility.
    pub async fn run_owner(&self, owner_id: &str) -> Result<SessionReport> {
        let _claim = self
            .try_claim(owner_id)
            .ok_or_else(|| EngineError::OwnerBusy(owner_id.to_string()))?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?;
        self.controller.run_owner(owner_id).await
    }

    /// One pass: select eligible owners and run them concurrently.
    pub async fn run_all_eligible(&self) -> Result<PassReport> {
        let eligible = self.controller.select_eligible().await?;
        let mut report = PassReport::default();
        let mut handles = Vec::with_capacity(eligible.len());

        for owner_id in eligible {
            let Some(claim) = self.try_claim(&owner_id) else {
                info!(owner_id = %owner_id, "owner busy, skipping");
                report.skipped.push(owner_id);
                continue;
            };
            let controller = Arc::clone(&self.controller);
            let permits = Arc::clone(&self.permits);
            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| EngineError::Task(e.to_string()))?;
                controller.run_owner(claim.owner_id()).await
            });
            handles.push((owner_id, handle));
        }

        let results = futures::future::join_all(
            handles
                .into_iter()
                .map(|(owner_id, handle)| async move { (owner_id, handle.await) }),
        )
        .await;

        for (owner_id, joined) in results {
            match joined {
                Ok(Ok(session)) => report.sessions.push(session),
                Ok(Err(err)) => {
                    if err.is_fatal() {
                        error!(owner_id = %owner_id, error = %err, "session needs manual intervention");
                    } else {
                        warn!(owner_id = %owner_id, error = %err, "session failed");
                    }
                    report.failed.push((owner_id, err.to_string()));
                }
                Err(join_err) => {
                    error!(owner_id = %owner_id, error = %join_err, "session task panicked");
                    report.failed.push((owner_id, join_err.to_string()));
                }
            }
        }

        info!(
            sessions = report.sessions.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "scheduler pass finished"
        );
        METRICS.flush();
        Ok(report)
    }

    /// Run passes every `interval` until `shutdown` resolves.
    ///
    /// Shutdown is observed between passes; a running pass finishes first.
    pub async fn daemon<F>(&self, interval: Duration, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "memforge daemon started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("memforge daemon shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_all_eligible().await {
                        warn!(error = %err, "scheduler pass failed");
                    }
                }
            }
        }
    }
}
