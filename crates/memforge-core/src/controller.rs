//! Session controller: selects owners and drives the model/tool loop.
//!
//! States: `Idle -> Selecting -> Prompting -> Looping -> Terminal`.
//!
//! Transient LLM failures are retried here, at the job level, never inside a
//! session. Before a retry the interrupted session is unwound, so every
//! attempt starts from the exact pre-session state.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use memforge_state::{AuditOperation, MemoryKind, Store};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn, Instrument};

use crate::actions::{self, raw_action_name};
use crate::audit::AuditTrail;
use crate::breaker::{BreakerVerdict, CircuitBreaker};
use crate::config::EngineConfig;
use crate::dispatcher::ActionDispatcher;
use crate::error::{ActionError, EngineError, Result};
use crate::llm::{CompletionRequest, LlmClient, Message};
use crate::metrics::METRICS;
use crate::obs;
use crate::prompt::{self, LedgerStats};
use crate::rollback::{RollbackEngine, RollbackReport};
use crate::session::{Session, SessionStats, TerminationReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Selecting,
    Prompting,
    Looping,
    Terminal,
}

/// How a run for one owner ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    /// The model called `complete`
    Completed,
    /// The breaker tripped and the session was unwound
    RolledBack,
    /// No explicit completion; closed with an implicit summary
    Exhausted,
    /// Transient failures outlasted the retry budget
    Abandoned,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalState::Completed => "completed",
            TerminalState::RolledBack => "rolled_back",
            TerminalState::Exhausted => "exhausted",
            TerminalState::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an owner was picked for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    OverBudget { core_mass: u64 },
    IntervalElapsed,
    NeverRefined,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session_id: String,
    pub owner_id: String,
    pub state: TerminalState,
    pub pre_mass: u64,
    pub post_mass: u64,
    pub mutations: u32,
    pub stats: SessionStats,
    pub turns: u32,
    pub attempts: u32,
    pub rollback: Option<RollbackReport>,
}

enum LoopExit {
    Completed,
    RolledBack(RollbackReport),
    Exhausted,
}

pub struct SessionController {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    config: EngineConfig,
    dispatcher: ActionDispatcher,
    breaker: CircuitBreaker,
    rollback: RollbackEngine,
    audit: AuditTrail,
}

impl SessionController {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmClient>, config: EngineConfig) -> Self {
        Self {
            dispatcher: ActionDispatcher::new(store.clone()),
            breaker: CircuitBreaker::new(store.clone()),
            rollback: RollbackEngine::new(store.clone()),
            audit: AuditTrail::new(store.clone()),
            store,
            llm,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn eligibility(&self, owner_id: &str) -> Result<Option<Eligibility>> {
        self.eligibility_at(owner_id, Utc::now()).await
    }

    async fn eligibility_at(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Eligibility>> {
        let last = self.store.last_session_outcome(owner_id).await?;
        // A failed rollback left partial writes behind; only an operator
        // (`run-owner`) or a later successful outcome clears it.
        if let Some(entry) = &last {
            if entry.operation == AuditOperation::RollbackFailed {
                warn!(
                    owner_id = %owner_id,
                    session_id = %entry.session_id,
                    "owner held after failed rollback"
                );
                return Ok(None);
            }
        }

        let core = self
            .store
            .list_memories(owner_id, Some(MemoryKind::Core))
            .await?;
        let core_mass: u64 = core.iter().map(|m| m.mass).sum();
        if core_mass > self.config.mass_budget {
            return Ok(Some(Eligibility::OverBudget { core_mass }));
        }

        match last {
            None if core.is_empty() => Ok(None),
            None => Ok(Some(Eligibility::NeverRefined)),
            Some(last) => {
                // Negative (clock skew) counts as just refined.
                let elapsed = (now - last.created_at).to_std().unwrap_or_default();
                if elapsed >= self.config.refine_interval() {
                    Ok(Some(Eligibility::IntervalElapsed))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Owners due for a session, in owner-id order.
    pub async fn select_eligible(&self) -> Result<Vec<String>> {
        let mut eligible = Vec::new();
        for owner_id in self.store.list_owners().await? {
            if let Some(reason) = self.eligibility(&owner_id).await? {
                debug!(owner_id = %owner_id, ?reason, "owner eligible");
                eligible.push(owner_id);
            }
        }
        info!(count = eligible.len(), "selected eligible owners");
        Ok(eligible)
    }

    /// Run one owner to a terminal state, retrying transient failures.
    ///
    /// Returns `Err` only for non-transient failures; a fatal
    /// [`EngineError::RollbackFailed`] is never retried.
    pub async fn run_owner(&self, owner_id: &str) -> Result<SessionReport> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let mut state = ControllerState::Idle;
            transition(&mut state, ControllerState::Selecting, owner_id);
            let (mut session, messages) = self.open_session(owner_id, &mut state).await?;
            let span = obs::session_span(&session.session_id, owner_id);

            let result = self
                .drive(&mut session, messages, &mut state)
                .instrument(span.clone())
                .await;
            transition(&mut state, ControllerState::Terminal, owner_id);

            let err = match result {
                Ok((exit, turns)) => {
                    return self.conclude(session, exit, turns, attempt, started).await;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => err,
            };

            // Unwind whatever landed before the interruption.
            self.rollback
                .rollback_session(&mut session, TerminationReason::Interrupted)
                .instrument(span)
                .await?;

            if !err.is_transient() {
                error!(owner_id = %owner_id, error = %err, "session failed");
                return Err(err);
            }

            if attempt > self.config.retry.max_retries {
                warn!(owner_id = %owner_id, attempts = attempt, error = %err, "session abandoned");
                self.audit
                    .record_outcome(
                        &mut session,
                        AuditOperation::SessionAbandoned,
                        json!({ "attempts": attempt, "error": err.to_string() }),
                    )
                    .await?;
                METRICS.inc_abandoned();
                obs::emit_session_finished(
                    &session.session_id,
                    TerminalState::Abandoned.as_str(),
                    started.elapsed().as_millis() as u64,
                    0,
                    session.pre_session_mass,
                );
                return Ok(SessionReport {
                    session_id: session.session_id,
                    owner_id: session.owner_id,
                    state: TerminalState::Abandoned,
                    pre_mass: session.pre_session_mass,
                    post_mass: session.pre_session_mass,
                    mutations: 0,
                    stats: SessionStats::default(),
                    turns: 0,
                    attempts: attempt,
                    rollback: None,
                });
            }

            let delay = self
                .config
                .retry
                .delay_for(attempt, err.retry_after_secs());
            warn!(
                owner_id = %owner_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying session"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Selecting and Prompting: snapshot pre-session state and build the prompt.
    async fn open_session(
        &self,
        owner_id: &str,
        state: &mut ControllerState,
    ) -> Result<(Session, Vec<Message>)> {
        let settings = self.store.owner_settings(owner_id).await?;
        let threshold = self.config.retention_threshold_for(settings.as_ref());
        let core = self
            .store
            .list_memories(owner_id, Some(MemoryKind::Core))
            .await?;
        let pre_mass: u64 = core.iter().map(|m| m.mass).sum();

        let session = Session::new(
            owner_id,
            pre_mass,
            threshold,
            self.config.max_mutations_per_session,
        );
        obs::emit_session_started(&session.session_id, owner_id, pre_mass, threshold);

        transition(state, ControllerState::Prompting, owner_id);
        let stats = LedgerStats {
            core_mass: pre_mass,
            mass_budget: self.config.mass_budget,
            retention_threshold: threshold,
            max_mutations: self.config.max_mutations_per_session,
        };
        let messages = vec![
            Message::system(prompt::system_prompt(
                &stats,
                prompt::style_for(settings.as_ref()),
            )),
            Message::user(prompt::ledger(owner_id, &core, &stats)),
        ];
        Ok((session, messages))
    }

    /// Looping: strictly sequential model turns and tool calls.
    async fn drive(
        &self,
        session: &mut Session,
        mut messages: Vec<Message>,
        state: &mut ControllerState,
    ) -> Result<(LoopExit, u32)> {
        transition(state, ControllerState::Looping, &session.owner_id);
        let tools = vec![actions::tool_schema()];

        for turn in 1..=self.config.max_turns {
            let request = CompletionRequest::new(messages.clone())
                .with_tools(tools.clone())
                .with_max_tokens(self.config.max_tokens);
            let response = self.llm.complete(request).await?;

            if response.tool_calls.is_empty() {
                debug!(turn, "model replied without tool calls");
                self.finish_implicitly(session, turn).await?;
                return Ok((LoopExit::Exhausted, turn));
            }

            messages.push(Message::assistant_with_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                let payload = match self.dispatcher.execute(session, call).await {
                    Ok(outcome) => {
                        obs::emit_action_dispatched(
                            &session.session_id,
                            outcome.action,
                            true,
                            session.mutation_count,
                        );
                        if outcome.counted {
                            if let BreakerVerdict::Tripped { post_mass, ratio } =
                                self.breaker.check(session).await?
                            {
                                obs::emit_breaker_tripped(
                                    &session.session_id,
                                    session.pre_session_mass,
                                    post_mass,
                                    ratio,
                                );
                                let report = self
                                    .rollback
                                    .rollback_session(session, TerminationReason::CircuitBreaker)
                                    .await?;
                                return Ok((LoopExit::RolledBack(report), turn));
                            }
                        }
                        outcome.payload
                    }
                    Err(ActionError::Storage(err)) => return Err(err.into()),
                    Err(err) => {
                        obs::emit_action_dispatched(
                            &session.session_id,
                            raw_action_name(call),
                            false,
                            session.mutation_count,
                        );
                        err.to_tool_result()
                    }
                };
                messages.push(Message::tool_result(&call.id, payload.to_string()));
            }

            if session.termination() == Some(TerminationReason::Completed) {
                return Ok((LoopExit::Completed, turn));
            }
        }

        self.finish_implicitly(session, self.config.max_turns).await?;
        Ok((LoopExit::Exhausted, self.config.max_turns))
    }

    async fn finish_implicitly(&self, session: &mut Session, turns: u32) -> Result<()> {
        let summary = implicit_summary(session, turns);
        self.dispatcher
            .finish(session, TerminationReason::Exhausted, &summary)
            .await?;
        Ok(())
    }

    async fn conclude(
        &self,
        session: Session,
        exit: LoopExit,
        turns: u32,
        attempts: u32,
        started: Instant,
    ) -> Result<SessionReport> {
        let post_mass = self.store.core_mass(&session.owner_id).await?;
        let (state, rollback) = match exit {
            LoopExit::Completed => {
                METRICS.inc_completed();
                (TerminalState::Completed, None)
            }
            LoopExit::RolledBack(report) => {
                METRICS.inc_rolled_back();
                (TerminalState::RolledBack, Some(report))
            }
            LoopExit::Exhausted => {
                METRICS.inc_exhausted();
                (TerminalState::Exhausted, None)
            }
        };

        obs::emit_session_finished(
            &session.session_id,
            state.as_str(),
            started.elapsed().as_millis() as u64,
            session.mutation_count,
            post_mass,
        );

        Ok(SessionReport {
            session_id: session.session_id,
            owner_id: session.owner_id,
            state,
            pre_mass: session.pre_session_mass,
            post_mass,
            mutations: session.mutation_count,
            stats: session.stats,
            turns,
            attempts,
            rollback,
        })
    }
}

fn transition(state: &mut ControllerState, next: ControllerState, owner_id: &str) {
    debug!(owner_id = %owner_id, from = ?*state, to = ?next, "controller state");
    *state = next;
}

fn implicit_summary(session: &Session, turns: u32) -> String {
    let s = &session.stats;
    format!(
        "Session ended after {turns} turn(s) without an explicit summary: deleted {}, \
         consolidated {}, updated {}, protected {}.",
        s.deleted, s.consolidated, s.updated, s.protected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use memforge_state::{AuditEntry, AuditLog, InMemoryStore, Memory, MemoryStore};

    fn controller(store: Arc<InMemoryStore>, config: EngineConfig) -> SessionController {
        SessionController::new(store, Arc::new(ScriptedLlm::new(vec![])), config)
    }

    #[tokio::test]
    async fn test_eligibility_rules() {
        let store = Arc::new(InMemoryStore::new());
        let config = EngineConfig {
            mass_budget: 100,
            refine_interval_secs: 3_600,
            ..EngineConfig::default()
        };

        store
            .insert_memory(Memory::core("big", "x").with_mass(150))
            .await
            .unwrap();
        store
            .insert_memory(Memory::core("fresh", "x").with_mass(10))
            .await
            .unwrap();
        store
            .insert_memory(Memory::core("recent", "x").with_mass(10))
            .await
            .unwrap();
        store
            .insert_memory(Memory::journal("journal-only", "x"))
            .await
            .unwrap();
        store
            .append(AuditEntry::new("s", "recent", 0, AuditOperation::SessionCompleted))
            .await
            .unwrap();

        let c = controller(store, config);
        assert_eq!(
            c.eligibility("big").await.unwrap(),
            Some(Eligibility::OverBudget { core_mass: 150 })
        );
        assert_eq!(
            c.eligibility("fresh").await.unwrap(),
            Some(Eligibility::NeverRefined)
        );
        assert_eq!(c.eligibility("recent").await.unwrap(), None);
        assert_eq!(c.eligibility("journal-only").await.unwrap(), None);

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(
            c.eligibility_at("recent", later).await.unwrap(),
            Some(Eligibility::IntervalElapsed)
        );

        assert_eq!(c.select_eligible().await.unwrap(), vec!["big", "fresh"]);
    }

    #[tokio::test]
    async fn test_failed_rollback_holds_owner_until_next_outcome() {
        let store = Arc::new(InMemoryStore::new());
        let config = EngineConfig {
            mass_budget: 100,
            ..EngineConfig::default()
        };
        store
            .insert_memory(Memory::core("bob", "x").with_mass(5_000))
            .await
            .unwrap();
        store
            .append(AuditEntry::new("s1", "bob", 7, AuditOperation::RollbackFailed))
            .await
            .unwrap();

        let c = controller(store.clone(), config);
        // Over budget, yet held.
        assert_eq!(c.eligibility("bob").await.unwrap(), None);
        let later = Utc::now() + chrono::Duration::days(30);
        assert_eq!(c.eligibility_at("bob", later).await.unwrap(), None);
        assert!(c.select_eligible().await.unwrap().is_empty());

        // An operator-driven session that completes clears the hold.
        store
            .append(AuditEntry::new("s2", "bob", 0, AuditOperation::SessionCompleted))
            .await
            .unwrap();
        assert_eq!(
            c.eligibility("bob").await.unwrap(),
            Some(Eligibility::OverBudget { core_mass: 5_000 })
        );
        assert_eq!(c.select_eligible().await.unwrap(), vec!["bob"]);
    }

    #[test]
    fn test_implicit_summary_mentions_counts() {
        let mut session = Session::new("o", 10, 0.7, 10);
        session.stats.deleted = 2;
        let summary = implicit_summary(&session, 3);
        assert!(summary.contains("3 turn(s)"));
        assert!(summary.contains("deleted 2"));
    }
}
