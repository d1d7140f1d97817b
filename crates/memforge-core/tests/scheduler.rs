//! Scheduler: eligibility passes, per-owner exclusion and the daemon loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memforge_core::llm::{CompletionRequest, CompletionResponse, LlmClient, ToolCall};
use memforge_core::{EngineConfig, EngineError, LlmError, Scheduler, SessionController, TerminalState};
use memforge_state::{InMemoryStore, Memory, MemoryKind, MemoryStore};
use serde_json::json;

/// Completes every session on the first turn, after an optional delay.
struct CompletingLlm {
    delay: Duration,
    calls: AtomicUsize,
}

impl CompletingLlm {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmClient for CompletingLlm {
    fn provider(&self) -> &str {
        "test"
    }

    fn model(&self) -> &str {
        "completing"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(CompletionResponse::with_tool_calls(vec![ToolCall::new(
            "call_0",
            "memory",
            json!({ "action": "complete", "summary": "looked fine" }),
        )]))
    }
}

async fn store_with_owners(owners: &[&str]) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for owner in owners {
        store
            .insert_memory(Memory::core(*owner, format!("{owner} likes hiking")))
            .await
            .unwrap();
    }
    store
}

fn scheduler(store: Arc<InMemoryStore>, llm: Arc<CompletingLlm>) -> Scheduler {
    let controller = SessionController::new(store, llm, EngineConfig::default());
    Scheduler::new(Arc::new(controller))
}

#[tokio::test]
async fn pass_runs_every_eligible_owner() {
    let store = store_with_owners(&["ana", "ben", "cy"]).await;
    store
        .insert_memory(Memory::journal("dee", "only a journal"))
        .await
        .unwrap();
    let llm = Arc::new(CompletingLlm::new(Duration::ZERO));
    let s = scheduler(store.clone(), llm.clone());

    let pass = s.run_all_eligible().await.unwrap();
    let mut owners: Vec<&str> = pass.sessions.iter().map(|r| r.owner_id.as_str()).collect();
    owners.sort();
    assert_eq!(owners, vec!["ana", "ben", "cy"]);
    assert!(pass
        .sessions
        .iter()
        .all(|r| r.state == TerminalState::Completed));
    assert!(pass.failed.is_empty());

    // Just refined, so nobody is due again.
    let second = s.run_all_eligible().await.unwrap();
    assert!(second.sessions.is_empty());
    assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn claimed_owner_is_skipped_and_refused() {
    let store = store_with_owners(&["ana", "ben"]).await;
    let s = scheduler(store, Arc::new(CompletingLlm::new(Duration::ZERO)));

    let claim = s.try_claim("ana").unwrap();
    assert_eq!(claim.owner_id(), "ana");
    assert!(s.try_claim("ana").is_none());

    let err = s.run_owner("ana").await.unwrap_err();
    assert!(matches!(err, EngineError::OwnerBusy(ref owner) if owner == "ana"));

    let pass = s.run_all_eligible().await.unwrap();
    assert_eq!(pass.skipped, vec!["ana".to_string()]);
    assert_eq!(pass.sessions.len(), 1);
    assert_eq!(pass.sessions[0].owner_id, "ben");

    drop(claim);
    assert!(s.try_claim("ana").is_some());
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_for_one_owner_are_exclusive() {
    let store = store_with_owners(&["ana"]).await;
    let s = scheduler(store.clone(), Arc::new(CompletingLlm::new(Duration::from_millis(50))));

    let (first, second) = tokio::join!(s.run_owner("ana"), s.run_owner("ana"));
    assert_eq!(first.unwrap().state, TerminalState::Completed);
    assert!(matches!(second, Err(EngineError::OwnerBusy(_))));

    let journals = store
        .list_memories("ana", Some(MemoryKind::Journal))
        .await
        .unwrap();
    assert_eq!(journals.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn daemon_stops_on_shutdown() {
    let store = store_with_owners(&["ana"]).await;
    let llm = Arc::new(CompletingLlm::new(Duration::ZERO));
    let s = scheduler(store.clone(), llm.clone());

    s.daemon(
        Duration::from_secs(60),
        tokio::time::sleep(Duration::from_secs(150)),
    )
    .await
    .unwrap();

    // Three ticks fired, but only the first found the owner due.
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
}
