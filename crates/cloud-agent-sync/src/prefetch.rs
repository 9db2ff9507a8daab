//! Background warm-up of conversations the user is likely to open next.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cloud_agent_api::{Agent, AgentGateway, ApiError, Message};
use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::AuthFailureHandler;

/// Conversations kept before the least recently stored one is dropped.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub agent: Agent,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    Stored,
    AlreadyCached,
    InFlight,
    Failed,
}

#[derive(Clone)]
pub struct PrefetchCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    gateway: Arc<dyn AgentGateway>,
    on_auth_failure: Option<AuthFailureHandler>,
    capacity: usize,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Store order, oldest first.
    order: VecDeque<String>,
    pending: HashSet<String>,
}

impl CacheState {
    fn put(&mut self, entry: CacheEntry, capacity: usize) {
        let agent_id = entry.agent.id.clone();
        self.order.retain(|id| *id != agent_id);
        self.order.push_back(agent_id.clone());
        self.entries.insert(agent_id, entry);
        while self.entries.len() > capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            tracing::debug!(agent_id = %oldest, "evicted cached conversation");
        }
    }

    fn remove(&mut self, agent_id: &str) {
        self.entries.remove(agent_id);
        self.order.retain(|id| id != agent_id);
    }
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a pending id however the prefetch ends.
struct PendingGuard {
    inner: Arc<CacheInner>,
    agent_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.lock().pending.remove(&self.agent_id);
    }
}

impl PrefetchCache {
    #[must_use]
    pub fn new(gateway: Arc<dyn AgentGateway>, on_auth_failure: Option<AuthFailureHandler>) -> Self {
        Self::with_capacity(gateway, on_auth_failure, DEFAULT_CACHE_CAPACITY)
    }

    /// A cache holding at most `capacity` conversations (at least one).
    #[must_use]
    pub fn with_capacity(
        gateway: Arc<dyn AgentGateway>,
        on_auth_failure: Option<AuthFailureHandler>,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                gateway,
                on_auth_failure,
                capacity: capacity.max(1),
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<CacheEntry> {
        self.inner.lock().entries.get(agent_id).cloned()
    }

    #[must_use]
    pub fn contains(&self, agent_id: &str) -> bool {
        self.inner.lock().entries.contains_key(agent_id)
    }

    #[must_use]
    pub fn is_pending(&self, agent_id: &str) -> bool {
        self.inner.lock().pending.contains(agent_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the entry for `agent` with a newer authoritative view.
    pub fn store(&self, agent: Agent, messages: Vec<Message>) {
        self.inner
            .lock()
            .put(CacheEntry { agent, messages }, self.inner.capacity);
    }

    pub fn invalidate(&self, agent_id: &str) {
        self.inner.lock().remove(agent_id);
    }

    /// Drops every cached conversation, e.g. on sign-out.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.entries.clear();
        state.order.clear();
    }

    /// Fire-and-forget prefetch. Returns `None` when nothing was started
    /// because the agent is already cached or being fetched.
    pub fn prefetch(&self, agent: &Agent) -> Option<JoinHandle<PrefetchOutcome>> {
        let guard = match self.claim(&agent.id) {
            Ok(guard) => guard,
            Err(outcome) => {
                tracing::debug!(agent_id = %agent.id, ?outcome, "prefetch skipped");
                return None;
            }
        };
        let cache = self.clone();
        let agent = agent.clone();
        Some(tokio::spawn(async move { cache.fetch(guard, agent).await }))
    }

    pub async fn prefetch_now(&self, agent: &Agent) -> PrefetchOutcome {
        match self.claim(&agent.id) {
            Ok(guard) => self.fetch(guard, agent.clone()).await,
            Err(outcome) => outcome,
        }
    }

    /// Prefetches up to `limit` agents, starting each one `stagger` after the
    /// previous, and waits for all of them.
    pub async fn warm(
        &self,
        agents: &[Agent],
        limit: usize,
        stagger: Duration,
    ) -> Vec<PrefetchOutcome> {
        let runs = agents.iter().take(limit).zip(0u32..).map(|(agent, slot)| async move {
            if slot > 0 {
                tokio::time::sleep(stagger.saturating_mul(slot)).await;
            }
            self.prefetch_now(agent).await
        });
        join_all(runs).await
    }

    /// Background variant of [`warm`](Self::warm).
    pub fn prefetch_many(
        &self,
        agents: Vec<Agent>,
        limit: usize,
        stagger: Duration,
    ) -> JoinHandle<Vec<PrefetchOutcome>> {
        let cache = self.clone();
        tokio::spawn(async move { cache.warm(&agents, limit, stagger).await })
    }

    fn claim(&self, agent_id: &str) -> Result<PendingGuard, PrefetchOutcome> {
        let mut state = self.inner.lock();
        if state.entries.contains_key(agent_id) {
            return Err(PrefetchOutcome::AlreadyCached);
        }
        if !state.pending.insert(agent_id.to_string()) {
            return Err(PrefetchOutcome::InFlight);
        }
        Ok(PendingGuard {
            inner: Arc::clone(&self.inner),
            agent_id: agent_id.to_string(),
        })
    }

    async fn fetch(&self, guard: PendingGuard, agent: Agent) -> PrefetchOutcome {
        let result = self.inner.gateway.get_conversation(&agent.id).await;
        let outcome = match result {
            Ok(messages) => {
                let mut state = self.inner.lock();
                if !state.entries.contains_key(&agent.id) {
                    state.put(CacheEntry { agent, messages }, self.inner.capacity);
                }
                PrefetchOutcome::Stored
            }
            Err(error) => {
                self.report_failure(&agent.id, &error);
                PrefetchOutcome::Failed
            }
        };
        drop(guard);
        outcome
    }

    fn report_failure(&self, agent_id: &str, error: &ApiError) {
        match error {
            ApiError::NotFound { .. } => {
                tracing::debug!(agent_id, "conversation not ready for prefetch");
            }
            ApiError::Auth { .. } => {
                tracing::warn!(agent_id, error = %error, "prefetch rejected credential");
                if let Some(on_auth_failure) = self.inner.on_auth_failure.as_ref() {
                    on_auth_failure();
                }
            }
            _ => tracing::warn!(agent_id, error = %error, "prefetch failed"),
        }
    }
}
