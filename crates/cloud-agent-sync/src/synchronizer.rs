//! Keeps one agent's conversation in step with the service.
//!
//! A synchronizer tracks at most one agent id at a time. While the agent is
//! active a background task polls it; every state change is published on a
//! `watch` channel as a [`ConversationSnapshot`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cloud_agent_api::{Agent, AgentGateway, ApiError, Message};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::AuthFailureHandler;
use crate::config::SyncConfig;
use crate::merge::{ConversationLog, PendingFollowUp};
use crate::prefetch::PrefetchCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Loading,
    Active,
    Terminal,
    Failed,
    /// Polling hit the wall-clock cap while the agent was still active.
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub agent_id: Option<String>,
    pub phase: SyncPhase,
    pub agent: Option<Agent>,
    pub messages: Vec<Message>,
    pub pending_follow_up: Option<String>,
    pub error: Option<ApiError>,
}

impl ConversationSnapshot {
    fn idle() -> Self {
        Self {
            agent_id: None,
            phase: SyncPhase::Idle,
            agent: None,
            messages: Vec::new(),
            pending_follow_up: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FollowUpError {
    #[error("follow-up text is empty")]
    EmptyText,
    #[error("no conversation is loaded")]
    NoAgent,
    #[error("follow-up rejected: {0}")]
    Rejected(#[source] ApiError),
}

/// Optional collaborators wired into a synchronizer.
#[derive(Clone, Default)]
pub struct SyncHooks {
    pub cache: Option<PrefetchCache>,
    pub on_auth_failure: Option<AuthFailureHandler>,
}

pub struct ConversationSynchronizer {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    gateway: Arc<dyn AgentGateway>,
    config: SyncConfig,
    hooks: SyncHooks,
    state: Mutex<SyncState>,
    /// Serializes refreshes so a manual refresh never overlaps a poll cycle.
    refresh_gate: tokio::sync::Mutex<()>,
    updates: watch::Sender<ConversationSnapshot>,
}

struct SyncState {
    agent_id: Option<String>,
    /// Bumped whenever the tracked agent changes.
    epoch: u64,
    phase: SyncPhase,
    agent: Option<Agent>,
    log: ConversationLog,
    pending: Option<PendingFollowUp>,
    error: Option<ApiError>,
    poll: Option<PollHandle>,
}

struct PollHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct Fetched {
    agent: Result<Agent, ApiError>,
    conversation: Option<Result<Vec<Message>, ApiError>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Applied {
    active: bool,
    errored: bool,
    auth_failure: bool,
}

impl SyncState {
    fn new(max_messages: usize) -> Self {
        Self {
            agent_id: None,
            epoch: 0,
            phase: SyncPhase::Idle,
            agent: None,
            log: ConversationLog::new(max_messages),
            pending: None,
            error: None,
            poll: None,
        }
    }

    fn track(&mut self, agent_id: &str) {
        self.stop_polling();
        self.epoch += 1;
        self.agent_id = Some(agent_id.to_string());
        self.agent = None;
        self.log.reset(&[]);
        self.pending = None;
        self.error = None;
    }

    fn stop_polling(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.token.cancel();
        }
    }

    fn is_polling(&self) -> bool {
        self.poll
            .as_ref()
            .is_some_and(|poll| !poll.token.is_cancelled() && !poll.task.is_finished())
    }

    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            agent_id: self.agent_id.clone(),
            phase: self.phase,
            agent: self.agent.clone(),
            messages: self.log.messages(),
            pending_follow_up: self.pending.as_ref().map(|pending| pending.text.clone()),
            error: self.error.clone(),
        }
    }
}

impl ConversationSynchronizer {
    #[must_use]
    pub fn new(gateway: Arc<dyn AgentGateway>, config: SyncConfig) -> Self {
        Self::with_hooks(gateway, config, SyncHooks::default())
    }

    #[must_use]
    pub fn with_hooks(
        gateway: Arc<dyn AgentGateway>,
        config: SyncConfig,
        hooks: SyncHooks,
    ) -> Self {
        let (updates, _) = watch::channel(ConversationSnapshot::idle());
        let state = SyncState::new(config.max_messages);
        Self {
            inner: Arc::new(SyncInner {
                gateway,
                config,
                hooks,
                state: Mutex::new(state),
                refresh_gate: tokio::sync::Mutex::new(()),
                updates,
            }),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.inner.updates.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.inner.lock().snapshot()
    }

    #[must_use]
    pub fn gateway(&self) -> Arc<dyn AgentGateway> {
        Arc::clone(&self.inner.gateway)
    }

    /// Starts tracking `agent_id`. Switching ids drops everything held for
    /// the previous agent. Polling starts only if the agent is active.
    pub async fn load_conversation(
        &self,
        agent_id: &str,
    ) -> Result<ConversationSnapshot, ApiError> {
        let inner = &self.inner;
        let epoch = {
            let mut state = inner.lock();
            state.stop_polling();
            if state.agent_id.as_deref() != Some(agent_id) {
                state.track(agent_id);
                let cached = inner
                    .hooks
                    .cache
                    .as_ref()
                    .and_then(|cache| cache.get(agent_id));
                if let Some(entry) = cached {
                    state.log.reset(&entry.messages);
                    state.agent = Some(entry.agent);
                }
            }
            state.phase = SyncPhase::Loading;
            inner.publish(&state);
            state.epoch
        };

        let _gate = inner.refresh_gate.lock().await;
        let fetched = inner.fetch(agent_id).await;

        let mut state = inner.lock();
        if state.epoch != epoch {
            return Ok(state.snapshot());
        }
        if let Err(error) = &fetched.agent {
            tracing::debug!(agent_id, error = %error, "agent load failed");
            let error = error.clone();
            state.error = Some(error.clone());
            state.phase = SyncPhase::Failed;
            inner.publish(&state);
            drop(state);
            inner.escalate(&error);
            return Err(error);
        }
        let applied = inner.apply(&mut state, fetched);
        inner.settle(&mut state);
        let snapshot = inner.publish(&state);
        drop(state);
        if applied.auth_failure {
            inner.notify_auth_failure();
        }
        Ok(snapshot)
    }

    /// Fetches the tracked agent now. Resumes polling if the agent is active
    /// and no loop is running.
    pub async fn refresh(&self) -> Result<ConversationSnapshot, ApiError> {
        self.inner.refresh_tracked().await
    }

    /// Sends a follow-up for the tracked agent, showing it as pending until
    /// the service echoes it back.
    pub async fn submit_follow_up(&self, text: &str) -> Result<(), FollowUpError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(FollowUpError::EmptyText);
        }
        let inner = &self.inner;
        let (agent_id, epoch) = {
            let mut state = inner.lock();
            let Some(agent_id) = state.agent_id.clone() else {
                return Err(FollowUpError::NoAgent);
            };
            state.pending = Some(PendingFollowUp::new(text, &state.log));
            inner.publish(&state);
            (agent_id, state.epoch)
        };

        match inner.gateway.add_follow_up(&agent_id, text).await {
            Ok(_) => {
                {
                    let mut state = inner.lock();
                    if state.epoch == epoch {
                        state.stop_polling();
                    }
                }
                if let Err(error) = inner.refresh_tracked().await {
                    tracing::debug!(agent_id, error = %error, "refresh after follow-up failed");
                }
                Ok(())
            }
            Err(error) => {
                {
                    let mut state = inner.lock();
                    if state.epoch == epoch {
                        state.pending = None;
                        state.error = Some(error.clone());
                        inner.publish(&state);
                    }
                }
                inner.escalate(&error);
                Err(FollowUpError::Rejected(error))
            }
        }
    }

    /// Cancels the active poll loop. Safe to call any number of times.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        let was_polling = state.is_polling();
        state.stop_polling();
        if was_polling && state.phase == SyncPhase::Active {
            state.phase = SyncPhase::Idle;
            self.inner.publish(&state);
        }
        if was_polling {
            tracing::info!(agent_id = ?state.agent_id, "polling stopped");
        }
    }
}

impl Drop for ConversationSynchronizer {
    fn drop(&mut self) {
        self.inner.lock().stop_polling();
    }
}

impl SyncInner {
    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &SyncState) -> ConversationSnapshot {
        let snapshot = state.snapshot();
        self.updates.send_replace(snapshot.clone());
        snapshot
    }

    fn escalate(&self, error: &ApiError) {
        if error.is_auth() {
            self.notify_auth_failure();
        }
    }

    fn notify_auth_failure(&self) {
        if let Some(on_auth_failure) = self.hooks.on_auth_failure.as_ref() {
            on_auth_failure();
        }
    }

    async fn fetch(&self, agent_id: &str) -> Fetched {
        match self.gateway.get_agent(agent_id).await {
            Ok(agent) => Fetched {
                agent: Ok(agent),
                conversation: Some(self.gateway.get_conversation(agent_id).await),
            },
            Err(error) => Fetched {
                agent: Err(error),
                conversation: None,
            },
        }
    }

    fn apply(&self, state: &mut SyncState, fetched: Fetched) -> Applied {
        let mut applied = Applied::default();
        match fetched.agent {
            Err(error) => {
                applied.errored = true;
                applied.auth_failure = error.is_auth();
                state.error = Some(error);
            }
            Ok(agent) => {
                state.error = None;
                let mut conversation_fetched = false;
                match fetched.conversation {
                    Some(Ok(messages)) => {
                        let appended = state.log.merge(&messages);
                        if appended > 0 {
                            tracing::debug!(agent_id = %agent.id, appended, "conversation advanced");
                        }
                        conversation_fetched = true;
                    }
                    Some(Err(ApiError::NotFound { .. })) | None => {}
                    Some(Err(error)) => {
                        applied.errored = true;
                        applied.auth_failure = error.is_auth();
                        state.error = Some(error);
                    }
                }
                if conversation_fetched {
                    if let Some(cache) = self.hooks.cache.as_ref() {
                        cache.store(agent.clone(), state.log.messages());
                    }
                }
                state.agent = Some(agent);
            }
        }
        if state
            .pending
            .as_ref()
            .is_some_and(|pending| pending.is_resolved_by(&state.log))
        {
            state.pending = None;
        }
        applied.active = state.agent.as_ref().is_none_or(Agent::is_active);
        applied
    }

    /// Picks the phase after an out-of-loop refresh and (re)starts polling
    /// when the agent is active.
    fn settle(self: &Arc<Self>, state: &mut SyncState) {
        match state.agent.as_ref().map(Agent::is_active) {
            Some(true) => {
                if !state.is_polling() {
                    self.start_polling(state);
                }
                state.phase = SyncPhase::Active;
            }
            Some(false) => {
                state.stop_polling();
                state.phase = SyncPhase::Terminal;
            }
            None => state.phase = SyncPhase::Failed,
        }
    }

    fn start_polling(self: &Arc<Self>, state: &mut SyncState) {
        state.stop_polling();
        let Some(agent_id) = state.agent_id.clone() else {
            return;
        };
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).poll_loop(agent_id, state.epoch, token.clone()));
        state.poll = Some(PollHandle { token, task });
    }

    async fn refresh_tracked(self: &Arc<Self>) -> Result<ConversationSnapshot, ApiError> {
        let Some((agent_id, epoch)) = ({
            let state = self.lock();
            state.agent_id.clone().map(|agent_id| (agent_id, state.epoch))
        }) else {
            return Ok(self.lock().snapshot());
        };

        let _gate = self.refresh_gate.lock().await;
        let fetched = self.fetch(&agent_id).await;
        let agent_error = fetched.agent.as_ref().err().cloned();

        let mut state = self.lock();
        if state.epoch != epoch {
            return Ok(state.snapshot());
        }
        let applied = self.apply(&mut state, fetched);
        self.settle(&mut state);
        let snapshot = self.publish(&state);
        drop(state);
        if applied.auth_failure {
            self.notify_auth_failure();
        }
        match agent_error {
            Some(error) => Err(error),
            None => Ok(snapshot),
        }
    }

    async fn poll_loop(self: Arc<Self>, agent_id: String, epoch: u64, token: CancellationToken) {
        let deadline = Instant::now() + self.config.max_poll_duration;
        let mut delay = self.config.poll_interval;
        tracing::info!(agent_id = %agent_id, "polling started");

        loop {
            if Instant::now() >= deadline {
                self.pause(&agent_id, epoch, &token);
                break;
            }
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            let applied = tokio::select! {
                biased;
                () = token.cancelled() => break,
                applied = self.poll_once(&agent_id, epoch, &token) => applied,
            };
            let Some(applied) = applied else {
                break;
            };
            if applied.auth_failure {
                self.notify_auth_failure();
            }
            if !applied.active {
                tracing::info!(
                    agent_id = %agent_id,
                    "agent reached terminal status; polling stopped"
                );
                break;
            }
            delay = if applied.errored {
                self.config.error_poll_interval
            } else {
                self.config.poll_interval
            };
        }
    }

    async fn poll_once(
        &self,
        agent_id: &str,
        epoch: u64,
        token: &CancellationToken,
    ) -> Option<Applied> {
        let _gate = self.refresh_gate.lock().await;
        let fetched = self.fetch(agent_id).await;

        let mut state = self.lock();
        if state.epoch != epoch || token.is_cancelled() {
            return None;
        }
        let applied = self.apply(&mut state, fetched);
        if let Some(error) = state.error.as_ref() {
            tracing::debug!(agent_id, error = %error, "poll refresh failed");
        }
        if !applied.active {
            state.phase = SyncPhase::Terminal;
        }
        self.publish(&state);
        Some(applied)
    }

    fn pause(&self, agent_id: &str, epoch: u64, token: &CancellationToken) {
        let mut state = self.lock();
        if state.epoch != epoch || token.is_cancelled() {
            return;
        }
        tracing::warn!(
            agent_id,
            max_secs = self.config.max_poll_duration.as_secs(),
            "poll duration cap reached; polling paused"
        );
        state.poll = None;
        state.phase = SyncPhase::Paused;
        self.publish(&state);
    }
}
