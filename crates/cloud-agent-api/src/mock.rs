//! In-memory stand-in for the cloud agent service.
//!
//! Honors the same operation contracts and error taxonomy as
//! [`HttpAgentGateway`](crate::HttpAgentGateway), so the synchronizer,
//! prefetch cache and registry run unchanged against it. Test controls let
//! callers script status changes, inject failures and count calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use crate::error::ApiError;
use crate::gateway::AgentGateway;
use crate::types::{
    Agent, AgentSource, AgentStatus, AgentTarget, Credential, FollowUpAck, LaunchAgentRequest,
    LifecycleAck, Message, Repository, UserInfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    ValidateCredential,
    ListRepositories,
    ListAgents,
    GetAgent,
    GetConversation,
    LaunchAgent,
    AddFollowUp,
    StopAgent,
    DeleteAgent,
}

/// One scripted change, applied on the next `get_agent` for that agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Reply(String),
    Status(AgentStatus),
    Summary(String),
}

#[derive(Default)]
pub struct MockAgentGateway {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    credential: Option<Credential>,
    accepted_keys: HashSet<String>,
    repositories: Vec<Repository>,
    agents: Vec<Agent>,
    conversations: HashMap<String, Vec<Message>>,
    unready: HashSet<String>,
    rejects_follow_ups: HashSet<String>,
    withheld_follow_ups: Option<HashMap<String, Vec<String>>>,
    failures: HashMap<MockOperation, VecDeque<ApiError>>,
    calls: HashMap<MockOperation, usize>,
    scripts: HashMap<String, VecDeque<MockEvent>>,
    script_launches: bool,
    next_agent: u64,
    next_message: u64,
}

impl MockState {
    fn agent_mut(&mut self, agent_id: &str) -> Result<&mut Agent, ApiError> {
        self.agents
            .iter_mut()
            .find(|agent| agent.id == agent_id)
            .ok_or_else(|| ApiError::NotFound {
                message: format!("agent {agent_id} not found"),
            })
    }

    fn push_message(&mut self, agent_id: &str, build: impl FnOnce(String) -> Message) {
        self.next_message += 1;
        let message = build(format!("msg-{}", self.next_message));
        self.conversations
            .entry(agent_id.to_string())
            .or_default()
            .push(message);
    }

    fn advance_script(&mut self, agent_id: &str) {
        let Some(event) = self
            .scripts
            .get_mut(agent_id)
            .and_then(VecDeque::pop_front)
        else {
            return;
        };
        match event {
            MockEvent::Reply(text) => {
                self.push_message(agent_id, |id| Message::assistant(id, text));
            }
            MockEvent::Status(status) => {
                if let Ok(agent) = self.agent_mut(agent_id) {
                    agent.status = status;
                }
            }
            MockEvent::Summary(summary) => {
                if let Ok(agent) = self.agent_mut(agent_id) {
                    agent.summary = Some(summary);
                }
            }
        }
    }
}

impl MockAgentGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A small seeded data set used by the CLI `--mock` mode. Running agents
    /// advance one scripted step per poll until they finish.
    #[must_use]
    pub fn demo() -> Self {
        let now = Utc::now();
        let gateway = Self::new();
        gateway.set_script_launches(true);

        for (owner, name, pushed_days_ago) in [
            ("acme", "widgets", Some(2)),
            ("acme", "gadgets", Some(9)),
            ("octo", "dotfiles", None),
        ] {
            gateway.insert_repository(Repository {
                owner: owner.to_string(),
                name: name.to_string(),
                repository: format!("github.com/{owner}/{name}"),
                pushed_at: pushed_days_ago.map(|days| now - ChronoDuration::days(days)),
            });
        }

        let mut finished = agent_fixture(
            "bc-demo-1",
            "github.com/acme/widgets",
            AgentStatus::Finished,
            now - ChronoDuration::hours(5),
        );
        finished.name = "Add retry to webhook sender".to_string();
        finished.summary = Some("Wrapped webhook delivery in bounded retries.".to_string());
        finished.target.pr_url = Some("https://github.com/acme/widgets/pull/42".to_string());
        gateway.insert_agent(finished);
        gateway.push_message(
            "bc-demo-1",
            Message::user("bc-demo-1-m1", "Add retry to webhook sender"),
        );
        gateway.push_message(
            "bc-demo-1",
            Message::assistant("bc-demo-1-m2", "Added exponential backoff and opened a PR."),
        );

        let mut running = agent_fixture(
            "bc-demo-2",
            "github.com/acme/gadgets",
            AgentStatus::Running,
            now - ChronoDuration::minutes(3),
        );
        running.name = "Fix flaky integration test".to_string();
        gateway.insert_agent(running);
        gateway.push_message(
            "bc-demo-2",
            Message::user("bc-demo-2-m1", "Fix flaky integration test"),
        );
        gateway.script("bc-demo-2", demo_script());

        gateway
    }

    pub fn accept_key(&self, key: impl Into<String>) {
        self.lock().accepted_keys.insert(key.into());
    }

    pub fn insert_repository(&self, repository: Repository) {
        self.lock().repositories.push(repository);
    }

    pub fn insert_agent(&self, agent: Agent) {
        let mut state = self.lock();
        state.agents.retain(|existing| existing.id != agent.id);
        state.agents.push(agent);
    }

    pub fn set_status(&self, agent_id: &str, status: AgentStatus) {
        if let Ok(agent) = self.lock().agent_mut(agent_id) {
            agent.status = status;
        }
    }

    pub fn push_message(&self, agent_id: &str, message: Message) {
        self.lock()
            .conversations
            .entry(agent_id.to_string())
            .or_default()
            .push(message);
    }

    /// While not ready, `get_conversation` answers `NotFound` the way a
    /// freshly created agent does.
    pub fn set_conversation_ready(&self, agent_id: &str, ready: bool) {
        let mut state = self.lock();
        if ready {
            state.unready.remove(agent_id);
        } else {
            state.unready.insert(agent_id.to_string());
        }
    }

    pub fn reject_follow_ups(&self, agent_id: &str) {
        self.lock().rejects_follow_ups.insert(agent_id.to_string());
    }

    /// When withheld, accepted follow-ups are acknowledged but only show up
    /// in the conversation after [`release_follow_ups`](Self::release_follow_ups).
    pub fn withhold_follow_ups(&self) {
        self.lock().withheld_follow_ups = Some(HashMap::new());
    }

    pub fn release_follow_ups(&self, agent_id: &str) {
        let mut state = self.lock();
        let texts = state
            .withheld_follow_ups
            .as_mut()
            .and_then(|withheld| withheld.remove(agent_id))
            .unwrap_or_default();
        for text in texts {
            state.push_message(agent_id, |id| Message::user(id, text));
        }
    }

    /// Queues a one-shot failure for the next call of `operation`.
    pub fn fail_next(&self, operation: MockOperation, error: ApiError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn script(&self, agent_id: &str, events: impl IntoIterator<Item = MockEvent>) {
        self.lock()
            .scripts
            .entry(agent_id.to_string())
            .or_default()
            .extend(events);
    }

    pub fn set_script_launches(&self, enabled: bool) {
        self.lock().script_launches = enabled;
    }

    #[must_use]
    pub fn calls(&self, operation: MockOperation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn conversation(&self, agent_id: &str) -> Vec<Message> {
        self.lock()
            .conversations
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call<T>(
        &self,
        operation: MockOperation,
        requires_credential: bool,
        body: impl FnOnce(&mut MockState) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_insert(0) += 1;
        if let Some(error) = state
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if requires_credential {
            let accepted = match &state.credential {
                Some(credential) => {
                    state.accepted_keys.is_empty()
                        || state.accepted_keys.contains(credential.expose())
                }
                None => false,
            };
            if !accepted {
                return Err(ApiError::missing_credential());
            }
        }
        body(&mut state)
    }
}

#[async_trait]
impl AgentGateway for MockAgentGateway {
    fn set_credential(&self, credential: Option<Credential>) {
        self.lock().credential = credential;
    }

    fn has_credential(&self) -> bool {
        self.lock().credential.is_some()
    }

    async fn validate_credential(&self, credential: &Credential) -> Result<UserInfo, ApiError> {
        self.call(MockOperation::ValidateCredential, false, |state| {
            let key = credential.expose();
            if key.trim().is_empty()
                || (!state.accepted_keys.is_empty() && !state.accepted_keys.contains(key))
            {
                return Err(ApiError::Auth {
                    message: "invalid api key".to_string(),
                });
            }
            Ok(UserInfo {
                api_key_name: "mock".to_string(),
                created_at: fixture_epoch(),
                user_email: Some("demo@example.test".to_string()),
            })
        })
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, ApiError> {
        self.call(MockOperation::ListRepositories, true, |state| {
            Ok(state.repositories.clone())
        })
    }

    async fn list_agents(&self, limit: usize) -> Result<Vec<Agent>, ApiError> {
        self.call(MockOperation::ListAgents, true, |state| {
            let mut agents = state.agents.clone();
            agents.sort_by(|left, right| right.created_at.cmp(&left.created_at));
            agents.truncate(limit);
            Ok(agents)
        })
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Agent, ApiError> {
        self.call(MockOperation::GetAgent, true, |state| {
            state.advance_script(agent_id);
            state.agent_mut(agent_id).cloned()
        })
    }

    async fn get_conversation(&self, agent_id: &str) -> Result<Vec<Message>, ApiError> {
        self.call(MockOperation::GetConversation, true, |state| {
            state.agent_mut(agent_id)?;
            if state.unready.contains(agent_id) {
                return Err(ApiError::NotFound {
                    message: format!("conversation for {agent_id} not ready"),
                });
            }
            Ok(state
                .conversations
                .get(agent_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    async fn launch_agent(&self, request: LaunchAgentRequest) -> Result<Agent, ApiError> {
        self.call(MockOperation::LaunchAgent, true, |state| {
            if request.prompt.trim().is_empty() {
                return Err(ApiError::RequestFailed {
                    status: Some(400),
                    message: "prompt must not be empty".to_string(),
                });
            }
            state.next_agent += 1;
            let id = format!("mock-{}", state.next_agent);
            let mut agent = agent_fixture(
                &id,
                &request.repository,
                AgentStatus::Creating,
                Utc::now(),
            );
            agent.name = request
                .prompt
                .lines()
                .next()
                .unwrap_or_default()
                .chars()
                .take(60)
                .collect();
            agent.model = request.model.clone();
            state.agents.push(agent.clone());
            let prompt = request.prompt.clone();
            state.push_message(&id, |message_id| Message::user(message_id, prompt));
            if state.script_launches {
                state.scripts.insert(id, demo_script().into_iter().collect());
            }
            Ok(agent)
        })
    }

    async fn add_follow_up(&self, agent_id: &str, prompt: &str) -> Result<FollowUpAck, ApiError> {
        self.call(MockOperation::AddFollowUp, true, |state| {
            if state.rejects_follow_ups.contains(agent_id) {
                state.agent_mut(agent_id)?;
                return Err(ApiError::NotFound {
                    message: format!("agent {agent_id} does not accept follow-ups"),
                });
            }
            let agent = state.agent_mut(agent_id)?;
            if agent.is_terminal() {
                agent.status = AgentStatus::Running;
            }
            let text = prompt.to_string();
            match state.withheld_follow_ups.as_mut() {
                Some(withheld) => withheld.entry(agent_id.to_string()).or_default().push(text),
                None => state.push_message(agent_id, |id| Message::user(id, text)),
            }
            Ok(FollowUpAck {
                id: agent_id.to_string(),
            })
        })
    }

    async fn stop_agent(&self, agent_id: &str) -> Result<LifecycleAck, ApiError> {
        self.call(MockOperation::StopAgent, true, |state| {
            match state.agent_mut(agent_id) {
                Ok(agent) if agent.is_active() => {
                    agent.status = AgentStatus::Stopped;
                    Ok(LifecycleAck::Applied)
                }
                _ => Ok(LifecycleAck::AlreadyApplied),
            }
        })
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<LifecycleAck, ApiError> {
        self.call(MockOperation::DeleteAgent, true, |state| {
            let before = state.agents.len();
            state.agents.retain(|agent| agent.id != agent_id);
            state.conversations.remove(agent_id);
            state.scripts.remove(agent_id);
            if state.agents.len() < before {
                Ok(LifecycleAck::Applied)
            } else {
                Ok(LifecycleAck::AlreadyApplied)
            }
        })
    }
}

/// Builds an agent with the fields the service always fills in.
#[must_use]
pub fn agent_fixture(
    id: &str,
    repository: &str,
    status: AgentStatus,
    created_at: DateTime<Utc>,
) -> Agent {
    Agent {
        id: id.to_string(),
        name: format!("agent {id}"),
        status,
        source: AgentSource {
            repository: repository.to_string(),
            git_ref: Some("main".to_string()),
        },
        target: AgentTarget {
            branch_name: Some(format!("agent/{id}")),
            url: None,
            pr_url: None,
            auto_create_pr: true,
        },
        summary: None,
        created_at,
        model: None,
    }
}

fn demo_script() -> Vec<MockEvent> {
    vec![
        MockEvent::Status(AgentStatus::Running),
        MockEvent::Reply("Reading the repository layout.".to_string()),
        MockEvent::Reply("Found the cause; applying a fix.".to_string()),
        MockEvent::Reply("Tests pass. Opening a pull request.".to_string()),
        MockEvent::Summary("Applied the requested change and opened a PR.".to_string()),
        MockEvent::Status(AgentStatus::Finished),
    ]
}

fn fixture_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}
