use async_trait::async_trait;

use crate::error::ApiError;
use crate::types::{
    Agent, Credential, FollowUpAck, LaunchAgentRequest, LifecycleAck, Message, Repository,
    UserInfo,
};

/// Typed operations against the cloud agent service.
///
/// Implemented by the HTTP client and by the in-memory mock; callers above
/// this trait cannot tell the two apart. Every operation except
/// [`validate_credential`](Self::validate_credential) uses the ambient
/// credential and fails with [`ApiError::Auth`] when none is installed.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    fn set_credential(&self, credential: Option<Credential>);

    fn has_credential(&self) -> bool;

    /// Checks `credential` itself, not the ambient one.
    async fn validate_credential(&self, credential: &Credential) -> Result<UserInfo, ApiError>;

    async fn list_repositories(&self) -> Result<Vec<Repository>, ApiError>;

    /// Up to `limit` agents, most recent first.
    async fn list_agents(&self, limit: usize) -> Result<Vec<Agent>, ApiError>;

    async fn get_agent(&self, agent_id: &str) -> Result<Agent, ApiError>;

    async fn get_conversation(&self, agent_id: &str) -> Result<Vec<Message>, ApiError>;

    async fn launch_agent(&self, request: LaunchAgentRequest) -> Result<Agent, ApiError>;

    /// May fail when the agent no longer accepts follow-ups; callers decide
    /// whether to launch a continuation instead.
    async fn add_follow_up(&self, agent_id: &str, prompt: &str) -> Result<FollowUpAck, ApiError>;

    async fn stop_agent(&self, agent_id: &str) -> Result<LifecycleAck, ApiError>;

    async fn delete_agent(&self, agent_id: &str) -> Result<LifecycleAck, ApiError>;
}
