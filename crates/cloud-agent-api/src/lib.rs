//! Typed, rate-limited access to the remote cloud agent service.

mod client;
mod error;
mod gateway;
pub mod governor;
pub mod metadata;
pub mod mock;
pub mod timestamp;
mod types;

pub use client::{
    ClientConfigError, CloudAgentClientConfig, DEFAULT_BASE_URL, DEFAULT_TIMEOUT_MS,
    ENV_BASE_URL, ENV_MAX_CONCURRENT, ENV_MIN_SPACING_MS, ENV_TIMEOUT_MS, HttpAgentGateway,
    basic_authorization, normalize_base_url,
};
pub use error::ApiError;
pub use gateway::AgentGateway;
pub use governor::{GovernorConfig, GovernorSnapshot, RequestGovernor};
pub use metadata::{GitHubMetadataSource, RepositoryMetadataSource};
pub use mock::{MockAgentGateway, MockEvent, MockOperation};
pub use types::{
    Agent, AgentSource, AgentStatus, AgentTarget, Credential, FollowUpAck, LaunchAgentRequest,
    LifecycleAck, Message, MessageKind, Repository, UserInfo,
};
