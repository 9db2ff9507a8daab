use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timestamp;

/// Opaque bearer credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Creating,
    Running,
    Finished,
    Error,
    Expired,
    Stopped,
}

impl AgentStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
            Self::Expired => "EXPIRED",
            Self::Stopped => "STOPPED",
        }
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Creating | Self::Running)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSource {
    pub repository: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub auto_create_pr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: AgentStatus,
    pub source: AgentSource,
    #[serde(default)]
    pub target: AgentTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Agent {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    UserMessage,
    AssistantMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub text: String,
}

impl Message {
    #[must_use]
    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::UserMessage,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn assistant(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::AssistantMessage,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn is_user(&self) -> bool {
        self.kind == MessageKind::UserMessage
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub owner: String,
    pub name: String,
    pub repository: String,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub pushed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub api_key_name: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub user_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchAgentRequest {
    pub prompt: String,
    pub repository: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpAck {
    pub id: String,
}

/// Outcome of a terminal lifecycle action. Repeating a stop or delete that
/// already took effect yields `AlreadyApplied` instead of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAck {
    Applied,
    AlreadyApplied,
}

#[derive(Debug, Serialize)]
pub(crate) struct PromptBody<'a> {
    pub text: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct LaunchSourceBody<'a> {
    pub repository: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LaunchTargetBody {
    pub auto_create_pr: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct LaunchAgentBody<'a> {
    pub prompt: PromptBody<'a>,
    pub source: LaunchSourceBody<'a>,
    pub target: LaunchTargetBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<&'a str>,
}

impl<'a> LaunchAgentBody<'a> {
    pub(crate) fn from_request(request: &'a LaunchAgentRequest) -> Self {
        Self {
            prompt: PromptBody {
                text: request.prompt.as_str(),
            },
            source: LaunchSourceBody {
                repository: request.repository.as_str(),
            },
            target: LaunchTargetBody {
                auto_create_pr: true,
            },
            model: request.model.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct FollowUpBody<'a> {
    pub prompt: PromptBody<'a>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AgentsEnvelope {
    pub agents: Vec<Agent>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RepositoriesEnvelope {
    pub repositories: Vec<Repository>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ConversationEnvelope {
    pub messages: Vec<Message>,
}
