//! Follow-up with a fallback to launching a continuation agent.
//!
//! The two steps are separate calls. [`try_follow_up`] reports a rejection
//! instead of deciding what to do about it, and the caller chooses whether to
//! [`launch_continuation`].

use cloud_agent_api::{Agent, AgentGateway, ApiError, LaunchAgentRequest};

use crate::synchronizer::{ConversationSynchronizer, FollowUpError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUpAttempt {
    Delivered,
    Rejected {
        agent: Agent,
        prompt: String,
        error: ApiError,
    },
}

impl FollowUpAttempt {
    #[must_use]
    pub fn can_continue(&self) -> bool {
        match self {
            Self::Delivered => false,
            Self::Rejected { error, .. } => is_continuation_eligible(error),
        }
    }
}

/// Credential problems and rate limiting are never worked around by
/// starting another agent.
#[must_use]
pub fn is_continuation_eligible(error: &ApiError) -> bool {
    !matches!(error, ApiError::Auth { .. } | ApiError::RateLimited { .. })
}

pub async fn try_follow_up(
    sync: &ConversationSynchronizer,
    text: &str,
) -> Result<FollowUpAttempt, FollowUpError> {
    match sync.submit_follow_up(text).await {
        Ok(()) => Ok(FollowUpAttempt::Delivered),
        Err(FollowUpError::Rejected(error)) => match sync.snapshot().agent {
            Some(agent) => Ok(FollowUpAttempt::Rejected {
                agent,
                prompt: text.trim().to_string(),
                error,
            }),
            None => Err(FollowUpError::Rejected(error)),
        },
        Err(error) => Err(error),
    }
}

#[must_use]
pub fn continuation_prompt(previous: &Agent, text: &str) -> String {
    let mut prompt = String::from("Continue the work of a previous agent on this repository.\n");
    if !previous.name.trim().is_empty() {
        prompt.push_str(&format!("\nPrevious task: {}\n", previous.name.trim()));
    }
    if let Some(branch) = previous.target.branch_name.as_deref() {
        prompt.push_str(&format!("Branch: {branch}\n"));
    }
    if let Some(pr_url) = previous.target.pr_url.as_deref() {
        prompt.push_str(&format!("Pull request: {pr_url}\n"));
    }
    if let Some(summary) = previous
        .summary
        .as_deref()
        .map(str::trim)
        .filter(|summary| !summary.is_empty())
    {
        prompt.push_str(&format!("\nSummary of what was done:\n{summary}\n"));
    }
    prompt.push_str(&format!("\nNew request:\n{}", text.trim()));
    prompt
}

/// Launches a fresh agent on `previous`'s repository carrying its context.
/// Falls back to the previous agent's model when `model` is `None`.
pub async fn launch_continuation(
    gateway: &dyn AgentGateway,
    previous: &Agent,
    text: &str,
    model: Option<String>,
) -> Result<Agent, ApiError> {
    let request = LaunchAgentRequest {
        prompt: continuation_prompt(previous, text),
        repository: previous.source.repository.clone(),
        model: model.or_else(|| previous.model.clone()),
    };
    let agent = gateway.launch_agent(request).await?;
    tracing::info!(
        previous_id = %previous.id,
        agent_id = %agent.id,
        "continuation agent launched"
    );
    Ok(agent)
}
