//! Best-effort repository metadata from the source-hosting provider.
//!
//! Only the last-pushed timestamp is consumed. Lookups never fail loudly:
//! any problem is logged and reported as "unknown".

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::timestamp;

pub const DEFAULT_GITHUB_API_BASE_URL: &str = "https://api.github.com";
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait RepositoryMetadataSource: Send + Sync {
    async fn pushed_at(&self, owner: &str, name: &str) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Deserialize)]
struct RepositoryMetadata {
    #[serde(default, with = "timestamp::option")]
    pushed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct GitHubMetadataSource {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl GitHubMetadataSource {
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            token: token
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn public() -> Self {
        Self::new(DEFAULT_GITHUB_API_BASE_URL, None)
    }

    #[must_use]
    pub fn repository_url(&self, owner: &str, name: &str) -> String {
        format!("{}/repos/{}/{}", self.base_url, owner.trim(), name.trim())
    }
}

#[async_trait]
impl RepositoryMetadataSource for GitHubMetadataSource {
    async fn pushed_at(&self, owner: &str, name: &str) -> Option<DateTime<Utc>> {
        if owner.trim().is_empty() || name.trim().is_empty() {
            return None;
        }
        let mut request = self
            .http
            .get(self.repository_url(owner, name))
            .header(reqwest::header::USER_AGENT, "cloud-agent-client")
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .timeout(METADATA_TIMEOUT);
        if let Some(token) = self.token.as_ref() {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(owner, name, error = %error, "repository metadata lookup failed");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(
                owner,
                name,
                status = response.status().as_u16(),
                "repository metadata unavailable"
            );
            return None;
        }
        match response.json::<RepositoryMetadata>().await {
            Ok(metadata) => metadata.pushed_at,
            Err(error) => {
                tracing::warn!(owner, name, error = %error, "repository metadata undecodable");
                None
            }
        }
    }
}
