use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ApiError;
use crate::gateway::AgentGateway;
use crate::governor::{GovernorConfig, RequestGovernor};
use crate::types::{
    Agent, AgentsEnvelope, ConversationEnvelope, Credential, FollowUpAck, FollowUpBody,
    LaunchAgentBody, LaunchAgentRequest, LifecycleAck, Message, PromptBody, RepositoriesEnvelope,
    Repository, UserInfo,
};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8787";
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;
pub const MIN_TIMEOUT_MS: u64 = 250;
pub const ENV_BASE_URL: &str = "CLOUD_AGENT_BASE_URL";
pub const ENV_TIMEOUT_MS: &str = "CLOUD_AGENT_TIMEOUT_MS";
pub const ENV_MAX_CONCURRENT: &str = "CLOUD_AGENT_MAX_CONCURRENT";
pub const ENV_MIN_SPACING_MS: &str = "CLOUD_AGENT_MIN_SPACING_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientConfigError {
    #[error("base url must not be empty")]
    BaseUrlMissing,
    #[error("base url must use http:// or https:// and include a host")]
    InvalidBaseUrl,
    #[error("invalid value for {key}: {message}")]
    InvalidNumber { key: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudAgentClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_concurrent: usize,
    pub min_spacing_ms: u64,
}

impl CloudAgentClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let governor = GovernorConfig::default();
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_concurrent: governor.max_concurrent,
            min_spacing_ms: governor.min_spacing.as_millis() as u64,
        }
    }

    pub fn from_env() -> Result<Self, ClientConfigError> {
        let base_url = env_non_empty(ENV_BASE_URL).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(normalize_base_url(&base_url)?);
        if let Some(raw) = env_non_empty(ENV_TIMEOUT_MS) {
            config.timeout_ms = parse_env_number(ENV_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = env_non_empty(ENV_MAX_CONCURRENT) {
            config.max_concurrent = parse_env_number(ENV_MAX_CONCURRENT, &raw)?;
        }
        if let Some(raw) = env_non_empty(ENV_MIN_SPACING_MS) {
            config.min_spacing_ms = parse_env_number(ENV_MIN_SPACING_MS, &raw)?;
        }
        Ok(config)
    }

    #[must_use]
    pub fn governor_config(&self) -> GovernorConfig {
        GovernorConfig {
            max_concurrent: self.max_concurrent.max(1),
            min_spacing: Duration::from_millis(self.min_spacing_ms),
        }
    }
}

/// Live gateway backed by `reqwest`. Every call goes through one slot of the
/// shared [`RequestGovernor`]; read-only calls are additionally deduplicated
/// per resource path.
#[derive(Clone)]
pub struct HttpAgentGateway {
    inner: Arc<HttpGatewayInner>,
}

struct HttpGatewayInner {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
    governor: RequestGovernor,
    credential: RwLock<Option<Credential>>,
}

impl HttpAgentGateway {
    pub fn new(config: CloudAgentClientConfig) -> Result<Self, ClientConfigError> {
        let governor = RequestGovernor::new(config.governor_config());
        Self::with_governor(config, governor)
    }

    /// Builds a gateway that shares an existing governor, so several clients
    /// share one concurrency limit and request spacing.
    pub fn with_governor(
        config: CloudAgentClientConfig,
        governor: RequestGovernor,
    ) -> Result<Self, ClientConfigError> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            inner: Arc::new(HttpGatewayInner {
                base_url,
                timeout: Duration::from_millis(config.timeout_ms.max(MIN_TIMEOUT_MS)),
                http: reqwest::Client::new(),
                governor,
                credential: RwLock::new(None),
            }),
        })
    }

    #[must_use]
    pub fn governor(&self) -> &RequestGovernor {
        &self.inner.governor
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.inner.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.inner.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn me_path() -> &'static str {
        "/me"
    }

    #[must_use]
    pub fn repositories_path() -> &'static str {
        "/repositories"
    }

    #[must_use]
    pub fn agents_path(limit: usize) -> String {
        format!("/agents?limit={limit}")
    }

    #[must_use]
    pub fn launch_path() -> &'static str {
        "/agents"
    }

    #[must_use]
    pub fn agent_path(agent_id: &str) -> String {
        format!("/agents/{}", agent_id.trim())
    }

    #[must_use]
    pub fn conversation_path(agent_id: &str) -> String {
        format!("/agents/{}/conversation", agent_id.trim())
    }

    #[must_use]
    pub fn follow_up_path(agent_id: &str) -> String {
        format!("/agents/{}/followup", agent_id.trim())
    }

    #[must_use]
    pub fn stop_path(agent_id: &str) -> String {
        format!("/agents/{}/stop", agent_id.trim())
    }

    fn authorization(&self) -> Result<String, ApiError> {
        let credential = self
            .inner
            .credential
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        credential
            .as_ref()
            .map(basic_authorization)
            .ok_or_else(ApiError::missing_credential)
    }

    async fn get_shared<T>(&self, path: String) -> Result<T, ApiError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let authorization = self.authorization()?;
        let client = self.clone();
        let key = format!("GET {path}");
        self.inner
            .governor
            .enqueue_keyed(key, move || async move {
                client
                    .send_json::<T, ()>(Method::GET, &path, &authorization, None)
                    .await
            })
            .await
    }

    async fn send_governed<T, B>(
        &self,
        method: Method,
        path: &str,
        authorization: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.inner
            .governor
            .enqueue(|| self.send_json(method, path, authorization, body))
            .await
    }

    async fn send_json<T, B>(
        &self,
        method: Method,
        path: &str,
        authorization: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let bytes = self.send(method, path, authorization, body).await?;
        serde_json::from_slice::<T>(&bytes).map_err(|error| ApiError::malformed(error.to_string()))
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        authorization: &str,
        body: Option<&B>,
    ) -> Result<Vec<u8>, ApiError>
    where
        B: Serialize + ?Sized,
    {
        let url = self
            .endpoint(path)
            .ok_or_else(|| ApiError::request_failed("invalid request path"))?;
        tracing::debug!(method = %method, path, "cloud agent request");

        let mut request = self
            .inner
            .http
            .request(method, url.as_str())
            .header(AUTHORIZATION, authorization)
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .timeout(self.inner.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| self.transport_error(&error))?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let bytes = response
            .bytes()
            .await
            .map_err(|error| self.transport_error(&error))?;

        if !status.is_success() {
            let error = ApiError::from_status(status, &bytes, retry_after);
            tracing::debug!(path, status = status.as_u16(), error = %error, "cloud agent request failed");
            return Err(error);
        }
        Ok(bytes.to_vec())
    }

    async fn lifecycle(&self, method: Method, path: &str) -> Result<LifecycleAck, ApiError> {
        let authorization = self.authorization()?;
        let outcome = self
            .inner
            .governor
            .enqueue(|| self.send::<()>(method, path, &authorization, None))
            .await;
        match outcome {
            Ok(_) => Ok(LifecycleAck::Applied),
            Err(error) if error.is_not_found() => {
                tracing::debug!(path, "lifecycle action already applied");
                Ok(LifecycleAck::AlreadyApplied)
            }
            Err(error) => Err(error),
        }
    }

    fn transport_error(&self, error: &reqwest::Error) -> ApiError {
        if error.is_timeout() {
            ApiError::TimedOut(self.inner.timeout)
        } else {
            ApiError::request_failed(error.to_string())
        }
    }
}

impl std::fmt::Debug for HttpAgentGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAgentGateway")
            .field("base_url", &self.inner.base_url)
            .field("timeout", &self.inner.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AgentGateway for HttpAgentGateway {
    fn set_credential(&self, credential: Option<Credential>) {
        let mut slot = self
            .inner
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = credential;
        drop(slot);
        // Reads already in flight were authorized with the previous key.
        self.inner.governor.forget_keyed();
    }

    fn has_credential(&self) -> bool {
        self.inner
            .credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn validate_credential(&self, credential: &Credential) -> Result<UserInfo, ApiError> {
        let authorization = basic_authorization(credential);
        self.send_governed::<UserInfo, ()>(Method::GET, Self::me_path(), &authorization, None)
            .await
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, ApiError> {
        let envelope: RepositoriesEnvelope = self
            .get_shared(Self::repositories_path().to_string())
            .await?;
        Ok(envelope.repositories)
    }

    async fn list_agents(&self, limit: usize) -> Result<Vec<Agent>, ApiError> {
        let envelope: AgentsEnvelope = self.get_shared(Self::agents_path(limit)).await?;
        Ok(envelope.agents)
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Agent, ApiError> {
        self.get_shared(Self::agent_path(agent_id)).await
    }

    async fn get_conversation(&self, agent_id: &str) -> Result<Vec<Message>, ApiError> {
        let envelope: ConversationEnvelope =
            self.get_shared(Self::conversation_path(agent_id)).await?;
        Ok(envelope.messages)
    }

    async fn launch_agent(&self, request: LaunchAgentRequest) -> Result<Agent, ApiError> {
        let authorization = self.authorization()?;
        let body = LaunchAgentBody::from_request(&request);
        let agent: Agent = self
            .send_governed(Method::POST, Self::launch_path(), &authorization, Some(&body))
            .await?;
        tracing::info!(agent_id = %agent.id, repository = %request.repository, "launched agent");
        Ok(agent)
    }

    async fn add_follow_up(&self, agent_id: &str, prompt: &str) -> Result<FollowUpAck, ApiError> {
        let authorization = self.authorization()?;
        let body = FollowUpBody {
            prompt: PromptBody { text: prompt },
        };
        self.send_governed(
            Method::POST,
            &Self::follow_up_path(agent_id),
            &authorization,
            Some(&body),
        )
        .await
    }

    async fn stop_agent(&self, agent_id: &str) -> Result<LifecycleAck, ApiError> {
        self.lifecycle(Method::POST, &Self::stop_path(agent_id))
            .await
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<LifecycleAck, ApiError> {
        self.lifecycle(Method::DELETE, &Self::agent_path(agent_id))
            .await
    }
}

/// HTTP Basic with the credential as user name and an empty password.
#[must_use]
pub fn basic_authorization(credential: &Credential) -> String {
    let encoded = BASE64_STANDARD.encode(format!("{}:", credential.expose()));
    format!("Basic {encoded}")
}

pub fn normalize_base_url(raw: &str) -> Result<String, ClientConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ClientConfigError::BaseUrlMissing);
    }
    let Some((scheme, remainder)) = trimmed.split_once("://") else {
        return Err(ClientConfigError::InvalidBaseUrl);
    };
    if !matches!(scheme, "http" | "https") {
        return Err(ClientConfigError::InvalidBaseUrl);
    }
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ClientConfigError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

fn parse_env_number<T>(key: &'static str, raw: &str) -> Result<T, ClientConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| ClientConfigError::InvalidNumber {
            key,
            message: error.to_string(),
        })
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::sync::{Mutex, oneshot};

    use super::*;
    use crate::types::{AgentStatus, MessageKind};

    const GOOD_KEY: &str = "key_good";

    #[derive(Clone, Default)]
    struct StubState {
        agent_hits: Arc<AtomicUsize>,
        bodies: Arc<Mutex<Vec<(String, Value)>>>,
        queries: Arc<Mutex<Vec<String>>>,
    }

    struct AgentApiStub {
        base_url: String,
        state: StubState,
        shutdown: Option<oneshot::Sender<()>>,
    }

    impl AgentApiStub {
        async fn stop(mut self) {
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
        }
    }

    async fn spawn_agent_api_stub() -> Result<AgentApiStub> {
        let state = StubState::default();
        let app = Router::new()
            .route("/v0/me", get(me))
            .route("/v0/repositories", get(repositories))
            .route("/v0/agents", get(list_agents).post(launch_agent))
            .route("/v0/agents/:id", get(get_agent).delete(delete_agent))
            .route("/v0/agents/:id/conversation", get(conversation))
            .route("/v0/agents/:id/followup", post(follow_up))
            .route("/v0/agents/:id/stop", post(stop_agent))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Ok(AgentApiStub {
            base_url: format!("http://{addr}/v0"),
            state,
            shutdown: Some(shutdown_tx),
        })
    }

    fn authorized(headers: &HeaderMap) -> bool {
        let expected = basic_authorization(&Credential::new(GOOD_KEY));
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == expected)
    }

    fn agent_json(id: &str, status: &str, created_at: &str) -> Value {
        json!({
            "id": id,
            "name": format!("agent {id}"),
            "status": status,
            "source": {"repository": "github.com/acme/widgets", "ref": "main"},
            "target": {"branchName": format!("cursor/{id}"), "autoCreatePr": true},
            "createdAt": created_at
        })
    }

    async fn me(headers: HeaderMap) -> impl IntoResponse {
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, "invalid key").into_response();
        }
        Json(json!({
            "apiKeyName": "laptop",
            "createdAt": "2025-01-02T03:04:05.678Z",
            "userEmail": "dev@example.test"
        }))
        .into_response()
    }

    async fn repositories() -> impl IntoResponse {
        tokio::time::sleep(Duration::from_millis(600)).await;
        Json(json!({"repositories": []}))
    }

    async fn list_agents(
        State(state): State<StubState>,
        Query(query): Query<std::collections::HashMap<String, String>>,
    ) -> impl IntoResponse {
        state
            .queries
            .lock()
            .await
            .push(query.get("limit").cloned().unwrap_or_default());
        Json(json!({
            "agents": [
                agent_json("a2", "RUNNING", "2025-03-02T00:00:00.250Z"),
                agent_json("a1", "FINISHED", "2025-03-01T00:00:00Z")
            ]
        }))
    }

    async fn get_agent(
        State(state): State<StubState>,
        Path(id): Path<String>,
    ) -> impl IntoResponse {
        state.agent_hits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        match id.as_str() {
            "gone" => (StatusCode::NOT_FOUND, "agent not found").into_response(),
            "bad-shape" => Json(json!({"id": 1, "status": "RUNNING"})).into_response(),
            "bad-time" => Json(agent_json("bad-time", "RUNNING", "soon")).into_response(),
            _ => Json(agent_json(&id, "RUNNING", "2025-03-01T10:20:30Z")).into_response(),
        }
    }

    async fn conversation(Path(id): Path<String>) -> impl IntoResponse {
        match id.as_str() {
            "limited" => (StatusCode::TOO_MANY_REQUESTS, [(RETRY_AFTER, "30")], "slow down")
                .into_response(),
            "boom" => (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable").into_response(),
            _ => Json(json!({
                "id": id,
                "messages": [
                    {"id": "m1", "type": "userMessage", "text": "add tests"},
                    {"id": "m2", "type": "assistantMessage", "text": "on it"}
                ]
            }))
            .into_response(),
        }
    }

    async fn launch_agent(
        State(state): State<StubState>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        state.bodies.lock().await.push(("launch".to_string(), body));
        Json(agent_json("new", "CREATING", "2025-03-03T00:00:00Z"))
    }

    async fn follow_up(
        State(state): State<StubState>,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        state.bodies.lock().await.push((format!("followup:{id}"), body));
        if id == "expired" {
            return (StatusCode::CONFLICT, "agent does not accept follow-ups").into_response();
        }
        Json(json!({"id": id})).into_response()
    }

    async fn stop_agent(Path(id): Path<String>) -> impl IntoResponse {
        if id == "done" {
            return (StatusCode::CONFLICT, "already stopped").into_response();
        }
        Json(json!({"id": id})).into_response()
    }

    async fn delete_agent(Path(id): Path<String>) -> impl IntoResponse {
        if id == "gone" {
            return (StatusCode::NOT_FOUND, "").into_response();
        }
        Json(json!({"id": id})).into_response()
    }

    fn gateway(stub: &AgentApiStub) -> Result<HttpAgentGateway> {
        let mut config = CloudAgentClientConfig::new(stub.base_url.clone());
        config.min_spacing_ms = 0;
        let gateway = HttpAgentGateway::new(config)?;
        gateway.set_credential(Some(Credential::new(GOOD_KEY)));
        Ok(gateway)
    }

    #[test]
    fn endpoint_builder_normalizes_paths() -> Result<()> {
        let gateway = HttpAgentGateway::new(CloudAgentClientConfig::new(
            "https://api.example.test/v0/",
        ))?;
        assert_eq!(
            gateway.endpoint("/agents"),
            Some("https://api.example.test/v0/agents".to_string())
        );
        assert_eq!(
            gateway.endpoint("agents"),
            Some("https://api.example.test/v0/agents".to_string())
        );
        assert_eq!(gateway.endpoint(" "), None);
        Ok(())
    }

    #[test]
    fn path_helpers_are_deterministic() {
        assert_eq!(HttpAgentGateway::agents_path(20), "/agents?limit=20");
        assert_eq!(HttpAgentGateway::agent_path(" a1 "), "/agents/a1");
        assert_eq!(
            HttpAgentGateway::conversation_path("a1"),
            "/agents/a1/conversation"
        );
        assert_eq!(HttpAgentGateway::follow_up_path("a1"), "/agents/a1/followup");
        assert_eq!(HttpAgentGateway::stop_path("a1"), "/agents/a1/stop");
    }

    #[test]
    fn basic_authorization_uses_empty_password() {
        assert_eq!(
            basic_authorization(&Credential::new("key_123")),
            "Basic a2V5XzEyMzo="
        );
    }

    #[test]
    fn base_url_must_be_http_with_host() {
        assert_eq!(
            normalize_base_url("  "),
            Err(ClientConfigError::BaseUrlMissing)
        );
        assert_eq!(
            normalize_base_url("ftp://example.test"),
            Err(ClientConfigError::InvalidBaseUrl)
        );
        assert_eq!(
            normalize_base_url("https:///v0"),
            Err(ClientConfigError::InvalidBaseUrl)
        );
        assert_eq!(
            normalize_base_url("https://api.example.test/v0//"),
            Ok("https://api.example.test/v0".to_string())
        );
    }

    #[tokio::test]
    async fn validate_credential_uses_the_given_key() -> Result<()> {
        let stub = spawn_agent_api_stub().await?;
        let gateway = HttpAgentGateway::new(CloudAgentClientConfig::new(stub.base_url.clone()))?;

        let info = gateway
            .validate_credential(&Credential::new(GOOD_KEY))
            .await?;
        assert_eq!(info.api_key_name, "laptop");
        assert_eq!(info.user_email.as_deref(), Some("dev@example.test"));

        let rejected = gateway
            .validate_credential(&Credential::new("key_bad"))
            .await;
        assert!(matches!(rejected, Err(ApiError::Auth { .. })));
        assert!(!gateway.has_credential());

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_request() -> Result<()> {
        let stub = spawn_agent_api_stub().await?;
        let gateway = HttpAgentGateway::new(CloudAgentClientConfig::new(stub.base_url.clone()))?;

        let result = gateway.get_agent("a1").await;
        assert!(matches!(result, Err(ApiError::Auth { .. })));
        assert_eq!(stub.state.agent_hits.load(Ordering::SeqCst), 0);

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn decodes_agents_with_either_timestamp_precision() -> Result<()> {
        let stub = spawn_agent_api_stub().await?;
        let gateway = gateway(&stub)?;

        let agents = gateway.list_agents(25).await?;
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].status, AgentStatus::Running);
        assert_eq!(agents[1].status, AgentStatus::Finished);
        assert_eq!(stub.state.queries.lock().await.clone(), vec!["25".to_string()]);

        let messages = gateway.get_conversation("a1").await?;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::UserMessage);

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn shape_mismatches_are_malformed_responses() -> Result<()> {
        let stub = spawn_agent_api_stub().await?;
        let gateway = gateway(&stub)?;

        let bad_shape = gateway.get_agent("bad-shape").await;
        assert!(matches!(bad_shape, Err(ApiError::MalformedResponse { .. })));
        let bad_time = gateway.get_agent("bad-time").await;
        assert!(matches!(bad_time, Err(ApiError::MalformedResponse { .. })));

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn status_codes_map_onto_taxonomy() -> Result<()> {
        let stub = spawn_agent_api_stub().await?;
        let gateway = gateway(&stub)?;

        assert!(matches!(
            gateway.get_agent("gone").await,
            Err(ApiError::NotFound { .. })
        ));
        assert_eq!(
            gateway.get_conversation("limited").await,
            Err(ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            })
        );
        assert_eq!(
            gateway.get_conversation("boom").await,
            Err(ApiError::RequestFailed {
                status: Some(500),
                message: "database unavailable".to_string(),
            })
        );
        assert!(matches!(
            gateway.add_follow_up("expired", "more").await,
            Err(ApiError::NotFound { .. })
        ));

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_reads_of_one_agent_share_a_request() -> Result<()> {
        let stub = spawn_agent_api_stub().await?;
        let gateway = gateway(&stub)?;

        let (first, second) = tokio::join!(gateway.get_agent("a1"), gateway.get_agent("a1"));
        assert_eq!(first?, second?);
        assert_eq!(stub.state.agent_hits.load(Ordering::SeqCst), 1);

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn credential_change_does_not_join_earlier_reads() -> Result<()> {
        let stub = spawn_agent_api_stub().await?;
        let gateway = gateway(&stub)?;

        let swapped = {
            let gateway = gateway.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                gateway.set_credential(Some(Credential::new("key_rotated")));
                gateway.get_agent("a1").await
            }
        };
        let (first, second) = tokio::join!(gateway.get_agent("a1"), swapped);
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(stub.state.agent_hits.load(Ordering::SeqCst), 2);

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn launch_and_follow_up_send_expected_bodies() -> Result<()> {
        let stub = spawn_agent_api_stub().await?;
        let gateway = gateway(&stub)?;

        let agent = gateway
            .launch_agent(LaunchAgentRequest {
                prompt: "add tests".to_string(),
                repository: "github.com/acme/widgets".to_string(),
                model: Some("claude-4-sonnet".to_string()),
            })
            .await?;
        assert_eq!(agent.status, AgentStatus::Creating);

        let ack = gateway.add_follow_up("a1", "also docs").await?;
        assert_eq!(ack.id, "a1");

        let bodies = stub.state.bodies.lock().await.clone();
        assert_eq!(
            bodies,
            vec![
                (
                    "launch".to_string(),
                    json!({
                        "prompt": {"text": "add tests"},
                        "source": {"repository": "github.com/acme/widgets"},
                        "target": {"autoCreatePr": true},
                        "model": "claude-4-sonnet"
                    })
                ),
                (
                    "followup:a1".to_string(),
                    json!({"prompt": {"text": "also docs"}})
                ),
            ]
        );

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn lifecycle_actions_are_idempotent() -> Result<()> {
        let stub = spawn_agent_api_stub().await?;
        let gateway = gateway(&stub)?;

        assert_eq!(gateway.stop_agent("a1").await?, LifecycleAck::Applied);
        assert_eq!(gateway.stop_agent("done").await?, LifecycleAck::AlreadyApplied);
        assert_eq!(gateway.delete_agent("a1").await?, LifecycleAck::Applied);
        assert_eq!(
            gateway.delete_agent("gone").await?,
            LifecycleAck::AlreadyApplied
        );

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn slow_responses_time_out_and_release_the_slot() -> Result<()> {
        let stub = spawn_agent_api_stub().await?;
        let mut config = CloudAgentClientConfig::new(stub.base_url.clone());
        config.timeout_ms = MIN_TIMEOUT_MS;
        let gateway = HttpAgentGateway::new(config)?;
        gateway.set_credential(Some(Credential::new(GOOD_KEY)));

        let result = gateway.list_repositories().await;
        assert_eq!(
            result,
            Err(ApiError::TimedOut(Duration::from_millis(MIN_TIMEOUT_MS)))
        );
        assert_eq!(gateway.governor().snapshot().in_flight, 0);

        stub.stop().await;
        Ok(())
    }
}
