use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use cloud_agent_api::{
    Agent, AgentGateway, AgentStatus, CloudAgentClientConfig, Credential, GitHubMetadataSource,
    HttpAgentGateway, LaunchAgentRequest, LifecycleAck, MockAgentGateway,
    RepositoryMetadataSource, normalize_base_url,
};
use cloud_agent_sync::{
    ConversationSnapshot, ConversationSynchronizer, CredentialStore, FileCredentialStore,
    FollowUpAttempt, MemoryCredentialStore, PrefetchCache, PrefetchOutcome, RepositoryRegistry,
    Session, SyncConfig, SyncHooks, SyncPhase, is_continuation_eligible, launch_continuation,
    repository_key, resolve_credential_path, try_follow_up,
};

const MOCK_KEY: &str = "mock-key";
const DEFAULT_AGENT_LIMIT: usize = 20;
const REGISTRY_AGENT_LIMIT: usize = 100;

#[derive(Parser, Debug)]
#[command(name = "cloud-agent")]
#[command(about = "Launch, follow and manage cloud coding agents")]
pub struct CloudAgentCli {
    /// Service base URL (overrides CLOUD_AGENT_BASE_URL)
    #[arg(long, global = true)]
    pub base_url: Option<String>,
    /// Use the in-memory demo service instead of the network
    #[arg(long, global = true)]
    pub mock: bool,
    /// Credential file (overrides CLOUD_AGENT_CREDENTIAL_PATH)
    #[arg(long, global = true)]
    pub credential_path: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Validate an API key and store it
    Login { key: String },
    /// Forget the stored API key
    Logout,
    /// Show the key the service sees
    Whoami,
    /// List repositories, most recently used first
    Repos {
        /// Previously selected repository to keep as the default
        #[arg(long)]
        persisted: Option<String>,
    },
    /// List recent agents
    Agents {
        #[arg(long, default_value_t = DEFAULT_AGENT_LIMIT)]
        limit: usize,
    },
    /// Print an agent and its conversation
    Show { id: String },
    /// Follow an agent's conversation until it finishes
    Watch { id: String },
    /// Start a new agent
    Launch {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        model: Option<String>,
        prompt: String,
    },
    /// Send a follow-up to an agent
    FollowUp {
        id: String,
        text: String,
        /// Launch a continuation agent if the follow-up is rejected
        #[arg(long = "continue")]
        continue_on_reject: bool,
    },
    /// Stop a running agent
    Stop { id: String },
    /// Delete an agent
    Delete { id: String },
    /// Warm the conversation cache for recent agents
    Prefetch {
        #[arg(long)]
        limit: Option<usize>,
    },
}

pub async fn run() -> Result<()> {
    let cli = CloudAgentCli::parse();
    let app = App::from_cli(&cli)?;
    app.execute(cli.command, &mut std::io::stdout()).await
}

pub struct App {
    gateway: Arc<dyn AgentGateway>,
    session: Session,
    sync_config: SyncConfig,
    metadata: Option<Arc<dyn RepositoryMetadataSource>>,
}

impl App {
    pub fn from_cli(cli: &CloudAgentCli) -> Result<Self> {
        let sync_config = SyncConfig::from_env().context("invalid sync configuration")?;
        if cli.mock {
            return Ok(Self::mock(sync_config));
        }

        let mut config = CloudAgentClientConfig::from_env().context("invalid client configuration")?;
        if let Some(base_url) = cli.base_url.as_deref() {
            config.base_url = normalize_base_url(base_url).context("invalid --base-url")?;
        }
        let gateway: Arc<dyn AgentGateway> =
            Arc::new(HttpAgentGateway::new(config).context("failed to build gateway")?);
        let path = match cli.credential_path.clone() {
            Some(path) => path,
            None => resolve_credential_path()?,
        };
        let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::new(path));
        let session = Session::new(Arc::clone(&gateway), store);
        session.restore().context("failed to read stored credential")?;
        Ok(Self {
            gateway,
            session,
            sync_config,
            metadata: Some(Arc::new(GitHubMetadataSource::public())),
        })
    }

    /// Demo data set, already signed in.
    #[must_use]
    pub fn mock(sync_config: SyncConfig) -> Self {
        let gateway: Arc<dyn AgentGateway> = Arc::new(MockAgentGateway::demo());
        let store: Arc<dyn CredentialStore> =
            Arc::new(MemoryCredentialStore::new(Some(Credential::new(MOCK_KEY))));
        let session = Session::new(Arc::clone(&gateway), store);
        if let Err(error) = session.restore() {
            tracing::warn!(error = %error, "mock credential not installed");
        }
        Self {
            gateway,
            session,
            sync_config,
            metadata: None,
        }
    }

    pub async fn execute(&self, command: Command, out: &mut dyn Write) -> Result<()> {
        match command {
            Command::Login { key } => {
                let user = self.session.sign_in(&key).await.context("sign in failed")?;
                let who = user.user_email.as_deref().unwrap_or(&user.api_key_name);
                writeln!(out, "Signed in as {who} (key \"{}\")", user.api_key_name)?;
            }
            Command::Logout => {
                self.session.sign_out()?;
                writeln!(out, "Signed out")?;
            }
            Command::Whoami => {
                self.require_session()?;
                let user = self.session.whoami().await?;
                writeln!(out, "key:     {}", user.api_key_name)?;
                writeln!(out, "email:   {}", user.user_email.as_deref().unwrap_or("-"))?;
                writeln!(out, "created: {}", user.created_at.format("%Y-%m-%d %H:%M"))?;
            }
            Command::Repos { persisted } => {
                self.require_session()?;
                self.repos(persisted.as_deref(), out).await?;
            }
            Command::Agents { limit } => {
                self.require_session()?;
                let agents = self.gateway.list_agents(limit).await?;
                if agents.is_empty() {
                    writeln!(out, "No agents")?;
                }
                for agent in &agents {
                    writeln!(out, "{}", agent_line(agent))?;
                }
            }
            Command::Show { id } => {
                self.require_session()?;
                let sync = self.synchronizer();
                let snapshot = sync.load_conversation(&id).await?;
                sync.stop();
                TranscriptPrinter::default().render(&snapshot, out)?;
            }
            Command::Watch { id } => {
                self.require_session()?;
                self.watch(&id, out).await?;
            }
            Command::Launch {
                repo,
                model,
                prompt,
            } => {
                self.require_session()?;
                let agent = self
                    .gateway
                    .launch_agent(LaunchAgentRequest {
                        prompt,
                        repository: repo,
                        model,
                    })
                    .await?;
                writeln!(out, "Launched {} ({})", agent.id, agent.status)?;
            }
            Command::FollowUp {
                id,
                text,
                continue_on_reject,
            } => {
                self.require_session()?;
                self.follow_up(&id, &text, continue_on_reject, out).await?;
            }
            Command::Stop { id } => {
                self.require_session()?;
                match self.gateway.stop_agent(&id).await? {
                    LifecycleAck::Applied => writeln!(out, "Stopped {id}")?,
                    LifecycleAck::AlreadyApplied => writeln!(out, "{id} was not running")?,
                }
            }
            Command::Delete { id } => {
                self.require_session()?;
                match self.gateway.delete_agent(&id).await? {
                    LifecycleAck::Applied => writeln!(out, "Deleted {id}")?,
                    LifecycleAck::AlreadyApplied => writeln!(out, "{id} was already gone")?,
                }
            }
            Command::Prefetch { limit } => {
                self.require_session()?;
                self.prefetch(limit, out).await?;
            }
        }
        Ok(())
    }

    fn require_session(&self) -> Result<()> {
        if !self.session.is_signed_in() {
            bail!("not signed in; run `cloud-agent login <key>` first");
        }
        Ok(())
    }

    fn synchronizer(&self) -> ConversationSynchronizer {
        ConversationSynchronizer::with_hooks(
            Arc::clone(&self.gateway),
            self.sync_config.clone(),
            SyncHooks {
                cache: None,
                on_auth_failure: Some(self.session.auth_failure_callback()),
            },
        )
    }

    async fn repos(&self, persisted: Option<&str>, out: &mut dyn Write) -> Result<()> {
        let repositories = self.gateway.list_repositories().await?;
        let agents = match self.gateway.list_agents(REGISTRY_AGENT_LIMIT).await {
            Ok(agents) => agents,
            Err(error) => {
                tracing::warn!(error = %error, "run history unavailable; ranking by push time");
                Vec::new()
            }
        };
        let mut registry = RepositoryRegistry::build(repositories, &agents);
        if let Some(metadata) = self.metadata.as_ref() {
            registry
                .enrich_missing_pushed_at(
                    metadata.as_ref(),
                    self.sync_config.metadata_batch_size,
                    self.sync_config.metadata_batch_delay,
                )
                .await;
        }
        if registry.is_empty() {
            writeln!(out, "No repositories")?;
            return Ok(());
        }

        let selected = registry.default_selection(persisted).map(|entry| entry.key.clone());
        for entry in registry.ranked() {
            let marker = if selected.as_deref() == Some(entry.key.as_str()) {
                '*'
            } else {
                ' '
            };
            let last_used = entry
                .last_used
                .map_or_else(|| "-".to_string(), |at| at.format("%Y-%m-%d").to_string());
            let pushed = entry
                .repository
                .pushed_at
                .map_or_else(|| "-".to_string(), |at| at.format("%Y-%m-%d").to_string());
            writeln!(
                out,
                "{marker} {:<32} runs {:>3}  used {last_used:<10}  pushed {pushed}",
                entry.key, entry.runs
            )?;
        }
        Ok(())
    }

    async fn watch(&self, agent_id: &str, out: &mut dyn Write) -> Result<()> {
        let sync = self.synchronizer();
        let mut updates = sync.subscribe();
        let mut printer = TranscriptPrinter::default();
        let mut snapshot = sync.load_conversation(agent_id).await?;
        printer.render(&snapshot, out)?;

        while snapshot.phase == SyncPhase::Active {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    snapshot = updates.borrow_and_update().clone();
                    printer.render(&snapshot, out)?;
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        sync.stop();
        if snapshot.phase == SyncPhase::Paused {
            writeln!(out, "Stopped watching after the polling time limit")?;
        }
        Ok(())
    }

    async fn follow_up(
        &self,
        agent_id: &str,
        text: &str,
        continue_on_reject: bool,
        out: &mut dyn Write,
    ) -> Result<()> {
        let sync = self.synchronizer();
        sync.load_conversation(agent_id).await?;
        let attempt = try_follow_up(&sync, text).await;
        sync.stop();

        match attempt? {
            FollowUpAttempt::Delivered => {
                writeln!(out, "Follow-up delivered to {agent_id}")?;
            }
            FollowUpAttempt::Rejected {
                agent,
                prompt,
                error,
            } => {
                let can_continue = is_continuation_eligible(&error);
                if !continue_on_reject || !can_continue {
                    let hint = if can_continue {
                        "; pass --continue to launch a continuation agent"
                    } else {
                        ""
                    };
                    bail!("follow-up rejected: {error}{hint}");
                }
                let continuation =
                    launch_continuation(self.gateway.as_ref(), &agent, &prompt, None).await?;
                writeln!(
                    out,
                    "Follow-up rejected ({error}); launched continuation {} ({})",
                    continuation.id, continuation.status
                )?;
            }
        }
        Ok(())
    }

    async fn prefetch(&self, limit: Option<usize>, out: &mut dyn Write) -> Result<()> {
        let limit = limit.unwrap_or(self.sync_config.prefetch_warm_limit);
        let agents = self.gateway.list_agents(limit).await?;
        let cache = PrefetchCache::with_capacity(
            Arc::clone(&self.gateway),
            Some(self.session.auth_failure_callback()),
            self.sync_config.prefetch_capacity,
        );
        let outcomes = cache
            .warm(&agents, limit, self.sync_config.prefetch_stagger)
            .await;
        for (agent, outcome) in agents.iter().zip(outcomes) {
            let detail = match outcome {
                PrefetchOutcome::Stored => cache.get(&agent.id).map_or_else(
                    || "cached".to_string(),
                    |entry| format!("{} messages", entry.messages.len()),
                ),
                PrefetchOutcome::AlreadyCached => "already cached".to_string(),
                PrefetchOutcome::InFlight => "in flight".to_string(),
                PrefetchOutcome::Failed => "not available yet".to_string(),
            };
            writeln!(out, "{:<20} {detail}", agent.id)?;
        }
        Ok(())
    }
}

fn agent_line(agent: &Agent) -> String {
    format!(
        "{:<20} {:<8} {:<24} {}  {}",
        agent.id,
        agent.status,
        repository_key(&agent.source.repository),
        agent.created_at.format("%Y-%m-%d %H:%M"),
        agent.name
    )
}

/// Prints each message once, plus status changes and errors as they occur.
#[derive(Default)]
struct TranscriptPrinter {
    printed: HashSet<String>,
    status: Option<AgentStatus>,
    error: Option<String>,
    pending: Option<String>,
}

impl TranscriptPrinter {
    fn render(&mut self, snapshot: &ConversationSnapshot, out: &mut dyn Write) -> Result<()> {
        if let Some(agent) = snapshot.agent.as_ref() {
            if self.status.is_none() {
                writeln!(out, "{}", agent_line(agent))?;
            }
            if self.status != Some(agent.status) {
                writeln!(out, "[{}]", agent.status)?;
                self.status = Some(agent.status);
            }
        }
        for message in &snapshot.messages {
            if self.printed.insert(message.id.clone()) {
                let speaker = if message.is_user() { "you" } else { "agent" };
                writeln!(out, "{speaker}: {}", message.text)?;
            }
        }
        if snapshot.pending_follow_up != self.pending {
            if let Some(pending) = snapshot.pending_follow_up.as_deref() {
                writeln!(out, "you (sending): {pending}")?;
            }
            self.pending.clone_from(&snapshot.pending_follow_up);
        }
        let error = snapshot.error.as_ref().map(ToString::to_string);
        if error != self.error {
            if let Some(error) = error.as_deref() {
                writeln!(out, "! {error}")?;
            }
            self.error = error;
        }
        if snapshot.phase == SyncPhase::Terminal {
            if let Some(agent) = snapshot.agent.as_ref() {
                if let Some(summary) = agent.summary.as_deref() {
                    writeln!(out, "summary: {summary}")?;
                }
                if let Some(pr_url) = agent.target.pr_url.as_deref() {
                    writeln!(out, "pull request: {pr_url}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use clap::error::ErrorKind;

    use super::*;

    async fn run_mock(app: &App, command: Command) -> Result<String> {
        let mut out = Vec::new();
        app.execute(command, &mut out).await?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn cli_requires_subcommand() {
        let kind = CloudAgentCli::try_parse_from(["cloud-agent"])
            .err()
            .map(|err| err.kind());
        assert_eq!(
            kind,
            Some(ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand)
        );
    }

    #[test]
    fn cli_rejects_unknown_subcommand() {
        let kind = CloudAgentCli::try_parse_from(["cloud-agent", "unknown-subcommand"])
            .err()
            .map(|err| err.kind());
        assert_eq!(kind, Some(ErrorKind::InvalidSubcommand));
    }

    #[test]
    fn global_flags_parse_after_the_subcommand() -> Result<()> {
        let cli = CloudAgentCli::try_parse_from([
            "cloud-agent",
            "follow-up",
            "bc-1",
            "add tests",
            "--continue",
            "--mock",
        ])?;
        assert!(cli.mock);
        assert_eq!(
            cli.command,
            Command::FollowUp {
                id: "bc-1".to_string(),
                text: "add tests".to_string(),
                continue_on_reject: true,
            }
        );

        let cli = CloudAgentCli::try_parse_from([
            "cloud-agent",
            "--base-url",
            "https://agents.example.test",
            "launch",
            "--repo",
            "acme/widgets",
            "fix the build",
        ])?;
        assert_eq!(cli.base_url.as_deref(), Some("https://agents.example.test"));
        assert!(matches!(cli.command, Command::Launch { model: None, .. }));
        Ok(())
    }

    #[test]
    fn agents_limit_has_a_default() -> Result<()> {
        let cli = CloudAgentCli::try_parse_from(["cloud-agent", "agents"])?;
        assert_eq!(
            cli.command,
            Command::Agents {
                limit: DEFAULT_AGENT_LIMIT
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn mock_lists_agents_and_ranks_repositories() -> Result<()> {
        let app = App::mock(SyncConfig::default());

        let agents = run_mock(&app, Command::Agents { limit: 10 }).await?;
        let lines: Vec<&str> = agents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("bc-demo-2"));

        let repos = run_mock(&app, Command::Repos { persisted: None }).await?;
        let keys: Vec<&str> = repos
            .lines()
            .filter_map(|line| line.get(2..).and_then(|rest| rest.split_whitespace().next()))
            .collect();
        assert_eq!(keys, vec!["acme/gadgets", "acme/widgets", "octo/dotfiles"]);
        assert!(repos.lines().next().is_some_and(|line| line.starts_with('*')));

        let repos = run_mock(
            &app,
            Command::Repos {
                persisted: Some("octo/dotfiles".to_string()),
            },
        )
        .await?;
        assert!(repos.lines().any(|line| line.starts_with("* octo/dotfiles")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn mock_watch_follows_agent_to_completion() -> Result<()> {
        let app = App::mock(SyncConfig::default());
        let transcript = run_mock(&app, Command::Watch { id: "bc-demo-2".to_string() }).await?;
        assert!(transcript.contains("you: Fix flaky integration test"));
        assert!(transcript.contains("agent: Tests pass. Opening a pull request."));
        assert!(transcript.contains("[FINISHED]"));
        assert!(transcript.contains("summary: Applied the requested change"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn mock_follow_up_and_lifecycle() -> Result<()> {
        let app = App::mock(SyncConfig::default());

        let output = run_mock(
            &app,
            Command::FollowUp {
                id: "bc-demo-1".to_string(),
                text: "also add metrics".to_string(),
                continue_on_reject: false,
            },
        )
        .await?;
        assert_eq!(output.trim(), "Follow-up delivered to bc-demo-1");

        let shown = run_mock(&app, Command::Show { id: "bc-demo-1".to_string() }).await?;
        assert!(shown.contains("you: also add metrics"));

        let stopped = run_mock(&app, Command::Stop { id: "bc-demo-1".to_string() }).await?;
        assert_eq!(stopped.trim(), "Stopped bc-demo-1");
        let again = run_mock(&app, Command::Stop { id: "bc-demo-1".to_string() }).await?;
        assert_eq!(again.trim(), "bc-demo-1 was not running");

        let deleted = run_mock(&app, Command::Delete { id: "bc-demo-1".to_string() }).await?;
        assert_eq!(deleted.trim(), "Deleted bc-demo-1");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn mock_prefetch_reports_each_agent() -> Result<()> {
        let app = App::mock(SyncConfig::default());
        let output = run_mock(&app, Command::Prefetch { limit: None }).await?;
        assert!(output.contains("bc-demo-1"));
        assert!(output.contains("2 messages"));
        Ok(())
    }

    #[tokio::test]
    async fn signed_out_commands_are_refused() -> Result<()> {
        let app = App::mock(SyncConfig::default());
        run_mock(&app, Command::Logout).await?;
        let error = run_mock(&app, Command::Agents { limit: 5 })
            .await
            .expect_err("signed out");
        assert!(error.to_string().contains("not signed in"));

        let output = run_mock(&app, Command::Login { key: "key_new".to_string() }).await?;
        assert!(output.starts_with("Signed in as demo@example.test"));
        run_mock(&app, Command::Agents { limit: 5 }).await?;
        Ok(())
    }
}
