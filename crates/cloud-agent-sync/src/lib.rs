//! Client-side state for cloud agents: live conversations, prefetching,
//! repository ranking and the signed-in session.

use std::sync::Arc;

pub mod config;
pub mod continuation;
pub mod credential;
pub mod merge;
pub mod prefetch;
pub mod registry;
pub mod session;
pub mod synchronizer;

/// Invoked when the service rejects the session credential.
pub type AuthFailureHandler = Arc<dyn Fn() + Send + Sync>;

pub use config::{ConfigError, SyncConfig, resolve_credential_path};
pub use continuation::{
    FollowUpAttempt, continuation_prompt, is_continuation_eligible, launch_continuation,
    try_follow_up,
};
pub use credential::{
    CredentialError, CredentialInputError, CredentialStore, FileCredentialStore,
    MemoryCredentialStore, normalize_api_key,
};
pub use merge::{ConversationLog, PendingFollowUp, merge_messages};
pub use prefetch::{CacheEntry, PrefetchCache, PrefetchOutcome};
pub use registry::{
    LastUsed, MatchMode, NormalizedRepo, RankedRepository, RepositoryRegistry, last_used_index,
    normalize, repos_match, repos_match_with, repository_key,
};
pub use session::{Session, SessionError};
pub use synchronizer::{
    ConversationSnapshot, ConversationSynchronizer, FollowUpError, SyncHooks, SyncPhase,
};
