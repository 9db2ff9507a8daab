//! Repository list ranked by how recently the user ran agents against it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloud_agent_api::{Agent, Repository, RepositoryMetadataSource};
use futures::future::join_all;

/// The comparable shapes of one repository reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRepo {
    /// Lowercased reference without scheme, `.git` or trailing slashes.
    pub full: String,
    pub name: String,
    pub owner_and_name: Option<String>,
}

impl NormalizedRepo {
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.owner_and_name
            .as_deref()
            .and_then(|owner_and_name| owner_and_name.split_once('/'))
            .map(|(owner, _)| owner)
    }
}

#[must_use]
pub fn normalize(reference: &str) -> NormalizedRepo {
    let mut full = reference.trim().to_lowercase();
    for scheme in ["https://", "http://", "ssh://", "git://"] {
        if let Some(rest) = full.strip_prefix(scheme) {
            full = rest.to_string();
            break;
        }
    }
    if let Some(rest) = full.strip_prefix("git@") {
        full = rest.replacen(':', "/", 1);
    }
    let trimmed = full.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let full = trimmed.trim_end_matches('/').to_string();

    let segments: Vec<&str> = full.split('/').filter(|segment| !segment.is_empty()).collect();
    let name = segments.last().copied().unwrap_or_default().to_string();
    let owner_and_name = match segments.as_slice() {
        [.., owner, name] => Some(format!("{owner}/{name}")),
        _ => None,
    };
    NormalizedRepo {
        full,
        name,
        owner_and_name,
    }
}

/// How far [`repos_match_with`] is willing to stretch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// Full match, owner/name match, bare-name match for names longer than
    /// two characters, then a suffix match in either direction.
    #[default]
    Chain,
    /// The same chain, but a bare name only matches when one side carries no
    /// owner, and a suffix only matches on an owner-qualified `/` boundary.
    OwnerAware,
}

/// Whether two references name the same repository, using [`MatchMode::Chain`].
#[must_use]
pub fn repos_match(left: &NormalizedRepo, right: &NormalizedRepo) -> bool {
    repos_match_with(left, right, MatchMode::Chain)
}

#[must_use]
pub fn repos_match_with(
    left: &NormalizedRepo,
    right: &NormalizedRepo,
    mode: MatchMode,
) -> bool {
    if left.full.is_empty() || right.full.is_empty() {
        return false;
    }
    if left.full == right.full {
        return true;
    }
    if let (Some(left_pair), Some(right_pair)) = (&left.owner_and_name, &right.owner_and_name) {
        if left_pair == right_pair {
            return true;
        }
    }
    let owner_missing = left.owner_and_name.is_none() || right.owner_and_name.is_none();
    if left.name == right.name
        && left.name.len() > 2
        && (mode == MatchMode::Chain || owner_missing)
    {
        return true;
    }
    is_suffix(&left.full, &right.full, mode) || is_suffix(&right.full, &left.full, mode)
}

fn is_suffix(longer: &str, shorter: &str, mode: MatchMode) -> bool {
    match mode {
        MatchMode::Chain => longer.ends_with(shorter),
        MatchMode::OwnerAware => {
            shorter.contains('/')
                && longer
                    .strip_suffix(shorter)
                    .is_some_and(|prefix| prefix.ends_with('/'))
        }
    }
}

/// Identity key: `owner/name` when the reference has an owner, otherwise the
/// bare name.
#[must_use]
pub fn repository_key(reference: &str) -> String {
    let normalized = normalize(reference);
    normalized.owner_and_name.unwrap_or(normalized.name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastUsed {
    pub at: DateTime<Utc>,
    pub runs: usize,
}

/// Most recent agent creation time per repository key.
#[must_use]
pub fn last_used_index(agents: &[Agent]) -> HashMap<String, LastUsed> {
    let mut index: HashMap<String, LastUsed> = HashMap::new();
    for agent in agents {
        let key = repository_key(&agent.source.repository);
        if key.is_empty() {
            continue;
        }
        index
            .entry(key)
            .and_modify(|last| {
                last.at = last.at.max(agent.created_at);
                last.runs += 1;
            })
            .or_insert(LastUsed {
                at: agent.created_at,
                runs: 1,
            });
    }
    index
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedRepository {
    pub key: String,
    pub repository: Repository,
    pub last_used: Option<DateTime<Utc>>,
    pub runs: usize,
    /// Known only from run history, not from the repository listing.
    pub inferred: bool,
}

impl RankedRepository {
    #[must_use]
    pub fn has_activity(&self) -> bool {
        self.last_used.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryRegistry {
    entries: Vec<RankedRepository>,
}

impl RepositoryRegistry {
    /// Ranks `repositories` by agent activity. Repositories that only appear
    /// in `agents` are added as inferred entries.
    #[must_use]
    pub fn build(repositories: Vec<Repository>, agents: &[Agent]) -> Self {
        let index = last_used_index(agents);
        let mut entries: Vec<RankedRepository> = Vec::with_capacity(repositories.len());

        for repository in repositories {
            let normalized = normalize(&repository.repository);
            let key = normalized
                .owner_and_name
                .clone()
                .unwrap_or_else(|| normalized.name.clone());
            let last = matching_activity(&index, &normalized);
            entries.push(RankedRepository {
                key,
                repository,
                last_used: last.map(|last| last.at),
                runs: last.map_or(0, |last| last.runs),
                inferred: false,
            });
        }

        for (key, last) in &index {
            let normalized = normalize(key);
            let known = entries
                .iter()
                .any(|entry| repos_match(&normalize(&entry.repository.repository), &normalized));
            if known {
                continue;
            }
            let source = agents
                .iter()
                .filter(|agent| repository_key(&agent.source.repository) == *key)
                .max_by_key(|agent| agent.created_at)
                .map_or_else(|| key.clone(), |agent| agent.source.repository.clone());
            entries.push(RankedRepository {
                key: key.clone(),
                repository: Repository {
                    owner: normalized.owner().unwrap_or_default().to_string(),
                    name: normalized.name.clone(),
                    repository: source,
                    pushed_at: None,
                },
                last_used: Some(last.at),
                runs: last.runs,
                inferred: true,
            });
        }

        let mut registry = Self { entries };
        registry.sort();
        registry
    }

    #[must_use]
    pub fn ranked(&self) -> &[RankedRepository] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn find(&self, reference: &str) -> Option<&RankedRepository> {
        let wanted = normalize(reference);
        self.entries
            .iter()
            .find(|entry| repos_match(&normalize(&entry.repository.repository), &wanted))
    }

    /// The persisted selection if it is still listed, otherwise the top
    /// ranked repository.
    #[must_use]
    pub fn default_selection(&self, persisted: Option<&str>) -> Option<&RankedRepository> {
        persisted
            .filter(|reference| !reference.trim().is_empty())
            .and_then(|reference| self.find(reference))
            .or_else(|| self.entries.first())
    }

    /// Fills in missing push timestamps from `source`, `batch_size` lookups at
    /// a time with `batch_delay` between batches. Returns how many were found.
    pub async fn enrich_missing_pushed_at(
        &mut self,
        source: &dyn RepositoryMetadataSource,
        batch_size: usize,
        batch_delay: Duration,
    ) -> usize {
        let missing: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.repository.pushed_at.is_none()
                    && !entry.repository.owner.trim().is_empty()
                    && !entry.repository.name.trim().is_empty()
            })
            .map(|(position, _)| position)
            .collect();
        if missing.is_empty() {
            return 0;
        }

        let mut found = 0;
        for (batch_number, batch) in missing.chunks(batch_size.max(1)).enumerate() {
            if batch_number > 0 {
                tokio::time::sleep(batch_delay).await;
            }
            let lookups = batch.iter().map(|&position| {
                let repository = &self.entries[position].repository;
                source.pushed_at(&repository.owner, &repository.name)
            });
            let results = join_all(lookups).await;
            for (&position, pushed_at) in batch.iter().zip(results) {
                if let Some(pushed_at) = pushed_at {
                    self.entries[position].repository.pushed_at = Some(pushed_at);
                    found += 1;
                }
            }
        }
        tracing::debug!(requested = missing.len(), found, "repository metadata enriched");
        self.sort();
        found
    }

    fn sort(&mut self) {
        self.entries.sort_by(compare_ranked);
    }
}

fn matching_activity(
    index: &HashMap<String, LastUsed>,
    normalized: &NormalizedRepo,
) -> Option<LastUsed> {
    let direct = normalized
        .owner_and_name
        .as_ref()
        .unwrap_or(&normalized.name);
    if let Some(last) = index.get(direct) {
        return Some(*last);
    }
    index
        .iter()
        .filter(|(key, _)| repos_match(&normalize(key), normalized))
        .map(|(_, last)| *last)
        .reduce(|left, right| LastUsed {
            at: left.at.max(right.at),
            runs: left.runs + right.runs,
        })
}

fn compare_ranked(left: &RankedRepository, right: &RankedRepository) -> Ordering {
    right
        .has_activity()
        .cmp(&left.has_activity())
        .then_with(|| right.last_used.cmp(&left.last_used))
        .then_with(|| right.repository.pushed_at.cmp(&left.repository.pushed_at))
        .then_with(|| {
            left.repository
                .name
                .to_lowercase()
                .cmp(&right.repository.name.to_lowercase())
        })
        .then_with(|| left.key.cmp(&right.key))
}
